use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
};

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{
    config::{load_settings_from, DEFAULT_CONFIG_PATH},
    Message, Session, SyncEngine, SyncEvent,
};
use shared::domain::Origin;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Follow a chat room and send stdin lines to it")]
struct Args {
    /// Overrides the server url from the config file and environment.
    #[arg(long)]
    server_url: Option<String>,
    /// Bearer token; without one the client runs receive-only.
    #[arg(long, env = "CHAT_TOKEN")]
    token: Option<String>,
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

/// Prints each log entry once, the first time it shows up. Entries are keyed
/// by sender, text and occurrence so confirmations do not print again.
#[derive(Default)]
struct Printer {
    seen: HashSet<(String, String, usize)>,
}

impl Printer {
    fn render(&mut self, log: &[Message]) {
        let mut occurrences: HashMap<(&str, &str), usize> = HashMap::new();
        for message in log {
            let occurrence = occurrences
                .entry((message.sender.as_str(), message.text.as_str()))
                .or_default();
            *occurrence += 1;
            let key = (message.sender.to_string(), message.text.clone(), *occurrence);
            if !self.seen.insert(key) {
                continue;
            }
            let marker = if message.origin == Origin::Optimistic {
                " (sending)"
            } else {
                ""
            };
            println!("<{}> {}{marker}", message.sender, message.text);
        }
    }
}

fn report(event: SyncEvent) {
    match event {
        SyncEvent::HistoryLoadFailed(err) => {
            eprintln!("! history unavailable: {err} (/refresh to retry)")
        }
        SyncEvent::RefreshFailed(err) => eprintln!("! refresh failed: {err}"),
        SyncEvent::SendFailed { error, .. } => eprintln!("! message not sent: {error}"),
        SyncEvent::ChannelError(err) => eprintln!("! live channel: {err}"),
        SyncEvent::ChannelUnavailable { attempts } => {
            eprintln!("! live updates unavailable after {attempts} attempts")
        }
        SyncEvent::ChannelStateChanged(state) => eprintln!("* live channel {state:?}"),
        SyncEvent::Rejected(err) => warn!(error = %err, "dropped malformed message"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut settings = load_settings_from(&args.config, |key| std::env::var(key).ok());
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }
    let engine = SyncEngine::from_settings(&settings).context("invalid client settings")?;

    let session = Session::decode(args.token.as_deref());
    match session.username().or(session.user_id().map(|id| id.as_str())) {
        Some(name) => println!("Signed in as {name}. Type a message, /refresh or /quit."),
        None => println!("No usable token: receive-only mode. /quit to leave."),
    }

    let mut log = engine.subscribe_log();
    let mut events = engine.subscribe_events();
    engine
        .start(session)
        .await
        .with_context(|| format!("failed to start sync against {}", settings.server_url))?;

    let mut printer = Printer::default();
    printer.render(&engine.log());

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            changed = log.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = log.borrow_and_update().clone();
                printer.render(&current);
            }
            event = events.recv() => match event {
                Ok(event) => report(event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event stream lagged"),
                Err(RecvError::Closed) => break,
            },
            line = stdin.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                match line.trim() {
                    "" => {}
                    "/quit" => break,
                    "/refresh" => {
                        if let Err(err) = engine.refresh().await {
                            eprintln!("! refresh failed: {err}");
                        }
                    }
                    text => {
                        if let Err(err) = engine.send(text).await {
                            eprintln!("! message not sent: {err}");
                        }
                    }
                }
            }
        }
    }

    engine.stop().await;
    Ok(())
}
