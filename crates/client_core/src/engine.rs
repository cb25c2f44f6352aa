//! Owner of the message log.
//!
//! All store mutations happen under one async mutex, so every append and
//! merge is indivisible with respect to the others. Network work runs without
//! the lock and is tagged with the generation it started in; `stop` and a
//! restart bump the generation, and results from an older generation are
//! discarded.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use shared::{
    domain::{LocalId, Origin},
    protocol::{MessageRecord, SendMessageRequest},
};
use tokio::{
    sync::{broadcast, mpsc, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    api::{ChatApi, HttpChatApi},
    config::Settings,
    error::{ChannelError, HistoryLoadError, SendError, SyncError, ValidationError},
    history::{HistoryLoader, HistorySnapshot},
    live::{ChannelState, LiveChannel, LiveEvent, LiveTransport, ReconnectPolicy, WebSocketTransport},
    message::Message,
    session::Session,
    store::{Admission, MergeReport, MessageLog, MessageStore, DEFAULT_DEDUP_WINDOW},
};

const EVENT_CAPACITY: usize = 1024;

/// Notifications for the UI layer. Failures never escape as raw transport
/// errors; they arrive here instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    HistoryLoadFailed(HistoryLoadError),
    RefreshFailed(HistoryLoadError),
    SendFailed { local_id: LocalId, error: SendError },
    ChannelError(ChannelError),
    ChannelUnavailable { attempts: u32 },
    ChannelStateChanged(ChannelState),
    Rejected(ValidationError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    pub reconnect: ReconnectPolicy,
    pub dedup_window: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            dedup_window: DEFAULT_DEDUP_WINDOW,
        }
    }
}

struct ActiveChannel {
    channel: LiveChannel,
    router: JoinHandle<()>,
}

struct EngineState {
    generation: u64,
    session: Option<Session>,
    store: MessageStore,
    /// Set once a history snapshot has been installed for this session.
    baseline: bool,
    live: Option<ActiveChannel>,
}

struct EngineShared {
    api: Arc<dyn ChatApi>,
    history: HistoryLoader,
    transport: Arc<dyn LiveTransport>,
    options: EngineOptions,
    state: Mutex<EngineState>,
    log: watch::Sender<MessageLog>,
    events: broadcast::Sender<SyncEvent>,
}

pub struct SyncEngine {
    shared: Arc<EngineShared>,
}

impl SyncEngine {
    pub fn new(
        api: Arc<dyn ChatApi>,
        transport: Arc<dyn LiveTransport>,
        options: EngineOptions,
    ) -> Self {
        let (log, _) = watch::channel(MessageLog::new());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(EngineShared {
                history: HistoryLoader::new(Arc::clone(&api)),
                api,
                transport,
                options,
                state: Mutex::new(EngineState {
                    generation: 0,
                    session: None,
                    store: MessageStore::with_window(options.dedup_window),
                    baseline: false,
                    live: None,
                }),
                log,
                events,
            }),
        }
    }

    /// HTTP history/send plus a WebSocket live channel on the same host.
    pub fn from_settings(settings: &Settings) -> Result<Self, SyncError> {
        let server_url = settings.server_url()?;
        let api = HttpChatApi::new(&server_url, settings.request_timeout())?;
        let transport = WebSocketTransport::new(settings.websocket_url()?);
        Ok(Self::new(
            Arc::new(api),
            Arc::new(transport),
            EngineOptions {
                reconnect: settings.reconnect_policy(),
                dedup_window: settings.dedup_window(),
            },
        ))
    }

    /// Loads history, then opens the live channel.
    ///
    /// A no-op for the session already running. A different session tears
    /// the previous one down first. A failed first load is reported as
    /// [`SyncEvent::HistoryLoadFailed`] and the channel is opened anyway.
    pub async fn start(&self, session: Session) -> Result<(), SyncError> {
        let generation = {
            let mut state = self.shared.state.lock().await;
            if state.session.as_ref() == Some(&session) {
                debug!("sync: session unchanged, start ignored");
                return Ok(());
            }
            self.shared.teardown(&mut state);
            state.session = Some(session.clone());
            state.generation
        };
        info!(
            user_id = session.user_id().map(|id| id.as_str()),
            generation, "sync: starting"
        );

        let loaded = self.shared.history.load(&session).await;

        let mut state = self.shared.state.lock().await;
        if state.generation != generation {
            info!(generation, "sync: start overtaken, discarding history");
            return Err(SyncError::Cancelled);
        }
        match loaded {
            Ok(snapshot) => {
                self.shared.install_snapshot(&mut state, snapshot);
            }
            Err(err) => {
                warn!(error = %err, "sync: initial history load failed");
                self.shared.notify(SyncEvent::HistoryLoadFailed(err));
            }
        }

        let (channel, live_events) = LiveChannel::open(
            Arc::clone(&self.shared.transport),
            session.token().map(str::to_string),
            self.shared.options.reconnect,
        );
        let states = channel.subscribe_state();
        let router = tokio::spawn(route_live_events(
            Arc::downgrade(&self.shared),
            generation,
            live_events,
            states,
        ));
        state.live = Some(ActiveChannel { channel, router });
        Ok(())
    }

    /// Sends `text` as the session user.
    ///
    /// The message shows up immediately as a pending entry. Once the server
    /// acknowledges it, the echoed record and a history refetch confirm that
    /// entry in place. On failure the pending entry is removed again.
    pub async fn send(&self, text: &str) -> Result<LocalId, SyncError> {
        let local_id = LocalId::new();
        let (generation, session, request) = {
            let mut state = self.shared.state.lock().await;
            let session = state.session.clone().ok_or(SyncError::NotStarted)?;
            let sender = session
                .user_id()
                .cloned()
                .ok_or(SyncError::NotAuthenticated)?;
            if text.trim().is_empty() {
                return Err(ValidationError::EmptyText.into());
            }

            let placeholder = Message {
                local_id: Some(local_id),
                ..Message::optimistic(sender.clone(), text)
            };
            state.store.append(placeholder)?;
            self.shared.publish(&state);

            let request = SendMessageRequest {
                text: text.to_string(),
                sender,
            };
            (state.generation, session, request)
        };

        let ack = match self.shared.api.submit_message(session.token(), &request).await {
            Ok(ack) => ack,
            Err(error) => {
                let mut state = self.shared.state.lock().await;
                if state.generation == generation {
                    state.store.remove_local(local_id);
                    self.shared.publish(&state);
                    self.shared.notify(SyncEvent::SendFailed {
                        local_id,
                        error: error.clone(),
                    });
                }
                warn!(error = %error, "sync: send failed, pending entry reverted");
                return Err(error.into());
            }
        };

        let echoed = ack.message.and_then(|record| {
            match Message::from_record(record, Origin::History) {
                Ok(message) => Some(message),
                Err(err) => {
                    warn!(error = %err, "sync: ignoring malformed send echo");
                    None
                }
            }
        });
        let announcement = echoed
            .as_ref()
            .map(Message::to_record)
            .unwrap_or_else(|| MessageRecord::from(request));

        {
            let mut state = self.shared.state.lock().await;
            if state.generation != generation {
                debug!("sync: send confirmed after stop, nothing to apply");
                return Ok(local_id);
            }
            if let Some(confirmed) = echoed {
                let confirmed = Message {
                    local_id: Some(local_id),
                    ..confirmed
                };
                if let Ok(Admission::Inserted | Admission::Upgraded) =
                    state.store.append(confirmed)
                {
                    self.shared.publish(&state);
                }
            }
        }

        match self.shared.history.load(&session).await {
            Ok(snapshot) => {
                let mut state = self.shared.state.lock().await;
                if state.generation != generation {
                    return Ok(local_id);
                }
                self.shared.install_snapshot(&mut state, snapshot);
            }
            Err(err) => {
                warn!(error = %err, "sync: refetch after send failed");
                self.shared.notify(SyncEvent::RefreshFailed(err));
            }
        }

        let state = self.shared.state.lock().await;
        if state.generation == generation {
            if let Some(live) = &state.live {
                if !live.channel.announce(announcement) {
                    warn!(
                        local_id = %local_id.0,
                        channel = ?live.channel.state(),
                        "sync: announcement not delivered"
                    );
                }
            }
        }
        info!(local_id = %local_id.0, "sync: message sent");
        Ok(local_id)
    }

    /// Reloads history. Installs it as the baseline when none was established
    /// yet, merges it otherwise.
    pub async fn refresh(&self) -> Result<MergeReport, SyncError> {
        let (generation, session) = {
            let state = self.shared.state.lock().await;
            let session = state.session.clone().ok_or(SyncError::NotStarted)?;
            (state.generation, session)
        };

        let loaded = self.shared.history.load(&session).await;

        let mut state = self.shared.state.lock().await;
        if state.generation != generation {
            return Err(SyncError::Cancelled);
        }
        match loaded {
            Ok(snapshot) => Ok(self.shared.install_snapshot(&mut state, snapshot)),
            Err(err) if state.baseline => {
                self.shared.notify(SyncEvent::RefreshFailed(err.clone()));
                Err(SyncError::Refresh(err))
            }
            Err(err) => {
                self.shared.notify(SyncEvent::HistoryLoadFailed(err.clone()));
                Err(SyncError::HistoryLoad(err))
            }
        }
    }

    /// Closes the live channel, stops event routing and clears the log.
    /// Results of work still in flight are discarded.
    pub async fn stop(&self) {
        let mut state = self.shared.state.lock().await;
        self.shared.teardown(&mut state);
        info!(generation = state.generation, "sync: stopped");
    }

    pub fn subscribe_log(&self) -> watch::Receiver<MessageLog> {
        self.shared.log.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.shared.events.subscribe()
    }

    pub fn log(&self) -> MessageLog {
        self.shared.log.borrow().clone()
    }

    pub async fn session(&self) -> Option<Session> {
        self.shared.state.lock().await.session.clone()
    }

    pub async fn channel_state(&self) -> ChannelState {
        self.shared
            .state
            .lock()
            .await
            .live
            .as_ref()
            .map(|live| live.channel.state())
            .unwrap_or(ChannelState::Disconnected)
    }
}

impl EngineShared {
    fn publish(&self, state: &EngineState) {
        self.log.send_replace(state.store.log());
    }

    fn notify(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    fn install_snapshot(&self, state: &mut EngineState, snapshot: HistorySnapshot) -> MergeReport {
        for rejected in snapshot.rejected {
            self.notify(SyncEvent::Rejected(rejected));
        }
        let report = if state.baseline {
            state.store.merge(snapshot.messages)
        } else {
            state.baseline = true;
            state.store.replace(snapshot.messages)
        };
        debug!(
            inserted = report.inserted,
            upgraded = report.upgraded,
            duplicates = report.duplicates,
            "sync: history applied"
        );
        self.publish(state);
        report
    }

    fn teardown(&self, state: &mut EngineState) {
        state.generation += 1;
        if let Some(mut live) = state.live.take() {
            live.router.abort();
            live.channel.close();
            self.notify(SyncEvent::ChannelStateChanged(ChannelState::Closed));
        }
        state.session = None;
        state.baseline = false;
        state.store.clear();
        self.publish(state);
    }
}

/// Single consumer of one channel's events; applies them to the store in
/// arrival order until the channel or the engine goes away.
async fn route_live_events(
    shared: Weak<EngineShared>,
    generation: u64,
    mut events: mpsc::Receiver<LiveEvent>,
    mut states: watch::Receiver<ChannelState>,
) {
    let mut watching = true;
    loop {
        let event = tokio::select! {
            changed = states.changed(), if watching => {
                if changed.is_err() {
                    watching = false;
                    continue;
                }
                let current = *states.borrow_and_update();
                SyncEvent::ChannelStateChanged(current)
            }
            event = events.recv() => match event {
                Some(LiveEvent::Message(record)) => {
                    let Some(shared) = shared.upgrade() else {
                        return;
                    };
                    let mut state = shared.state.lock().await;
                    if state.generation != generation {
                        return;
                    }
                    apply_live_record(&shared, &mut state, record);
                    continue;
                }
                Some(LiveEvent::Connected | LiveEvent::Reconnecting { .. }) => continue,
                Some(LiveEvent::Disconnected { error } | LiveEvent::Error(error)) => {
                    SyncEvent::ChannelError(error)
                }
                Some(LiveEvent::Unavailable { attempts }) => {
                    SyncEvent::ChannelUnavailable { attempts }
                }
                None => return,
            },
        };

        let Some(shared) = shared.upgrade() else {
            return;
        };
        if shared.state.lock().await.generation != generation {
            return;
        }
        shared.notify(event);
    }
}

fn apply_live_record(shared: &EngineShared, state: &mut EngineState, record: MessageRecord) {
    let admitted = Message::from_record(record, Origin::Live)
        .and_then(|message| state.store.append(message));
    match admitted {
        Ok(Admission::Duplicate) => debug!("sync: duplicate live message ignored"),
        Ok(_) => shared.publish(state),
        Err(err) => {
            warn!(error = %err, "sync: rejecting malformed live message");
            shared.notify(SyncEvent::Rejected(err));
        }
    }
}

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
mod tests;
