//! Persistent live connection with automatic reconnection.
//!
//! A [`LiveChannel`] owns one background task. The task connects through a
//! [`LiveTransport`], authenticates, waits for the server's `connected`
//! acknowledgement and then forwards inbound `message` frames as
//! [`LiveEvent`]s. Transport failures, peer closes and `disconnect` frames send
//! the task into exponential backoff; only [`LiveChannel::close`] is final.

use std::{pin::Pin, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{future, stream::BoxStream, Sink, SinkExt, StreamExt};
use shared::protocol::{LiveFrame, MessageRecord};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{sleep, timeout, Instant},
};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};

use crate::error::ChannelError;

const EVENT_BUFFER: usize = 256;
const OUTBOUND_BUFFER: usize = 64;

pub type FrameStream = BoxStream<'static, Result<LiveFrame, ChannelError>>;
pub type FrameSink = Pin<Box<dyn Sink<LiveFrame, Error = ChannelError> + Send>>;

/// Both halves of one established connection.
pub struct LiveConnection {
    pub frames: FrameStream,
    pub sink: FrameSink,
}

#[async_trait]
pub trait LiveTransport: Send + Sync {
    async fn connect(&self) -> Result<LiveConnection, ChannelError>;
}

/// JSON frames over a WebSocket.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    url: String,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl LiveTransport for WebSocketTransport {
    async fn connect(&self) -> Result<LiveConnection, ChannelError> {
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|err| ChannelError::Connect(format!("{}: {err}", self.url)))?;
        let (writer, reader) = ws_stream.split();

        let sink = writer
            .sink_map_err(|err| ChannelError::Transport(err.to_string()))
            .with(|frame: LiveFrame| {
                future::ready(
                    serde_json::to_string(&frame)
                        .map(WsMessage::Text)
                        .map_err(|err| ChannelError::Protocol(err.to_string())),
                )
            });

        let frames = reader
            .filter_map(|item| {
                future::ready(match item {
                    Ok(WsMessage::Text(text)) => Some(
                        serde_json::from_str::<LiveFrame>(&text)
                            .map_err(|err| ChannelError::Protocol(format!("invalid frame: {err}"))),
                    ),
                    Ok(WsMessage::Close(frame)) => Some(Err(ChannelError::ClosedByPeer(
                        frame
                            .map(|frame| frame.reason.to_string())
                            .filter(|reason| !reason.is_empty())
                            .unwrap_or_else(|| "close frame".to_string()),
                    ))),
                    Ok(_) => None,
                    Err(err) => Some(Err(ChannelError::Transport(err.to_string()))),
                })
            })
            .boxed();

        Ok(LiveConnection {
            frames,
            sink: Box::pin(sink),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Final: closed locally or reconnection exhausted.
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveEvent {
    Connected,
    Message(MessageRecord),
    /// An established connection was lost; reconnection follows.
    Disconnected { error: ChannelError },
    Error(ChannelError),
    Reconnecting { attempt: u32, delay: Duration },
    Unavailable { attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Consecutive failed connection attempts tolerated before giving up.
    pub max_attempts: u32,
    pub ack_timeout: Duration,
    /// A connection must stay up this long before the attempt budget and
    /// backoff are reset.
    pub stable_after: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(10),
            max_attempts: 8,
            ack_timeout: Duration::from_secs(10),
            stable_after: Duration::from_secs(5),
        }
    }
}

struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(policy: &ReconnectPolicy) -> Self {
        Self {
            base: policy.base,
            max: policy.max,
            current: policy.base,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let next = self.current.checked_mul(2).unwrap_or(self.max);
        self.current = std::cmp::min(next, self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.base;
    }
}

pub struct LiveChannel {
    state: watch::Receiver<ChannelState>,
    state_tx: Arc<watch::Sender<ChannelState>>,
    outbound: mpsc::Sender<LiveFrame>,
    task: Option<JoinHandle<()>>,
}

impl LiveChannel {
    /// Spawns the connection task. Events arrive on the returned receiver in
    /// the order the server sent them.
    pub fn open(
        transport: Arc<dyn LiveTransport>,
        token: Option<String>,
        policy: ReconnectPolicy,
    ) -> (Self, mpsc::Receiver<LiveEvent>) {
        let (state_tx, state) = watch::channel(ChannelState::Connecting);
        let state_tx = Arc::new(state_tx);
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);

        let runner = Runner {
            transport,
            token,
            policy,
            state: Arc::clone(&state_tx),
            events: events_tx,
        };
        let task = tokio::spawn(runner.run(outbound_rx));

        (
            Self {
                state,
                state_tx,
                outbound,
                task: Some(task),
            },
            events_rx,
        )
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.state.clone()
    }

    /// Best effort: dropped unless the channel is currently connected.
    pub fn announce(&self, record: MessageRecord) -> bool {
        if self.state() != ChannelState::Connected {
            debug!("live: not connected, announcement dropped");
            return false;
        }
        self.outbound.try_send(LiveFrame::Message(record)).is_ok()
    }

    pub fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            info!("live: channel closed");
        }
        self.state_tx.send_replace(ChannelState::Closed);
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ChannelState::Closed
    }
}

impl Drop for LiveChannel {
    fn drop(&mut self) {
        self.close();
    }
}

enum SessionEnd {
    /// Nobody is listening any more.
    Abandoned,
    Lost {
        error: ChannelError,
        /// How long the connection was up; `None` if the handshake never
        /// completed.
        connected_for: Option<Duration>,
    },
}

struct Runner {
    transport: Arc<dyn LiveTransport>,
    token: Option<String>,
    policy: ReconnectPolicy,
    state: Arc<watch::Sender<ChannelState>>,
    events: mpsc::Sender<LiveEvent>,
}

impl Runner {
    async fn run(self, mut outbound: mpsc::Receiver<LiveFrame>) {
        let mut backoff = Backoff::new(&self.policy);
        let mut failures: u32 = 0;

        loop {
            let (error, connected_for) = match self.session(&mut outbound).await {
                SessionEnd::Abandoned => return,
                SessionEnd::Lost {
                    error,
                    connected_for,
                } => (error, connected_for),
            };

            if let Some(uptime) = connected_for {
                if uptime >= self.policy.stable_after {
                    backoff.reset();
                    failures = 0;
                }
                warn!(error = %error, uptime_ms = uptime.as_millis() as u64, "live: connection lost");
                if !self.emit(LiveEvent::Disconnected { error }).await {
                    return;
                }
            } else {
                warn!(error = %error, "live: connection attempt failed");
                if !self.emit(LiveEvent::Error(error)).await {
                    return;
                }
            }

            failures += 1;
            if failures > self.policy.max_attempts {
                warn!(attempts = failures, "live: giving up on reconnection");
                self.state.send_replace(ChannelState::Closed);
                let _ = self
                    .emit(LiveEvent::Unavailable { attempts: failures })
                    .await;
                return;
            }

            let delay = backoff.next_delay();
            self.state.send_replace(ChannelState::Reconnecting);
            info!(attempt = failures, delay_ms = delay.as_millis() as u64, "live: reconnecting");
            if !self
                .emit(LiveEvent::Reconnecting {
                    attempt: failures,
                    delay,
                })
                .await
            {
                return;
            }
            sleep(delay).await;
        }
    }

    async fn session(&self, outbound: &mut mpsc::Receiver<LiveFrame>) -> SessionEnd {
        let lost = |error| SessionEnd::Lost {
            error,
            connected_for: None,
        };

        let LiveConnection {
            mut frames,
            mut sink,
        } = match self.transport.connect().await {
            Ok(connection) => connection,
            Err(err) => return lost(err),
        };

        if let Err(err) = sink
            .send(LiveFrame::Auth {
                token: self.token.clone(),
            })
            .await
        {
            return lost(err);
        }

        let early = match timeout(self.policy.ack_timeout, await_ack(&mut frames)).await {
            Ok(Ok(early)) => early,
            Ok(Err(err)) => return lost(err),
            Err(_) => return lost(ChannelError::AckTimeout(self.policy.ack_timeout)),
        };

        // Anything queued while disconnected is stale.
        while outbound.try_recv().is_ok() {}

        self.state.send_replace(ChannelState::Connected);
        info!("live: connected");
        if !self.emit(LiveEvent::Connected).await {
            return SessionEnd::Abandoned;
        }
        for record in early {
            if !self.emit(LiveEvent::Message(record)).await {
                return SessionEnd::Abandoned;
            }
        }

        let connected_at = Instant::now();
        let dropped = |error| SessionEnd::Lost {
            error,
            connected_for: Some(connected_at.elapsed()),
        };
        loop {
            tokio::select! {
                inbound = frames.next() => match inbound {
                    Some(Ok(LiveFrame::Message(record))) => {
                        if !self.emit(LiveEvent::Message(record)).await {
                            return SessionEnd::Abandoned;
                        }
                    }
                    Some(Ok(LiveFrame::Error(api_error))) => {
                        warn!(code = ?api_error.code, message = %api_error.message, "live: server error");
                        if !self.emit(LiveEvent::Error(api_error.into())).await {
                            return SessionEnd::Abandoned;
                        }
                    }
                    Some(Ok(LiveFrame::Disconnect { reason })) => {
                        return dropped(ChannelError::Disconnected(reason));
                    }
                    Some(Ok(LiveFrame::Connected | LiveFrame::Auth { .. })) => {
                        debug!("live: ignoring unexpected handshake frame");
                    }
                    Some(Err(ChannelError::Protocol(detail))) => {
                        warn!(detail = %detail, "live: dropping unreadable frame");
                        if !self.emit(LiveEvent::Error(ChannelError::Protocol(detail))).await {
                            return SessionEnd::Abandoned;
                        }
                    }
                    Some(Err(err)) => return dropped(err),
                    None => return dropped(ChannelError::ClosedByPeer("stream ended".to_string())),
                },
                queued = outbound.recv() => match queued {
                    Some(frame) => {
                        if let Err(err) = sink.send(frame).await {
                            return dropped(err);
                        }
                    }
                    None => return SessionEnd::Abandoned,
                },
            }
        }
    }

    async fn emit(&self, event: LiveEvent) -> bool {
        self.events.send(event).await.is_ok()
    }
}

/// Reads frames until the server acknowledges the handshake. Messages that
/// arrive first are handed back so they are not lost.
async fn await_ack(frames: &mut FrameStream) -> Result<Vec<MessageRecord>, ChannelError> {
    let mut early = Vec::new();
    while let Some(frame) = frames.next().await {
        match frame {
            Ok(LiveFrame::Connected) => return Ok(early),
            Ok(LiveFrame::Message(record)) => early.push(record),
            Ok(LiveFrame::Error(api_error)) => return Err(api_error.into()),
            Ok(LiveFrame::Disconnect { reason }) => return Err(ChannelError::Disconnected(reason)),
            Ok(LiveFrame::Auth { .. }) => {}
            Err(ChannelError::Protocol(detail)) => {
                warn!(detail = %detail, "live: unreadable frame during handshake");
            }
            Err(err) => return Err(err),
        }
    }
    Err(ChannelError::ClosedByPeer(
        "closed before acknowledgement".to_string(),
    ))
}

#[cfg(test)]
#[path = "tests/live_tests.rs"]
mod tests;
