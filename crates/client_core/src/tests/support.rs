//! In-memory doubles for the chat service and the live transport.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::json;
use shared::{
    domain::{MessageId, UserId},
    protocol::{LiveFrame, MessageRecord, SendMessageRequest, SendMessageResponse},
};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{
    api::ChatApi,
    error::{ChannelError, HistoryLoadError, SendError},
    live::{LiveConnection, LiveTransport},
    session::Session,
};

pub(crate) const WAIT: Duration = Duration::from_secs(3);

pub(crate) fn record(id: Option<&str>, sender: &str, text: &str) -> MessageRecord {
    MessageRecord {
        id: id.map(MessageId::new),
        sender: Some(UserId::new(sender)),
        text: Some(text.to_string()),
        sent_at: None,
    }
}

/// Session for `user_id` decoded from a freshly signed token.
pub(crate) fn session_for(user_id: &str) -> Session {
    let token = encode(
        &Header::default(),
        &json!({ "id": user_id, "username": user_id }),
        &EncodingKey::from_secret(b"test-issuer"),
    )
    .expect("encode token");
    Session::decode(Some(&token))
}

/// Polls `condition` until it holds or [`WAIT`] elapses.
pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[derive(Default)]
pub(crate) struct FakeChatApi {
    history: Mutex<Vec<MessageRecord>>,
    history_failure: Mutex<Option<HistoryLoadError>>,
    history_gate: Mutex<Option<oneshot::Receiver<()>>>,
    send_failure: Mutex<Option<SendError>>,
    send_gate: Mutex<Option<oneshot::Receiver<()>>>,
    echo: AtomicBool,
    submitted: Mutex<Vec<SendMessageRequest>>,
    fetches: AtomicUsize,
    next_id: AtomicUsize,
}

impl FakeChatApi {
    pub(crate) fn with_history(records: Vec<MessageRecord>) -> Self {
        let api = Self::default();
        *api.history.lock().expect("history") = records;
        api
    }

    pub(crate) fn set_history_failure(&self, failure: Option<HistoryLoadError>) {
        *self.history_failure.lock().expect("failure") = failure;
    }

    pub(crate) fn set_send_failure(&self, failure: Option<SendError>) {
        *self.send_failure.lock().expect("failure") = failure;
    }

    pub(crate) fn set_echo(&self, echo: bool) {
        self.echo.store(echo, Ordering::SeqCst);
    }

    /// The next history fetch waits until the returned sender fires (or drops).
    pub(crate) fn hold_next_history(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.history_gate.lock().expect("gate") = Some(rx);
        tx
    }

    pub(crate) fn hold_next_send(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.send_gate.lock().expect("gate") = Some(rx);
        tx
    }

    pub(crate) fn push_history(&self, record: MessageRecord) {
        self.history.lock().expect("history").push(record);
    }

    pub(crate) fn submitted(&self) -> Vec<SendMessageRequest> {
        self.submitted.lock().expect("submitted").clone()
    }

    pub(crate) fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatApi for FakeChatApi {
    async fn fetch_history(
        &self,
        _token: Option<&str>,
    ) -> Result<Vec<MessageRecord>, HistoryLoadError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let gate = self.history_gate.lock().expect("gate").take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        if let Some(failure) = self.history_failure.lock().expect("failure").clone() {
            return Err(failure);
        }
        Ok(self.history.lock().expect("history").clone())
    }

    async fn submit_message(
        &self,
        _token: Option<&str>,
        request: &SendMessageRequest,
    ) -> Result<SendMessageResponse, SendError> {
        self.submitted
            .lock()
            .expect("submitted")
            .push(request.clone());
        let gate = self.send_gate.lock().expect("gate").take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        if let Some(failure) = self.send_failure.lock().expect("failure").clone() {
            return Err(failure);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let stored = MessageRecord {
            id: Some(MessageId::new(format!("srv-{id}"))),
            sender: Some(request.sender.clone()),
            text: Some(request.text.clone()),
            sent_at: Some(Utc::now()),
        };
        self.push_history(stored.clone());

        let mut response = SendMessageResponse::acknowledged();
        if self.echo.load(Ordering::SeqCst) {
            response.message = Some(stored);
        }
        Ok(response)
    }
}

/// Server side of one fake connection.
pub(crate) struct FakePeer {
    to_client: mpsc::UnboundedSender<Result<LiveFrame, ChannelError>>,
    from_client: futures::channel::mpsc::UnboundedReceiver<LiveFrame>,
}

impl FakePeer {
    pub(crate) fn push(&self, frame: LiveFrame) {
        let _ = self.to_client.send(Ok(frame));
    }

    pub(crate) fn fail(&self, error: ChannelError) {
        let _ = self.to_client.send(Err(error));
    }

    pub(crate) async fn next_sent(&mut self) -> Option<LiveFrame> {
        tokio::time::timeout(WAIT, self.from_client.next())
            .await
            .ok()
            .flatten()
    }
}

pub(crate) struct FakeTransport {
    auto_ack: bool,
    refusals: AtomicUsize,
    connects: AtomicUsize,
    peers_tx: mpsc::UnboundedSender<FakePeer>,
    peers_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<FakePeer>>,
}

impl FakeTransport {
    pub(crate) fn new(auto_ack: bool) -> Self {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        Self {
            auto_ack,
            refusals: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
            peers_tx,
            peers_rx: tokio::sync::Mutex::new(peers_rx),
        }
    }

    /// The next `count` connection attempts fail.
    pub(crate) fn refuse(&self, count: usize) {
        self.refusals.store(count, Ordering::SeqCst);
    }

    pub(crate) fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub(crate) async fn next_peer(&self) -> FakePeer {
        tokio::time::timeout(WAIT, self.peers_rx.lock().await.recv())
            .await
            .expect("peer timeout")
            .expect("peer channel")
    }
}

#[async_trait]
impl LiveTransport for FakeTransport {
    async fn connect(&self) -> Result<LiveConnection, ChannelError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if refused {
            return Err(ChannelError::Connect("connection refused".into()));
        }

        let (to_client, client_rx) = mpsc::unbounded_channel();
        let (client_tx, from_client) = futures::channel::mpsc::unbounded();
        if self.auto_ack {
            let _ = to_client.send(Ok(LiveFrame::Connected));
        }
        let _ = self.peers_tx.send(FakePeer {
            to_client,
            from_client,
        });

        Ok(LiveConnection {
            frames: UnboundedReceiverStream::new(client_rx).boxed(),
            sink: Box::pin(
                client_tx.sink_map_err(|err| ChannelError::Transport(err.to_string())),
            ),
        })
    }
}

pub(crate) fn fake_transport(auto_ack: bool) -> Arc<FakeTransport> {
    Arc::new(FakeTransport::new(auto_ack))
}
