use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::Utc;
use client_core::{ChannelState, Session, Settings, SyncEngine, SyncError};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use shared::protocol::LiveFrame;
use tokio::{
    net::TcpListener,
    sync::{broadcast, Mutex},
    time::{sleep, timeout},
};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Clone)]
struct ChatServer {
    messages: Arc<Mutex<Vec<Value>>>,
    relay: broadcast::Sender<String>,
    next_id: Arc<AtomicU64>,
}

async fn list_messages(State(server): State<ChatServer>) -> Json<Value> {
    Json(Value::Array(server.messages.lock().await.clone()))
}

async fn post_message(State(server): State<ChatServer>, Json(body): Json<Value>) -> Json<Value> {
    let id = server.next_id.fetch_add(1, Ordering::SeqCst) + 1;
    let stored = json!({
        "_id": format!("m{id}"),
        "sender": body["sender"],
        "text": body["text"],
        "createdAt": Utc::now().to_rfc3339(),
    });
    server.messages.lock().await.push(stored.clone());
    let frame = json!({ "type": "message", "payload": stored });
    let _ = server.relay.send(frame.to_string());
    Json(json!({ "msg": "Message sent", "message": stored }))
}

async fn live(State(server): State<ChatServer>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| relay_session(server, socket))
}

async fn relay_session(server: ChatServer, mut socket: WebSocket) {
    let Some(Ok(WsMessage::Text(auth))) = socket.recv().await else {
        return;
    };
    if !matches!(
        serde_json::from_str::<LiveFrame>(&auth),
        Ok(LiveFrame::Auth { .. })
    ) {
        return;
    }
    let mut relay = server.relay.subscribe();
    if socket
        .send(WsMessage::Text(r#"{"type":"connected"}"#.to_string()))
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            inbound = socket.recv() => match inbound {
                Some(Ok(WsMessage::Text(text))) => {
                    let _ = server.relay.send(text);
                }
                Some(Ok(_)) => {}
                _ => return,
            },
            outbound = relay.recv() => match outbound {
                Ok(text) => {
                    if socket.send(WsMessage::Text(text)).await.is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return,
            },
        }
    }
}

async fn spawn_chat_server(seed: Vec<Value>) -> String {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (relay, _) = broadcast::channel(64);
    let server = ChatServer {
        messages: Arc::new(Mutex::new(seed)),
        relay,
        next_id: Arc::new(AtomicU64::new(100)),
    };
    let app = Router::new()
        .route("/api/chat", get(list_messages).post(post_message))
        .route("/ws", get(live))
        .with_state(server);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

fn engine_for(server_url: &str) -> SyncEngine {
    let settings = Settings {
        server_url: server_url.to_string(),
        reconnect_base_ms: 20,
        reconnect_max_ms: 100,
        ..Settings::default()
    };
    SyncEngine::from_settings(&settings).expect("engine")
}

fn session_for(user_id: &str) -> Session {
    let token = encode(
        &Header::default(),
        &json!({ "id": user_id, "username": user_id }),
        &EncodingKey::from_secret(b"integration"),
    )
    .expect("token");
    Session::decode(Some(&token))
}

async fn wait_connected(engine: &SyncEngine) {
    timeout(WAIT, async {
        while engine.channel_state().await != ChannelState::Connected {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("channel never connected");
}

async fn wait_for_log(engine: &SyncEngine, done: impl Fn(&[client_core::Message]) -> bool) {
    let mut log = engine.subscribe_log();
    timeout(WAIT, async {
        loop {
            if done(&log.borrow_and_update()) {
                return;
            }
            if log.changed().await.is_err() {
                panic!("log subscription closed");
            }
        }
    })
    .await
    .expect("log never reached expected state");
}

fn count(log: &[client_core::Message], text: &str) -> usize {
    log.iter().filter(|message| message.text == text).count()
}

#[tokio::test]
async fn start_loads_existing_history() {
    let server_url = spawn_chat_server(vec![
        json!({ "_id": "m1", "sender": "a", "text": "hi", "createdAt": "2024-01-01T00:00:00Z" }),
        json!({ "_id": "m2", "sender": "b", "text": "yo", "createdAt": "2024-01-01T00:00:05Z" }),
        json!({ "_id": "m3", "text": "orphan" }),
    ])
    .await;
    let engine = engine_for(&server_url);

    engine.start(session_for("alice")).await.expect("start");

    let texts: Vec<_> = engine.log().into_iter().map(|m| m.text).collect();
    assert_eq!(texts, vec!["hi", "yo"]);
    engine.stop().await;
}

#[tokio::test]
async fn message_sent_by_one_client_reaches_the_other_once() {
    let server_url = spawn_chat_server(Vec::new()).await;
    let alice = engine_for(&server_url);
    let bob = engine_for(&server_url);

    alice.start(session_for("alice")).await.expect("alice start");
    bob.start(session_for("bob")).await.expect("bob start");
    wait_connected(&alice).await;
    wait_connected(&bob).await;

    alice.send("hello bob").await.expect("send");

    wait_for_log(&bob, |log| count(log, "hello bob") == 1).await;
    // Let the announced copy arrive too; it must collapse into the same entry.
    sleep(Duration::from_millis(200)).await;
    assert_eq!(count(&bob.log(), "hello bob"), 1);
    assert_eq!(count(&alice.log(), "hello bob"), 1);
    assert!(alice.log().iter().all(|message| message.id.is_some()));

    alice.stop().await;
    bob.stop().await;
}

#[tokio::test]
async fn receive_only_client_follows_but_cannot_send() {
    let server_url = spawn_chat_server(Vec::new()).await;
    let alice = engine_for(&server_url);
    let watcher = engine_for(&server_url);

    alice.start(session_for("alice")).await.expect("alice start");
    watcher.start(Session::decode(None)).await.expect("watcher start");
    wait_connected(&watcher).await;

    assert_eq!(watcher.send("hi").await, Err(SyncError::NotAuthenticated));

    alice.send("broadcast").await.expect("send");
    wait_for_log(&watcher, |log| count(log, "broadcast") == 1).await;

    alice.stop().await;
    watcher.stop().await;
}

#[tokio::test]
async fn unreachable_server_degrades_without_failing_start() {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    let engine = engine_for(&format!("http://{addr}"));
    let mut events = engine.subscribe_events();

    engine.start(session_for("alice")).await.expect("start");

    assert!(engine.log().is_empty());
    let first = timeout(WAIT, events.recv())
        .await
        .expect("event timeout")
        .expect("event");
    assert!(
        matches!(first, client_core::SyncEvent::HistoryLoadFailed(_)),
        "{first:?}"
    );
    engine.stop().await;
}
