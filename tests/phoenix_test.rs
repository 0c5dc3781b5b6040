//! Integration tests for the Phoenix transport against a loopback server.
//!
//! The server speaks just enough of the Phoenix V2 protocol: it acks joins
//! (rejecting `room:secret`), answers heartbeats when asked to, and pushes
//! events on request from the test.
//!
//! Run with: cargo test --test phoenix_test

// Rust guideline compliant 2026-02

use channel_session::{
    ConnectionStatus, PhoenixTransport, ReconnectPolicy, SessionConfig, SessionError,
    SessionManager, TransportError,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;

/// Handle to a running loopback server.
struct TestServer {
    endpoint: String,
    /// Every frame the server received, as decoded JSON arrays.
    frames: mpsc::UnboundedReceiver<Vec<Value>>,
    /// Request URIs of accepted WebSocket connections.
    uris: Arc<Mutex<Vec<String>>>,
    /// Frames to push to the most recent connection.
    push: mpsc::UnboundedSender<Value>,
}

impl TestServer {
    async fn start(answer_heartbeats: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (frames_tx, frames) = mpsc::unbounded_channel();
        let (push, mut push_rx) = mpsc::unbounded_channel::<Value>();
        let uris = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&uris);

        tokio::spawn(async move {
            let Ok((tcp, _)) = listener.accept().await else {
                return;
            };
            let ws = tokio_tungstenite::accept_hdr_async(tcp, |req: &Request, resp: Response| {
                seen.lock().unwrap().push(req.uri().to_string());
                Ok(resp)
            })
            .await
            .unwrap();
            let (mut sink, mut stream) = ws.split();

            loop {
                tokio::select! {
                    msg = stream.next() => {
                        let Some(Ok(Message::Text(text))) = msg else { break };
                        let frame: Vec<Value> = serde_json::from_str(&text).unwrap();
                        let _ = frames_tx.send(frame.clone());
                        for reply in respond(&frame, answer_heartbeats) {
                            if sink.send(Message::Text(reply.to_string())).await.is_err() {
                                return;
                            }
                        }
                    }
                    Some(frame) = push_rx.recv() => {
                        if sink.send(Message::Text(frame.to_string())).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Self {
            endpoint: format!("ws://{addr}/socket"),
            frames,
            uris,
            push,
        }
    }

    /// Wait for the next received frame with the given event name.
    async fn next_event(&mut self, event: &str) -> Vec<Value> {
        let deadline = Duration::from_secs(2);
        tokio::time::timeout(deadline, async {
            loop {
                let frame = self.frames.recv().await.expect("server stopped");
                if frame[3] == event {
                    return frame;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no {event} frame received"))
    }
}

fn respond(frame: &[Value], answer_heartbeats: bool) -> Vec<Value> {
    let (join_ref, msg_ref, topic, event) = (&frame[0], &frame[1], &frame[2], &frame[3]);
    match event.as_str() {
        Some("phx_join") if topic == "room:secret" => vec![json!([
            join_ref, msg_ref, topic, "phx_reply",
            {"status": "error", "response": {"reason": "unauthorized"}}
        ])],
        Some("phx_join") => vec![json!([
            join_ref, msg_ref, topic, "phx_reply",
            {"status": "ok", "response": {"joined": topic}}
        ])],
        Some("phx_leave") => vec![json!([
            join_ref, msg_ref, topic, "phx_reply",
            {"status": "ok", "response": {}}
        ])],
        Some("heartbeat") if answer_heartbeats => vec![json!([
            null, msg_ref, "phoenix", "phx_reply",
            {"status": "ok", "response": {}}
        ])],
        _ => Vec::new(),
    }
}

fn config(endpoint: &str, heartbeat_ms: u64) -> SessionConfig {
    let mut config = SessionConfig {
        endpoint: endpoint.to_string(),
        heartbeat_interval_ms: heartbeat_ms,
        reconnect: ReconnectPolicy {
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            max_attempts: 1,
        },
        join_timeout_ms: 2_000,
        reconnect_on_close: false,
        rejoin_on_reconnect: false,
        ..SessionConfig::default()
    };
    config.params.insert("token".to_string(), json!("abc"));
    config
}

fn spawn(config: SessionConfig) -> SessionManager {
    let transport = PhoenixTransport::new(config.endpoint.clone(), config.heartbeat_interval());
    SessionManager::spawn(Arc::new(transport), config)
}

#[tokio::test]
async fn test_connect_join_push_and_leave() {
    let mut server = TestServer::start(true).await;
    let session = spawn(config(&server.endpoint, 30_000));

    session.connect().await.unwrap();
    let uri = server.uris.lock().unwrap().first().cloned().unwrap();
    assert!(uri.starts_with("/socket/websocket?"), "unexpected uri {uri}");
    assert!(uri.contains("vsn=2.0.0"));
    assert!(uri.contains("token=abc"));

    let (tx, mut rx) = mpsc::unbounded_channel();
    session
        .on("lobby", move |msg| {
            let _ = tx.send(msg.clone());
        })
        .unwrap();
    let channel = session.join("room:lobby", Some("lobby"), None).await.unwrap();
    assert_eq!(channel.topic(), "room:lobby");
    assert_eq!(session.snapshot().aliases(), vec!["lobby"]);

    let join = server.next_event("phx_join").await;
    assert_eq!(join[2], "room:lobby");
    assert_eq!(join[0], join[1]);

    server
        .push
        .send(json!([join[0], null, "room:lobby", "new_msg", {"body": "welcome"}]))
        .unwrap();
    let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.event, "new_msg");
    assert_eq!(msg.payload["body"], "welcome");

    session.leave("lobby").await.unwrap();
    let leave = server.next_event("phx_leave").await;
    assert_eq!(leave[0], join[0]);
    assert_eq!(leave[2], "room:lobby");
    assert!(session.snapshot().channels().is_empty());

    session.shutdown().await;
}

#[tokio::test]
async fn test_rejected_join_surfaces_server_response() {
    let server = TestServer::start(true).await;
    let session = spawn(config(&server.endpoint, 30_000));
    session.connect().await.unwrap();

    let result = session.join("room:secret", None, None).await;
    assert_eq!(
        result.err(),
        Some(SessionError::TransportFailure(TransportError::JoinRejected(
            json!({"reason": "unauthorized"})
        )))
    );
    assert!(session.snapshot().channels().is_empty());
}

#[tokio::test]
async fn test_join_params_are_sent() {
    let mut server = TestServer::start(true).await;
    let session = spawn(config(&server.endpoint, 30_000));
    session.connect().await.unwrap();

    let mut params = channel_session::Params::new();
    params.insert("last_seen".to_string(), json!(17));
    session.join("room:1", None, Some(params)).await.unwrap();

    let join = server.next_event("phx_join").await;
    assert_eq!(join[4], json!({"last_seen": 17}));
}

#[tokio::test]
async fn test_heartbeats_keep_connection_alive() {
    let mut server = TestServer::start(true).await;
    let session = spawn(config(&server.endpoint, 40));
    session.connect().await.unwrap();

    let first = server.next_event("heartbeat").await;
    let second = server.next_event("heartbeat").await;
    let third = server.next_event("heartbeat").await;
    assert_eq!(first[2], "phoenix");
    assert_ne!(first[1], second[1]);
    assert_ne!(second[1], third[1]);
    assert!(session.snapshot().is_connected());
}

#[tokio::test]
async fn test_unanswered_heartbeat_drops_connection() {
    let server = TestServer::start(false).await;
    let session = spawn(config(&server.endpoint, 30));
    session.connect().await.unwrap();

    let mut states = session.subscribe();
    let state = Arc::clone(
        &*tokio::time::timeout(
            Duration::from_secs(2),
            states.wait_for(|s| *s.status() == ConnectionStatus::Disconnected),
        )
        .await
        .expect("heartbeat timeout should close the connection")
        .unwrap(),
    );
    assert!(state.socket().is_none());
}

#[tokio::test]
async fn test_connect_refused_reports_transport_failure() {
    // Bind then drop to get a port with nothing listening.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let session = spawn(config(&format!("ws://{addr}/socket"), 30_000));
    let result = session.connect().await;
    assert!(matches!(
        result,
        Err(SessionError::TransportFailure(TransportError::ConnectionFailed(_)))
    ));
    assert!(matches!(session.snapshot().status(), ConnectionStatus::Failed { .. }));
}

/// Next item from a handler channel, failing after two seconds.
async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for a channel message")
        .expect("handler channel closed")
}

#[tokio::test]
async fn test_malformed_frames_do_not_break_connection() {
    // Warnings on, so undecodable frames are formatted into the log line.
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Warn)
        .try_init();

    let mut server = TestServer::start(true).await;
    let session = spawn(config(&server.endpoint, 30_000));
    session.connect().await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    session
        .on("lobby", move |msg| {
            let _ = tx.send(msg.event.clone());
        })
        .unwrap();
    session.join("room:lobby", Some("lobby"), None).await.unwrap();
    let join_ref = server.next_event("phx_join").await[0].clone();

    // The first one puts a two-byte character across the preview cut.
    server.push.send(json!("é".repeat(60))).unwrap();
    server.push.send(json!({"topic": "room:lobby"})).unwrap();
    server.push.send(json!([1, 2])).unwrap();
    server
        .push
        .send(json!([join_ref, null, "room:lobby", "after_garbage", {}]))
        .unwrap();

    assert_eq!(recv(&mut rx).await, "after_garbage");
    assert!(session.snapshot().is_connected());
    session.join("room:1", None, None).await.unwrap();
}

#[tokio::test]
async fn test_server_close_and_error_end_channel_routing() {
    let mut server = TestServer::start(true).await;
    let session = spawn(config(&server.endpoint, 30_000));
    session.connect().await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut join_refs = Vec::new();
    for (topic, alias) in [("room:a", "closed"), ("room:b", "crashed"), ("room:c", "live")] {
        let tx = tx.clone();
        let label = alias.to_string();
        session
            .on(alias, move |msg| {
                let _ = tx.send((label.clone(), msg.event.clone()));
            })
            .unwrap();
        session.join(topic, Some(alias), None).await.unwrap();
        join_refs.push(server.next_event("phx_join").await[0].clone());
    }
    let (a, b, c) = (&join_refs[0], &join_refs[1], &join_refs[2]);

    server.push.send(json!([a, a, "room:a", "phx_close", {}])).unwrap();
    server.push.send(json!([b, b, "room:b", "phx_error", {}])).unwrap();
    let mut ended = vec![recv(&mut rx).await, recv(&mut rx).await];
    ended.sort();
    assert_eq!(
        ended,
        vec![
            ("closed".to_string(), "phx_close".to_string()),
            ("crashed".to_string(), "phx_error".to_string()),
        ]
    );

    // Both routes are gone; only the live channel still receives.
    server.push.send(json!([a, null, "room:a", "new_msg", {}])).unwrap();
    server.push.send(json!([b, null, "room:b", "new_msg", {}])).unwrap();
    server.push.send(json!([c, null, "room:c", "new_msg", {}])).unwrap();
    assert_eq!(recv(&mut rx).await, ("live".to_string(), "new_msg".to_string()));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_push_with_stale_join_ref_is_dropped() {
    let mut server = TestServer::start(true).await;
    let session = spawn(config(&server.endpoint, 30_000));
    session.connect().await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    session
        .on("lobby", move |msg| {
            let _ = tx.send(msg.event.clone());
        })
        .unwrap();
    session.join("room:lobby", Some("lobby"), None).await.unwrap();
    let join_ref = server.next_event("phx_join").await[0].clone();

    server
        .push
        .send(json!(["999", null, "room:lobby", "old_msg", {}]))
        .unwrap();
    server
        .push
        .send(json!([null, null, "room:lobby", "broadcast", {}]))
        .unwrap();
    server
        .push
        .send(json!([join_ref, null, "room:lobby", "new_msg", {}]))
        .unwrap();

    // Frames arrive in order on one forwarding task, so old_msg would come first.
    assert_eq!(recv(&mut rx).await, "broadcast");
    assert_eq!(recv(&mut rx).await, "new_msg");
}
