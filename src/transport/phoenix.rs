//! Phoenix Channels transport.
//!
//! Speaks the Phoenix V2 JSON serializer over a single WebSocket and
//! multiplexes any number of channel topics on it.
//!
//! # Architecture
//!
//! ```text
//!   PhoenixSocket                     PhoenixChannel ("room:lobby")
//!         │                                  │
//!         │ connect()                        │ join()  ──► Command::Join
//!         ▼                                  │ leave() ──► Command::Leave
//!   Background connection task  ◄────────────┘
//!   (route by topic, match replies by ref, heartbeat)
//! ```
//!
//! # Protocol
//!
//! - Endpoint `<endpoint>/websocket?vsn=2.0.0&<params>`
//! - Every frame is `[join_ref, ref, topic, event, payload]`
//! - `phx_join` / `phx_leave` manage subscriptions; the server answers with
//!   `phx_reply` carrying `{"status": "ok" | "error", "response": ...}`
//! - `phx_close` and `phx_error` end a channel
//! - A `heartbeat` on the `phoenix` topic is sent every interval; if the
//!   previous one is still unanswered at the next tick the connection is
//!   considered dead

// Rust guideline compliant 2026-02

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use url::Url;

use super::{
    Channel, ChannelMessage, Params, Socket, SocketId, Transport, TransportError, TransportEvent,
    TransportLogger,
};
use crate::ws::{self, WsMessage, WsReader, WsWriter};

/// Protocol version requested in the endpoint query.
pub const PROTOCOL_VSN: &str = "2.0.0";

/// Topic used for socket-level messages (heartbeats).
const PHOENIX_TOPIC: &str = "phoenix";

/// Heartbeat period used when none is configured.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(30);

/// Buffered pushes per channel before slow receivers start lagging.
const CHANNEL_BUFFER: usize = 256;

/// Characters of an undecodable frame included in the warning.
const PREVIEW_CHARS: usize = 100;

/// Reserved event names.
pub mod events {
    /// Join request.
    pub const JOIN: &str = "phx_join";
    /// Leave request.
    pub const LEAVE: &str = "phx_leave";
    /// Reply to a request carrying a ref.
    pub const REPLY: &str = "phx_reply";
    /// Server closed the channel.
    pub const CLOSE: &str = "phx_close";
    /// Channel process crashed on the server.
    pub const ERROR: &str = "phx_error";
    /// Socket keepalive.
    pub const HEARTBEAT: &str = "heartbeat";
}

/// One Phoenix V2 frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Ref of the `phx_join` this frame belongs to.
    pub join_ref: Option<String>,
    /// Ref used to correlate a reply with its request.
    pub msg_ref: Option<String>,
    /// Channel topic.
    pub topic: String,
    /// Event name.
    pub event: String,
    /// Event payload.
    pub payload: Value,
}

impl Frame {
    /// Encode as the five-element JSON array the server expects.
    pub fn encode(&self) -> String {
        serde_json::json!([self.join_ref, self.msg_ref, self.topic, self.event, self.payload])
            .to_string()
    }

    /// Decode a text frame.
    pub fn decode(text: &str) -> Result<Self, TransportError> {
        let (join_ref, msg_ref, topic, event, payload): (
            Option<String>,
            Option<String>,
            String,
            String,
            Value,
        ) = serde_json::from_str(text)
            .map_err(|e| TransportError::Protocol(format!("malformed frame: {e}")))?;
        Ok(Self {
            join_ref,
            msg_ref,
            topic,
            event,
            payload,
        })
    }

    fn into_message(self) -> ChannelMessage {
        ChannelMessage {
            topic: self.topic,
            event: self.event,
            payload: self.payload,
        }
    }

    /// Split a `phx_reply` payload into its status and response.
    fn reply_status(&self) -> (bool, Value) {
        let ok = self.payload.get("status").and_then(Value::as_str) == Some("ok");
        let response = self.payload.get("response").cloned().unwrap_or(Value::Null);
        (ok, response)
    }
}

/// Build the WebSocket URL for an endpoint and socket parameters.
///
/// `http(s)` endpoints are mapped to `ws(s)`, `/websocket` is appended unless
/// already present, and the protocol version plus every parameter are added
/// to the query string.
pub fn endpoint_url(endpoint: &str, params: &Params) -> Result<Url, TransportError> {
    let mut url = Url::parse(&ws::http_to_ws_scheme(endpoint)).map_err(|e| {
        TransportError::ConnectionFailed(format!("invalid endpoint {endpoint}: {e}"))
    })?;

    if !url.path().trim_end_matches('/').ends_with("/websocket") {
        let mut segments = url.path_segments_mut().map_err(|()| {
            TransportError::ConnectionFailed(format!("endpoint cannot be a base: {endpoint}"))
        })?;
        segments.pop_if_empty().push("websocket");
    }

    {
        let mut query = url.query_pairs_mut();
        query.append_pair("vsn", PROTOCOL_VSN);
        for (key, value) in params {
            match value {
                Value::String(s) => query.append_pair(key, s),
                other => query.append_pair(key, &other.to_string()),
            };
        }
    }

    Ok(url)
}

/// [`Transport`] producing Phoenix WebSocket sockets.
#[derive(Debug, Clone)]
pub struct PhoenixTransport {
    endpoint: String,
    heartbeat_interval: Duration,
}

impl PhoenixTransport {
    /// Create a transport for `endpoint` (e.g. `ws://localhost:4000/socket`).
    ///
    /// A zero heartbeat interval falls back to [`DEFAULT_HEARTBEAT`].
    pub fn new(endpoint: impl Into<String>, heartbeat_interval: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            heartbeat_interval: if heartbeat_interval.is_zero() {
                DEFAULT_HEARTBEAT
            } else {
                heartbeat_interval
            },
        }
    }
}

impl Transport for PhoenixTransport {
    fn socket(&self, params: Params, logger: TransportLogger) -> Arc<dyn Socket> {
        Arc::new(PhoenixSocket {
            id: SocketId::next(),
            endpoint: self.endpoint.clone(),
            params,
            heartbeat_interval: self.heartbeat_interval,
            shared: Arc::new(SocketShared::new(logger)),
        })
    }
}

/// Requests from handles to the connection task.
#[derive(Debug)]
enum Command {
    Join {
        topic: String,
        join_ref: String,
        params: Params,
        messages: broadcast::Sender<ChannelMessage>,
        reply: oneshot::Sender<Result<Value, TransportError>>,
    },
    Leave {
        topic: String,
        join_ref: String,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// State shared between a socket, its channels and the connection task.
struct SocketShared {
    command_tx: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    connected: AtomicBool,
    closed_tx: watch::Sender<bool>,
    next_ref: AtomicU64,
    logger: TransportLogger,
}

impl SocketShared {
    fn new(logger: TransportLogger) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            command_tx: Mutex::new(None),
            connected: AtomicBool::new(false),
            closed_tx,
            next_ref: AtomicU64::new(1),
            logger,
        }
    }

    fn make_ref(&self) -> String {
        self.next_ref.fetch_add(1, Ordering::Relaxed).to_string()
    }

    fn log(&self, kind: &str, msg: impl Into<String>, data: Value) {
        (self.logger)(&TransportEvent::new(kind, msg, data));
    }

    fn send(&self, command: Command) -> Result<(), TransportError> {
        let guard = self
            .command_tx
            .lock()
            .map_err(|_poisoned| TransportError::Closed)?;
        match guard.as_ref() {
            Some(tx) => tx.send(command).map_err(|_send_error| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }
}

/// A Phoenix socket. Created by [`PhoenixTransport`].
pub struct PhoenixSocket {
    id: SocketId,
    endpoint: String,
    params: Params,
    heartbeat_interval: Duration,
    shared: Arc<SocketShared>,
}

impl std::fmt::Debug for PhoenixSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhoenixSocket")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Socket for PhoenixSocket {
    fn id(&self) -> SocketId {
        self.id
    }

    async fn connect(&self) -> Result<(), TransportError> {
        if self.is_connected() {
            return Ok(());
        }

        let url = endpoint_url(&self.endpoint, &self.params)?;
        self.shared
            .log("transport", format!("connecting to {}", self.endpoint), Value::Null);

        let (writer, reader) = ws::connect(&url).await.map_err(|e| {
            self.shared
                .log("transport", "connect failed", Value::String(e.to_string()));
            TransportError::ConnectionFailed(format!("{e:#}"))
        })?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        {
            let mut guard = self
                .shared
                .command_tx
                .lock()
                .map_err(|_poisoned| TransportError::Closed)?;
            *guard = Some(command_tx);
        }
        self.shared.connected.store(true, Ordering::SeqCst);
        self.shared
            .log("transport", format!("connected to {}", self.endpoint), Value::Null);

        tokio::spawn(run_connection(
            Arc::clone(&self.shared),
            writer,
            reader,
            command_rx,
            self.heartbeat_interval,
        ));
        Ok(())
    }

    async fn disconnect(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.shared.send(Command::Shutdown { done: done_tx }).is_ok() {
            let _ = done_rx.await;
        }
    }

    fn channel(&self, topic: &str, params: Params) -> Arc<dyn Channel> {
        let (messages, _) = broadcast::channel(CHANNEL_BUFFER);
        Arc::new(PhoenixChannel {
            topic: topic.to_string(),
            params,
            socket_id: self.id,
            join_ref: Mutex::new(None),
            messages,
            shared: Arc::clone(&self.shared),
        })
    }

    async fn closed(&self) {
        let mut rx = self.shared.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }
}

impl Drop for PhoenixSocket {
    fn drop(&mut self) {
        let (done, _) = oneshot::channel();
        let _ = self.shared.send(Command::Shutdown { done });
    }
}

/// A channel on a [`PhoenixSocket`].
pub struct PhoenixChannel {
    topic: String,
    params: Params,
    socket_id: SocketId,
    join_ref: Mutex<Option<String>>,
    messages: broadcast::Sender<ChannelMessage>,
    shared: Arc<SocketShared>,
}

impl std::fmt::Debug for PhoenixChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhoenixChannel")
            .field("topic", &self.topic)
            .field("socket_id", &self.socket_id)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Channel for PhoenixChannel {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn params(&self) -> &Params {
        &self.params
    }

    fn socket_id(&self) -> SocketId {
        self.socket_id
    }

    async fn join(&self) -> Result<Value, TransportError> {
        let join_ref = self.shared.make_ref();
        if let Ok(mut guard) = self.join_ref.lock() {
            *guard = Some(join_ref.clone());
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.shared.send(Command::Join {
            topic: self.topic.clone(),
            join_ref,
            params: self.params.clone(),
            messages: self.messages.clone(),
            reply: reply_tx,
        })?;

        reply_rx.await.map_err(|_recv_error| TransportError::Closed)?
    }

    fn leave(&self) {
        let join_ref = self.join_ref.lock().ok().and_then(|mut guard| guard.take());
        let Some(join_ref) = join_ref else {
            log::debug!("[Phoenix] leave() on {} before join, nothing to send", self.topic);
            return;
        };
        if self
            .shared
            .send(Command::Leave {
                topic: self.topic.clone(),
                join_ref,
            })
            .is_err()
        {
            log::debug!("[Phoenix] leave() on {} after socket closed", self.topic);
        }
    }

    fn messages(&self) -> broadcast::Receiver<ChannelMessage> {
        self.messages.subscribe()
    }
}

/// A joined (or joining) topic, as tracked by the connection task.
struct Route {
    join_ref: String,
    messages: broadcast::Sender<ChannelMessage>,
}

/// A request waiting for its `phx_reply`.
struct PendingJoin {
    topic: String,
    reply: oneshot::Sender<Result<Value, TransportError>>,
}

/// Connection task state for one WebSocket.
struct Connection {
    shared: Arc<SocketShared>,
    writer: WsWriter,
    routes: HashMap<String, Route>,
    pending: HashMap<String, PendingJoin>,
    heartbeat_ref: Option<String>,
}

/// Why the connection task stopped.
enum Exit {
    /// Shutdown was requested; carries the requester to notify.
    Shutdown(oneshot::Sender<()>),
    /// The connection was lost.
    Lost(String),
}

async fn run_connection(
    shared: Arc<SocketShared>,
    writer: WsWriter,
    mut reader: WsReader,
    mut command_rx: mpsc::UnboundedReceiver<Command>,
    heartbeat_interval: Duration,
) {
    let mut conn = Connection {
        shared: Arc::clone(&shared),
        writer,
        routes: HashMap::new(),
        pending: HashMap::new(),
        heartbeat_ref: None,
    };

    let start = tokio::time::Instant::now() + heartbeat_interval;
    let mut heartbeat = tokio::time::interval_at(start, heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let exit = loop {
        tokio::select! {
            msg = reader.recv() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => conn.handle_text(&text),
                    Some(Ok(WsMessage::Ping(data))) => {
                        if let Err(e) = conn.writer.send_pong(data).await {
                            break Exit::Lost(format!("{e:#}"));
                        }
                    }
                    Some(Ok(WsMessage::Close { code, reason })) => {
                        break Exit::Lost(format!("closed by server ({code} {reason})"));
                    }
                    Some(Err(e)) => break Exit::Lost(format!("{e:#}")),
                    None => break Exit::Lost("stream ended".to_string()),
                }
            }

            Some(command) = command_rx.recv() => {
                match command {
                    Command::Shutdown { done } => break Exit::Shutdown(done),
                    other => {
                        if let Err(e) = conn.handle_command(other).await {
                            break Exit::Lost(e);
                        }
                    }
                }
            }

            _ = heartbeat.tick() => {
                if conn.heartbeat_ref.is_some() {
                    break Exit::Lost("heartbeat timeout".to_string());
                }
                if let Err(e) = conn.send_heartbeat().await {
                    break Exit::Lost(e);
                }
            }
        }
    };

    if let Ok(mut guard) = shared.command_tx.lock() {
        guard.take();
    }
    shared.connected.store(false, Ordering::SeqCst);
    let _ = conn.writer.close().await;
    conn.fail_pending();

    match exit {
        Exit::Shutdown(done) => {
            shared.log("transport", "disconnected", Value::Null);
            shared.closed_tx.send_replace(true);
            let _ = done.send(());
        }
        Exit::Lost(reason) => {
            log::warn!("[Phoenix] Connection lost: {}", reason);
            shared.log("transport", "connection lost", Value::String(reason));
            shared.closed_tx.send_replace(true);
        }
    }
}

impl Connection {
    async fn push(&mut self, frame: Frame) -> Result<(), String> {
        let msg_ref = frame.msg_ref.as_deref().unwrap_or("");
        self.shared.log(
            "push",
            format!("{}: {} ({})", frame.topic, frame.event, msg_ref),
            frame.payload.clone(),
        );
        self.writer
            .send_text(frame.encode())
            .await
            .map_err(|e| format!("{e:#}"))
    }

    async fn handle_command(&mut self, command: Command) -> Result<(), String> {
        match command {
            Command::Join {
                topic,
                join_ref,
                params,
                messages,
                reply,
            } => {
                self.routes.insert(
                    topic.clone(),
                    Route {
                        join_ref: join_ref.clone(),
                        messages,
                    },
                );
                self.pending.insert(
                    join_ref.clone(),
                    PendingJoin {
                        topic: topic.clone(),
                        reply,
                    },
                );
                self.push(Frame {
                    join_ref: Some(join_ref.clone()),
                    msg_ref: Some(join_ref),
                    topic,
                    event: events::JOIN.to_string(),
                    payload: Value::Object(params),
                })
                .await
            }
            Command::Leave { topic, join_ref } => {
                if self
                    .routes
                    .get(&topic)
                    .is_some_and(|route| route.join_ref == join_ref)
                {
                    self.routes.remove(&topic);
                }
                self.pending.remove(&join_ref);
                let msg_ref = self.shared.make_ref();
                self.push(Frame {
                    join_ref: Some(join_ref),
                    msg_ref: Some(msg_ref),
                    topic,
                    event: events::LEAVE.to_string(),
                    payload: serde_json::json!({}),
                })
                .await
            }
            Command::Shutdown { .. } => Ok(()),
        }
    }

    async fn send_heartbeat(&mut self) -> Result<(), String> {
        let msg_ref = self.shared.make_ref();
        self.heartbeat_ref = Some(msg_ref.clone());
        self.push(Frame {
            join_ref: None,
            msg_ref: Some(msg_ref),
            topic: PHOENIX_TOPIC.to_string(),
            event: events::HEARTBEAT.to_string(),
            payload: serde_json::json!({}),
        })
        .await
    }

    fn handle_text(&mut self, text: &str) {
        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("[Phoenix] {}: {}", e, preview(text));
                return;
            }
        };

        self.shared.log(
            "receive",
            format!("{} {}", frame.topic, frame.event),
            frame.payload.clone(),
        );

        match frame.event.as_str() {
            events::REPLY => self.handle_reply(frame),
            events::CLOSE | events::ERROR => {
                if self.route_matches(&frame) {
                    if let Some(route) = self.routes.remove(&frame.topic) {
                        log::info!("[Phoenix] Channel {} ended: {}", frame.topic, frame.event);
                        let _ = route.messages.send(frame.into_message());
                    }
                }
            }
            _ => self.deliver(frame),
        }
    }

    fn handle_reply(&mut self, frame: Frame) {
        let Some(msg_ref) = frame.msg_ref.clone() else {
            log::trace!("[Phoenix] Reply without ref on {}", frame.topic);
            return;
        };

        if frame.topic == PHOENIX_TOPIC {
            if self.heartbeat_ref.as_deref() == Some(msg_ref.as_str()) {
                self.heartbeat_ref = None;
            }
            return;
        }

        if let Some(pending) = self.pending.remove(&msg_ref) {
            let (ok, response) = frame.reply_status();
            if ok {
                log::debug!("[Phoenix] Joined {}", pending.topic);
                let _ = pending.reply.send(Ok(response));
            } else {
                log::warn!("[Phoenix] Join rejected for {}: {}", pending.topic, response);
                if self
                    .routes
                    .get(&pending.topic)
                    .is_some_and(|route| route.join_ref == msg_ref)
                {
                    self.routes.remove(&pending.topic);
                }
                let _ = pending.reply.send(Err(TransportError::JoinRejected(response)));
            }
            return;
        }

        // Replies to channel pushes other than joins are delivered like any event.
        self.deliver(frame);
    }

    fn route_matches(&self, frame: &Frame) -> bool {
        self.routes.get(&frame.topic).is_some_and(|route| {
            frame
                .join_ref
                .as_deref()
                .map_or(true, |join_ref| join_ref == route.join_ref)
        })
    }

    fn deliver(&mut self, frame: Frame) {
        if !self.route_matches(&frame) {
            log::trace!("[Phoenix] Message for unknown channel: {}", frame.topic);
            return;
        }
        if let Some(route) = self.routes.get(&frame.topic) {
            // No receivers is fine: nobody registered a handler for this alias.
            let _ = route.messages.send(frame.into_message());
        }
    }

    fn fail_pending(&mut self) {
        for (_, pending) in self.pending.drain() {
            let _ = pending.reply.send(Err(TransportError::Closed));
        }
        self.routes.clear();
    }
}

/// Leading characters of `text`, cut on a character boundary.
fn preview(text: &str) -> String {
    text.chars().take(PREVIEW_CHARS).collect()
}
