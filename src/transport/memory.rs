//! In-process transport.
//!
//! [`MemoryTransport`] implements the transport traits without any network.
//! Handshakes and join acknowledgments either complete immediately or wait
//! until the test (or demo) resolves them explicitly, which makes pending,
//! rejected and out-of-order acknowledgments easy to reproduce.
//!
//! ```ignore
//! let transport = MemoryTransport::new().with_manual_acks();
//! let session = SessionManager::spawn(Arc::new(transport.clone()), config);
//! session.connect().await?;
//! let join = tokio::spawn({
//!     let s = session.clone();
//!     async move { s.join("room:1", None, None).await }
//! });
//! transport.ack("room:1");
//! ```

// Rust guideline compliant 2026-02

use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, oneshot, watch};

use super::{
    Channel, ChannelMessage, Params, Socket, SocketId, Transport, TransportError, TransportEvent,
    TransportLogger,
};

type AckSender = oneshot::Sender<Result<Value, TransportError>>;

/// Scriptable in-process [`Transport`].
///
/// Cloning shares the same underlying state, so a test can keep one clone
/// to drive acknowledgments while the session owns another.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    hub: Arc<Mutex<Hub>>,
}

#[derive(Debug, Default)]
struct Hub {
    manual_acks: bool,
    manual_handshakes: bool,
    refuse_connects: u32,
    connect_attempts: u32,
    closed_connections: u32,
    next_channel_id: u64,
    sockets: Vec<SocketRecord>,
    pending_handshakes: VecDeque<(SocketId, oneshot::Sender<Result<(), TransportError>>)>,
    pending_joins: VecDeque<PendingJoin>,
    joined: Vec<JoinedChannel>,
    left: Vec<String>,
}

#[derive(Debug)]
struct SocketRecord {
    id: SocketId,
    connected: Arc<AtomicBool>,
    closed_tx: watch::Sender<bool>,
}

#[derive(Debug)]
struct PendingJoin {
    channel_id: u64,
    socket_id: SocketId,
    topic: String,
    messages: broadcast::Sender<ChannelMessage>,
    reply: AckSender,
}

#[derive(Debug)]
struct JoinedChannel {
    channel_id: u64,
    socket_id: SocketId,
    topic: String,
    messages: broadcast::Sender<ChannelMessage>,
}

impl MemoryTransport {
    /// Transport that completes handshakes and joins immediately.
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold join acknowledgments until [`Self::ack`] or [`Self::reject`].
    pub fn with_manual_acks(self) -> Self {
        self.lock().manual_acks = true;
        self
    }

    /// Hold handshakes until [`Self::complete_handshake`].
    pub fn with_manual_handshakes(self) -> Self {
        self.lock().manual_handshakes = true;
        self
    }

    /// Refuse the next `count` handshakes.
    pub fn refuse_connects(&self, count: u32) {
        self.lock().refuse_connects = count;
    }

    fn lock(&self) -> MutexGuard<'_, Hub> {
        // A panic while holding the lock only happens inside a failing test.
        self.hub.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Number of handshakes attempted so far.
    pub fn connect_attempts(&self) -> u32 {
        self.lock().connect_attempts
    }

    /// Sockets whose connection is currently open.
    pub fn connected_sockets(&self) -> Vec<SocketId> {
        self.lock()
            .sockets
            .iter()
            .filter(|s| s.connected.load(Ordering::SeqCst))
            .map(|s| s.id)
            .collect()
    }

    /// Number of open connections closed so far, by either side.
    pub fn closed_connections(&self) -> u32 {
        self.lock().closed_connections
    }

    /// Complete the oldest held handshake. Returns `false` if none is pending.
    pub fn complete_handshake(&self) -> bool {
        let pending = self.lock().pending_handshakes.pop_front();
        match pending {
            Some((_, reply)) => reply.send(Ok(())).is_ok(),
            None => false,
        }
    }

    /// Topics with a join waiting for acknowledgment, oldest first.
    pub fn pending_joins(&self) -> Vec<String> {
        self.lock().pending_joins.iter().map(|p| p.topic.clone()).collect()
    }

    /// Acknowledge the oldest pending join for `topic`.
    pub fn ack(&self, topic: &str) -> bool {
        self.resolve(topic, Ok(serde_json::json!({})))
    }

    /// Reject the oldest pending join for `topic` with `response`.
    pub fn reject(&self, topic: &str, response: Value) -> bool {
        self.resolve(topic, Err(TransportError::JoinRejected(response)))
    }

    fn resolve(&self, topic: &str, result: Result<Value, TransportError>) -> bool {
        let mut hub = self.lock();
        let Some(index) = hub.pending_joins.iter().position(|p| p.topic == topic) else {
            return false;
        };
        let Some(pending) = hub.pending_joins.remove(index) else {
            return false;
        };
        if result.is_ok() {
            hub.joined.push(JoinedChannel {
                channel_id: pending.channel_id,
                socket_id: pending.socket_id,
                topic: pending.topic,
                messages: pending.messages,
            });
        }
        drop(hub);
        pending.reply.send(result).is_ok()
    }

    /// Push an event to every joined channel on `topic`. Returns the number
    /// of channels that received it.
    pub fn push(&self, topic: &str, event: &str, payload: Value) -> usize {
        let hub = self.lock();
        let mut delivered = 0;
        for joined in hub.joined.iter().filter(|j| j.topic == topic) {
            let message = ChannelMessage {
                topic: topic.to_string(),
                event: event.to_string(),
                payload: payload.clone(),
            };
            if joined.messages.send(message).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Topics left so far, in order.
    pub fn left_topics(&self) -> Vec<String> {
        self.lock().left.clone()
    }

    /// Simulate the server dropping `socket`'s connection.
    pub fn drop_connection(&self, socket: SocketId) -> bool {
        close_socket(&mut self.lock(), socket)
    }
}

/// Mark a socket closed and fail everything riding on it.
fn close_socket(hub: &mut Hub, socket: SocketId) -> bool {
    let Some(record) = hub.sockets.iter().find(|s| s.id == socket) else {
        return false;
    };
    let was_connected = record.connected.swap(false, Ordering::SeqCst);
    record.closed_tx.send_replace(true);
    if was_connected {
        hub.closed_connections += 1;
    }

    let (failed, kept): (VecDeque<_>, VecDeque<_>) = hub
        .pending_joins
        .drain(..)
        .partition(|p| p.socket_id == socket);
    hub.pending_joins = kept;
    for pending in failed {
        let _ = pending.reply.send(Err(TransportError::Closed));
    }
    hub.pending_handshakes.retain(|(id, _)| *id != socket);
    hub.joined.retain(|j| j.socket_id != socket);
    was_connected
}

impl Transport for MemoryTransport {
    fn socket(&self, params: Params, logger: TransportLogger) -> Arc<dyn Socket> {
        let id = SocketId::next();
        let connected = Arc::new(AtomicBool::new(false));
        let (closed_tx, _) = watch::channel(false);
        let closed_rx = closed_tx.subscribe();
        self.lock().sockets.push(SocketRecord {
            id,
            connected: Arc::clone(&connected),
            closed_tx,
        });
        Arc::new(MemorySocket {
            id,
            params,
            logger,
            connected,
            closed_rx,
            transport: self.clone(),
        })
    }
}

/// Socket created by [`MemoryTransport`].
#[derive(Clone)]
pub struct MemorySocket {
    id: SocketId,
    params: Params,
    logger: TransportLogger,
    connected: Arc<AtomicBool>,
    closed_rx: watch::Receiver<bool>,
    transport: MemoryTransport,
}

impl std::fmt::Debug for MemorySocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySocket")
            .field("id", &self.id)
            .field("params", &self.params)
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl MemorySocket {
    fn log(&self, kind: &str, msg: impl Into<String>, data: Value) {
        (self.logger)(&TransportEvent::new(kind, msg, data));
    }
}

#[async_trait]
impl Socket for MemorySocket {
    fn id(&self) -> SocketId {
        self.id
    }

    async fn connect(&self) -> Result<(), TransportError> {
        self.log("transport", "connecting", Value::Object(self.params.clone()));

        let waiter = {
            let mut hub = self.transport.lock();
            hub.connect_attempts += 1;
            if hub.refuse_connects > 0 {
                hub.refuse_connects -= 1;
                None
            } else if hub.manual_handshakes {
                let (tx, rx) = oneshot::channel();
                hub.pending_handshakes.push_back((self.id, tx));
                Some(Some(rx))
            } else {
                Some(None)
            }
        };

        match waiter {
            None => {
                self.log("transport", "connection refused", Value::Null);
                return Err(TransportError::ConnectionFailed("connection refused".to_string()));
            }
            Some(Some(rx)) => {
                rx.await.map_err(|_recv_error| TransportError::Closed)??;
            }
            Some(None) => {}
        }

        self.connected.store(true, Ordering::SeqCst);
        self.log("transport", "connected", Value::Null);
        Ok(())
    }

    async fn disconnect(&self) {
        let was_connected = close_socket(&mut self.transport.lock(), self.id);
        if was_connected {
            self.log("transport", "disconnected", Value::Null);
        }
    }

    fn channel(&self, topic: &str, params: Params) -> Arc<dyn Channel> {
        let channel_id = {
            let mut hub = self.transport.lock();
            hub.next_channel_id += 1;
            hub.next_channel_id
        };
        let (messages, _) = broadcast::channel(64);
        Arc::new(MemoryChannel {
            id: channel_id,
            topic: topic.to_string(),
            params,
            socket: self.clone(),
            messages,
            left: AtomicBool::new(false),
        })
    }

    async fn closed(&self) {
        let mut rx = self.closed_rx.clone();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Channel created by [`MemorySocket`].
pub struct MemoryChannel {
    id: u64,
    topic: String,
    params: Params,
    socket: MemorySocket,
    messages: broadcast::Sender<ChannelMessage>,
    left: AtomicBool,
}

impl std::fmt::Debug for MemoryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryChannel")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("socket", &self.socket.id)
            .finish_non_exhaustive()
    }
}

static JOIN_REFS: AtomicU64 = AtomicU64::new(1);

#[async_trait]
impl Channel for MemoryChannel {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn params(&self) -> &Params {
        &self.params
    }

    fn socket_id(&self) -> SocketId {
        self.socket.id
    }

    async fn join(&self) -> Result<Value, TransportError> {
        if !self.socket.is_connected() {
            return Err(TransportError::Closed);
        }
        let join_ref = JOIN_REFS.fetch_add(1, Ordering::Relaxed);
        self.socket.log(
            "push",
            format!("{}: phx_join ({})", self.topic, join_ref),
            Value::Object(self.params.clone()),
        );

        let rx = {
            let mut hub = self.socket.transport.lock();
            if hub.manual_acks {
                let (tx, rx) = oneshot::channel();
                hub.pending_joins.push_back(PendingJoin {
                    channel_id: self.id,
                    socket_id: self.socket.id,
                    topic: self.topic.clone(),
                    messages: self.messages.clone(),
                    reply: tx,
                });
                Some(rx)
            } else {
                hub.joined.push(JoinedChannel {
                    channel_id: self.id,
                    socket_id: self.socket.id,
                    topic: self.topic.clone(),
                    messages: self.messages.clone(),
                });
                None
            }
        };

        let reply = match rx {
            Some(rx) => rx.await.map_err(|_recv_error| TransportError::Closed)?,
            None => Ok(serde_json::json!({})),
        };
        let status = if reply.is_ok() { "ok" } else { "error" };
        self.socket
            .log("receive", format!("{status} {} phx_reply ({join_ref})", self.topic), Value::Null);
        reply
    }

    fn leave(&self) {
        if self.left.swap(true, Ordering::SeqCst) {
            return;
        }
        self.socket
            .log("push", format!("{}: phx_leave", self.topic), Value::Null);
        let mut hub = self.socket.transport.lock();
        hub.joined.retain(|j| j.channel_id != self.id);
        hub.pending_joins.retain(|p| p.channel_id != self.id);
        hub.left.push(self.topic.clone());
    }

    fn messages(&self) -> broadcast::Receiver<ChannelMessage> {
        self.messages.subscribe()
    }
}
