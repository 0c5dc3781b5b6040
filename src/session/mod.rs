//! Channel session manager.
//!
//! Owns one socket connection and the channels joined over it. All state
//! changes happen on a single coordinator task; callers talk to it through a
//! cloneable [`SessionManager`] handle.
//!
//! # Architecture
//!
//! ```text
//!   SessionManager (handle, Clone)
//!         │ connect / join / leave / on
//!         ▼
//!   Coordinator task ─── Store (snapshot + reducer) ──► watch subscribers
//!         │  ▲
//!         │  └── completions: handshake done, join acked, socket closed
//!         ▼
//!   spawned handshake / join tasks ──► Transport
//! ```
//!
//! Operations queue on one channel and run to completion in order.
//! Handshakes and join acknowledgments are awaited in spawned tasks that
//! post a completion back onto the same queue, so state updates land in the
//! order acknowledgments resolve, not the order operations were issued.
//!
//! # Connect generations
//!
//! Each `connect()` bumps a generation counter. Completions from an older
//! generation are dropped and their socket disconnected, so only the most
//! recent `connect()` can install a socket.
//!
//! # Rejoins
//!
//! After a reconnect every mapped channel is re-joined on the new socket.
//! Pending rejoins are tracked per alias so a `leave()` or a fresh `join()`
//! issued meanwhile wins over the late acknowledgment.

// Rust guideline compliant 2026-02

pub mod handlers;
pub mod state;
pub mod store;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

use crate::config::{SessionConfig, UnknownChannelPolicy};
use crate::error::{SessionError, TransportError};
use crate::transport::{
    log_logger, Channel, ChannelMessage, Params, Socket, SocketId, Transport, TransportLogger,
};

pub use handlers::{ChannelHandler, HandlerRegistry};
pub use state::{
    reduce, same_channel, ChannelMap, ChannelStatus, ConnectionState, ConnectionStatus,
    SessionEvent,
};
pub use store::Store;

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

/// Who is waiting for a join acknowledgment.
enum JoinOrigin {
    /// A `join()` caller.
    Caller(Reply<Arc<dyn Channel>>),
    /// A rejoin issued after a reconnect.
    Rejoin,
}

/// Messages processed by the coordinator.
enum Message {
    // === Operations ===
    Connect {
        reply: Option<Reply<()>>,
    },
    Join {
        name: String,
        alias: Option<String>,
        params: Option<Params>,
        reply: Reply<Arc<dyn Channel>>,
    },
    Leave {
        name: String,
        reply: Reply<()>,
    },
    On {
        alias: String,
        handler: ChannelHandler,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },

    // === Completions ===
    Attempt {
        generation: u64,
        attempt: u32,
    },
    Connected {
        generation: u64,
        socket: Arc<dyn Socket>,
    },
    ConnectFailed {
        generation: u64,
        error: TransportError,
    },
    Joined {
        alias: String,
        channel: Arc<dyn Channel>,
        result: Result<serde_json::Value, TransportError>,
        origin: JoinOrigin,
    },
    SocketClosed {
        socket_id: SocketId,
    },
}

/// Handle to a running session.
///
/// Cloning is cheap; all clones drive the same coordinator. The coordinator
/// stops when [`Self::shutdown`] is called or every handle is dropped.
#[derive(Debug, Clone)]
pub struct SessionManager {
    tx: mpsc::UnboundedSender<Message>,
    state_rx: watch::Receiver<Arc<ConnectionState>>,
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Connect { .. } => "Connect",
            Self::Join { .. } => "Join",
            Self::Leave { .. } => "Leave",
            Self::On { .. } => "On",
            Self::Shutdown { .. } => "Shutdown",
            Self::Attempt { .. } => "Attempt",
            Self::Connected { .. } => "Connected",
            Self::ConnectFailed { .. } => "ConnectFailed",
            Self::Joined { .. } => "Joined",
            Self::SocketClosed { .. } => "SocketClosed",
        };
        f.write_str(name)
    }
}

impl SessionManager {
    /// Start a session over `transport`. Logs transport events through `log`.
    ///
    /// Must be called from within a tokio runtime. Does not connect; call
    /// [`Self::initialize`] or [`Self::connect`].
    pub fn spawn(transport: Arc<dyn Transport>, config: SessionConfig) -> Self {
        Self::spawn_with_logger(transport, config, log_logger())
    }

    /// Start a session with a custom transport diagnostic hook.
    pub fn spawn_with_logger(
        transport: Arc<dyn Transport>,
        config: SessionConfig,
        logger: TransportLogger,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let coordinator = Coordinator::new(transport, config, logger, &tx);
        let state_rx = coordinator.store.subscribe();
        tokio::spawn(coordinator.run(rx));

        Self { tx, state_rx }
    }

    fn send(&self, message: Message) -> Result<(), SessionError> {
        self.tx.send(message).map_err(|_send_error| SessionError::Closed)
    }

    /// Schedule a connect without waiting for it. Failures show up in the
    /// snapshot status.
    pub fn initialize(&self) {
        if self.send(Message::Connect { reply: None }).is_err() {
            log::warn!("[Session] initialize() after shutdown");
        }
    }

    /// Connect, replacing any existing socket.
    ///
    /// Resolves when the handshake completes or every attempt allowed by the
    /// reconnect policy has failed.
    pub async fn connect(&self) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Message::Connect { reply: Some(reply) })?;
        rx.await.map_err(|_recv_error| SessionError::Closed)?
    }

    /// Join channel `name`, stored under `alias` (defaults to `name`).
    ///
    /// Resolves with the channel once the server acknowledges the join.
    ///
    /// # Errors
    ///
    /// `NotConnected` if no socket is connected; `TransportFailure` if the
    /// join is rejected, times out or the connection drops.
    pub async fn join(
        &self,
        name: &str,
        alias: Option<&str>,
        params: Option<Params>,
    ) -> Result<Arc<dyn Channel>, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Message::Join {
            name: name.to_string(),
            alias: alias.map(str::to_string),
            params,
            reply,
        })?;
        rx.await.map_err(|_recv_error| SessionError::Closed)?
    }

    /// Leave the channel stored under `name`.
    ///
    /// # Errors
    ///
    /// `UnknownChannel` if `name` is not joined and the policy is
    /// [`UnknownChannelPolicy::Report`].
    pub async fn leave(&self, name: &str) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Message::Leave {
            name: name.to_string(),
            reply,
        })?;
        rx.await.map_err(|_recv_error| SessionError::Closed)?
    }

    /// Register a handler for messages on the channel stored under `alias`.
    ///
    /// Active immediately if the alias is joined, otherwise from its next
    /// acknowledged join.
    pub fn on<F>(&self, alias: &str, handler: F) -> Result<(), SessionError>
    where
        F: Fn(&ChannelMessage) + Send + Sync + 'static,
    {
        self.send(Message::On {
            alias: alias.to_string(),
            handler: Arc::new(handler),
        })
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> Arc<ConnectionState> {
        Arc::clone(&self.state_rx.borrow())
    }

    /// Observe snapshots as they are published.
    pub fn subscribe(&self) -> watch::Receiver<Arc<ConnectionState>> {
        self.state_rx.clone()
    }

    /// Disconnect and stop the coordinator. Idempotent.
    pub async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self.send(Message::Shutdown { done }).is_ok() {
            let _ = rx.await;
        }
    }
}

struct Coordinator {
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    logger: TransportLogger,
    store: Store,
    handlers: HandlerRegistry,
    /// Generation of the current connect, shared with handshake tasks so
    /// superseded retry loops stop early.
    generation: Arc<AtomicU64>,
    pending_connect: Option<Reply<()>>,
    /// Sockets we are tearing down ourselves; their close is not a loss.
    /// Only sockets with a close watcher are tracked here.
    expected_closes: HashSet<SocketId>,
    /// Alias -> fresh handle for rejoins not yet acknowledged.
    rejoining: HashMap<String, Arc<dyn Channel>>,
    tx: mpsc::WeakUnboundedSender<Message>,
}

impl Coordinator {
    fn new(
        transport: Arc<dyn Transport>,
        config: SessionConfig,
        logger: TransportLogger,
        tx: &mpsc::UnboundedSender<Message>,
    ) -> Self {
        Self {
            transport,
            config,
            logger,
            store: Store::new(),
            handlers: HandlerRegistry::default(),
            generation: Arc::new(AtomicU64::new(0)),
            pending_connect: None,
            expected_closes: HashSet::new(),
            rejoining: HashMap::new(),
            tx: tx.downgrade(),
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Message>) {
        log::debug!("[Session] Coordinator started");
        while let Some(message) = rx.recv().await {
            log::trace!("[Session] Handling {:?}", message);
            match message {
                Message::Connect { reply } => self.handle_connect(reply),
                Message::Join {
                    name,
                    alias,
                    params,
                    reply,
                } => self.handle_join(name, alias, params, reply),
                Message::Leave { name, reply } => self.handle_leave(name, reply),
                Message::On { alias, handler } => self.handle_on(&alias, handler),
                Message::Shutdown { done } => {
                    self.shutdown().await;
                    let _ = done.send(());
                    return;
                }
                Message::Attempt {
                    generation,
                    attempt,
                } => {
                    if self.is_current(generation) {
                        self.store.dispatch(&SessionEvent::ConnectAttempt { attempt });
                    }
                }
                Message::Connected { generation, socket } => {
                    self.handle_connected(generation, socket);
                }
                Message::ConnectFailed { generation, error } => {
                    self.handle_connect_failed(generation, error);
                }
                Message::Joined {
                    alias,
                    channel,
                    result,
                    origin,
                } => self.handle_joined(alias, channel, result, origin),
                Message::SocketClosed { socket_id } => self.handle_socket_closed(socket_id),
            }
        }
        // Every handle dropped.
        self.shutdown().await;
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn handle_connect(&mut self, reply: Option<Reply<()>>) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(previous) = std::mem::replace(&mut self.pending_connect, reply) {
            let _ = previous.send(Err(SessionError::Superseded));
        }

        let state = self.store.state();
        let old = state.socket().cloned();
        if let Some(old) = &old {
            log::info!("[Session] Reconnecting, releasing {}", old.id());
            self.expected_closes.insert(old.id());
        } else {
            log::info!("[Session] Connecting to {}", self.config.endpoint);
        }
        self.store.dispatch(&SessionEvent::ConnectAttempt { attempt: 1 });

        let task = HandshakeTask {
            generation,
            current: Arc::clone(&self.generation),
            old,
            transport: Arc::clone(&self.transport),
            logger: Arc::clone(&self.logger),
            config: self.config.clone(),
            tx: self.tx.clone(),
        };
        tokio::spawn(task.run());
    }

    fn handle_connected(&mut self, generation: u64, socket: Arc<dyn Socket>) {
        if !self.is_current(generation) {
            // Never watched, so its close never reaches the coordinator.
            log::debug!("[Session] Discarding superseded {}", socket.id());
            tokio::spawn(async move { socket.disconnect().await });
            return;
        }

        log::info!("[Session] Connected ({})", socket.id());
        let previous = self.store.state();
        self.store.dispatch(&SessionEvent::SocketConnect {
            socket: Arc::clone(&socket),
        });
        if let Some(reply) = self.pending_connect.take() {
            let _ = reply.send(Ok(()));
        }

        let closed = Arc::clone(&socket);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            closed.closed().await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Message::SocketClosed {
                    socket_id: closed.id(),
                });
            }
        });

        if self.config.rejoin_on_reconnect {
            self.rejoin_all(&previous, &socket);
        }
    }

    /// Re-issue joins for every channel not bound to `socket`.
    fn rejoin_all(&mut self, state: &ConnectionState, socket: &Arc<dyn Socket>) {
        for (alias, channel) in state.channels() {
            if channel.socket_id() == socket.id() {
                continue;
            }
            log::info!("[Session] Rejoining {} ({})", alias, channel.topic());
            let fresh = socket.channel(channel.topic(), channel.params().clone());
            self.rejoining.insert(alias.clone(), Arc::clone(&fresh));
            self.store.dispatch(&SessionEvent::ChannelRejoin {
                name: alias.clone(),
            });
            self.spawn_join(alias.clone(), fresh, JoinOrigin::Rejoin);
        }
    }

    /// Leave a channel whose acknowledgment is no longer wanted, unless the
    /// alias now holds another handle on the same topic (the server has
    /// already replaced the subscription).
    fn discard(&self, alias: &str, channel: &Arc<dyn Channel>) {
        let superseded = self.store.state().channel(alias).is_some_and(|current| {
            !same_channel(current, channel) && current.topic() == channel.topic()
        });
        if !superseded {
            channel.leave();
        }
    }

    fn handle_connect_failed(&mut self, generation: u64, error: TransportError) {
        if !self.is_current(generation) {
            return;
        }
        log::error!("[Session] Connect failed: {}", error);
        self.store.dispatch(&SessionEvent::ConnectFailed {
            reason: error.to_string(),
        });
        if let Some(reply) = self.pending_connect.take() {
            let _ = reply.send(Err(SessionError::TransportFailure(error)));
        }
    }

    fn handle_socket_closed(&mut self, socket_id: SocketId) {
        if self.expected_closes.remove(&socket_id) {
            log::debug!("[Session] {} closed after release", socket_id);
            return;
        }

        let was_current = self
            .store
            .state()
            .socket()
            .is_some_and(|s| s.id() == socket_id);
        if !was_current {
            return;
        }

        log::warn!("[Session] Connection lost ({})", socket_id);
        self.store.dispatch(&SessionEvent::SocketClosed { socket_id });
        if self.config.reconnect_on_close {
            self.handle_connect(None);
        }
    }

    fn handle_join(
        &mut self,
        name: String,
        alias: Option<String>,
        params: Option<Params>,
        reply: Reply<Arc<dyn Channel>>,
    ) {
        let state = self.store.state();
        let socket = match state.socket() {
            Some(socket) if state.is_connected() => Arc::clone(socket),
            _ => {
                log::warn!("[Session] join({}) without an active connection", name);
                let _ = reply.send(Err(SessionError::NotConnected));
                return;
            }
        };

        let alias = alias.unwrap_or_else(|| name.clone());
        if let Some(pending) = self.rejoining.remove(&alias) {
            log::debug!("[Session] join({}) replaces pending rejoin of {}", alias, pending.topic());
            if pending.topic() != name {
                pending.leave();
            }
        }
        log::debug!("[Session] Joining {} as {}", name, alias);
        let channel = socket.channel(&name, params.unwrap_or_default());
        self.spawn_join(alias, channel, JoinOrigin::Caller(reply));
    }

    fn spawn_join(&self, alias: String, channel: Arc<dyn Channel>, origin: JoinOrigin) {
        let timeout = self.config.join_timeout();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, channel.join()).await {
                Ok(result) => result,
                Err(_elapsed) => {
                    log::warn!(
                        "[Session] Join of {} timed out after {:?}",
                        channel.topic(),
                        timeout
                    );
                    channel.leave();
                    Err(TransportError::Timeout)
                }
            };
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Message::Joined {
                    alias,
                    channel,
                    result,
                    origin,
                });
            }
        });
    }

    fn handle_joined(
        &mut self,
        alias: String,
        channel: Arc<dyn Channel>,
        result: Result<serde_json::Value, TransportError>,
        origin: JoinOrigin,
    ) {
        let reply = match origin {
            JoinOrigin::Caller(reply) => Some(reply),
            JoinOrigin::Rejoin => {
                let wanted = self
                    .rejoining
                    .get(&alias)
                    .is_some_and(|pending| same_channel(pending, &channel));
                if !wanted {
                    log::debug!(
                        "[Session] Dropping stale rejoin of {} as {}",
                        channel.topic(),
                        alias
                    );
                    if result.is_ok() {
                        self.discard(&alias, &channel);
                    }
                    return;
                }
                self.rejoining.remove(&alias);
                None
            }
        };

        if let Err(error) = result {
            log::warn!("[Session] Join of {} as {} failed: {}", channel.topic(), alias, error);
            match reply {
                Some(reply) => {
                    let _ = reply.send(Err(SessionError::TransportFailure(error)));
                }
                None => {
                    self.store.dispatch(&SessionEvent::ChannelRejoinFailed {
                        name: alias,
                        reason: error.to_string(),
                    });
                }
            }
            return;
        }

        let previous = self.store.state().channel(&alias).cloned();
        self.handlers.install(&alias, &channel);
        self.store.dispatch(&SessionEvent::ChannelJoin {
            name: alias.clone(),
            channel: Arc::clone(&channel),
        });
        log::info!("[Session] Joined {} as {}", channel.topic(), alias);

        // A replaced handle on another topic would otherwise stay subscribed
        // server-side. Same-topic joins supersede the old one on the server.
        if let Some(previous) = previous {
            if !same_channel(&previous, &channel) && previous.topic() != channel.topic() {
                log::debug!("[Session] Leaving replaced {} for alias {}", previous.topic(), alias);
                previous.leave();
            }
        }

        if let Some(reply) = reply {
            let _ = reply.send(Ok(channel));
        }
    }

    fn handle_leave(&mut self, name: String, reply: Reply<()>) {
        let state = self.store.state();
        let Some(channel) = state.channel(&name) else {
            let result = match self.config.unknown_channel {
                UnknownChannelPolicy::Report => Err(SessionError::UnknownChannel(name)),
                UnknownChannelPolicy::Ignore => {
                    log::warn!("[Session] leave({}) for a channel that is not joined", name);
                    Ok(())
                }
            };
            let _ = reply.send(result);
            return;
        };

        channel.leave();
        if let Some(pending) = self.rejoining.remove(&name) {
            log::debug!("[Session] Cancelling pending rejoin of {}", name);
            pending.leave();
        }
        self.handlers.uninstall(&name);
        self.store.dispatch(&SessionEvent::ChannelLeave { name });
        let _ = reply.send(Ok(()));
    }

    fn handle_on(&mut self, alias: &str, handler: ChannelHandler) {
        self.handlers.register(alias, handler);
        if let Some(channel) = self.store.state().channel(alias) {
            self.handlers.install(alias, channel);
        }
    }

    async fn shutdown(&mut self) {
        // Invalidate in-flight handshakes.
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(reply) = self.pending_connect.take() {
            let _ = reply.send(Err(SessionError::Closed));
        }
        self.handlers.clear();
        self.rejoining.clear();

        let state = self.store.state();
        if let Some(socket) = state.socket() {
            log::info!("[Session] Shutting down, disconnecting {}", socket.id());
            self.expected_closes.insert(socket.id());
            if tokio::time::timeout(self.config.teardown_timeout(), socket.disconnect())
                .await
                .is_err()
            {
                log::warn!("[Session] Disconnect of {} timed out", socket.id());
            }
            self.store.dispatch(&SessionEvent::SocketClosed {
                socket_id: socket.id(),
            });
        }
    }
}

/// Tears down the previous socket, then runs handshake attempts with backoff.
struct HandshakeTask {
    generation: u64,
    current: Arc<AtomicU64>,
    old: Option<Arc<dyn Socket>>,
    transport: Arc<dyn Transport>,
    logger: TransportLogger,
    config: SessionConfig,
    tx: mpsc::WeakUnboundedSender<Message>,
}

impl HandshakeTask {
    fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.generation
    }

    fn post(&self, message: Message) -> bool {
        match self.tx.upgrade() {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }

    async fn run(self) {
        if let Some(old) = &self.old {
            if tokio::time::timeout(self.config.teardown_timeout(), old.disconnect())
                .await
                .is_err()
            {
                log::warn!("[Session] Teardown of {} timed out, continuing", old.id());
            }
        }

        let policy = &self.config.reconnect;
        let mut attempt: u32 = 1;
        loop {
            if !self.is_current() {
                log::debug!("[Session] Handshake generation {} superseded", self.generation);
                return;
            }
            if attempt > 1 && !self.post(Message::Attempt {
                generation: self.generation,
                attempt,
            }) {
                return;
            }

            let socket = self
                .transport
                .socket(self.config.params.clone(), Arc::clone(&self.logger));
            match socket.connect().await {
                Ok(()) => {
                    if !self.post(Message::Connected {
                        generation: self.generation,
                        socket: Arc::clone(&socket),
                    }) {
                        socket.disconnect().await;
                    }
                    return;
                }
                Err(error) => {
                    if !policy.allows_retry(attempt) {
                        self.post(Message::ConnectFailed {
                            generation: self.generation,
                            error,
                        });
                        return;
                    }
                    let delay = policy.backoff(attempt);
                    log::warn!(
                        "[Session] Connect attempt {} failed: {} (retry in {:?})",
                        attempt,
                        error,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconnectPolicy;
    use crate::transport::memory::MemoryTransport;

    fn fast_config() -> SessionConfig {
        SessionConfig {
            reconnect: ReconnectPolicy {
                initial_backoff_ms: 1,
                max_backoff_ms: 5,
                max_attempts: 3,
            },
            join_timeout_ms: 200,
            teardown_timeout_ms: 200,
            ..SessionConfig::default()
        }
    }

    #[tokio::test]
    async fn test_join_before_connect_is_not_connected() {
        let session = SessionManager::spawn(Arc::new(MemoryTransport::new()), fast_config());

        let result = session.join("room1", None, None).await;
        assert_eq!(result.err(), Some(SessionError::NotConnected));
        assert!(session.snapshot().channels().is_empty());
        assert_eq!(session.snapshot().version(), 0);
    }

    #[tokio::test]
    async fn test_connect_then_join_and_leave() {
        let session = SessionManager::spawn(Arc::new(MemoryTransport::new()), fast_config());
        session.connect().await.unwrap();
        assert!(session.snapshot().is_connected());

        session.join("room1", None, None).await.unwrap();
        assert_eq!(session.snapshot().aliases(), vec!["room1"]);

        session.leave("room1").await.unwrap();
        assert!(session.snapshot().channels().is_empty());
    }

    #[tokio::test]
    async fn test_connect_gives_up_after_max_attempts() {
        let transport = MemoryTransport::new();
        transport.refuse_connects(10);
        let session = SessionManager::spawn(Arc::new(transport.clone()), fast_config());

        let result = session.connect().await;
        assert!(matches!(result, Err(SessionError::TransportFailure(_))));
        assert_eq!(transport.connect_attempts(), 3);
        assert!(matches!(session.snapshot().status(), ConnectionStatus::Failed { .. }));
    }

    #[tokio::test]
    async fn test_connect_retries_then_succeeds() {
        let transport = MemoryTransport::new();
        transport.refuse_connects(2);
        let session = SessionManager::spawn(Arc::new(transport.clone()), fast_config());

        session.connect().await.unwrap();
        assert_eq!(transport.connect_attempts(), 3);
        assert!(session.snapshot().is_connected());
    }

    #[tokio::test]
    async fn test_leave_unknown_reports_by_default() {
        let session = SessionManager::spawn(Arc::new(MemoryTransport::new()), fast_config());
        let result = session.leave("nonexistent").await;
        assert_eq!(result, Err(SessionError::UnknownChannel("nonexistent".to_string())));
    }

    #[tokio::test]
    async fn test_leave_unknown_ignored_by_policy() {
        let config = SessionConfig {
            unknown_channel: UnknownChannelPolicy::Ignore,
            ..fast_config()
        };
        let session = SessionManager::spawn(Arc::new(MemoryTransport::new()), config);
        assert_eq!(session.leave("nonexistent").await, Ok(()));
        assert_eq!(session.snapshot().version(), 0);
    }

    #[tokio::test]
    async fn test_superseded_socket_is_not_tracked_as_expected_close() {
        let transport = MemoryTransport::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut coordinator =
            Coordinator::new(Arc::new(transport.clone()), fast_config(), log_logger(), &tx);
        let stale = transport.socket(Params::new(), log_logger());
        stale.connect().await.unwrap();

        coordinator.generation.store(2, Ordering::SeqCst);
        coordinator.handle_connected(1, Arc::clone(&stale));

        assert!(coordinator.expected_closes.is_empty());
        assert!(coordinator.store.state().socket().is_none());
        stale.closed().await;
        assert!(transport.connected_sockets().is_empty());
    }

    #[tokio::test]
    async fn test_rejoin_ack_after_leave_is_discarded() {
        let transport = MemoryTransport::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut coordinator =
            Coordinator::new(Arc::new(transport.clone()), fast_config(), log_logger(), &tx);
        let socket = transport.socket(Params::new(), log_logger());
        socket.connect().await.unwrap();
        coordinator.handle_connected(0, Arc::clone(&socket));

        // Acknowledged, but nothing is waiting for it any more.
        let fresh = socket.channel("room:1", Params::new());
        fresh.join().await.unwrap();
        coordinator.handle_joined(
            "room1".to_string(),
            Arc::clone(&fresh),
            Ok(serde_json::json!({})),
            JoinOrigin::Rejoin,
        );

        assert!(coordinator.store.state().channels().is_empty());
        assert_eq!(transport.left_topics(), vec!["room:1"]);
    }

    #[tokio::test]
    async fn test_shutdown_closes_handle() {
        let transport = MemoryTransport::new();
        let session = SessionManager::spawn(Arc::new(transport.clone()), fast_config());
        session.connect().await.unwrap();

        session.shutdown().await;
        assert!(transport.connected_sockets().is_empty());
        assert_eq!(session.connect().await, Err(SessionError::Closed));
    }
}
