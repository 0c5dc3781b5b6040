//! Transport boundary for the session manager.
//!
//! The session manager never speaks a wire protocol itself. It drives a
//! [`Transport`] that hands out [`Socket`]s, which in turn hand out
//! [`Channel`]s multiplexed over the one connection.
//!
//! # Architecture
//!
//! ```text
//! Transport (factory)
//!     │ socket(params, logger)
//!     ▼
//! Socket ── connect() / disconnect() / closed()
//!     │ channel(topic, params)
//!     ├──► Channel "room:lobby"  ── join() / leave() / messages()
//!     └──► Channel "room:42"     ── join() / leave() / messages()
//! ```
//!
//! Two implementations ship with the crate:
//!
//! - [`phoenix::PhoenixTransport`] - Phoenix Channels V2 JSON over WebSocket
//! - [`memory::MemoryTransport`] - scriptable in-process transport

// Rust guideline compliant 2026-02

pub mod memory;
pub mod phoenix;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

pub use crate::error::TransportError;

/// Connection or join parameters. Always a JSON object.
pub type Params = serde_json::Map<String, serde_json::Value>;

/// Diagnostic hook invoked for every transport-level event.
pub type TransportLogger = Arc<dyn Fn(&TransportEvent) + Send + Sync>;

/// One transport-level event, as seen by the diagnostic hook.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportEvent {
    /// Event category (`"transport"`, `"push"`, `"receive"`, `"channel"`).
    pub kind: String,
    /// Short description.
    pub msg: String,
    /// Associated payload, `Null` when there is none.
    pub data: serde_json::Value,
    /// When the event was recorded.
    pub at: DateTime<Utc>,
}

impl TransportEvent {
    /// Create an event stamped with the current time.
    pub fn new(kind: &str, msg: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            kind: kind.to_string(),
            msg: msg.into(),
            data,
            at: Utc::now(),
        }
    }
}

/// Logger that forwards every transport event to the `log` facade at debug level.
pub fn log_logger() -> TransportLogger {
    Arc::new(|event: &TransportEvent| {
        log::debug!(
            target: "channel_session::transport",
            "{}: {} {}",
            event.kind,
            event.msg,
            event.data
        );
    })
}

/// Message pushed by the server on a joined channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMessage {
    /// Channel topic the message arrived on.
    pub topic: String,
    /// Event name.
    pub event: String,
    /// Event payload.
    pub payload: serde_json::Value,
}

/// Process-unique socket identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub u64);

impl SocketId {
    /// Allocate the next identifier.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "socket#{}", self.0)
    }
}

/// Factory for sockets.
pub trait Transport: Send + Sync + fmt::Debug {
    /// Create an unconnected socket with the given parameters and diagnostic hook.
    fn socket(&self, params: Params, logger: TransportLogger) -> Arc<dyn Socket>;
}

/// A single transport connection carrying multiplexed channels.
#[async_trait]
pub trait Socket: Send + Sync + fmt::Debug {
    /// Identifier of this socket.
    fn id(&self) -> SocketId;

    /// Perform the connection handshake.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::ConnectionFailed` if the handshake fails.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Close the connection. Resolves once teardown has been initiated and
    /// the connection task has acknowledged it.
    async fn disconnect(&self);

    /// Create a channel handle for `topic`. No traffic is sent until
    /// [`Channel::join`] is called.
    fn channel(&self, topic: &str, params: Params) -> Arc<dyn Channel>;

    /// Resolves when the connection has ended for any reason.
    async fn closed(&self);

    /// Whether the connection is currently open.
    fn is_connected(&self) -> bool;
}

/// A channel subscription riding on a [`Socket`].
#[async_trait]
pub trait Channel: Send + Sync + fmt::Debug {
    /// Channel topic (the name passed to `join`).
    fn topic(&self) -> &str;

    /// Parameters sent with the join.
    fn params(&self) -> &Params;

    /// Socket this channel belongs to.
    fn socket_id(&self) -> SocketId;

    /// Request the join and wait for the acknowledgment.
    ///
    /// Returns the server's reply payload on success.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::JoinRejected` if the server refuses, or
    /// `TransportError::Closed` if the connection drops first.
    async fn join(&self) -> Result<serde_json::Value, TransportError>;

    /// Request to leave. Does not wait for an acknowledgment.
    fn leave(&self);

    /// Subscribe to messages pushed on this channel.
    fn messages(&self) -> broadcast::Receiver<ChannelMessage>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_socket_ids_are_unique() {
        let a = SocketId::next();
        let b = SocketId::next();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn test_logger_hook_receives_events() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let logger: TransportLogger = Arc::new(move |event: &TransportEvent| {
            sink.lock().unwrap().push(event.kind.clone());
        });

        logger(&TransportEvent::new("push", "room:lobby phx_join", serde_json::Value::Null));
        logger(&TransportEvent::new("receive", "ok", serde_json::json!({})));

        assert_eq!(*seen.lock().unwrap(), vec!["push", "receive"]);
    }
}
