//! Error types for session and transport operations.
//!
//! [`TransportError`] is what a transport reports: a failed handshake, a
//! rejected join, a dead connection. [`SessionError`] is what callers of the
//! [`SessionManager`](crate::session::SessionManager) see, including the
//! precondition failures the manager detects on its own.

// Rust guideline compliant 2026-02

use std::fmt;

/// Errors reported by a transport implementation.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportError {
    /// Failed to establish the underlying connection.
    ConnectionFailed(String),
    /// The server refused the channel join. Carries the server's response.
    JoinRejected(serde_json::Value),
    /// The handshake or acknowledgment did not arrive in time.
    Timeout,
    /// The connection or channel was closed.
    Closed,
    /// The peer sent something the protocol does not allow.
    Protocol(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionFailed(msg) => write!(f, "Connection failed: {msg}"),
            Self::JoinRejected(response) => write!(f, "Join rejected: {response}"),
            Self::Timeout => write!(f, "Operation timed out"),
            Self::Closed => write!(f, "Connection closed"),
            Self::Protocol(msg) => write!(f, "Protocol error: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Errors returned by session operations.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    /// A join was attempted with no active connection.
    NotConnected,
    /// A leave was attempted on an alias that is not joined.
    UnknownChannel(String),
    /// The transport failed to connect or acknowledge a join.
    TransportFailure(TransportError),
    /// A newer `connect()` replaced this one before it completed.
    Superseded,
    /// The session coordinator has shut down.
    Closed,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => write!(f, "Not connected"),
            Self::UnknownChannel(alias) => write!(f, "Unknown channel: {alias}"),
            Self::TransportFailure(err) => write!(f, "Transport failure: {err}"),
            Self::Superseded => write!(f, "Superseded by a newer connect"),
            Self::Closed => write!(f, "Session closed"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::TransportFailure(err) => Some(err),
            _ => None,
        }
    }
}

impl From<TransportError> for SessionError {
    fn from(err: TransportError) -> Self {
        Self::TransportFailure(err)
    }
}
