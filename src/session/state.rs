//! Connection state snapshot and its reducer.
//!
//! A [`ConnectionState`] is immutable once built. [`reduce`] takes the
//! current snapshot and one [`SessionEvent`] and returns the next snapshot;
//! unchanged parts (including the channel map when only the socket moves)
//! are shared rather than copied.

// Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::transport::{Channel, Socket, SocketId};

/// Alias → channel handle.
pub type ChannelMap = HashMap<String, Arc<dyn Channel>>;

/// Join status of one alias in the channel map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    /// Acknowledged on the socket it is bound to.
    Joined,
    /// Being re-joined on a new socket; the stored handle is still the old one.
    Rejoining,
    /// The last rejoin failed. The entry stays until `leave()`.
    Failed {
        /// Error from the rejoin.
        reason: String,
    },
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Joined => write!(f, "joined"),
            Self::Rejoining => write!(f, "rejoining"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

/// Connection lifecycle status.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    /// No connection and none in progress.
    #[default]
    Disconnected,
    /// Handshake in progress.
    Connecting {
        /// 1-based attempt number within the current `connect()`.
        attempt: u32,
    },
    /// Connected and ready for joins.
    Connected,
    /// The last `connect()` gave up.
    Failed {
        /// Error from the final attempt.
        reason: String,
    },
}

impl ConnectionStatus {
    /// Whether joins can be issued.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting { attempt } => write!(f, "connecting (attempt {attempt})"),
            Self::Connected => write!(f, "connected"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

/// Immutable snapshot of the session.
#[derive(Debug, Clone, Default)]
pub struct ConnectionState {
    socket: Option<Arc<dyn Socket>>,
    channels: Arc<ChannelMap>,
    channel_status: Arc<HashMap<String, ChannelStatus>>,
    status: ConnectionStatus,
    version: u64,
}

impl ConnectionState {
    /// The active socket, if any.
    pub fn socket(&self) -> Option<&Arc<dyn Socket>> {
        self.socket.as_ref()
    }

    /// All joined channels keyed by alias.
    pub fn channels(&self) -> &ChannelMap {
        &self.channels
    }

    /// The channel joined under `alias`.
    pub fn channel(&self, alias: &str) -> Option<&Arc<dyn Channel>> {
        self.channels.get(alias)
    }

    /// Join status of the channel stored under `alias`.
    pub fn channel_status(&self, alias: &str) -> Option<&ChannelStatus> {
        self.channel_status.get(alias)
    }

    /// Connection status.
    pub fn status(&self) -> &ConnectionStatus {
        &self.status
    }

    /// Number of events that changed state since creation.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Whether there is a socket and it finished its handshake.
    pub fn is_connected(&self) -> bool {
        self.socket.is_some() && self.status.is_connected()
    }

    /// Aliases in sorted order, for display and comparisons.
    pub fn aliases(&self) -> Vec<String> {
        let mut aliases: Vec<String> = self.channels.keys().cloned().collect();
        aliases.sort();
        aliases
    }

    /// Copy of this snapshot with the version bumped.
    fn next(&self) -> Self {
        Self {
            version: self.version + 1,
            ..self.clone()
        }
    }

    /// Next snapshot with `alias` set to `status`, if the alias is mapped.
    fn with_channel_status(&self, alias: &str, status: ChannelStatus) -> Self {
        if !self.channels.contains_key(alias) {
            return self.clone();
        }
        let mut statuses = HashMap::clone(&self.channel_status);
        statuses.insert(alias.to_string(), status);
        Self {
            channel_status: Arc::new(statuses),
            ..self.next()
        }
    }
}

/// Events applied to the state. Mirrors `SOCKET_CONNECT`, `CHANNEL_JOIN`
/// and `CHANNEL_LEAVE`, plus connection status transitions.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A handshake completed; `socket` becomes the active socket.
    SocketConnect {
        /// The newly connected socket.
        socket: Arc<dyn Socket>,
    },
    /// A handshake attempt started.
    ConnectAttempt {
        /// 1-based attempt number.
        attempt: u32,
    },
    /// All handshake attempts failed.
    ConnectFailed {
        /// Error from the last attempt.
        reason: String,
    },
    /// A socket's connection ended.
    SocketClosed {
        /// Which socket closed.
        socket_id: SocketId,
    },
    /// A join was acknowledged.
    ChannelJoin {
        /// Alias the channel is stored under.
        name: String,
        /// The joined channel.
        channel: Arc<dyn Channel>,
    },
    /// A channel was left.
    ChannelLeave {
        /// Alias to remove.
        name: String,
    },
    /// A mapped channel is being re-joined after a reconnect.
    ChannelRejoin {
        /// Alias being re-joined.
        name: String,
    },
    /// Re-joining a mapped channel failed.
    ChannelRejoinFailed {
        /// Alias that could not be re-joined.
        name: String,
        /// Why.
        reason: String,
    },
}

impl SessionEvent {
    /// Event kind name, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SocketConnect { .. } => "SOCKET_CONNECT",
            Self::ConnectAttempt { .. } => "CONNECT_ATTEMPT",
            Self::ConnectFailed { .. } => "CONNECT_FAILED",
            Self::SocketClosed { .. } => "SOCKET_CLOSED",
            Self::ChannelJoin { .. } => "CHANNEL_JOIN",
            Self::ChannelLeave { .. } => "CHANNEL_LEAVE",
            Self::ChannelRejoin { .. } => "CHANNEL_REJOIN",
            Self::ChannelRejoinFailed { .. } => "CHANNEL_REJOIN_FAILED",
        }
    }
}

/// Compare two channel handles by identity.
pub fn same_channel(a: &Arc<dyn Channel>, b: &Arc<dyn Channel>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Compute the next snapshot. Returns an unchanged clone (same version)
/// when the event does not apply.
pub fn reduce(state: &ConnectionState, event: &SessionEvent) -> ConnectionState {
    match event {
        SessionEvent::SocketConnect { socket } => ConnectionState {
            socket: Some(Arc::clone(socket)),
            status: ConnectionStatus::Connected,
            ..state.next()
        },
        SessionEvent::ConnectAttempt { attempt } => ConnectionState {
            status: ConnectionStatus::Connecting { attempt: *attempt },
            ..state.next()
        },
        SessionEvent::ConnectFailed { reason } => ConnectionState {
            socket: None,
            status: ConnectionStatus::Failed {
                reason: reason.clone(),
            },
            ..state.next()
        },
        SessionEvent::SocketClosed { socket_id } => {
            if state.socket.as_ref().map(|s| s.id()) != Some(*socket_id) {
                return state.clone();
            }
            ConnectionState {
                socket: None,
                status: ConnectionStatus::Disconnected,
                ..state.next()
            }
        }
        SessionEvent::ChannelJoin { name, channel } => {
            let mut channels = ChannelMap::clone(&state.channels);
            channels.insert(name.clone(), Arc::clone(channel));
            let mut statuses = HashMap::clone(&state.channel_status);
            statuses.insert(name.clone(), ChannelStatus::Joined);
            ConnectionState {
                channels: Arc::new(channels),
                channel_status: Arc::new(statuses),
                ..state.next()
            }
        }
        SessionEvent::ChannelLeave { name } => {
            if !state.channels.contains_key(name) {
                return state.clone();
            }
            let mut channels = ChannelMap::clone(&state.channels);
            channels.remove(name);
            let mut statuses = HashMap::clone(&state.channel_status);
            statuses.remove(name);
            ConnectionState {
                channels: Arc::new(channels),
                channel_status: Arc::new(statuses),
                ..state.next()
            }
        }
        SessionEvent::ChannelRejoin { name } => {
            state.with_channel_status(name, ChannelStatus::Rejoining)
        }
        SessionEvent::ChannelRejoinFailed { name, reason } => state.with_channel_status(
            name,
            ChannelStatus::Failed {
                reason: reason.clone(),
            },
        ),
    }
}
