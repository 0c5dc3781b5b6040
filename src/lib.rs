//! Channel Session - one socket, many channels.
//!
//! This crate manages a single persistent pub/sub socket connection and the
//! named channels multiplexed over it, publishing every lifecycle transition
//! as an immutable state snapshot.
//!
//! # Architecture
//!
//! - **Session** - coordinator task owning the connection and channel map
//! - **Store** - snapshot + reducer; the only path that changes state
//! - **Transport** - boundary traits; Phoenix WebSocket and in-memory impls
//!
//! # Modules
//!
//! - [`session`] - [`SessionManager`], state, reducer, handlers
//! - [`transport`] - transport traits and implementations
//! - [`config`] - configuration loading
//! - [`error`] - error types
//! - [`ws`] - WebSocket reader/writer halves
//!
//! # Example
//!
//! ```ignore
//! let config = SessionConfig::from_env();
//! let transport = PhoenixTransport::new(&config.endpoint, config.heartbeat_interval());
//! let session = SessionManager::spawn(Arc::new(transport), config);
//!
//! session.connect().await?;
//! session.on("lobby", |msg| println!("{}: {}", msg.event, msg.payload))?;
//! session.join("room:lobby", Some("lobby"), None).await?;
//! ```

// Rust guideline compliant 2026-02

pub mod config;
pub mod error;
pub mod session;
pub mod transport;
pub mod ws;

// Re-export commonly used types
pub use config::{ReconnectPolicy, SessionConfig, UnknownChannelPolicy};
pub use error::{SessionError, TransportError};
pub use session::{
    ChannelStatus, ConnectionState, ConnectionStatus, SessionEvent, SessionManager,
};
pub use transport::memory::MemoryTransport;
pub use transport::phoenix::PhoenixTransport;
pub use transport::{Channel, ChannelMessage, Params, Socket, Transport};
