//! Snapshot store.
//!
//! Holds the current [`ConnectionState`] behind a `watch` channel. Every
//! [`Store::dispatch`] runs the reducer and, if anything changed, publishes a
//! fresh `Arc` so readers holding an older snapshot keep seeing it unchanged.

// Rust guideline compliant 2026-02

use std::sync::Arc;
use tokio::sync::watch;

use super::state::{reduce, ConnectionState, SessionEvent};

/// Owner of the session state.
#[derive(Debug)]
pub struct Store {
    tx: watch::Sender<Arc<ConnectionState>>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    /// Store holding the initial (disconnected, empty) state.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Arc::new(ConnectionState::default()));
        Self { tx }
    }

    /// Current snapshot.
    pub fn state(&self) -> Arc<ConnectionState> {
        Arc::clone(&self.tx.borrow())
    }

    /// Observe snapshots as they are published.
    pub fn subscribe(&self) -> watch::Receiver<Arc<ConnectionState>> {
        self.tx.subscribe()
    }

    /// Apply `event` and publish the result. Returns the snapshot in effect
    /// afterwards.
    pub fn dispatch(&self, event: &SessionEvent) -> Arc<ConnectionState> {
        let current = self.state();
        let next = reduce(&current, event);
        if next.version() == current.version() {
            log::trace!("[Session] {} left state unchanged", event.kind());
            return current;
        }

        log::debug!(
            "[Session] {} -> v{} status={} channels={:?}",
            event.kind(),
            next.version(),
            next.status(),
            next.aliases()
        );
        let next = Arc::new(next);
        self.tx.send_replace(Arc::clone(&next));
        next
    }
}
