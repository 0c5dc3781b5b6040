//! Per-alias channel event handlers.
//!
//! Handlers are registered by alias and become active when a join for that
//! alias is acknowledged. Each active alias gets one forwarding task that
//! reads the channel's message stream and calls the handlers in
//! registration order. Leaving or replacing the channel stops the task.

// Rust guideline compliant 2026-01

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::transport::{Channel, ChannelMessage};

/// Callback for messages pushed on a channel.
pub type ChannelHandler = Arc<dyn Fn(&ChannelMessage) + Send + Sync>;

/// Handlers keyed by alias, plus the tasks currently forwarding to them.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Vec<ChannelHandler>>,
    running: HashMap<String, JoinHandle<()>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: HashMap<&str, usize> = self
            .handlers
            .iter()
            .map(|(alias, list)| (alias.as_str(), list.len()))
            .collect();
        f.debug_struct("HandlerRegistry")
            .field("handlers", &counts)
            .field("running", &self.running.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl HandlerRegistry {
    /// Register `handler` for `alias`. Takes effect on the next
    /// [`Self::install`] for that alias.
    pub fn register(&mut self, alias: &str, handler: ChannelHandler) {
        self.handlers.entry(alias.to_string()).or_default().push(handler);
    }

    /// Whether any handler is registered for `alias`.
    pub fn has_handlers(&self, alias: &str) -> bool {
        self.handlers.get(alias).is_some_and(|list| !list.is_empty())
    }

    /// Whether a forwarding task is running for `alias`.
    pub fn is_installed(&self, alias: &str) -> bool {
        self.running.contains_key(alias)
    }

    /// Start forwarding `channel`'s messages to the handlers for `alias`,
    /// replacing any previous forwarding for that alias.
    pub fn install(&mut self, alias: &str, channel: &Arc<dyn Channel>) {
        self.uninstall(alias);
        let Some(handlers) = self.handlers.get(alias).filter(|list| !list.is_empty()) else {
            return;
        };
        let handlers = handlers.clone();
        let mut rx = channel.messages();
        let label = alias.to_string();

        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(message) => {
                        for handler in &handlers {
                            handler(&message);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        log::warn!(
                            "[Session] Handlers for {} lagged, skipped {} messages",
                            label,
                            skipped
                        );
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        self.running.insert(alias.to_string(), task);
    }

    /// Stop forwarding for `alias`. Registered handlers are kept.
    pub fn uninstall(&mut self, alias: &str) {
        if let Some(task) = self.running.remove(alias) {
            task.abort();
        }
    }

    /// Stop every forwarding task.
    pub fn clear(&mut self) {
        for (_, task) in self.running.drain() {
            task.abort();
        }
    }
}

impl Drop for HandlerRegistry {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryTransport;
    use crate::transport::{log_logger, Params, Socket, Transport};
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_installed_handler_receives_pushes() {
        let transport = MemoryTransport::new();
        let socket = transport.socket(Params::new(), log_logger());
        socket.connect().await.unwrap();
        let channel = socket.channel("room:1", Params::new());
        channel.join().await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut registry = HandlerRegistry::default();
        registry.register(
            "lobby",
            Arc::new(move |msg: &ChannelMessage| {
                let _ = tx.send(msg.event.clone());
            }),
        );
        registry.install("lobby", &channel);
        assert!(registry.is_installed("lobby"));

        transport.push("room:1", "new_msg", serde_json::json!({}));
        assert_eq!(rx.recv().await.as_deref(), Some("new_msg"));
    }

    #[tokio::test]
    async fn test_install_without_handlers_is_noop() {
        let transport = MemoryTransport::new();
        let channel = transport
            .socket(Params::new(), log_logger())
            .channel("room:1", Params::new());

        let mut registry = HandlerRegistry::default();
        registry.install("room:1", &channel);
        assert!(!registry.is_installed("room:1"));
        assert!(!registry.has_handlers("room:1"));
    }

    #[tokio::test]
    async fn test_uninstall_keeps_registration() {
        let transport = MemoryTransport::new();
        let channel = transport
            .socket(Params::new(), log_logger())
            .channel("room:1", Params::new());
        let calls = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&calls);

        let mut registry = HandlerRegistry::default();
        registry.register(
            "room:1",
            Arc::new(move |_: &ChannelMessage| *counter.lock().unwrap() += 1),
        );
        registry.install("room:1", &channel);
        registry.uninstall("room:1");

        assert!(!registry.is_installed("room:1"));
        assert!(registry.has_handlers("room:1"));
    }
}
