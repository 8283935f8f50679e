//! Consumer-facing event delivery.
//!
//! # Responsibilities
//! - Define the lifecycle/message event set
//! - Hold consumer-registered handlers and invoke them on emit
//!
//! # Design Decisions
//! - Explicit observer registration (a list of handlers), no ambient wiring
//! - Handlers run synchronously in registration order; the handler list is
//!   cloned out of the lock before dispatch so a slow handler never holds it
//! - A panicking handler is logged and skipped, never unwinds into the
//!   emitting connection loop

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use hyper::http::HeaderMap;

use crate::net::transport::MessageKind;

/// Metadata captured from the HTTP request that was upgraded.
#[derive(Debug, Clone)]
pub struct HandshakeInfo {
    /// Request URI as received (path and query).
    pub uri: String,
    /// Request headers as received.
    pub headers: HeaderMap,
}

/// Notifications delivered to the consumer.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A connection completed its upgrade and is now open.
    Connected {
        identity: String,
        handshake: HandshakeInfo,
    },
    /// A connection finished teardown. Fires exactly once per connection.
    ///
    /// Emitted before the identity is removed from the connection list, so
    /// a handler reacting to this event may still observe the identity
    /// listed for a brief instant.
    Disconnected { identity: String },
    /// One fully reassembled message arrived from a peer.
    MessageReceived {
        identity: String,
        payload: Bytes,
        kind: MessageKind,
    },
    /// The accept loop has exited. Fires exactly once per start.
    Stopped,
}

type EventHandler = dyn Fn(&ServerEvent) + Send + Sync;

/// Registration list of consumer event handlers.
#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<Vec<Arc<EventHandler>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for all server events.
    pub fn subscribe<F>(&self, handler: F)
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .expect("event handler lock poisoned")
            .push(Arc::new(handler));
    }

    /// Invoke every registered handler with `event`, in registration order.
    pub fn emit(&self, event: &ServerEvent) {
        let handlers = self
            .handlers
            .read()
            .expect("event handler lock poisoned")
            .clone();
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                tracing::error!("event handler panicked");
            }
        }
    }
}
