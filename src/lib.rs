//! ws-hub: a websocket session server.
//!
//! Accepts inbound connections, upgrades qualifying HTTP requests into
//! long-lived duplex message streams, and multiplexes traffic across many
//! such streams concurrently.
//!
//! ```text
//! TcpListener ─▶ acceptor ─▶ access filter ─▶ upgrade ─▶ session
//!                                                          │
//!                      registry ◀── insert/remove ─────────┤
//!                      events   ◀── Connected/Message/… ───┤
//!                      stats    ◀── counters ──────────────┘
//! ```
//!
//! Consumers register event handlers with [`WsServer::subscribe`], send
//! through [`WsServer::send`] and friends, and force teardown with
//! [`WsServer::disconnect`].

// Core subsystems
pub mod net;
pub mod registry;
pub mod server;
pub mod session;

// Cross-cutting concerns
pub mod config;
pub mod error;
pub mod events;
pub mod observability;
pub mod security;
pub mod stats;

pub use config::ServerConfig;
pub use error::ServerError;
pub use events::{HandshakeInfo, ServerEvent};
pub use net::transport::MessageKind;
pub use server::WsServer;
pub use stats::StatsSnapshot;
