//! Network layer.
//!
//! # Responsibilities
//! - Accept raw TCP connections and serve the HTTP upgrade path
//! - Bridge upgraded connections onto the transport seam
//!
//! # Data Flow
//! ```text
//! TcpListener ──▶ acceptor (filter check, HTTP/1.1 serve)
//!                    │ upgrade request
//!                    ▼
//!                101 + hyper upgrade ──▶ WebSocketStream ──▶ session
//!                    │ plain request
//!                    ▼
//!                fallback handler (or 400)
//! ```

pub mod acceptor;
pub mod transport;

pub use transport::MessageKind;
