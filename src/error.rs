//! Server error type.
//!
//! Only caller misuse (invalid configuration, lifecycle misuse, empty send
//! payload) and startup failures surface as errors. Everything that goes
//! wrong inside a live connection resolves to a log line, a `false` send
//! result, or a lifecycle event instead.

use thiserror::Error;

/// Errors surfaced to the caller of the server API.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Lifecycle misuse: start while listening, stop while stopped.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// Configuration rejected by semantic validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A send was attempted with an empty payload.
    #[error("payload must not be empty")]
    EmptyPayload,

    /// The bind host could not be resolved to an address.
    #[error("failed to resolve bind address '{0}'")]
    Resolve(String),

    /// Binding the listener failed.
    #[error("failed to bind listener: {0}")]
    Bind(#[source] std::io::Error),
}
