//! Observability.
//!
//! # Responsibilities
//! - Initialize the tracing subscriber for binaries
//!
//! Library code only emits `tracing` events; subscriber setup is the
//! embedding application's call to make.

pub mod logging;
