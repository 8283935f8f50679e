//! Access control.
//!
//! # Responsibilities
//! - Maintain the mutable allow-list of permitted peer addresses
//! - Answer allow/deny for each incoming connection, before upgrade

pub mod filter;

pub use filter::AccessFilter;
