//! Traffic statistics.
//!
//! # Responsibilities
//! - Count sent/received messages and bytes with atomic counters
//! - Provide an immutable snapshot for callers
//! - Reset exactly once, at server start

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Atomic counters for message traffic.
///
/// Counters are monotonically non-decreasing between resets. Relaxed
/// ordering is sufficient since the counters are independent of each other.
#[derive(Debug, Default)]
pub struct Statistics {
    messages_sent: AtomicU64,
    bytes_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_received: AtomicU64,
}

/// An immutable point-in-time view of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub messages_received: u64,
    pub bytes_received: u64,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one successfully sent message of `bytes` length.
    pub fn record_sent(&self, bytes: u64) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record one fully reassembled received message of `bytes` length.
    pub fn record_received(&self, bytes: u64) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Zero all counters. Called once per server start, never mid-run.
    pub fn reset(&self) {
        self.messages_sent.store(0, Ordering::Relaxed);
        self.bytes_sent.store(0, Ordering::Relaxed);
        self.messages_received.store(0, Ordering::Relaxed);
        self.bytes_received.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}
