//! Peer address allow-list.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Mutex;

/// Mutable allow-list of permitted peer addresses.
///
/// An empty list means "allow all". The list may be mutated at any time,
/// concurrently with the accept loop reading it, so it sits behind a mutex.
/// Each incoming connection is checked exactly once, before the upgrade;
/// already-open sessions are never re-checked.
#[derive(Debug, Default)]
pub struct AccessFilter {
    permitted: Mutex<HashSet<IpAddr>>,
}

impl AccessFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an address to the allow-list.
    pub fn permit(&self, addr: IpAddr) {
        self.lock().insert(addr);
    }

    /// Remove an address from the allow-list.
    pub fn revoke(&self, addr: IpAddr) {
        self.lock().remove(&addr);
    }

    /// Replace the allow-list wholesale.
    pub fn set_permitted<I: IntoIterator<Item = IpAddr>>(&self, addrs: I) {
        let mut permitted = self.lock();
        permitted.clear();
        permitted.extend(addrs);
    }

    /// Clear the allow-list, returning to allow-all.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Whether a peer at `addr` may connect.
    pub fn is_allowed(&self, addr: IpAddr) -> bool {
        let permitted = self.lock();
        permitted.is_empty() || permitted.contains(&addr)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<IpAddr>> {
        self.permitted.lock().expect("access filter lock poisoned")
    }
}
