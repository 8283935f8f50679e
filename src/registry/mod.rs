//! Live-connection registry.
//!
//! # Responsibilities
//! - Map connection identity → session for every open connection
//! - Support add-if-absent, lookup, remove, and snapshot enumeration
//!
//! # Design Decisions
//! - DashMap keeps add/remove/lookup atomic without a registry-wide lock;
//!   sessions deregister themselves without coordinating with each other
//! - An identity is present iff its session is open: inserted only after a
//!   successful upgrade, removed only as the final step of teardown

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::session::Session;

#[derive(Default)]
pub struct ConnectionRegistry {
    sessions: DashMap<String, Arc<Session>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session under `identity` if the identity is not taken.
    ///
    /// Returns false without replacing anything when the identity already
    /// exists. Identities are unique at insertion time, so a collision is a
    /// bug upstream; it is logged and otherwise ignored.
    pub fn insert(&self, identity: &str, session: Arc<Session>) -> bool {
        match self.sessions.entry(identity.to_owned()) {
            Entry::Occupied(_) => {
                tracing::warn!(identity, "registry insert for already-present identity");
                false
            }
            Entry::Vacant(entry) => {
                entry.insert(session);
                true
            }
        }
    }

    pub fn get(&self, identity: &str) -> Option<Arc<Session>> {
        self.sessions.get(identity).map(|e| Arc::clone(e.value()))
    }

    pub fn remove(&self, identity: &str) -> Option<Arc<Session>> {
        self.sessions.remove(identity).map(|(_, session)| session)
    }

    /// Snapshot of the identities present at call time. Order is arbitrary.
    pub fn identities(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
