//! Session key storage.
//!
//! Maps a [`SessionId`] to the key negotiated for it. The store belongs to a
//! single connection and is cleared when that connection closes; nothing is
//! evicted automatically.

use crate::ids::SessionId;
use dashmap::DashMap;
use shroud_crypto::AeadKey;

/// Per-connection session key store
#[derive(Debug, Default)]
pub struct SessionKeyStore {
    keys: DashMap<SessionId, AeadKey>,
}

impl SessionKeyStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a key, replacing any previous key for the session.
    pub fn store(&self, id: SessionId, key: AeadKey) {
        if self.keys.insert(id.clone(), key).is_some() {
            tracing::debug!("Replaced key for session {}", id);
        }
    }

    /// Get a copy of the key for a session.
    #[must_use]
    pub fn get(&self, id: &SessionId) -> Option<AeadKey> {
        self.keys.get(id).map(|entry| entry.value().clone())
    }

    /// Remove a session's key. Returns whether one was stored.
    pub fn remove(&self, id: &SessionId) -> bool {
        self.keys.remove(id).is_some()
    }

    /// Whether a key is stored for the session.
    #[must_use]
    pub fn contains(&self, id: &SessionId) -> bool {
        self.keys.contains_key(id)
    }

    /// Drop every key.
    pub fn clear(&self) {
        self.keys.clear();
    }

    /// Number of stored sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
