//! # Ephemeral State Store
//!
//! A key-value store where every entry carries a time-to-live. Backs the
//! token blacklist, the pending-second-factor marker, and the unconfirmed
//! two-factor setup stash. Expiry is evaluated against the caller's clock,
//! so an entry past its deadline reads as absent even before it is purged.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

use super::errors::AuthResult;

// ==================
// Keys
// ==================

/// Key namespaces used by the auth flows
pub mod keys {
    /// Blacklist entry for a revoked token
    pub fn blacklist(token: &str) -> String {
        format!("blacklist:{}", token)
    }

    /// Pending-second-factor marker, written on password success
    pub fn second_factor_pending(user_id: i64) -> String {
        format!("2fa:pending:{}", user_id)
    }

    /// Unconfirmed two-factor setup material
    pub fn second_factor_setup(user_id: i64) -> String {
        format!("2fa:setup:{}", user_id)
    }
}

// ==================
// Store Trait
// ==================

/// TTL key-value storage
///
/// `now` is supplied by the caller so expiry is deterministic under test.
pub trait EphemeralStore: Send + Sync {
    /// Insert or replace an entry that expires `ttl` after `now`
    fn set(&self, key: &str, value: &str, ttl: Duration, now: DateTime<Utc>) -> AuthResult<()>;

    /// Read a live entry; expired entries behave as absent
    fn get(&self, key: &str, now: DateTime<Utc>) -> AuthResult<Option<String>>;

    /// Delete an entry, reporting whether a live entry was removed
    fn remove(&self, key: &str, now: DateTime<Utc>) -> AuthResult<bool>;

    /// Physically drop expired entries, returning how many were removed
    fn purge_expired(&self, now: DateTime<Utc>) -> AuthResult<usize>;
}

// ==================
// In-Memory Store
// ==================

struct Entry {
    value: String,
    expires_at: DateTime<Utc>,
}

/// In-memory ephemeral store
pub struct InMemoryEphemeralStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl InMemoryEphemeralStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryEphemeralStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EphemeralStore for InMemoryEphemeralStore {
    fn set(&self, key: &str, value: &str, ttl: Duration, now: DateTime<Utc>) -> AuthResult<()> {
        let mut entries = self.entries.write().unwrap();
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    fn get(&self, key: &str, now: DateTime<Utc>) -> AuthResult<Option<String>> {
        let entries = self.entries.read().unwrap();
        Ok(entries
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value.clone()))
    }

    fn remove(&self, key: &str, now: DateTime<Utc>) -> AuthResult<bool> {
        let mut entries = self.entries.write().unwrap();
        Ok(entries
            .remove(key)
            .map(|entry| entry.expires_at > now)
            .unwrap_or(false))
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> AuthResult<usize> {
        let mut entries = self.entries.write().unwrap();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        Ok(before - entries.len())
    }
}
