//! Distributed mutual exclusion over the coordination store
//!
//! A lock is a key set with `SET NX EX`; it is held while the key exists.
//! There is no waiting or fairness: a contended acquire returns `false`.
//!
//! [`LockManager::release`] deletes the key unconditionally. If the TTL
//! expired and another holder took the lock in the meantime, that holder's
//! lock is deleted. [`LockManager::acquire_owned`] and
//! [`LockManager::release_owned`] close that gap by storing a random token
//! and deleting only while the key still holds it.

use crate::keys;
use crate::metrics;
use crate::store::SharedStore;
use crate::Result;
use meshstore::StoreExt;
use std::time::Duration;

const SENTINEL: &str = "1";

/// Proof of an owned lock acquisition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    key: String,
    token: String,
}

impl LockToken {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

pub fn decision_lock_key(decision_id: &str) -> String {
    keys::decision_lock(decision_id)
}

pub fn container_lock_key(container_id: &str) -> String {
    keys::container_lock(container_id)
}

/// Label for contention metrics: the key's second segment (`decision`, ...)
fn lock_kind(key: &str) -> &str {
    key.split(':').nth(1).unwrap_or("other")
}

#[derive(Clone)]
pub struct LockManager {
    store: SharedStore,
}

impl LockManager {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Try once to take `key` for `ttl`
    pub async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let acquired = self.store.set_nx_ex(key, SENTINEL, ttl).await?;
        if !acquired {
            metrics::record_lock_contention(lock_kind(key));
            tracing::debug!(key, "Lock already held");
        }
        Ok(acquired)
    }

    /// Delete `key` whoever holds it
    pub async fn release(&self, key: &str) -> Result<()> {
        self.store.del(key).await?;
        Ok(())
    }

    pub async fn is_held(&self, key: &str) -> Result<bool> {
        Ok(self.store.get(key).await?.is_some())
    }

    /// Try once to take `key` for `ttl`, remembering who took it
    pub async fn acquire_owned(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>> {
        let token = uuid::Uuid::new_v4().to_string();
        if self.store.set_nx_ex(key, &token, ttl).await? {
            Ok(Some(LockToken {
                key: key.to_string(),
                token,
            }))
        } else {
            metrics::record_lock_contention(lock_kind(key));
            tracing::debug!(key, "Lock already held");
            Ok(None)
        }
    }

    /// Release only if `token` still owns the lock; `false` if it expired
    /// or was taken over
    pub async fn release_owned(&self, token: &LockToken) -> Result<bool> {
        let released = self.store.del_if_eq(&token.key, &token.token).await?;
        if !released {
            tracing::warn!(key = %token.key, "Lock expired before release");
        }
        Ok(released)
    }
}
