use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::storage::CredentialStorage;
use crate::models::CachedCredential;

/// Validated access to the persisted virtual key.
///
/// Clone is cheap; clones share the same storage.
#[derive(Clone)]
pub struct CredentialCache {
    storage: Arc<dyn CredentialStorage>,
}

impl CredentialCache {
    pub fn new(storage: Arc<dyn CredentialStorage>) -> Self {
        Self { storage }
    }

    /// Load the cached credential if present, parseable, and outside the
    /// expiry buffer. Anything else is evicted and reads as `None`.
    pub fn read(&self) -> Option<CachedCredential> {
        self.read_at(Utc::now())
    }

    pub fn read_at(&self, now: DateTime<Utc>) -> Option<CachedCredential> {
        let raw = match self.storage.load() {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(backend = self.storage.name(), error = %e, "Failed to load cached credential");
                return None;
            }
        };

        match serde_json::from_str::<CachedCredential>(&raw) {
            Ok(credential) if credential.is_valid_at(now) => Some(credential),
            Ok(credential) => {
                debug!(expires_at = %credential.expires_at, "Cached credential expired or expiring, evicting");
                self.evict();
                None
            }
            Err(e) => {
                warn!(backend = self.storage.name(), error = %e, "Cached credential unreadable, evicting");
                self.evict();
                None
            }
        }
    }

    /// Overwrite the persisted entry. No validation happens on write.
    pub fn write(&self, credential: &CachedCredential) -> Result<()> {
        let raw = serde_json::to_string(credential).context("Failed to serialize credential")?;
        self.storage.store(&raw)
    }

    /// Remove the persisted entry. Idempotent.
    pub fn clear(&self) -> Result<()> {
        self.storage.remove()
    }

    fn evict(&self) {
        if let Err(e) = self.storage.remove() {
            warn!(backend = self.storage.name(), error = %e, "Failed to evict cached credential");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStorage;
    use chrono::Duration;
    use serde_json::Map;

    fn cache_with(raw: &str) -> (CredentialCache, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::with_raw(raw));
        (CredentialCache::new(storage.clone()), storage)
    }

    fn credential(expires_at: DateTime<Utc>) -> CachedCredential {
        CachedCredential {
            token: "sk-live".to_string(),
            expires_at,
            remaining_budget: Some(9.5),
            issuer: Map::new(),
        }
    }

    #[test]
    fn test_read_empty() {
        let cache = CredentialCache::new(Arc::new(MemoryStorage::new()));
        assert!(cache.read().is_none());
    }

    #[test]
    fn test_read_valid_entry() {
        let cred = credential(Utc::now() + Duration::hours(3));
        let storage = Arc::new(MemoryStorage::new());
        let cache = CredentialCache::new(storage.clone());
        cache.write(&cred).unwrap();

        assert_eq!(cache.read(), Some(cred));
        assert!(storage.raw().is_some());
    }

    #[test]
    fn test_read_evicts_unparseable() {
        let (cache, storage) = cache_with("{not json");
        assert!(cache.read().is_none());
        assert!(storage.raw().is_none());
    }

    #[test]
    fn test_read_evicts_bad_timestamp() {
        let (cache, storage) = cache_with(r#"{"token":"a","expiresAt":"tomorrow"}"#);
        assert!(cache.read().is_none());
        assert!(storage.raw().is_none());
    }

    #[test]
    fn test_read_evicts_inside_buffer() {
        let now = Utc::now();
        let cred = credential(now + Duration::minutes(45));
        let storage = Arc::new(MemoryStorage::new());
        let cache = CredentialCache::new(storage.clone());
        cache.write(&cred).unwrap();

        assert!(cache.read_at(now).is_none());
        assert!(storage.raw().is_none());
    }

    #[test]
    fn test_read_boundary_is_exclusive() {
        let now = Utc::now();
        let cred = credential(now + Duration::hours(1));
        let storage = Arc::new(MemoryStorage::new());
        let cache = CredentialCache::new(storage.clone());
        cache.write(&cred).unwrap();

        // now == expires_at - 1h
        assert!(cache.read_at(now).is_none());
    }

    #[test]
    fn test_write_never_validates() {
        let storage = Arc::new(MemoryStorage::new());
        let cache = CredentialCache::new(storage.clone());
        let expired = credential(Utc::now() - Duration::hours(5));

        cache.write(&expired).unwrap();
        assert!(storage.raw().is_some());
    }

    #[test]
    fn test_clear_is_idempotent() {
        let (cache, storage) = cache_with("{}");
        cache.clear().unwrap();
        cache.clear().unwrap();
        assert!(storage.raw().is_none());
    }
}
