use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use super::{CoordinationResult, CoordinationStore};

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// An in-process coordination store with lazily enforced ttls.
#[derive(Default)]
pub struct MemoryCoordination {
    keys: DashMap<String, Entry>,
    hashes: DashMap<String, DashMap<String, String>>,
}

impl MemoryCoordination {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CoordinationStore for MemoryCoordination {
    async fn set_ttl(&self, key: &str, value: &str, ttl: Duration) -> CoordinationResult<()> {
        self.keys.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );

        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> CoordinationResult<bool> {
        // The entry api keeps check-then-set atomic against other callers
        let mut entry = self.keys.entry(key.to_string()).or_insert_with(|| Entry {
            value: value.to_string(),
            expires_at: None,
        });

        if entry.expires_at.is_none() || entry.is_expired() {
            entry.value = value.to_string();
            entry.expires_at = Some(Instant::now() + ttl);
            return Ok(true);
        }

        Ok(false)
    }

    async fn get(&self, key: &str) -> CoordinationResult<Option<String>> {
        // The read guard must be released before removing an expired entry
        match self.keys.get(key) {
            Some(entry) if !entry.is_expired() => return Ok(Some(entry.value.clone())),
            Some(_) => {}
            None => return Ok(None),
        }

        self.keys.remove(key);
        Ok(None)
    }

    async fn exists(&self, key: &str) -> CoordinationResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn delete(&self, key: &str) -> CoordinationResult<()> {
        self.keys.remove(key);
        Ok(())
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> CoordinationResult<()> {
        self.hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());

        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> CoordinationResult<Option<String>> {
        Ok(self
            .hashes
            .get(key)
            .and_then(|h| h.get(field).map(|v| v.clone())))
    }

    async fn hash_delete(&self, key: &str, field: &str) -> CoordinationResult<()> {
        if let Some(hash) = self.hashes.get(key) {
            hash.remove(field);
        }

        Ok(())
    }

    async fn hash_fields(&self, key: &str) -> CoordinationResult<Vec<String>> {
        Ok(self
            .hashes
            .get(key)
            .map(|h| h.iter().map(|e| e.key().clone()).collect())
            .unwrap_or_default())
    }
}
