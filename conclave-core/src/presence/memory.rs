use async_trait::async_trait;
use dashmap::DashMap;

use super::{PresenceBackend, PresenceResult};

/// An in-process presence backend, one map per bucket.
#[derive(Default)]
pub struct MemoryPresence {
    buckets: DashMap<String, DashMap<String, String>>,
}

impl MemoryPresence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PresenceBackend for MemoryPresence {
    async fn put(&self, bucket: &str, key: &str, value: String) -> PresenceResult<()> {
        self.buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), value);

        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> PresenceResult<Option<String>> {
        Ok(self
            .buckets
            .get(bucket)
            .and_then(|b| b.get(key).map(|v| v.clone())))
    }

    async fn delete(&self, bucket: &str, key: &str) -> PresenceResult<()> {
        if let Some(bucket) = self.buckets.get(bucket) {
            bucket.remove(key);
        }

        Ok(())
    }

    async fn keys(&self, bucket: &str) -> PresenceResult<Vec<String>> {
        Ok(self
            .buckets
            .get(bucket)
            .map(|b| b.iter().map(|e| e.key().clone()).collect())
            .unwrap_or_default())
    }

    async fn drop_bucket(&self, bucket: &str) -> PresenceResult<()> {
        self.buckets.remove(bucket);
        Ok(())
    }

    async fn bucket_names(&self) -> PresenceResult<Vec<String>> {
        Ok(self.buckets.iter().map(|b| b.key().clone()).collect())
    }
}
