//! An in-memory `LeaseStore` used by `stream-consumer`'s unit tests, so the
//! Lease Manager's CAS logic can be exercised without a real DynamoDB table.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::{CheckpointMode, LeaseIdentity, LeaseItem, LeaseKey, LeaseStore, ShardLease, StoreError};
use stream_types::ShardId;
use stream_types::SequenceNumber;

#[derive(Default)]
pub struct InMemoryLeaseStore {
    items: Mutex<HashMap<LeaseKey, LeaseItem>>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook mirroring a direct `put_item`: seeds a shard's lease
    /// without going through any conditional-update path.
    pub async fn seed(&self, key: &LeaseKey, shard_id: ShardId, lease: ShardLease) {
        let mut items = self.items.lock().await;
        items.entry(key.clone()).or_default().shards.insert(shard_id, lease);
    }
}

#[async_trait::async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn get_item(&self, key: &LeaseKey) -> Result<Option<LeaseItem>, StoreError> {
        let items = self.items.lock().await;
        Ok(items.get(key).cloned())
    }

    async fn create_shard_lease(
        &self,
        key: &LeaseKey,
        shard_id: &ShardId,
        lease: &ShardLease,
    ) -> Result<bool, StoreError> {
        let mut items = self.items.lock().await;
        let item = items.entry(key.clone()).or_default();
        if item.shards.contains_key(shard_id) {
            return Ok(false);
        }
        item.shards.insert(shard_id.clone(), lease.clone());
        Ok(true)
    }

    async fn renew_shard_lease(
        &self,
        key: &LeaseKey,
        shard_id: &ShardId,
        expected: &LeaseIdentity,
        lease: &ShardLease,
    ) -> Result<bool, StoreError> {
        let mut items = self.items.lock().await;
        let Some(item) = items.get_mut(key) else {
            return Ok(false);
        };
        let Some(existing) = item.shards.get_mut(shard_id) else {
            return Ok(false);
        };
        if existing.consumer_id != expected.consumer_id || existing.expires_at != expected.expires_at {
            return Ok(false);
        }
        existing.consumer_id = lease.consumer_id.clone();
        existing.expires_at = lease.expires_at;
        existing.heartbeat = lease.heartbeat;
        Ok(true)
    }

    async fn checkpoint_shard(
        &self,
        key: &LeaseKey,
        shard_id: &ShardId,
        sequence_number: &SequenceNumber,
        heartbeat: DateTime<Utc>,
        mode: CheckpointMode,
    ) -> Result<bool, StoreError> {
        let mut items = self.items.lock().await;
        let Some(item) = items.get_mut(key) else {
            return Ok(false);
        };
        let Some(existing) = item.shards.get_mut(shard_id) else {
            return Ok(false);
        };
        if mode == CheckpointMode::Pull {
            if let Some(current) = &existing.checkpoint {
                if current >= sequence_number {
                    return Ok(false);
                }
            }
        }
        existing.checkpoint = Some(sequence_number.clone());
        existing.heartbeat = heartbeat;
        Ok(true)
    }

    async fn ensure_shards_map(&self, key: &LeaseKey) -> Result<(), StoreError> {
        let mut items = self.items.lock().await;
        items.entry(key.clone()).or_default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn key() -> LeaseKey {
        LeaseKey {
            consumer_group: "group".into(),
            stream_name: "stream".into(),
        }
    }

    fn lease(consumer_id: &str, expires_at: DateTime<Utc>) -> ShardLease {
        ShardLease {
            consumer_id: consumer_id.into(),
            expires_at,
            heartbeat: Utc::now(),
            checkpoint: None,
        }
    }

    #[tokio::test]
    async fn create_then_create_again_fails() {
        let store = InMemoryLeaseStore::new();
        let key = key();
        let shard = ShardId::from("shard-0");
        let now = Utc::now();

        assert!(store
            .create_shard_lease(&key, &shard, &lease("a", now + Duration::seconds(30)))
            .await
            .unwrap());
        assert!(!store
            .create_shard_lease(&key, &shard, &lease("b", now + Duration::seconds(30)))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn renew_requires_matching_identity() {
        let store = InMemoryLeaseStore::new();
        let key = key();
        let shard = ShardId::from("shard-0");
        let now = Utc::now();
        let first_expiry = now + Duration::seconds(30);
        store
            .create_shard_lease(&key, &shard, &lease("a", first_expiry))
            .await
            .unwrap();

        let stale = LeaseIdentity {
            consumer_id: "a".into(),
            expires_at: now, // wrong, doesn't match stored expiry
        };
        assert!(!store
            .renew_shard_lease(&key, &shard, &stale, &lease("a", now + Duration::seconds(60)))
            .await
            .unwrap());

        let correct = LeaseIdentity {
            consumer_id: "a".into(),
            expires_at: first_expiry,
        };
        assert!(store
            .renew_shard_lease(&key, &shard, &correct, &lease("a", now + Duration::seconds(60)))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn pull_checkpoint_must_advance() {
        let store = InMemoryLeaseStore::new();
        let key = key();
        let shard = ShardId::from("shard-0");
        let now = Utc::now();
        store
            .create_shard_lease(&key, &shard, &lease("a", now + Duration::seconds(30)))
            .await
            .unwrap();

        let seq_1: SequenceNumber = "100".into();
        let seq_2: SequenceNumber = "200".into();
        assert!(store
            .checkpoint_shard(&key, &shard, &seq_2, now, CheckpointMode::Pull)
            .await
            .unwrap());
        assert!(!store
            .checkpoint_shard(&key, &shard, &seq_1, now, CheckpointMode::Pull)
            .await
            .unwrap());
    }
}
