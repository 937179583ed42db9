//! Process-local view of lease state layered on top of the coordination
//! store (spec §4.2): tracks, per shard, the `(consumer_id, expires_at,
//! heartbeat, checkpoint)` last observed or written by this process, and
//! mediates every acquire/renew/checkpoint call through the store's
//! conditional-update primitives plus the bootstrap-quirk retry.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use stream_store::{CheckpointMode, LeaseIdentity, LeaseKey, LeaseStore, ShardLease, StoreError};
use stream_types::{IteratorSpec, SequenceNumber, ShardId};

#[derive(Debug, Clone)]
struct LocalLeaseState {
    consumer_id: String,
    expires_at: DateTime<Utc>,
    heartbeat: DateTime<Utc>,
    checkpoint: Option<SequenceNumber>,
}

pub struct LeaseManager {
    store: Arc<dyn LeaseStore>,
    key: LeaseKey,
    consumer_id: String,
    mode: CheckpointMode,
    local: HashMap<ShardId, LocalLeaseState>,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn LeaseStore>, key: LeaseKey, consumer_id: String, mode: CheckpointMode) -> Self {
        LeaseManager {
            store,
            key,
            consumer_id,
            mode,
            local: HashMap::new(),
        }
    }

    /// Spec §4.2.1: conditional acquire-or-renew, gated on whatever this
    /// process last observed (or just read) for this shard.
    pub async fn acquire_or_renew(
        &mut self,
        shard_id: &ShardId,
        new_expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let item = self.store.get_item(&self.key).await?;
        let observed = item.and_then(|i| i.shards.get(shard_id).cloned());

        if let Some(observed) = &observed {
            if observed.consumer_id != self.consumer_id && observed.expires_at > now {
                tracing::debug!(shard_id = %shard_id, holder = %observed.consumer_id, "shard lease held by a live consumer, yielding");
                return Ok(false);
            }
        }

        let lease = ShardLease {
            consumer_id: self.consumer_id.clone(),
            expires_at: new_expires_at,
            heartbeat: now,
            checkpoint: observed.as_ref().and_then(|o| o.checkpoint.clone()),
        };

        let acquired = match &observed {
            None => self.create_with_bootstrap_retry(shard_id, &lease).await?,
            Some(observed) => {
                let expected = LeaseIdentity {
                    consumer_id: observed.consumer_id.clone(),
                    expires_at: observed.expires_at,
                };
                self.renew_with_bootstrap_retry(shard_id, &expected, &lease).await?
            }
        };

        if acquired {
            tracing::debug!(shard_id = %shard_id, expires_at = %new_expires_at, "acquired or renewed shard lease");
            self.local.insert(
                shard_id.clone(),
                LocalLeaseState {
                    consumer_id: lease.consumer_id,
                    expires_at: lease.expires_at,
                    heartbeat: lease.heartbeat,
                    checkpoint: lease.checkpoint,
                },
            );
        } else {
            self.local.remove(shard_id);
        }

        Ok(acquired)
    }

    async fn create_with_bootstrap_retry(&self, shard_id: &ShardId, lease: &ShardLease) -> Result<bool, StoreError> {
        match self.store.create_shard_lease(&self.key, shard_id, lease).await {
            Err(StoreError::MissingShardsMap) => {
                self.store.ensure_shards_map(&self.key).await?;
                self.store.create_shard_lease(&self.key, shard_id, lease).await
            }
            other => other,
        }
    }

    async fn renew_with_bootstrap_retry(
        &self,
        shard_id: &ShardId,
        expected: &LeaseIdentity,
        lease: &ShardLease,
    ) -> Result<bool, StoreError> {
        match self.store.renew_shard_lease(&self.key, shard_id, expected, lease).await {
            Err(StoreError::MissingShardsMap) => {
                self.store.ensure_shards_map(&self.key).await?;
                self.store.renew_shard_lease(&self.key, shard_id, expected, lease).await
            }
            other => other,
        }
    }

    /// Spec §4.2.2. Returns `Ok(false)` on a non-fatal pull-mode conditional
    /// failure: the record was still delivered to user code.
    pub async fn checkpoint(
        &mut self,
        shard_id: &ShardId,
        sequence_number: &SequenceNumber,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let result = match self
            .store
            .checkpoint_shard(&self.key, shard_id, sequence_number, now, self.mode)
            .await
        {
            Err(StoreError::MissingShardsMap) => {
                self.store.ensure_shards_map(&self.key).await?;
                self.store
                    .checkpoint_shard(&self.key, shard_id, sequence_number, now, self.mode)
                    .await
            }
            other => other,
        }?;

        if result {
            if let Some(local) = self.local.get_mut(shard_id) {
                local.checkpoint = Some(sequence_number.clone());
                local.heartbeat = now;
            }
        }

        Ok(result)
    }

    /// Spec §4.2.3.
    pub fn initial_iterator(&self, shard_id: &ShardId, retention_hours: u32) -> IteratorSpec {
        let Some(local) = self.local.get(shard_id) else {
            return IteratorSpec::Latest;
        };
        let Some(checkpoint) = &local.checkpoint else {
            return IteratorSpec::Latest;
        };

        let age = Utc::now() - local.heartbeat;
        if age > chrono::Duration::hours(retention_hours as i64) {
            tracing::warn!(shard_id = %shard_id, age_hours = age.num_hours(), "heartbeat is stale, falling back to LATEST");
            return IteratorSpec::Latest;
        }

        IteratorSpec::AfterSequenceNumber(checkpoint.clone())
    }

    /// Drops a shard's local state, e.g. after its reader has been stopped
    /// because the lease was lost. The next cycle re-derives everything from
    /// a fresh `get_item` the next time `acquire_or_renew` is called.
    pub fn forget(&mut self, shard_id: &ShardId) {
        self.local.remove(shard_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use stream_store::test_support::InMemoryLeaseStore;

    fn key() -> LeaseKey {
        LeaseKey {
            consumer_group: "group".into(),
            stream_name: "orders".into(),
        }
    }

    #[tokio::test]
    async fn fresh_lease_is_acquired_and_starts_at_latest() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let mut manager = LeaseManager::new(store, key(), "me".into(), CheckpointMode::Pull);
        let shard = ShardId::from("shardId-000000000000");

        let acquired = manager.acquire_or_renew(&shard, Utc::now() + Duration::seconds(30)).await.unwrap();
        assert!(acquired);
        assert_eq!(manager.initial_iterator(&shard, 24), IteratorSpec::Latest);
    }

    #[tokio::test]
    async fn preemption_by_expiry_succeeds() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let key = key();
        let shard = ShardId::from("shard-0");
        let now = Utc::now();
        store
            .seed(
                &key,
                shard.clone(),
                stream_store::ShardLease {
                    consumer_id: "A".into(),
                    expires_at: now - Duration::seconds(1),
                    heartbeat: now - Duration::seconds(31),
                    checkpoint: None,
                },
            )
            .await;

        let mut manager = LeaseManager::new(store.clone(), key.clone(), "B".into(), CheckpointMode::Pull);
        let acquired = manager.acquire_or_renew(&shard, now + Duration::seconds(30)).await.unwrap();
        assert!(acquired);

        let item = store.get_item(&key).await.unwrap().unwrap();
        assert_eq!(item.shards[&shard].consumer_id, "B");
    }

    #[tokio::test]
    async fn contention_with_a_live_holder_fails() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let key = key();
        let shard = ShardId::from("shard-0");
        let now = Utc::now();
        store
            .seed(
                &key,
                shard.clone(),
                stream_store::ShardLease {
                    consumer_id: "A".into(),
                    expires_at: now + Duration::seconds(20),
                    heartbeat: now,
                    checkpoint: None,
                },
            )
            .await;

        let mut manager = LeaseManager::new(store.clone(), key.clone(), "B".into(), CheckpointMode::Pull);
        let acquired = manager.acquire_or_renew(&shard, now + Duration::seconds(30)).await.unwrap();
        assert!(!acquired);

        let item = store.get_item(&key).await.unwrap().unwrap();
        assert_eq!(item.shards[&shard].consumer_id, "A");
    }

    #[tokio::test]
    async fn stale_heartbeat_falls_back_to_latest() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let mut manager = LeaseManager::new(store, key(), "me".into(), CheckpointMode::Pull);
        let shard = ShardId::from("shard-0");
        let now = Utc::now();

        manager.acquire_or_renew(&shard, now + Duration::seconds(30)).await.unwrap();
        manager.checkpoint(&shard, &"495900000000000000000000".into()).await.unwrap();

        // Simulate a heartbeat that is 25 hours old against a 24 hour retention window.
        if let Some(local) = manager.local.get_mut(&shard) {
            local.heartbeat = now - Duration::hours(25);
        }

        assert_eq!(manager.initial_iterator(&shard, 24), IteratorSpec::Latest);
    }

    #[tokio::test]
    async fn pull_mode_checkpoint_must_advance() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let mut manager = LeaseManager::new(store, key(), "me".into(), CheckpointMode::Pull);
        let shard = ShardId::from("shard-0");
        let now = Utc::now();
        manager.acquire_or_renew(&shard, now + Duration::seconds(30)).await.unwrap();

        assert!(manager.checkpoint(&shard, &"200".into()).await.unwrap());
        assert!(!manager.checkpoint(&shard, &"100".into()).await.unwrap());
    }

    #[quickcheck_macros::quickcheck]
    fn repeated_acquire_with_increasing_expiry_always_succeeds(deltas: Vec<u8>) -> bool {
        // P6: strictly increasing `new_expires_at` from the same consumer always succeeds.
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let store = Arc::new(InMemoryLeaseStore::new());
            let mut manager = LeaseManager::new(store, key(), "me".into(), CheckpointMode::Pull);
            let shard = ShardId::from("shard-0");
            let mut expiry = Utc::now() + Duration::seconds(1);

            for delta in deltas {
                expiry += Duration::seconds(delta as i64 + 1);
                if !manager.acquire_or_renew(&shard, expiry).await.unwrap() {
                    return false;
                }
            }
            true
        })
    }
}
