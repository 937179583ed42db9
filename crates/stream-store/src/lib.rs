//! The Coordinator Store Adapter: CRUD on a single coordination-store item
//! per `(consumer_group, stream_name)`, holding one lease record per shard
//! under a `shards` map attribute. Conditional updates are expressed as
//! compare-and-swap preconditions over nested fields of that map, exactly
//! as a DynamoDB-backed coordination store would express them.
//!
//! This crate intentionally knows nothing about lease *policy* (who gets to
//! acquire, when a checkpoint is stale, etc.) — that lives in the Lease
//! Manager, layered on top in `stream-consumer`. This crate only knows how
//! to read and conditionally write the item.

mod dynamo;
pub mod test_support;

pub use dynamo::DynamoLeaseStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use stream_types::{SequenceNumber, ShardId};

/// Primary key of a coordination-store item.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeaseKey {
    pub consumer_group: String,
    pub stream_name: String,
}

/// A single shard's lease record, as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardLease {
    pub consumer_id: String,
    pub expires_at: DateTime<Utc>,
    pub heartbeat: DateTime<Utc>,
    pub checkpoint: Option<SequenceNumber>,
}

/// The `(consumer_id, expires_at)` pair a renewal's CAS is gated on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseIdentity {
    pub consumer_id: String,
    pub expires_at: DateTime<Utc>,
}

/// The full contents of a coordination-store item.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaseItem {
    pub shards: HashMap<ShardId, ShardLease>,
}

/// Checkpoint conditional-write mode (see spec §4.2.2): pull-mode consumers
/// require the new sequence number to be strictly greater than any
/// previously stored one; push-mode (EFO) consumers relax this to a
/// group-scope existence check only, because EFO records may arrive
/// out of lexical-sequence-order across reconnections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointMode {
    Pull,
    Push,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The conditional update's precondition did not hold: the lease was
    /// held by someone else, or the checkpoint would have gone backwards.
    /// Not a failure — callers treat this as "the write did not happen".
    #[error("conditional check failed")]
    ConditionalCheckFailed,

    /// The bootstrap quirk (spec §4.1): a conditional update addressed a
    /// nested path under `shards.<shard_id>` before the parent `shards` map
    /// attribute existed on the item. Callers recover by calling
    /// `ensure_shards_map` and retrying the original call exactly once.
    #[error("item has no `shards` map yet")]
    MissingShardsMap,

    #[error("coordination store request failed: {0}")]
    Backend(#[source] anyhow::Error),
}

/// CRUD surface exposed by the coordination store, independent of any
/// particular backend.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Strongly-consistent read of the full item.
    async fn get_item(&self, key: &LeaseKey) -> Result<Option<LeaseItem>, StoreError>;

    /// Create path (spec §4.2.1 step 4): conditional update gated on
    /// `attribute_not_exists(shards.<shard_id>)`. Returns `Ok(false)` if the
    /// entry already existed (another consumer beat us to it, or we are
    /// racing ourselves).
    async fn create_shard_lease(
        &self,
        key: &LeaseKey,
        shard_id: &ShardId,
        lease: &ShardLease,
    ) -> Result<bool, StoreError>;

    /// Renew path (spec §4.2.1 step 5): conditional update gated on the
    /// shard's current `(consumer_id, expires_at)` matching `expected`
    /// exactly, touching only `consumer_id`, `expires_at`, and `heartbeat`
    /// so a concurrent checkpoint write is not clobbered. Returns `Ok(false)`
    /// if the CAS failed (the lease was stolen).
    async fn renew_shard_lease(
        &self,
        key: &LeaseKey,
        shard_id: &ShardId,
        expected: &LeaseIdentity,
        lease: &ShardLease,
    ) -> Result<bool, StoreError>;

    /// Checkpoint write (spec §4.2.2). Returns `Ok(false)` on a pull-mode
    /// conditional failure (non-fatal: the record was still delivered).
    async fn checkpoint_shard(
        &self,
        key: &LeaseKey,
        shard_id: &ShardId,
        sequence_number: &SequenceNumber,
        heartbeat: DateTime<Utc>,
        mode: CheckpointMode,
    ) -> Result<bool, StoreError>;

    /// The bootstrap quirk's compensating update: `SET shards =
    /// if_not_exists(shards, empty_map)`. Idempotent; safe to call even if
    /// `shards` already exists.
    async fn ensure_shards_map(&self, key: &LeaseKey) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_mode_is_copy() {
        let mode = CheckpointMode::Pull;
        let _also = mode;
        assert_eq!(mode, CheckpointMode::Pull);
    }
}
