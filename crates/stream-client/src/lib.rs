//! The stream service surface used by both the consumer and producer crate
//! graphs: `KinesisOps` wraps exactly the operations named in spec §6,
//! behind a trait so unit tests can swap in an in-memory fake instead of a
//! live Kinesis endpoint. This crate does no lease or checkpoint bookkeeping
//! of its own — that is `stream-consumer`'s job.

mod aws;
pub mod test_support;

pub use aws::AwsKinesisClient;

use async_trait::async_trait;
use std::pin::Pin;
use stream_types::{IteratorSpec, Record, SequenceNumber, ShardId, StartingPosition};

/// A stream of subscribe-to-shard push events, terminated by the first
/// `Err` or by the underlying HTTP/2 connection closing.
pub type EventStream = Pin<Box<dyn futures::Stream<Item = Result<SubscribeEvent, ClientError>> + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// `ProvisionedThroughputExceededException` / `LimitExceededException` /
    /// the generic `ThrottlingException` seen on any stream-service call.
    #[error("request throttled: {0}")]
    Throttled(String),

    /// The shard iterator used in `get_records` has expired or no longer
    /// refers to a readable position; callers must re-derive a fresh
    /// iterator via `get_shard_iterator` (spec §4.3).
    #[error("shard iterator expired or invalid")]
    ExpiredIterator,

    /// The named stream, consumer, or shard does not exist.
    #[error("resource not found: {0}")]
    NotFound(String),

    /// The push-mode (EFO) HTTP/2 event stream failed to establish, or was
    /// torn down mid-flight by the server. Distinct from `Throttled` because
    /// the retry/backoff policy for the Push Shard Reader treats stream
    /// initialization failures more aggressively than record-level errors
    /// (spec §4.4).
    #[error("subscribe_to_shard stream error: {0}")]
    StreamInit(String),

    #[error("stream-service request failed: {0}")]
    Other(#[source] anyhow::Error),
}

impl ClientError {
    /// Whether a pull-mode reader should back off and retry the same
    /// request, as opposed to treating the error as terminal for the shard.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Throttled(_) | ClientError::ExpiredIterator)
    }
}

/// Bare description of a stream, as returned by `describe_stream`. Spec §6
/// only needs the ARN (to register/describe consumers against) and the
/// retention window (to decide whether `TrimHorizon` is still reachable).
#[derive(Debug, Clone)]
pub struct StreamDescription {
    pub stream_arn: String,
    pub retention_hours: u32,
}

/// One page of `get_records`.
#[derive(Debug, Clone)]
pub struct GetRecordsOutput {
    pub records: Vec<Record>,
    /// `None` means the shard is closed and fully drained: there is no
    /// further iterator to advance to.
    pub next_iterator: Option<String>,
    pub millis_behind_latest: Option<i64>,
}

/// One push-mode event delivered over a `subscribe_to_shard` event stream.
#[derive(Debug, Clone)]
pub struct SubscribeEvent {
    pub records: Vec<Record>,
    /// Opaque handle identifying this point in the shard; re-supplied as
    /// `StartingPosition::AfterSequenceNumber` when resubscribing after the
    /// ~5 minute subscription expires (spec §4.4).
    pub continuation_sequence_number: Option<SequenceNumber>,
    pub millis_behind_latest: Option<i64>,
}

/// One record handed to `put_records`.
#[derive(Debug, Clone)]
pub struct PutRecordsEntry {
    pub partition_key: String,
    pub data: bytes::Bytes,
}

/// Result of a `put_records` call: indices into the entries that were
/// rejected and should be retried. Per-entry errors (e.g. throttling on a
/// single shard) do not fail the whole batch (spec §4.6).
#[derive(Debug, Clone, Default)]
pub struct PutRecordsOutcome {
    pub failed_indices: Vec<usize>,
}

#[async_trait]
pub trait KinesisOps: Send + Sync {
    async fn describe_stream(&self, stream_name: &str) -> Result<StreamDescription, ClientError>;

    /// Lists all open shards as of now. Spec §9 decides that callers must
    /// exhaust pagination fully before leasing, rather than leasing
    /// page-by-page, so this returns a complete `Vec` rather than a stream.
    async fn list_shards(&self, stream_name: &str) -> Result<Vec<ShardId>, ClientError>;

    async fn get_shard_iterator(
        &self,
        stream_name: &str,
        shard_id: &ShardId,
        position: IteratorSpec,
    ) -> Result<String, ClientError>;

    async fn get_records(&self, iterator: &str, limit: i32) -> Result<GetRecordsOutput, ClientError>;

    /// `Ok(None)` if no consumer by that name is registered yet.
    async fn describe_stream_consumer(
        &self,
        stream_arn: &str,
        consumer_name: &str,
    ) -> Result<Option<String>, ClientError>;

    /// Returns the new consumer's ARN. Idempotent: registering a name that
    /// already exists is treated as success by the caller (spec §4.4).
    async fn register_stream_consumer(
        &self,
        stream_arn: &str,
        consumer_name: &str,
    ) -> Result<String, ClientError>;

    async fn subscribe_to_shard(
        &self,
        consumer_arn: &str,
        shard_id: &ShardId,
        starting_position: StartingPosition,
    ) -> Result<EventStream, ClientError>;

    async fn put_records(
        &self,
        stream_name: &str,
        entries: Vec<PutRecordsEntry>,
    ) -> Result<PutRecordsOutcome, ClientError>;
}
