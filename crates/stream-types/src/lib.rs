//! Plain data types shared by the stream-consumer crate graph: shard and
//! sequence-number identifiers, the wire-level record shape, and the
//! iterator/starting-position vocabulary used by both the pull (get-records)
//! and push (subscribe-to-shard) reading paths. This crate does no I/O.

use std::fmt;

/// Opaque identifier of a shard within a stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct ShardId(pub String);

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ShardId {
    fn from(s: String) -> Self {
        ShardId(s)
    }
}

impl From<&str> for ShardId {
    fn from(s: &str) -> Self {
        ShardId(s.to_string())
    }
}

/// A shard sequence number, as returned by the stream service.
///
/// Kinesis sequence numbers are decimal-digit strings that, for a given
/// shard, grow in both value and digit-length together, so a
/// length-then-lexicographic comparison is equivalent to a numeric one
/// without needing a big-integer type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct SequenceNumber(pub String);

impl SequenceNumber {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SequenceNumber {
    fn from(s: String) -> Self {
        SequenceNumber(s)
    }
}

impl From<&str> for SequenceNumber {
    fn from(s: &str) -> Self {
        SequenceNumber(s.to_string())
    }
}

impl PartialOrd for SequenceNumber {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SequenceNumber {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.0.len(), &self.0).cmp(&(other.0.len(), &other.0))
    }
}

/// A single record read from a shard.
#[derive(Debug, Clone)]
pub struct Record {
    pub sequence_number: SequenceNumber,
    pub partition_key: String,
    pub data: bytes::Bytes,
    pub arrival_timestamp: Option<chrono::DateTime<chrono::Utc>>,
}

/// Where to begin (or resume) reading within a shard. Shared by
/// `get_shard_iterator` (pull mode) and `subscribe_to_shard` (push/EFO
/// mode), mirroring the stream service's own single `ShardIteratorType`
/// vocabulary for both operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IteratorSpec {
    Latest,
    TrimHorizon,
    AtSequenceNumber(SequenceNumber),
    AfterSequenceNumber(SequenceNumber),
    AtTimestamp(chrono::DateTime<chrono::Utc>),
}

/// Alias used at EFO call sites, where the stream service's own naming is
/// "starting position" rather than "iterator", even though the vocabulary
/// is identical.
pub type StartingPosition = IteratorSpec;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_number_orders_by_length_then_lexicographically() {
        let shorter: SequenceNumber = "999".into();
        let longer: SequenceNumber = "1000".into();
        assert!(shorter < longer, "a numerically smaller but shorter string must still sort first");

        let a: SequenceNumber = "100".into();
        let b: SequenceNumber = "200".into();
        assert!(a < b);
    }

    #[quickcheck_macros::quickcheck]
    fn sequence_number_ord_is_reflexive(n: u64) -> bool {
        let s: SequenceNumber = n.to_string().into();
        s.cmp(&s) == std::cmp::Ordering::Equal
    }
}
