//! An in-memory `KinesisOps` used by `stream-consumer` and `stream-producer`
//! unit tests, so reader and producer logic can be exercised without a live
//! stream-service endpoint.

use std::collections::HashMap;

use futures::stream;
use tokio::sync::Mutex;

use crate::{
    ClientError, EventStream, GetRecordsOutput, KinesisOps, PutRecordsEntry, PutRecordsOutcome, StreamDescription,
    SubscribeEvent,
};
use stream_types::{IteratorSpec, Record, SequenceNumber, ShardId, StartingPosition};

struct ShardState {
    records: Vec<Record>,
    /// If set, `get_records`/`subscribe_to_shard` report no further iterator
    /// once every record has been delivered, simulating a merged/split shard.
    closed: bool,
}

#[derive(Default)]
struct StreamState {
    stream_arn: String,
    shards: HashMap<ShardId, ShardState>,
    consumers: HashMap<String, String>,
}

/// A fake stream-service backend seeded entirely in memory. Iterators are
/// opaque `"<shard_id>:<offset>"` strings, mirroring how the real service's
/// iterators are opaque to callers but stable for a given shard position.
#[derive(Default)]
pub struct FakeKinesisClient {
    streams: Mutex<HashMap<String, StreamState>>,
}

impl FakeKinesisClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed_stream(&self, stream_name: &str, stream_arn: &str) {
        let mut streams = self.streams.lock().await;
        streams.entry(stream_name.to_string()).or_default().stream_arn = stream_arn.to_string();
    }

    pub async fn seed_shard(&self, stream_name: &str, shard_id: ShardId, records: Vec<Record>) {
        let mut streams = self.streams.lock().await;
        let stream = streams.entry(stream_name.to_string()).or_default();
        stream.shards.insert(
            shard_id,
            ShardState {
                records,
                closed: false,
            },
        );
    }

    pub async fn close_shard(&self, stream_name: &str, shard_id: &ShardId) {
        let mut streams = self.streams.lock().await;
        if let Some(shard) = streams.get_mut(stream_name).and_then(|s| s.shards.get_mut(shard_id)) {
            shard.closed = true;
        }
    }

    pub async fn put_record_count(&self, stream_name: &str, shard_id: &ShardId) -> usize {
        let streams = self.streams.lock().await;
        streams
            .get(stream_name)
            .and_then(|s| s.shards.get(shard_id))
            .map(|s| s.records.len())
            .unwrap_or(0)
    }

    fn offset_for(position: &IteratorSpec, records: &[Record]) -> usize {
        match position {
            IteratorSpec::TrimHorizon => 0,
            IteratorSpec::Latest => records.len(),
            IteratorSpec::AtSequenceNumber(seq) => {
                records.iter().position(|r| &r.sequence_number == seq).unwrap_or(records.len())
            }
            IteratorSpec::AfterSequenceNumber(seq) => records
                .iter()
                .position(|r| &r.sequence_number == seq)
                .map(|idx| idx + 1)
                .unwrap_or(records.len()),
            IteratorSpec::AtTimestamp(_) => 0,
        }
    }
}

#[async_trait::async_trait]
impl KinesisOps for FakeKinesisClient {
    async fn describe_stream(&self, stream_name: &str) -> Result<StreamDescription, ClientError> {
        let streams = self.streams.lock().await;
        let stream = streams
            .get(stream_name)
            .ok_or_else(|| ClientError::NotFound(stream_name.to_string()))?;
        Ok(StreamDescription {
            stream_arn: stream.stream_arn.clone(),
            retention_hours: 24,
        })
    }

    async fn list_shards(&self, stream_name: &str) -> Result<Vec<ShardId>, ClientError> {
        let streams = self.streams.lock().await;
        let stream = streams
            .get(stream_name)
            .ok_or_else(|| ClientError::NotFound(stream_name.to_string()))?;
        let mut ids: Vec<ShardId> = stream.shards.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn get_shard_iterator(
        &self,
        stream_name: &str,
        shard_id: &ShardId,
        position: IteratorSpec,
    ) -> Result<String, ClientError> {
        let streams = self.streams.lock().await;
        let shard = streams
            .get(stream_name)
            .and_then(|s| s.shards.get(shard_id))
            .ok_or_else(|| ClientError::NotFound(shard_id.to_string()))?;
        let offset = Self::offset_for(&position, &shard.records);
        Ok(format!("{}:{}", shard_id.0, offset))
    }

    async fn get_records(&self, iterator: &str, limit: i32) -> Result<GetRecordsOutput, ClientError> {
        let (shard_id, offset) = parse_iterator(iterator)?;
        let streams = self.streams.lock().await;
        let shard = streams
            .values()
            .find_map(|s| s.shards.get(&shard_id))
            .ok_or(ClientError::ExpiredIterator)?;

        let end = (offset + limit.max(0) as usize).min(shard.records.len());
        let records = shard.records[offset.min(shard.records.len())..end].to_vec();

        let next_iterator = if end >= shard.records.len() && shard.closed {
            None
        } else {
            Some(format!("{}:{}", shard_id.0, end))
        };

        Ok(GetRecordsOutput {
            records,
            next_iterator,
            millis_behind_latest: Some(0),
        })
    }

    async fn describe_stream_consumer(
        &self,
        stream_arn: &str,
        consumer_name: &str,
    ) -> Result<Option<String>, ClientError> {
        let streams = self.streams.lock().await;
        Ok(streams
            .values()
            .find(|s| s.stream_arn == stream_arn)
            .and_then(|s| s.consumers.get(consumer_name).cloned()))
    }

    async fn register_stream_consumer(
        &self,
        stream_arn: &str,
        consumer_name: &str,
    ) -> Result<String, ClientError> {
        let mut streams = self.streams.lock().await;
        let stream = streams
            .values_mut()
            .find(|s| s.stream_arn == stream_arn)
            .ok_or_else(|| ClientError::NotFound(stream_arn.to_string()))?;
        let consumer_arn = format!("{stream_arn}/consumer/{consumer_name}");
        stream
            .consumers
            .entry(consumer_name.to_string())
            .or_insert_with(|| consumer_arn.clone());
        Ok(stream.consumers[consumer_name].clone())
    }

    async fn subscribe_to_shard(
        &self,
        consumer_arn: &str,
        shard_id: &ShardId,
        starting_position: StartingPosition,
    ) -> Result<EventStream, ClientError> {
        let streams = self.streams.lock().await;
        let shard = streams
            .values()
            .find(|s| s.consumers.values().any(|arn| arn == consumer_arn))
            .and_then(|s| s.shards.get(shard_id))
            .ok_or_else(|| ClientError::NotFound(shard_id.to_string()))?;

        let offset = Self::offset_for(&starting_position, &shard.records);
        let remaining = shard.records[offset.min(shard.records.len())..].to_vec();
        let last_sequence_number = remaining.last().map(|r| r.sequence_number.clone());

        // The fake delivers everything it has in a single event, then ends
        // the stream, mirroring a subscription reaching its ~5 minute expiry.
        let event = SubscribeEvent {
            records: remaining,
            continuation_sequence_number: last_sequence_number,
            millis_behind_latest: Some(0),
        };
        Ok(Box::pin(stream::once(async move { Ok(event) })))
    }

    async fn put_records(
        &self,
        stream_name: &str,
        entries: Vec<PutRecordsEntry>,
    ) -> Result<PutRecordsOutcome, ClientError> {
        let mut streams = self.streams.lock().await;
        let stream = streams
            .entry(stream_name.to_string())
            .or_insert_with(StreamState::default);
        let shard_id = stream
            .shards
            .keys()
            .next()
            .cloned()
            .unwrap_or_else(|| ShardId::from("shard-0"));
        let shard = stream.shards.entry(shard_id).or_insert_with(|| ShardState {
            records: Vec::new(),
            closed: false,
        });

        for entry in &entries {
            let sequence_number = SequenceNumber(format!("{:020}", shard.records.len()));
            shard.records.push(Record {
                sequence_number,
                partition_key: entry.partition_key.clone(),
                data: entry.data.clone(),
                arrival_timestamp: None,
            });
        }

        Ok(PutRecordsOutcome::default())
    }
}

fn parse_iterator(iterator: &str) -> Result<(ShardId, usize), ClientError> {
    let (shard, offset) = iterator
        .rsplit_once(':')
        .ok_or(ClientError::ExpiredIterator)?;
    let offset = offset.parse().map_err(|_| ClientError::ExpiredIterator)?;
    Ok((ShardId::from(shard), offset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn record(seq: &str) -> Record {
        Record {
            sequence_number: seq.into(),
            partition_key: "pk".into(),
            data: bytes::Bytes::from_static(b"payload"),
            arrival_timestamp: None,
        }
    }

    #[tokio::test]
    async fn get_records_paginates_by_offset() {
        let client = FakeKinesisClient::new();
        client.seed_stream("orders", "arn:stream/orders").await;
        let shard = ShardId::from("shard-0");
        client
            .seed_shard(
                "orders",
                shard.clone(),
                vec![record("00000000000000000000"), record("00000000000000000001")],
            )
            .await;

        let iterator = client
            .get_shard_iterator("orders", &shard, IteratorSpec::TrimHorizon)
            .await
            .unwrap();
        let page = client.get_records(&iterator, 1).await.unwrap();
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.records[0].sequence_number.as_str(), "00000000000000000000");

        let next = page.next_iterator.expect("shard not closed, must have next iterator");
        let page2 = client.get_records(&next, 10).await.unwrap();
        assert_eq!(page2.records.len(), 1);
        assert_eq!(page2.records[0].sequence_number.as_str(), "00000000000000000001");
    }

    #[tokio::test]
    async fn closed_shard_reports_no_next_iterator_once_drained() {
        let client = FakeKinesisClient::new();
        client.seed_stream("orders", "arn:stream/orders").await;
        let shard = ShardId::from("shard-0");
        client.seed_shard("orders", shard.clone(), vec![record("0")]).await;
        client.close_shard("orders", &shard).await;

        let iterator = client
            .get_shard_iterator("orders", &shard, IteratorSpec::TrimHorizon)
            .await
            .unwrap();
        let page = client.get_records(&iterator, 10).await.unwrap();
        assert!(page.next_iterator.is_none());
    }

    #[tokio::test]
    async fn subscribe_to_shard_delivers_remaining_records_then_ends() {
        let client = FakeKinesisClient::new();
        client.seed_stream("orders", "arn:stream/orders").await;
        let shard = ShardId::from("shard-0");
        client.seed_shard("orders", shard.clone(), vec![record("0"), record("1")]).await;
        let consumer_arn = client
            .register_stream_consumer("arn:stream/orders", "my-app")
            .await
            .unwrap();

        let mut events = client
            .subscribe_to_shard(&consumer_arn, &shard, IteratorSpec::TrimHorizon)
            .await
            .unwrap();

        let first = events.next().await.unwrap().unwrap();
        assert_eq!(first.records.len(), 2);
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn put_records_appends_and_assigns_sequence_numbers() {
        let client = FakeKinesisClient::new();
        let shard = ShardId::from("shard-0");
        client.seed_stream("orders", "arn:stream/orders").await;
        client.seed_shard("orders", shard.clone(), Vec::new()).await;

        client
            .put_records(
                "orders",
                vec![PutRecordsEntry {
                    partition_key: "pk".into(),
                    data: bytes::Bytes::from_static(b"hello"),
                }],
            )
            .await
            .unwrap();

        assert_eq!(client.put_record_count("orders", &shard).await, 1);
    }
}
