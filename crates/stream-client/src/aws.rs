use aws_sdk_kinesis::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_kinesis::primitives::{Blob, DateTime as AwsDateTime};
use aws_sdk_kinesis::types::{
    PutRecordsRequestEntry, ShardFilter, ShardFilterType, ShardIteratorType, StartingPosition as AwsStartingPosition,
    StartingPositionType,
};
use futures::stream;
use futures::StreamExt;

use crate::{
    ClientError, EventStream, GetRecordsOutput, KinesisOps, PutRecordsEntry, PutRecordsOutcome, StreamDescription,
    SubscribeEvent,
};
use stream_types::{IteratorSpec, Record, SequenceNumber, ShardId};

/// `KinesisOps` backed by `aws_sdk_kinesis`.
pub struct AwsKinesisClient {
    client: aws_sdk_kinesis::Client,
}

impl AwsKinesisClient {
    pub async fn new() -> Self {
        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .load()
            .await;
        Self::from_client(aws_sdk_kinesis::Client::new(&config))
    }

    pub fn from_client(client: aws_sdk_kinesis::Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl KinesisOps for AwsKinesisClient {
    async fn describe_stream(&self, stream_name: &str) -> Result<StreamDescription, ClientError> {
        let output = self
            .client
            .describe_stream()
            .stream_name(stream_name)
            .send()
            .await
            .map_err(classify_generic)?;

        let description = output
            .stream_description
            .ok_or_else(|| ClientError::Other(anyhow::anyhow!("describe_stream returned no description")))?;

        Ok(StreamDescription {
            stream_arn: description.stream_arn,
            retention_hours: description.retention_period_hours as u32,
        })
    }

    async fn list_shards(&self, stream_name: &str) -> Result<Vec<ShardId>, ClientError> {
        let mut shards = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let mut request = self.client.list_shards();
            request = match &next_token {
                Some(token) => request.next_token(token),
                None => request
                    .stream_name(stream_name)
                    .shard_filter(ShardFilter::builder().r#type(ShardFilterType::AtLatest).build()),
            };

            let output = request.send().await.map_err(classify_generic)?;
            shards.extend(output.shards().iter().map(|shard| ShardId(shard.shard_id().to_string())));

            next_token = output.next_token().map(str::to_string);
            if next_token.is_none() {
                break;
            }
        }

        Ok(shards)
    }

    async fn get_shard_iterator(
        &self,
        stream_name: &str,
        shard_id: &ShardId,
        position: IteratorSpec,
    ) -> Result<String, ClientError> {
        let mut request = self
            .client
            .get_shard_iterator()
            .stream_name(stream_name)
            .shard_id(&shard_id.0);

        request = match position {
            IteratorSpec::Latest => request.shard_iterator_type(ShardIteratorType::Latest),
            IteratorSpec::TrimHorizon => request.shard_iterator_type(ShardIteratorType::TrimHorizon),
            IteratorSpec::AtSequenceNumber(seq) => request
                .shard_iterator_type(ShardIteratorType::AtSequenceNumber)
                .starting_sequence_number(seq.0),
            IteratorSpec::AfterSequenceNumber(seq) => request
                .shard_iterator_type(ShardIteratorType::AfterSequenceNumber)
                .starting_sequence_number(seq.0),
            IteratorSpec::AtTimestamp(ts) => request
                .shard_iterator_type(ShardIteratorType::AtTimestamp)
                .timestamp(AwsDateTime::from_millis(ts.timestamp_millis())),
        };

        let output = request.send().await.map_err(classify_generic)?;
        output
            .shard_iterator
            .ok_or_else(|| ClientError::Other(anyhow::anyhow!("get_shard_iterator returned no iterator")))
    }

    async fn get_records(&self, iterator: &str, limit: i32) -> Result<GetRecordsOutput, ClientError> {
        let output = self
            .client
            .get_records()
            .shard_iterator(iterator)
            .limit(limit)
            .send()
            .await
            .map_err(classify_get_records)?;

        let records = output.records.into_iter().map(record_from_aws).collect::<Result<_, _>>()?;

        Ok(GetRecordsOutput {
            records,
            next_iterator: output.next_shard_iterator,
            millis_behind_latest: output.millis_behind_latest,
        })
    }

    async fn describe_stream_consumer(
        &self,
        stream_arn: &str,
        consumer_name: &str,
    ) -> Result<Option<String>, ClientError> {
        let result = self
            .client
            .describe_stream_consumer()
            .stream_arn(stream_arn)
            .consumer_name(consumer_name)
            .send()
            .await;

        match result {
            Ok(output) => Ok(output.consumer_description.map(|d| d.consumer_arn)),
            Err(err) if is_not_found(&err) => Ok(None),
            Err(err) => Err(classify_generic(err)),
        }
    }

    async fn register_stream_consumer(
        &self,
        stream_arn: &str,
        consumer_name: &str,
    ) -> Result<String, ClientError> {
        let result = self
            .client
            .register_stream_consumer()
            .stream_arn(stream_arn)
            .consumer_name(consumer_name)
            .send()
            .await;

        match result {
            Ok(output) => output
                .consumer
                .map(|c| c.consumer_arn)
                .ok_or_else(|| ClientError::Other(anyhow::anyhow!("register_stream_consumer returned no consumer"))),
            // Another process (or a previous attempt of ours) already registered this name.
            Err(err) if is_already_exists(&err) => self
                .describe_stream_consumer(stream_arn, consumer_name)
                .await?
                .ok_or_else(|| ClientError::Other(anyhow::anyhow!("consumer reported as existing but not found"))),
            Err(err) => Err(classify_generic(err)),
        }
    }

    async fn subscribe_to_shard(
        &self,
        consumer_arn: &str,
        shard_id: &ShardId,
        starting_position: stream_types::StartingPosition,
    ) -> Result<EventStream, ClientError> {
        let position = match starting_position {
            IteratorSpec::Latest => AwsStartingPosition::builder().r#type(StartingPositionType::Latest).build(),
            IteratorSpec::TrimHorizon => AwsStartingPosition::builder()
                .r#type(StartingPositionType::TrimHorizon)
                .build(),
            IteratorSpec::AtSequenceNumber(seq) => AwsStartingPosition::builder()
                .r#type(StartingPositionType::AtSequenceNumber)
                .sequence_number(seq.0)
                .build(),
            IteratorSpec::AfterSequenceNumber(seq) => AwsStartingPosition::builder()
                .r#type(StartingPositionType::AfterSequenceNumber)
                .sequence_number(seq.0)
                .build(),
            IteratorSpec::AtTimestamp(ts) => AwsStartingPosition::builder()
                .r#type(StartingPositionType::AtTimestamp)
                .timestamp(AwsDateTime::from_millis(ts.timestamp_millis()))
                .build(),
        };

        let output = self
            .client
            .subscribe_to_shard()
            .consumer_arn(consumer_arn)
            .shard_id(&shard_id.0)
            .starting_position(position)
            .send()
            .await
            .map_err(|err| ClientError::StreamInit(describe_error(&err)))?;

        let receiver = output.event_stream;
        let events = stream::unfold(receiver, |mut receiver| async move {
            match receiver.recv().await {
                Ok(Some(event)) => {
                    let translated = translate_subscribe_event(event);
                    Some((translated, receiver))
                }
                Ok(None) => None,
                Err(err) => Some((
                    Err(ClientError::StreamInit(describe_error(&err))),
                    receiver,
                )),
            }
        });

        Ok(Box::pin(events))
    }

    async fn put_records(
        &self,
        stream_name: &str,
        entries: Vec<PutRecordsEntry>,
    ) -> Result<PutRecordsOutcome, ClientError> {
        let request_entries = entries
            .into_iter()
            .map(|entry| {
                PutRecordsRequestEntry::builder()
                    .partition_key(entry.partition_key)
                    .data(Blob::new(entry.data.to_vec()))
                    .build()
                    .expect("partition_key and data are always set")
            })
            .collect::<Vec<_>>();

        let output = self
            .client
            .put_records()
            .stream_name(stream_name)
            .set_records(Some(request_entries))
            .send()
            .await
            .map_err(classify_generic)?;

        let failed_indices = output
            .records
            .iter()
            .enumerate()
            .filter(|(_, result)| result.error_code.is_some())
            .map(|(index, _)| index)
            .collect();

        Ok(PutRecordsOutcome { failed_indices })
    }
}

fn translate_subscribe_event(
    event: aws_sdk_kinesis::types::SubscribeToShardEventStream,
) -> Result<SubscribeEvent, ClientError> {
    match event {
        aws_sdk_kinesis::types::SubscribeToShardEventStream::SubscribeToShardEvent(event) => {
            let records = event
                .records
                .into_iter()
                .map(record_from_aws)
                .collect::<Result<_, _>>()?;
            Ok(SubscribeEvent {
                records,
                continuation_sequence_number: event.continuation_sequence_number.map(SequenceNumber),
                millis_behind_latest: event.millis_behind_latest,
            })
        }
        other => Err(ClientError::Other(anyhow::anyhow!(
            "unexpected subscribe_to_shard event variant: {other:?}"
        ))),
    }
}

fn record_from_aws(record: aws_sdk_kinesis::types::Record) -> Result<Record, ClientError> {
    Ok(Record {
        sequence_number: SequenceNumber(record.sequence_number),
        partition_key: record.partition_key,
        data: bytes::Bytes::from(record.data.into_inner()),
        arrival_timestamp: record
            .approximate_arrival_timestamp
            .and_then(|ts| chrono::DateTime::from_timestamp(ts.secs(), ts.subsec_nanos())),
    })
}

fn classify_generic<E: ProvideErrorMetadata + std::fmt::Debug>(err: SdkError<E>) -> ClientError {
    match err.as_service_error().and_then(|e| e.code()) {
        Some(code) if is_throttling_code(code) => ClientError::Throttled(describe_error(&err)),
        Some("ExpiredIteratorException") => ClientError::ExpiredIterator,
        Some("ResourceNotFoundException") => ClientError::NotFound(describe_error(&err)),
        _ => ClientError::Other(anyhow::anyhow!("{}", describe_error(&err))),
    }
}

fn classify_get_records<E: ProvideErrorMetadata + std::fmt::Debug>(err: SdkError<E>) -> ClientError {
    classify_generic(err)
}

fn is_not_found<E: ProvideErrorMetadata>(err: &SdkError<E>) -> bool {
    err.as_service_error()
        .and_then(|e| e.code())
        .is_some_and(|code| code == "ResourceNotFoundException")
}

fn is_already_exists<E: ProvideErrorMetadata>(err: &SdkError<E>) -> bool {
    err.as_service_error()
        .and_then(|e| e.code())
        .is_some_and(|code| code == "ResourceInUseException")
}

fn is_throttling_code(code: &str) -> bool {
    matches!(
        code,
        "ProvisionedThroughputExceededException" | "ThrottlingException" | "LimitExceededException"
    )
}

fn describe_error<E: std::fmt::Debug>(err: &SdkError<E>) -> String {
    format!("{err:?}")
}
