use std::collections::HashMap;
use std::time::Duration;

use aws_sdk_dynamodb::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_dynamodb::operation::update_item::UpdateItemError;
use aws_sdk_dynamodb::types::AttributeValue;
use chrono::{DateTime, Utc};

use crate::{CheckpointMode, LeaseIdentity, LeaseItem, LeaseKey, LeaseStore, ShardLease, StoreError};
use stream_types::{SequenceNumber, ShardId};

/// Coordination store adapter backed by Amazon DynamoDB, per spec §4.1.
pub struct DynamoLeaseStore {
    client: aws_sdk_dynamodb::Client,
    table_name: String,
}

impl DynamoLeaseStore {
    /// Loads credentials and region from the environment, exactly as
    /// `iam-auth`'s AWS provider does for STS.
    pub async fn new(table_name: impl Into<String>) -> Self {
        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .load()
            .await;
        Self::from_client(aws_sdk_dynamodb::Client::new(&config), table_name)
    }

    pub fn from_client(client: aws_sdk_dynamodb::Client, table_name: impl Into<String>) -> Self {
        Self {
            client,
            table_name: table_name.into(),
        }
    }
}

#[async_trait::async_trait]
impl LeaseStore for DynamoLeaseStore {
    async fn get_item(&self, key: &LeaseKey) -> Result<Option<LeaseItem>, StoreError> {
        let result = retry_on_throttle(|| {
            self.client
                .get_item()
                .table_name(&self.table_name)
                .key("consumerGroup", AttributeValue::S(key.consumer_group.clone()))
                .key("streamName", AttributeValue::S(key.stream_name.clone()))
                .consistent_read(true)
                .send()
        })
        .await
        .map_err(|err| StoreError::Backend(anyhow::anyhow!("get_item failed: {err}")))?;

        let Some(item) = result.item else {
            return Ok(None);
        };

        let mut shards = HashMap::new();
        if let Some(AttributeValue::M(map)) = item.get("shards") {
            for (shard_id, av) in map {
                shards.insert(ShardId(shard_id.clone()), lease_from_av(av)?);
            }
        }
        Ok(Some(LeaseItem { shards }))
    }

    async fn create_shard_lease(
        &self,
        key: &LeaseKey,
        shard_id: &ShardId,
        lease: &ShardLease,
    ) -> Result<bool, StoreError> {
        let result = retry_on_throttle(|| {
            self.client
                .update_item()
                .table_name(&self.table_name)
                .key("consumerGroup", AttributeValue::S(key.consumer_group.clone()))
                .key("streamName", AttributeValue::S(key.stream_name.clone()))
                .update_expression("SET shards.#sid = :lease")
                .condition_expression("attribute_not_exists(shards.#sid)")
                .expression_attribute_names("#sid", &shard_id.0)
                .expression_attribute_values(":lease", lease_to_av(lease))
                .send()
        })
        .await;

        match result {
            Ok(_) => Ok(true),
            Err(err) => classify_update_error(err),
        }
    }

    async fn renew_shard_lease(
        &self,
        key: &LeaseKey,
        shard_id: &ShardId,
        expected: &LeaseIdentity,
        lease: &ShardLease,
    ) -> Result<bool, StoreError> {
        let result = retry_on_throttle(|| {
            self.client
                .update_item()
                .table_name(&self.table_name)
                .key("consumerGroup", AttributeValue::S(key.consumer_group.clone()))
                .key("streamName", AttributeValue::S(key.stream_name.clone()))
                // Touches only the three sub-fields so a concurrent checkpoint write isn't clobbered.
                .update_expression(
                    "SET shards.#sid.consumerId = :new_consumer, \
                         shards.#sid.expiresIn = :new_expires, \
                         shards.#sid.heartbeat = :new_heartbeat",
                )
                .condition_expression(
                    "shards.#sid.consumerId = :expected_consumer AND shards.#sid.expiresIn = :expected_expires",
                )
                .expression_attribute_names("#sid", &shard_id.0)
                .expression_attribute_values(":new_consumer", AttributeValue::S(lease.consumer_id.clone()))
                .expression_attribute_values(":new_expires", AttributeValue::S(fmt_ts(lease.expires_at)))
                .expression_attribute_values(":new_heartbeat", AttributeValue::S(fmt_ts(lease.heartbeat)))
                .expression_attribute_values(
                    ":expected_consumer",
                    AttributeValue::S(expected.consumer_id.clone()),
                )
                .expression_attribute_values(
                    ":expected_expires",
                    AttributeValue::S(fmt_ts(expected.expires_at)),
                )
                .send()
        })
        .await;

        match result {
            Ok(_) => Ok(true),
            Err(err) => classify_update_error(err),
        }
    }

    async fn checkpoint_shard(
        &self,
        key: &LeaseKey,
        shard_id: &ShardId,
        sequence_number: &SequenceNumber,
        heartbeat: DateTime<Utc>,
        mode: CheckpointMode,
    ) -> Result<bool, StoreError> {
        // DynamoDB compares string (S) attributes byte-lexicographically, so this
        // condition only yields a numeric ordering if sequence numbers are
        // zero-padded to a common width by the caller (see stream_types::SequenceNumber).
        let condition = match mode {
            CheckpointMode::Pull => {
                "attribute_not_exists(shards.#sid.checkpoint) OR shards.#sid.checkpoint < :seq"
            }
            CheckpointMode::Push => "attribute_exists(shards.#sid)",
        };

        let result = retry_on_throttle(|| {
            self.client
                .update_item()
                .table_name(&self.table_name)
                .key("consumerGroup", AttributeValue::S(key.consumer_group.clone()))
                .key("streamName", AttributeValue::S(key.stream_name.clone()))
                .update_expression("SET shards.#sid.checkpoint = :seq, shards.#sid.heartbeat = :heartbeat")
                .condition_expression(condition)
                .expression_attribute_names("#sid", &shard_id.0)
                .expression_attribute_values(":seq", AttributeValue::S(sequence_number.0.clone()))
                .expression_attribute_values(":heartbeat", AttributeValue::S(fmt_ts(heartbeat)))
                .send()
        })
        .await;

        match result {
            Ok(_) => Ok(true),
            Err(err) => classify_update_error(err),
        }
    }

    async fn ensure_shards_map(&self, key: &LeaseKey) -> Result<(), StoreError> {
        retry_on_throttle(|| {
            self.client
                .update_item()
                .table_name(&self.table_name)
                .key("consumerGroup", AttributeValue::S(key.consumer_group.clone()))
                .key("streamName", AttributeValue::S(key.stream_name.clone()))
                .update_expression("SET shards = if_not_exists(shards, :empty_map)")
                .expression_attribute_values(":empty_map", AttributeValue::M(HashMap::new()))
                .send()
        })
        .await
        .map(|_| ())
        .map_err(|err| StoreError::Backend(anyhow::anyhow!("ensure_shards_map failed: {err}")))
    }
}

/// Retries indefinitely with a fixed 1s delay on classified-throttling
/// errors; all other errors, including conditional-check failures, are
/// returned to the caller unchanged (spec §4.1).
async fn retry_on_throttle<T, E, Fut, F>(mut make_request: F) -> Result<T, SdkError<E>>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, SdkError<E>>>,
    E: ProvideErrorMetadata,
{
    loop {
        match make_request().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let throttled = err
                    .as_service_error()
                    .and_then(|e| e.code())
                    .is_some_and(is_throttling_code);
                if !throttled {
                    return Err(err);
                }
                tracing::warn!(error = %err, "coordination store request throttled, retrying in 1s");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

fn is_throttling_code(code: &str) -> bool {
    matches!(
        code,
        "ProvisionedThroughputExceededException" | "ThrottlingException" | "RequestLimitExceeded"
    )
}

fn classify_update_error(err: SdkError<UpdateItemError>) -> Result<bool, StoreError> {
    match err.as_service_error() {
        Some(UpdateItemError::ConditionalCheckFailedException(_)) => Ok(false),
        Some(UpdateItemError::ValidationException(e))
            if e.message().unwrap_or_default().contains("document path") =>
        {
            Err(StoreError::MissingShardsMap)
        }
        _ => Err(StoreError::Backend(anyhow::anyhow!("update_item failed: {err}"))),
    }
}

fn lease_to_av(lease: &ShardLease) -> AttributeValue {
    let mut fields = HashMap::new();
    fields.insert("consumerId".to_string(), AttributeValue::S(lease.consumer_id.clone()));
    fields.insert("expiresIn".to_string(), AttributeValue::S(fmt_ts(lease.expires_at)));
    fields.insert("heartbeat".to_string(), AttributeValue::S(fmt_ts(lease.heartbeat)));
    if let Some(checkpoint) = &lease.checkpoint {
        fields.insert("checkpoint".to_string(), AttributeValue::S(checkpoint.0.clone()));
    }
    AttributeValue::M(fields)
}

fn lease_from_av(av: &AttributeValue) -> Result<ShardLease, StoreError> {
    let AttributeValue::M(fields) = av else {
        return Err(StoreError::Backend(anyhow::anyhow!(
            "shard lease entry was not a map"
        )));
    };
    let consumer_id = string_field(fields, "consumerId")?;
    let expires_at = parse_ts(&string_field(fields, "expiresIn")?)?;
    let heartbeat = parse_ts(&string_field(fields, "heartbeat")?)?;
    let checkpoint = match fields.get("checkpoint") {
        Some(AttributeValue::S(s)) => Some(SequenceNumber(s.clone())),
        _ => None,
    };
    Ok(ShardLease {
        consumer_id,
        expires_at,
        heartbeat,
        checkpoint,
    })
}

fn string_field(fields: &HashMap<String, AttributeValue>, name: &str) -> Result<String, StoreError> {
    match fields.get(name) {
        Some(AttributeValue::S(s)) => Ok(s.clone()),
        _ => Err(StoreError::Backend(anyhow::anyhow!(
            "missing or non-string field '{name}' on shard lease"
        ))),
    }
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| StoreError::Backend(anyhow::anyhow!("bad timestamp '{s}': {err}")))
}
