//! Minimal end-to-end wiring of `stream-consumer` against a real stream and
//! coordination table: counts records per shard and logs a running total.
//! Not an operator CLI — configuration is three env reads, not a flag
//! parser, and there is no daemonization or subcommand surface.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use async_trait::async_trait;

use stream_client::AwsKinesisClient;
use stream_consumer::{Consumer, ConsumerCallback, Options, ReaderMode};
use stream_store::DynamoLeaseStore;
use stream_types::{Record, ShardId};

struct ShardCounts {
    counts: Mutex<HashMap<ShardId, u64>>,
    total: AtomicU64,
}

#[async_trait]
impl ConsumerCallback for ShardCounts {
    async fn on_record(&self, shard_id: &ShardId, record: Record) -> Result<(), anyhow::Error> {
        let total = self.total.fetch_add(1, Ordering::Relaxed) + 1;
        let mut counts = self.counts.lock().expect("counts mutex is never poisoned");
        let shard_count = counts.entry(shard_id.clone()).or_insert(0);
        *shard_count += 1;

        if total % 100 == 0 {
            tracing::info!(
                shard_id = %shard_id,
                shard_count,
                total,
                sequence_number = %record.sequence_number,
                "processed records"
            );
        }

        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting tracing default failed");

    let stream_name = std::env::var("STREAM_NAME").context("STREAM_NAME must be set")?;
    let coordination_table = std::env::var("COORDINATION_TABLE").context("COORDINATION_TABLE must be set")?;
    let consumer_group =
        std::env::var("CONSUMER_GROUP").unwrap_or_else(|_| stream_consumer::default_consumer_group());

    let mode = match std::env::var("CONSUMER_NAME") {
        Ok(consumer_name) => ReaderMode::Push { consumer_name },
        Err(_) => ReaderMode::Pull,
    };

    let client = Arc::new(AwsKinesisClient::new().await);
    let store = Arc::new(DynamoLeaseStore::new(coordination_table).await);
    let consumer_id = stream_consumer::resolve_consumer_id();

    tracing::info!(%stream_name, %consumer_group, %consumer_id, "starting shard-counter");

    let callback = Arc::new(ShardCounts {
        counts: Mutex::new(HashMap::new()),
        total: AtomicU64::new(0),
    });

    let consumer = Consumer::new(
        stream_name,
        client,
        store,
        mode,
        consumer_group,
        consumer_id,
        callback,
        Options::default(),
    );

    consumer.cancellation_token().spawn_signal_handler();
    consumer.run().await?;

    tracing::info!("shard-counter exiting");
    Ok(())
}
