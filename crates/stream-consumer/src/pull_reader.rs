//! The Pull Shard Reader (spec §4.3): a periodic `get_records` loop against
//! one shard iterator, with retry/backoff on classified-retryable errors.
//! Modeled as an explicit state machine, the way `journal-client`'s
//! uncommitted reader drives its own `{StartReq, Reading, Backoff}` enum
//! rather than folding retry logic into nested `match`/`loop` control flow.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use stream_client::{ClientError, KinesisOps};
use stream_types::{IteratorSpec, Record, ShardId};

use crate::cancellation::CancellationToken;
use crate::reader::{ReaderTask, ShardReader};
use crate::ReaderError;

pub struct PullReaderConfig {
    pub shard_id: ShardId,
    pub stream_name: String,
    pub initial_position: IteratorSpec,
    pub sleep_time: Duration,
    pub max_sleep_time: Duration,
    pub pull_limit: i32,
}

enum State {
    Starting,
    Fetching { iterator: String, retries: u32 },
    Sleeping { iterator: String },
    Retrying { iterator: String, retries: u32 },
    Closed,
}

pub fn spawn(
    config: PullReaderConfig,
    client: Arc<dyn KinesisOps>,
    record_tx: mpsc::Sender<(ShardId, Record)>,
    error_tx: mpsc::UnboundedSender<ReaderError>,
) -> ShardReader {
    let token = CancellationToken::new();
    let task_token = token.clone();

    let handle = tokio::spawn(async move {
        run(config, client, record_tx, error_tx, task_token).await;
    });

    ShardReader::Pull(ReaderTask::new(token, handle))
}

async fn run(
    config: PullReaderConfig,
    client: Arc<dyn KinesisOps>,
    record_tx: mpsc::Sender<(ShardId, Record)>,
    error_tx: mpsc::UnboundedSender<ReaderError>,
    token: CancellationToken,
) {
    let shard_id = config.shard_id.clone();
    let mut state = State::Starting;

    loop {
        if token.is_cancelled() {
            tracing::debug!(shard_id = %shard_id, "pull reader shutting down between iterations");
            return;
        }

        state = match state {
            State::Starting => {
                match client
                    .get_shard_iterator(&config.stream_name, &shard_id, config.initial_position.clone())
                    .await
                {
                    Ok(iterator) => State::Fetching { iterator, retries: 0 },
                    Err(err) => {
                        tracing::error!(shard_id = %shard_id, error = %err, "failed to resolve initial shard iterator");
                        let _ = error_tx.send(ReaderError { shard_id: shard_id.clone(), error: err });
                        State::Closed
                    }
                }
            }

            State::Fetching { iterator, retries } => {
                match client.get_records(&iterator, config.pull_limit).await {
                    Ok(output) => {
                        for record in output.records {
                            if record_tx.send((shard_id.clone(), record)).await.is_err() {
                                tracing::debug!(shard_id = %shard_id, "record channel closed, exiting pull reader");
                                return;
                            }
                        }
                        match output.next_iterator {
                            Some(next) => State::Sleeping { iterator: next },
                            None => {
                                tracing::debug!(shard_id = %shard_id, "shard closed, no next iterator");
                                State::Closed
                            }
                        }
                    }
                    Err(err) => classify_fetch_error(&shard_id, &error_tx, err, iterator, retries),
                }
            }

            State::Sleeping { iterator } => {
                tokio::select! {
                    _ = tokio::time::sleep(config.sleep_time) => State::Fetching { iterator, retries: 0 },
                    _ = token.cancelled() => State::Closed,
                }
            }

            State::Retrying { iterator, retries } => {
                let raw_delay_secs = retries as u64 * 2;
                if raw_delay_secs >= config.max_sleep_time.as_secs() {
                    tracing::error!(shard_id = %shard_id, retries, "pull reader backoff exceeded max sleep time, exiting");
                    State::Closed
                } else {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(raw_delay_secs)) => {
                            State::Fetching { iterator, retries }
                        }
                        _ = token.cancelled() => State::Closed,
                    }
                }
            }

            State::Closed => return,
        };
    }
}

/// Retryable errors are absorbed into backoff silently; non-retryable
/// errors are additionally surfaced once on the error channel, since they
/// likely indicate a condition the caller should observe, even though the
/// reader itself keeps retrying rather than crashing the consumer.
fn classify_fetch_error(
    shard_id: &ShardId,
    error_tx: &mpsc::UnboundedSender<ReaderError>,
    err: ClientError,
    iterator: String,
    retries: u32,
) -> State {
    let retries = retries + 1;
    if !err.is_retryable() {
        tracing::error!(shard_id = %shard_id, error = %err, "non-retryable error from get_records");
        let _ = error_tx.send(ReaderError {
            shard_id: shard_id.clone(),
            error: err,
        });
    } else {
        tracing::warn!(shard_id = %shard_id, error = %err, retries, "retryable error from get_records, backing off");
    }
    State::Retrying { iterator, retries }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stream_client::test_support::FakeKinesisClient;

    #[tokio::test]
    async fn delivers_records_then_closes_on_drained_shard() {
        let fake = Arc::new(FakeKinesisClient::new());
        fake.seed_stream("orders", "arn:stream/orders").await;
        let shard = ShardId::from("shard-0");
        fake.seed_shard(
            "orders",
            shard.clone(),
            vec![Record {
                sequence_number: "0".into(),
                partition_key: "pk".into(),
                data: bytes::Bytes::from_static(b"hi"),
                arrival_timestamp: None,
            }],
        )
        .await;
        fake.close_shard("orders", &shard).await;

        let (record_tx, mut record_rx) = mpsc::channel(10);
        let (error_tx, _error_rx) = mpsc::unbounded_channel();

        let config = PullReaderConfig {
            shard_id: shard.clone(),
            stream_name: "orders".into(),
            initial_position: IteratorSpec::TrimHorizon,
            sleep_time: Duration::from_millis(5),
            max_sleep_time: Duration::from_secs(30),
            pull_limit: 100,
        };

        let reader = spawn(config, fake, record_tx, error_tx);

        let (received_shard, record) = tokio::time::timeout(Duration::from_secs(1), record_rx.recv())
            .await
            .expect("reader should deliver a record before closing")
            .expect("channel should not be closed before delivering");
        assert_eq!(received_shard, shard);
        assert_eq!(record.sequence_number.as_str(), "0");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!reader.is_alive(), "reader should exit once the shard reports closed");
    }
}
