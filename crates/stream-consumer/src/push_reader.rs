//! The Push Shard Reader (EFO, spec §4.4): resubscribes to a per-shard
//! `subscribe_to_shard` event stream roughly every ~5 minutes, tracking the
//! continuation sequence number across reconnects.
//!
//! `KinesisOps::subscribe_to_shard` already adapts the underlying HTTP/2
//! event stream into a single `futures::Stream` of record/error events, so
//! the separate record-callback/error-callback/dispatcher-thread structure
//! the source uses collapses here into one task consuming that stream; the
//! continuation sequence number is therefore plain task-local state rather
//! than a mutex-guarded field (see DESIGN.md).

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;

use stream_client::{ClientError, KinesisOps};
use stream_types::{Record, SequenceNumber, ShardId, StartingPosition};

use crate::cancellation::CancellationToken;
use crate::reader::{ReaderTask, ShardReader};
use crate::ReaderError;

pub struct PushReaderConfig {
    pub shard_id: ShardId,
    pub consumer_arn: String,
    pub initial_position: StartingPosition,
    pub wait_timeout: Duration,
    /// Delay before resubscribing after the previous subscription ended or
    /// failed to establish; keeps a persistently-failing shard from busy-looping.
    pub reconnect_delay: Duration,
}

pub fn spawn(
    config: PushReaderConfig,
    client: Arc<dyn KinesisOps>,
    record_tx: mpsc::Sender<(ShardId, Record)>,
    error_tx: mpsc::UnboundedSender<ReaderError>,
) -> ShardReader {
    let token = CancellationToken::new();
    let task_token = token.clone();

    let handle = tokio::spawn(async move {
        run(config, client, record_tx, error_tx, task_token).await;
    });

    ShardReader::Push(ReaderTask::new(token, handle))
}

async fn run(
    config: PushReaderConfig,
    client: Arc<dyn KinesisOps>,
    record_tx: mpsc::Sender<(ShardId, Record)>,
    error_tx: mpsc::UnboundedSender<ReaderError>,
    token: CancellationToken,
) {
    let shard_id = config.shard_id.clone();
    let mut starting_position = config.initial_position.clone();

    loop {
        if token.is_cancelled() {
            tracing::debug!(shard_id = %shard_id, "push reader shutting down between iterations");
            return;
        }

        let subscription = client
            .subscribe_to_shard(&config.consumer_arn, &shard_id, starting_position.clone())
            .await;

        let mut events = match subscription {
            Ok(events) => events,
            Err(ClientError::StreamInit(detail)) => {
                tracing::warn!(shard_id = %shard_id, detail, "subscribe_to_shard stream failed to initialize, will retry");
                sleep_or_cancel(config.reconnect_delay, &token).await;
                continue;
            }
            Err(err) => {
                tracing::error!(shard_id = %shard_id, error = %err, "subscribe_to_shard failed");
                let _ = error_tx.send(ReaderError {
                    shard_id: shard_id.clone(),
                    error: err,
                });
                sleep_or_cancel(config.reconnect_delay, &token).await;
                continue;
            }
        };

        let mut continuation: Option<SequenceNumber> = None;
        let wait = async {
            loop {
                tokio::select! {
                    next = events.next() => {
                        match next {
                            Some(Ok(event)) => {
                                if let Some(seq) = event.continuation_sequence_number {
                                    continuation = Some(seq);
                                }
                                for record in event.records {
                                    if record_tx.send((shard_id.clone(), record)).await.is_err() {
                                        return false;
                                    }
                                }
                            }
                            Some(Err(ClientError::StreamInit(detail))) => {
                                tracing::warn!(shard_id = %shard_id, detail, "subscribe_to_shard transport error mid-stream, will resubscribe");
                            }
                            Some(Err(err)) => {
                                tracing::warn!(shard_id = %shard_id, error = %err, "subscribe_to_shard event error");
                                let _ = error_tx.send(ReaderError {
                                    shard_id: shard_id.clone(),
                                    error: err,
                                });
                            }
                            None => return true,
                        }
                    }
                    _ = token.cancelled() => return true,
                }
            }
        };

        match tokio::time::timeout(config.wait_timeout, wait).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(shard_id = %shard_id, "record channel closed, exiting push reader");
                return;
            }
            Err(_) => {
                tracing::warn!(shard_id = %shard_id, "subscribe_to_shard wait timed out, resubscribing");
            }
        }

        starting_position = match continuation {
            Some(seq) => stream_types::IteratorSpec::AfterSequenceNumber(seq),
            None => starting_position,
        };

        if token.is_cancelled() {
            return;
        }
        sleep_or_cancel(config.reconnect_delay, &token).await;
    }
}

async fn sleep_or_cancel(delay: Duration, token: &CancellationToken) {
    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = token.cancelled() => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stream_client::test_support::FakeKinesisClient;

    #[tokio::test]
    async fn resubscribes_with_continuation_after_subscription_ends() {
        let fake = Arc::new(FakeKinesisClient::new());
        fake.seed_stream("orders", "arn:stream/orders").await;
        let shard = ShardId::from("shard-0");
        fake.seed_shard(
            "orders",
            shard.clone(),
            vec![
                Record {
                    sequence_number: "100".into(),
                    partition_key: "pk".into(),
                    data: bytes::Bytes::from_static(b"a"),
                    arrival_timestamp: None,
                },
                Record {
                    sequence_number: "110".into(),
                    partition_key: "pk".into(),
                    data: bytes::Bytes::from_static(b"b"),
                    arrival_timestamp: None,
                },
            ],
        )
        .await;
        let consumer_arn = fake.register_stream_consumer("arn:stream/orders", "my-app").await.unwrap();

        let (record_tx, mut record_rx) = mpsc::channel(10);
        let (error_tx, _error_rx) = mpsc::unbounded_channel();

        let config = PushReaderConfig {
            shard_id: shard.clone(),
            consumer_arn,
            initial_position: stream_types::IteratorSpec::TrimHorizon,
            wait_timeout: Duration::from_millis(200),
            reconnect_delay: Duration::from_millis(5),
        };

        let reader = spawn(config, fake, record_tx, error_tx);

        let (shard_a, record_a) = record_rx.recv().await.unwrap();
        let (shard_b, record_b) = record_rx.recv().await.unwrap();
        assert_eq!(shard_a, shard);
        assert_eq!(shard_b, shard);
        assert_eq!(record_a.sequence_number.as_str(), "100");
        assert_eq!(record_b.sequence_number.as_str(), "110");

        reader.shutdown().await;
    }
}
