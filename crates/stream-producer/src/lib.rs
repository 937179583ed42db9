//! The buffered Producer (spec §4.6): a single background worker task that
//! batches `put(...)` calls into size- and count-bounded `put_records`
//! requests, flushing on whichever bound is hit first or on a timer.
//!
//! Follows the one-task-per-long-lived-resource convention used for the
//! EFO reader in `stream-consumer`: exactly one `tokio::spawn`ed worker per
//! `Producer`, fed by an unbounded channel so `put` never blocks on the
//! network.

use std::sync::Arc;
use std::time::Duration;

use exponential_backoff::Backoff;
use tokio::sync::{mpsc, oneshot};

use stream_client::{ClientError, KinesisOps, PutRecordsEntry};

/// `PRODUCER_MAX_RECORDS_SIZE`, `PRODUCER_MAX_RECORDS_COUNT`, and
/// `PRODUCER_DEFAULT_BUFFER_TIME` from spec §6, plus the bounded-retry knob
/// the distilled spec leaves unspecified.
#[derive(Debug, Clone)]
pub struct ProducerOptions {
    pub max_batch_size: usize,
    pub max_batch_count: usize,
    pub buffer_time: Duration,
    pub max_retries: u32,
}

impl Default for ProducerOptions {
    fn default() -> Self {
        ProducerOptions {
            max_batch_size: 1 << 20,
            max_batch_count: 500,
            buffer_time: Duration::from_millis(500),
            max_retries: 5,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("producer's background worker has already exited")]
    Closed,
}

/// One or more records dropped after exhausting retries on a partial or
/// total `put_records` failure. Mirrors `stream_consumer::ReaderError`:
/// observability only, never panics the worker.
#[derive(Debug)]
pub struct ProducerError {
    pub dropped_records: usize,
    pub cause: Option<ClientError>,
}

enum WorkerMessage {
    Put(PutRecordsEntry),
    Drain(oneshot::Sender<()>),
}

pub struct Producer {
    tx: mpsc::UnboundedSender<WorkerMessage>,
    worker: tokio::task::JoinHandle<()>,
}

impl Producer {
    pub fn new(
        stream_name: impl Into<String>,
        client: Arc<dyn KinesisOps>,
        options: ProducerOptions,
    ) -> (Self, mpsc::UnboundedReceiver<ProducerError>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (error_tx, error_rx) = mpsc::unbounded_channel();
        let stream_name = stream_name.into();

        let worker = tokio::spawn(async move {
            run(stream_name, client, rx, options, error_tx).await;
        });

        (Producer { tx, worker }, error_rx)
    }

    /// Enqueues a record for the next batch. Never awaits the network: it
    /// only blocks on the unbounded channel's own allocation.
    pub async fn put(&self, partition_key: impl Into<String>, data: bytes::Bytes) -> Result<(), Error> {
        self.tx
            .send(WorkerMessage::Put(PutRecordsEntry {
                partition_key: partition_key.into(),
                data,
            }))
            .map_err(|_| Error::Closed)
    }

    /// Flushes everything buffered and stops the worker. Dropping a
    /// `Producer` without calling `drain` may lose buffered records; this
    /// repository keeps that guarantee rather than adding a durability
    /// layer on top (spec §9).
    pub async fn drain(self) -> Result<(), Error> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx.send(WorkerMessage::Drain(ack_tx)).map_err(|_| Error::Closed)?;
        let _ = ack_rx.await;
        let _ = self.worker.await;
        Ok(())
    }
}

async fn run(
    stream_name: String,
    client: Arc<dyn KinesisOps>,
    mut rx: mpsc::UnboundedReceiver<WorkerMessage>,
    options: ProducerOptions,
    error_tx: mpsc::UnboundedSender<ProducerError>,
) {
    let mut buffer: Vec<PutRecordsEntry> = Vec::new();
    let mut buffered_size: usize = 0;

    let mut interval = tokio::time::interval(options.buffer_time);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await; // first tick fires immediately; consume it so the real cadence starts now.

    loop {
        tokio::select! {
            message = rx.recv() => {
                match message {
                    Some(WorkerMessage::Put(entry)) => {
                        let entry_size = entry.partition_key.len() + entry.data.len();
                        let exceeds_size = buffered_size + entry_size > options.max_batch_size;
                        let exceeds_count = buffer.len() + 1 > options.max_batch_count;
                        if (exceeds_size || exceeds_count) && !buffer.is_empty() {
                            flush(&stream_name, &client, &mut buffer, &mut buffered_size, &options, &error_tx).await;
                        }
                        buffered_size += entry_size;
                        buffer.push(entry);
                    }
                    Some(WorkerMessage::Drain(ack)) => {
                        flush(&stream_name, &client, &mut buffer, &mut buffered_size, &options, &error_tx).await;
                        let _ = ack.send(());
                        return;
                    }
                    None => {
                        flush(&stream_name, &client, &mut buffer, &mut buffered_size, &options, &error_tx).await;
                        return;
                    }
                }
            }
            _ = interval.tick() => {
                if !buffer.is_empty() {
                    flush(&stream_name, &client, &mut buffer, &mut buffered_size, &options, &error_tx).await;
                }
            }
        }
    }
}

async fn flush(
    stream_name: &str,
    client: &Arc<dyn KinesisOps>,
    buffer: &mut Vec<PutRecordsEntry>,
    buffered_size: &mut usize,
    options: &ProducerOptions,
    error_tx: &mpsc::UnboundedSender<ProducerError>,
) {
    if buffer.is_empty() {
        return;
    }

    let mut pending = std::mem::take(buffer);
    *buffered_size = 0;

    let backoff = Backoff::new(options.max_retries, Duration::from_millis(50), Some(Duration::from_secs(5)));
    let mut attempt: u32 = 0;

    loop {
        match client.put_records(stream_name, pending.clone()).await {
            Ok(outcome) if outcome.failed_indices.is_empty() => return,
            Ok(outcome) => {
                let retryable: Vec<PutRecordsEntry> =
                    outcome.failed_indices.into_iter().filter_map(|i| pending.get(i).cloned()).collect();
                attempt += 1;
                match backoff.next(attempt) {
                    Some(delay) => {
                        tracing::warn!(attempt, dropped_this_attempt = pending.len() - retryable.len(), "put_records partial failure, retrying");
                        pending = retryable;
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        tracing::error!(dropped = retryable.len(), "put_records retries exhausted, dropping records");
                        let _ = error_tx.send(ProducerError {
                            dropped_records: retryable.len(),
                            cause: None,
                        });
                        return;
                    }
                }
            }
            Err(err) => {
                attempt += 1;
                match backoff.next(attempt) {
                    Some(delay) => {
                        tracing::warn!(attempt, error = %err, "put_records failed, retrying");
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        tracing::error!(error = %err, dropped = pending.len(), "put_records retries exhausted, dropping records");
                        let _ = error_tx.send(ProducerError {
                            dropped_records: pending.len(),
                            cause: Some(err),
                        });
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stream_client::test_support::FakeKinesisClient;

    #[tokio::test]
    async fn put_then_drain_delivers_all_records() {
        let fake = Arc::new(FakeKinesisClient::new());
        fake.seed_stream("orders", "arn:stream/orders").await;
        fake.seed_shard("orders", "shard-0".into(), Vec::new()).await;

        let (producer, _errors) = Producer::new("orders", fake.clone(), ProducerOptions::default());
        producer.put("pk-1", bytes::Bytes::from_static(b"a")).await.unwrap();
        producer.put("pk-2", bytes::Bytes::from_static(b"b")).await.unwrap();
        producer.drain().await.unwrap();

        assert_eq!(fake.put_record_count("orders", &"shard-0".into()).await, 2);
    }

    #[tokio::test]
    async fn flush_triggers_once_batch_count_is_exceeded() {
        let fake = Arc::new(FakeKinesisClient::new());
        fake.seed_stream("orders", "arn:stream/orders").await;
        fake.seed_shard("orders", "shard-0".into(), Vec::new()).await;

        let options = ProducerOptions {
            max_batch_count: 2,
            buffer_time: Duration::from_secs(60),
            ..ProducerOptions::default()
        };
        let (producer, _errors) = Producer::new("orders", fake.clone(), options);

        producer.put("pk-1", bytes::Bytes::from_static(b"a")).await.unwrap();
        producer.put("pk-2", bytes::Bytes::from_static(b"b")).await.unwrap();
        producer.put("pk-3", bytes::Bytes::from_static(b"c")).await.unwrap();

        // Give the worker a moment to act on the third `put` crossing the count bound.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fake.put_record_count("orders", &"shard-0".into()).await, 2);

        producer.drain().await.unwrap();
        assert_eq!(fake.put_record_count("orders", &"shard-0".into()).await, 3);
    }
}
