//! The Consumer Orchestrator (spec §4.5): shard discovery, the per-cycle
//! lease loop, reader lifecycle, record dispatch, and signal-driven
//! shutdown. This is the component the rest of the crate exists to support.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;

use stream_client::KinesisOps;
use stream_store::{CheckpointMode, LeaseKey, LeaseStore};
use stream_types::{IteratorSpec, Record, ShardId};

use crate::cancellation::CancellationToken;
use crate::lease_manager::LeaseManager;
use crate::reader::ShardReader;
use crate::{pull_reader, push_reader, Error, Options, ReaderError, ReaderMode};

/// User-supplied record handler. Invoked serially by the orchestrator's
/// dispatch loop — never concurrently for the same, or even different,
/// shards — so implementations do not need their own synchronization.
#[async_trait]
pub trait ConsumerCallback: Send + Sync {
    async fn on_record(&self, shard_id: &ShardId, record: Record) -> Result<(), anyhow::Error>;
}

pub struct Consumer {
    stream_name: String,
    consumer_group: String,
    consumer_id: String,
    mode: ReaderMode,
    options: Options,

    client: Arc<dyn KinesisOps>,
    store: Arc<dyn LeaseStore>,
    callback: Arc<dyn ConsumerCallback>,

    token: CancellationToken,

    record_tx: mpsc::Sender<(ShardId, Record)>,
    record_rx: mpsc::Receiver<(ShardId, Record)>,
    error_tx: mpsc::UnboundedSender<ReaderError>,
    error_rx: mpsc::UnboundedReceiver<ReaderError>,

    readers: HashMap<ShardId, ShardReader>,

    stream_arn: Option<String>,
    retention_hours: u32,
    consumer_arn: Option<String>,
    lease_manager: Option<LeaseManager>,
}

impl Consumer {
    pub fn new(
        stream_name: impl Into<String>,
        client: Arc<dyn KinesisOps>,
        store: Arc<dyn LeaseStore>,
        mode: ReaderMode,
        consumer_group: impl Into<String>,
        consumer_id: impl Into<String>,
        callback: Arc<dyn ConsumerCallback>,
        options: Options,
    ) -> Self {
        let (record_tx, record_rx) = mpsc::channel(options.push_limit);
        let (error_tx, error_rx) = mpsc::unbounded_channel();

        Consumer {
            stream_name: stream_name.into(),
            consumer_group: consumer_group.into(),
            consumer_id: consumer_id.into(),
            mode,
            options,
            client,
            store,
            callback,
            token: CancellationToken::new(),
            record_tx,
            record_rx,
            error_tx,
            error_rx,
            readers: HashMap::new(),
            stream_arn: None,
            retention_hours: 24,
            consumer_arn: None,
            lease_manager: None,
        }
    }

    /// The token this consumer observes. Install a signal handler against it
    /// (`token.spawn_signal_handler()`) before calling `run`, or cancel it
    /// directly for programmatic shutdown.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Drains reader errors accumulated so far without blocking. Observability
    /// only — the orchestrator never reacts to these itself (spec §7).
    pub fn try_recv_error(&mut self) -> Option<ReaderError> {
        self.error_rx.try_recv().ok()
    }

    async fn bootstrap(&mut self) -> Result<(), Error> {
        let description = self.client.describe_stream(&self.stream_name).await?;
        self.stream_arn = Some(description.stream_arn.clone());
        self.retention_hours = description.retention_hours;

        let checkpoint_mode = match &self.mode {
            ReaderMode::Pull => CheckpointMode::Pull,
            ReaderMode::Push { .. } => CheckpointMode::Push,
        };
        self.lease_manager = Some(LeaseManager::new(
            self.store.clone(),
            LeaseKey {
                consumer_group: self.consumer_group.clone(),
                stream_name: self.stream_name.clone(),
            },
            self.consumer_id.clone(),
            checkpoint_mode,
        ));

        if let ReaderMode::Push { consumer_name } = &self.mode {
            let existing = self
                .client
                .describe_stream_consumer(&description.stream_arn, consumer_name)
                .await?;
            self.consumer_arn = Some(match existing {
                Some(arn) => arn,
                None => {
                    self.client
                        .register_stream_consumer(&description.stream_arn, consumer_name)
                        .await?
                }
            });
        }

        Ok(())
    }

    /// Runs the outer lease-cycle loop until cancelled. Consumes `self`
    /// since every live reader is torn down on return.
    pub async fn run(mut self) -> Result<(), Error> {
        self.bootstrap().await?;

        let result = self.lease_cycle_loop().await;

        for (_, reader) in self.readers.drain() {
            reader.shutdown().await;
        }

        result
    }

    async fn lease_cycle_loop(&mut self) -> Result<(), Error> {
        while !self.token.is_cancelled() {
            self.reap_dead_readers().await;
            self.run_lease_round().await?;

            let cycle_start = Instant::now();
            let cycle_budget = self.options.lock_duration.saturating_sub(Duration::from_secs(1));

            while cycle_start.elapsed() < cycle_budget {
                if self.token.is_cancelled() {
                    return Ok(());
                }

                match self.record_rx.try_recv() {
                    Ok((shard_id, record)) => {
                        if let Err(err) = self.dispatch(&shard_id, record).await {
                            return Err(err);
                        }
                    }
                    Err(mpsc::error::TryRecvError::Empty) => {}
                    Err(mpsc::error::TryRecvError::Disconnected) => {}
                }

                tokio::select! {
                    _ = tokio::time::sleep(self.options.read_interval) => {}
                    _ = self.token.cancelled() => return Ok(()),
                }
            }
        }

        Ok(())
    }

    async fn reap_dead_readers(&mut self) {
        let dead: Vec<ShardId> = self
            .readers
            .iter()
            .filter(|(_, reader)| !reader.is_alive())
            .map(|(shard_id, _)| shard_id.clone())
            .collect();

        for shard_id in dead {
            if let Some(reader) = self.readers.remove(&shard_id) {
                reader.shutdown().await;
            }
            if let Some(manager) = &mut self.lease_manager {
                manager.forget(&shard_id);
            }
        }
    }

    async fn run_lease_round(&mut self) -> Result<(), Error> {
        let shard_ids = self.client.list_shards(&self.stream_name).await?;
        let new_expiry = Utc::now() + chrono::Duration::from_std(self.options.lock_duration).expect("lock_duration fits in chrono::Duration");

        for shard_id in shard_ids {
            let acquired = self
                .lease_manager
                .as_mut()
                .expect("bootstrap runs before any lease round")
                .acquire_or_renew(&shard_id, new_expiry)
                .await?;

            let has_reader = self.readers.contains_key(&shard_id);

            if acquired && !has_reader {
                self.spawn_reader(&shard_id).await?;
            } else if !acquired && has_reader {
                if let Some(reader) = self.readers.remove(&shard_id) {
                    reader.shutdown().await;
                }
                if let Some(manager) = &mut self.lease_manager {
                    manager.forget(&shard_id);
                }
            }
        }

        Ok(())
    }

    async fn spawn_reader(&mut self, shard_id: &ShardId) -> Result<(), Error> {
        let manager = self.lease_manager.as_ref().expect("bootstrap runs before any lease round");
        let initial_position = manager.initial_iterator(shard_id, self.retention_hours);

        let reader = match &self.mode {
            ReaderMode::Pull => pull_reader::spawn(
                pull_reader::PullReaderConfig {
                    shard_id: shard_id.clone(),
                    stream_name: self.stream_name.clone(),
                    initial_position,
                    sleep_time: self.options.sleep_time,
                    max_sleep_time: self.options.max_sleep_time,
                    pull_limit: self.options.pull_limit,
                },
                self.client.clone(),
                self.record_tx.clone(),
                self.error_tx.clone(),
            ),
            ReaderMode::Push { .. } => {
                let consumer_arn = self
                    .consumer_arn
                    .clone()
                    .ok_or_else(|| Error::Config("push mode requires a registered consumer ARN".into()))?;
                push_reader::spawn(
                    push_reader::PushReaderConfig {
                        shard_id: shard_id.clone(),
                        consumer_arn,
                        initial_position,
                        wait_timeout: self.options.wait_timeout,
                        reconnect_delay: self.options.sleep_time,
                    },
                    self.client.clone(),
                    self.record_tx.clone(),
                    self.error_tx.clone(),
                )
            }
        };

        self.readers.insert(shard_id.clone(), reader);
        Ok(())
    }

    async fn dispatch(&mut self, shard_id: &ShardId, record: Record) -> Result<(), Error> {
        let sequence_number = record.sequence_number.clone();

        self.callback
            .on_record(shard_id, record)
            .await
            .map_err(Error::Callback)?;

        let manager = self.lease_manager.as_mut().expect("bootstrap runs before any dispatch");
        match manager.checkpoint(shard_id, &sequence_number).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(shard_id = %shard_id, "checkpoint conditional write lost, record was still delivered");
            }
            Err(err) => {
                tracing::error!(shard_id = %shard_id, error = %err, "checkpoint write failed, shutting down this shard's reader");
                if let Some(reader) = self.readers.remove(shard_id) {
                    reader.shutdown().await;
                }
                manager.forget(shard_id);
            }
        }

        Ok(())
    }
}
