//! The sink service of a single task. It owns one [TopicPartitionChannel] per assigned partition,
//! routes the records handed over by the host and tells the host which offsets are safe to commit
//! upstream.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::channel::{ChannelState, Reporters, TopicPartitionChannel};
use crate::client::ClientManager;
use crate::config::SinkConfig;
use crate::error::{Error, Result};
use crate::ingest::{IngestClientFactory, NoSchemaEvolution, SchemaStore};
use crate::record::{Record, TopicPartition};
use crate::report::{ErrorReporter, TelemetryReporter};

/// Builds a [SinkService] for a task.
pub struct SinkServiceBuilder<F: IngestClientFactory, S = NoSchemaEvolution> {
    task_id: usize,
    config: SinkConfig,
    client_manager: Arc<ClientManager<F>>,
    schema_store: S,
    reporters: Reporters,
}

impl<F: IngestClientFactory> SinkServiceBuilder<F, NoSchemaEvolution> {
    pub fn new(task_id: usize, config: SinkConfig, client_manager: Arc<ClientManager<F>>) -> Self {
        Self {
            task_id,
            config,
            client_manager,
            schema_store: NoSchemaEvolution,
            reporters: Reporters::default(),
        }
    }
}

impl<F: IngestClientFactory, S> SinkServiceBuilder<F, S> {
    pub fn schema_store<T: SchemaStore>(self, schema_store: T) -> SinkServiceBuilder<F, T> {
        SinkServiceBuilder {
            task_id: self.task_id,
            config: self.config,
            client_manager: self.client_manager,
            schema_store,
            reporters: self.reporters,
        }
    }

    pub fn error_reporter(mut self, error_reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporters.error = error_reporter;
        self
    }

    pub fn telemetry(mut self, telemetry: Arc<dyn TelemetryReporter>) -> Self {
        self.reporters.telemetry = telemetry;
        self
    }

    /// Adds to the topic to table mapping of the config.
    pub fn topic_to_table(mut self, topic_to_table: HashMap<String, String>) -> Self {
        self.config.topic_to_table.extend(topic_to_table);
        self
    }
}

impl<F, S> SinkServiceBuilder<F, S>
where
    F: IngestClientFactory + Sync,
    S: SchemaStore + Send + Sync,
{
    pub fn build(self) -> Result<SinkService<F, S>> {
        self.config.validate()?;
        // fails early for a task the pool has no client for
        self.client_manager.client_index(self.task_id)?;

        Ok(SinkService {
            task_id: self.task_id,
            config: self.config,
            client_manager: self.client_manager,
            schema_store: Arc::new(self.schema_store),
            reporters: self.reporters,
            channels: HashMap::new(),
            stopped: false,
        })
    }
}

pub struct SinkService<F: IngestClientFactory, S: SchemaStore> {
    task_id: usize,
    config: SinkConfig,
    client_manager: Arc<ClientManager<F>>,
    schema_store: Arc<S>,
    reporters: Reporters,
    channels: HashMap<TopicPartition, TopicPartitionChannel<F::Client, S>>,
    stopped: bool,
}

impl<F, S> SinkService<F, S>
where
    F: IngestClientFactory + Sync,
    S: SchemaStore + Send + Sync,
{
    /// Opens the channel of a newly assigned partition. Assigning a tracked partition is a no-op.
    pub async fn on_partition_assigned(&mut self, tp: TopicPartition) -> Result<()> {
        self.ensure_running()?;
        if self.channels.contains_key(&tp) {
            return Ok(());
        }

        let client = self.client_manager.client_for(self.task_id).await?;
        let table = self.config.table_for(&tp.topic);
        let channel = TopicPartitionChannel::open(
            tp.clone(),
            table,
            client,
            Arc::clone(&self.schema_store),
            &self.config,
            self.reporters.clone(),
        )
        .await?;
        self.channels.insert(tp, channel);
        Ok(())
    }

    pub async fn on_partitions_assigned(
        &mut self,
        partitions: impl IntoIterator<Item = TopicPartition>,
    ) -> Result<()> {
        for tp in partitions {
            self.on_partition_assigned(tp).await?;
        }
        Ok(())
    }

    /// Routes the records to the channels of their partitions, opening channels for partitions
    /// seen for the first time, then flushes every buffer that got too old. A failing partition
    /// does not keep the records of the others from being routed, the first failure is returned
    /// once every partition got its records.
    pub async fn insert(&mut self, records: Vec<Record>) -> Result<()> {
        self.ensure_running()?;

        let mut by_partition: BTreeMap<TopicPartition, Vec<Record>> = BTreeMap::new();
        for record in records {
            by_partition
                .entry(record.topic_partition())
                .or_default()
                .push(record);
        }

        let mut first_error = None;
        for (tp, records) in by_partition {
            if let Err(e) = self.insert_partition(tp, records).await {
                first_error.get_or_insert(e);
            }
        }

        if let Err(e) = self.flush_if_time_threshold_reached().await {
            first_error.get_or_insert(e);
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Flushes the buffers whose oldest record is older than the time threshold. Called after each
    /// insert, hosts that go quiet for long should call it periodically as well. Every open
    /// channel is polled, the first failure is returned.
    pub async fn flush_if_time_threshold_reached(&mut self) -> Result<()> {
        self.ensure_running()?;
        let mut first_error = None;
        for channel in self.channels.values_mut() {
            if channel.state() != ChannelState::Open {
                continue;
            }
            if let Err(e) = channel.flush_if_time_threshold_reached().await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Offsets the host may commit upstream, for the requested partitions whose channel flushed
    /// something. A committed offset is the offset of the next record to consume, so it is one
    /// past the last flushed offset, capped at what the host asked for.
    pub fn precommit(
        &self,
        requested: &HashMap<TopicPartition, i64>,
    ) -> Result<HashMap<TopicPartition, i64>> {
        self.ensure_running()?;
        let committed = requested
            .iter()
            .filter_map(|(tp, requested_offset)| {
                let flushed = self.channels.get(tp)?.last_flushed_offset()?;
                Some((tp.clone(), (flushed + 1).min(*requested_offset)))
            })
            .collect();
        Ok(committed)
    }

    /// Offsets the upstream must rewind to after channel recoveries. Each rewind is returned once.
    pub fn offsets_to_rewind(&mut self) -> HashMap<TopicPartition, i64> {
        self.channels
            .iter_mut()
            .filter_map(|(tp, channel)| channel.take_rewind_offset().map(|o| (tp.clone(), o)))
            .collect()
    }

    /// Flushes and closes the channels of the revoked partitions. Failures are logged only, the
    /// partitions are gone either way.
    pub async fn on_partitions_revoked(
        &mut self,
        partitions: impl IntoIterator<Item = TopicPartition>,
    ) {
        for tp in partitions {
            let Some(mut channel) = self.channels.remove(&tp) else {
                continue;
            };
            Self::flush_and_close(&mut channel).await;
            info!(partition = %tp, "Partition revoked");
        }
    }

    /// Flushes and closes every channel. The client pool is shared with other tasks and stays
    /// open, see [ClientManager::close_all].
    pub async fn stop(&mut self) -> Result<()> {
        self.ensure_running()?;
        self.stopped = true;

        let mut first_error = None;
        for (_, mut channel) in self.channels.drain() {
            if let Some(e) = Self::flush_and_close(&mut channel).await {
                first_error.get_or_insert(e);
            }
        }
        info!(task_id = self.task_id, "Sink service stopped");
        first_error.map_or(Ok(()), Err)
    }

    pub fn is_partition_buffer_empty(&self, tp: &TopicPartition) -> bool {
        self.channels
            .get(tp)
            .is_none_or(|channel| channel.is_buffer_empty())
    }

    /// Last offset of the partition durably ingested by the destination.
    pub fn committed_offset(&self, tp: &TopicPartition) -> Option<i64> {
        self.channels.get(tp)?.last_flushed_offset()
    }

    pub fn channel_state(&self, tp: &TopicPartition) -> Option<ChannelState> {
        self.channels.get(tp).map(|channel| channel.state())
    }

    pub fn partition_count(&self) -> usize {
        self.channels.len()
    }

    /// Forwards the records of one partition to its channel. Stops at the first failure, which
    /// closes the channel.
    async fn insert_partition(&mut self, tp: TopicPartition, records: Vec<Record>) -> Result<()> {
        if !self.channels.contains_key(&tp) {
            warn!(
                partition = %tp,
                "Received records for an unassigned partition, opening its channel"
            );
            self.on_partition_assigned(tp.clone()).await?;
        }
        let channel = self
            .channels
            .get_mut(&tp)
            .ok_or_else(|| Error::ChannelClosed {
                channel: tp.channel_name(),
            })?;
        for record in records {
            channel.insert(record).await?;
        }
        Ok(())
    }

    fn ensure_running(&self) -> Result<()> {
        if self.stopped {
            return Err(Error::Stopped);
        }
        Ok(())
    }

    /// Returns the first failure, after logging it.
    async fn flush_and_close(channel: &mut TopicPartitionChannel<F::Client, S>) -> Option<Error> {
        let mut failure = None;
        if channel.state() == ChannelState::Open {
            if let Err(e) = channel.flush().await {
                error!(channel = channel.channel_name(), ?e, "Failed to flush channel");
                failure = Some(e);
            }
        }
        if let Err(e) = channel.close().await {
            error!(channel = channel.channel_name(), ?e, "Failed to close channel");
            failure.get_or_insert(e);
        }
        failure
    }
}
