//! Ingestion channel of a single topic-partition.
//!
//! A [TopicPartitionChannel] buffers the records of its partition, flushes them to its remote
//! channel when a threshold is reached and keeps track of the last offset the destination has
//! durably ingested. Flush failures are classified with [ErrorKind] and recovered from when
//! possible:
//!
//! - an invalidated remote channel is re-opened and the offset committed on the remote side is
//!   adopted, the upstream is then asked to rewind to the offset right after it.
//! - rows refused because of the table's columns trigger a schema evolution and a single resubmit
//!   of the batch, if the destination allows it.
//! - other refused rows are either dead-lettered or fail the channel, depending on the configured
//!   error tolerance.
//!
//! A channel that failed is `Closed` for good and keeps the batch it could not ingest.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::buffer::{BufferThreshold, PartitionBuffer};
use crate::config::{ErrorConfig, ErrorTolerance, SinkConfig};
use crate::error::{Error, ErrorKind, Result};
use crate::ingest::{
    IngestChannel, IngestClient, IngestError, InsertError, InsertValidationResponse,
    OpenChannelRequest, SchemaStore,
};
use crate::metrics::{partition_labels, sink_metrics};
use crate::record::{Record, TopicPartition};
use crate::report::{ErrorReporter, LogErrorReporter, LogTelemetryReporter, TelemetryReporter};
use crate::schema::SchemaChange;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Open,
    /// The remote channel is being re-opened after it was invalidated.
    Reopening,
    /// Terminal, the channel accepts neither inserts nor flushes.
    Closed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelState::Open => write!(f, "OPEN"),
            ChannelState::Reopening => write!(f, "REOPENING"),
            ChannelState::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Result of flushing a batch. Fatal outcomes are returned as an [Error] instead, see
/// [Error::kind].
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    /// Every record of the batch was ingested.
    Success { max_offset: Option<i64> },
    /// Some records were refused and skipped, the others were ingested.
    PartialErrors {
        /// `None` when every record was refused.
        accepted_max_offset: Option<i64>,
        rejected: Vec<(Record, ErrorKind)>,
    },
    /// The remote channel was invalidated and re-opened. Nothing of the batch is known to be
    /// ingested past `committed_offset`. The upstream has to replay from the offset after it, or
    /// from the start of the batch when nothing was committed.
    Reopened { committed_offset: Option<i64> },
}

/// Where refused records and fatal failures are reported.
#[derive(Clone)]
pub struct Reporters {
    pub error: Arc<dyn ErrorReporter>,
    pub telemetry: Arc<dyn TelemetryReporter>,
}

impl Default for Reporters {
    fn default() -> Self {
        Self {
            error: Arc::new(LogErrorReporter),
            telemetry: Arc::new(LogTelemetryReporter),
        }
    }
}

pub struct TopicPartitionChannel<C: IngestClient, S: SchemaStore> {
    tp: TopicPartition,
    channel_name: String,
    table: String,
    client: Arc<C>,
    /// `None` once the channel is closed.
    handle: Option<C::Channel>,
    schema_store: Arc<S>,
    /// Enabled in the config and allowed by the destination.
    schema_evolution: bool,
    errors: ErrorConfig,
    threshold: BufferThreshold,
    buffer: PartitionBuffer,
    /// Highest offset durably ingested by the destination.
    last_flushed_offset: Option<i64>,
    /// Highest offset accepted into a buffer.
    processed_offset: Option<i64>,
    state: ChannelState,
    /// Offset the upstream must deliver next after a recovery. Other offsets are skipped until it
    /// arrives.
    awaiting_offset: Option<i64>,
    /// Rewind not yet picked up by the host.
    pending_rewind: Option<i64>,
    /// Batch that failed the channel.
    retained: Option<PartitionBuffer>,
    reporters: Reporters,
    labels: Vec<(String, String)>,
}

impl<C, S> TopicPartitionChannel<C, S>
where
    C: IngestClient + Send + Sync,
    S: SchemaStore + Send + Sync,
{
    /// Opens the remote channel of the partition through the given pooled client.
    pub async fn open(
        tp: TopicPartition,
        table: String,
        client: Arc<C>,
        schema_store: Arc<S>,
        config: &SinkConfig,
        reporters: Reporters,
    ) -> Result<Self> {
        let channel_name = tp.channel_name();
        let handle = client
            .open_channel(OpenChannelRequest {
                channel_name: channel_name.clone(),
                table: table.clone(),
            })
            .await
            .map_err(|source| Error::Ingest {
                channel: channel_name.clone(),
                table: table.clone(),
                source,
            })?;

        let schema_evolution = if config.schema_evolution.enabled {
            schema_store
                .has_schema_evolution_permission(&table, config.schema_evolution.role.as_deref())
                .await
                .map_err(|e| Error::SchemaEvolution {
                    table: table.clone(),
                    message: format!("failed to check permission: {e}"),
                })?
        } else {
            false
        };
        if config.schema_evolution.enabled && !schema_evolution {
            warn!(
                channel = channel_name,
                table, "Schema evolution is enabled but not permitted on the table"
            );
        }

        info!(
            channel = channel_name,
            table,
            client = client.name(),
            schema_evolution,
            "Opened channel"
        );

        let labels = partition_labels(&tp, &table);
        Ok(Self {
            tp,
            channel_name,
            table,
            client,
            handle: Some(handle),
            schema_store,
            schema_evolution,
            errors: config.errors.clone(),
            threshold: config.buffer_threshold(),
            buffer: PartitionBuffer::new(),
            last_flushed_offset: None,
            processed_offset: None,
            state: ChannelState::Open,
            awaiting_offset: None,
            pending_rewind: None,
            retained: None,
            reporters,
            labels,
        })
    }

    /// Accepts a record into the buffer and flushes the buffer if a threshold is reached.
    /// Redelivered records, and records arriving while a rewind is awaited, are skipped.
    pub async fn insert(&mut self, record: Record) -> Result<Option<InsertOutcome>> {
        self.ensure_open()?;

        if let Some(expected) = self.awaiting_offset {
            if record.offset != expected {
                debug!(
                    channel = self.channel_name,
                    offset = record.offset,
                    expected,
                    "Skipping record while waiting for the rewind"
                );
                return Ok(None);
            }
            self.awaiting_offset = None;
        }

        if self
            .processed_offset
            .is_some_and(|processed| record.offset <= processed)
        {
            warn!(
                channel = self.channel_name,
                offset = record.offset,
                processed = self.processed_offset,
                "Skipping already processed record"
            );
            return Ok(None);
        }

        self.processed_offset = Some(record.offset);
        self.buffer.insert(record);
        self.update_buffered_gauge();

        if self.buffer.has_reached_threshold(&self.threshold) {
            return self.flush().await;
        }
        Ok(None)
    }

    /// Flushes the buffer if its oldest record is older than the time threshold.
    pub async fn flush_if_time_threshold_reached(&mut self) -> Result<Option<InsertOutcome>> {
        self.ensure_open()?;
        if self.buffer.has_reached_time_threshold(&self.threshold) {
            return self.flush().await;
        }
        Ok(None)
    }

    /// Flushes whatever is buffered. Returns `None` if there was nothing to flush.
    pub async fn flush(&mut self) -> Result<Option<InsertOutcome>> {
        self.ensure_open()?;
        if self.buffer.is_empty() {
            return Ok(None);
        }

        let batch = std::mem::take(&mut self.buffer);
        self.update_buffered_gauge();
        debug!(
            channel = self.channel_name,
            records = batch.len(),
            bytes = batch.bytes(),
            first_offset = batch.first_offset(),
            last_offset = batch.last_offset(),
            "Flushing buffer"
        );

        let start = Instant::now();
        let outcome = self.flush_batch(batch).await;
        sink_metrics()
            .flush_time
            .get_or_create(&self.labels)
            .observe(start.elapsed().as_micros() as f64);

        outcome.map(Some)
    }

    /// Closes the remote channel. The channel is `Closed` even if closing the remote one failed.
    pub async fn close(&mut self) -> Result<()> {
        self.state = ChannelState::Closed;
        let Some(mut handle) = self.handle.take() else {
            return Ok(());
        };
        info!(channel = self.channel_name, table = self.table, "Closing channel");
        handle.close().await.map_err(|source| Error::Ingest {
            channel: self.channel_name.clone(),
            table: self.table.clone(),
            source,
        })
    }

    pub fn topic_partition(&self) -> &TopicPartition {
        &self.tp
    }

    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn last_flushed_offset(&self) -> Option<i64> {
        self.last_flushed_offset
    }

    pub fn processed_offset(&self) -> Option<i64> {
        self.processed_offset
    }

    pub fn is_buffer_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn buffered_records(&self) -> usize {
        self.buffer.len()
    }

    pub fn schema_evolution_enabled(&self) -> bool {
        self.schema_evolution
    }

    /// Records of the batch that failed the channel, if it failed.
    pub fn retained_batch(&self) -> Option<&[Record]> {
        self.retained.as_ref().map(|batch| batch.records())
    }

    /// Offset the upstream must rewind to, if a recovery requested one since the last call.
    pub fn take_rewind_offset(&mut self) -> Option<i64> {
        self.pending_rewind.take()
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            ChannelState::Closed => Err(Error::ChannelClosed {
                channel: self.channel_name.clone(),
            }),
            ChannelState::Open | ChannelState::Reopening => Ok(()),
        }
    }

    async fn flush_batch(&mut self, batch: PartitionBuffer) -> Result<InsertOutcome> {
        let response = match self.insert_batch(&batch).await {
            Ok(response) => response,
            Err(e) => return self.handle_insert_failure(batch, e).await,
        };

        let schema_mismatch = response
            .errors()
            .iter()
            .any(|e| e.kind() == ErrorKind::SchemaMismatchRecoverable);
        if !(self.schema_evolution && schema_mismatch) {
            return self.complete(batch, response, false);
        }

        let change = SchemaChange::from_errors(batch.records(), response.errors());
        if let Err(e) = self.evolve_schema(&change).await {
            self.fail(batch);
            return Err(e);
        }

        // one resubmit per batch, whatever it refuses is final
        let response = match self.insert_batch(&batch).await {
            Ok(response) => response,
            Err(e) => return self.handle_insert_failure(batch, e).await,
        };
        self.complete(batch, response, true)
    }

    async fn insert_batch(
        &mut self,
        batch: &PartitionBuffer,
    ) -> std::result::Result<InsertValidationResponse, IngestError> {
        let handle = self
            .handle
            .as_mut()
            .ok_or_else(|| IngestError::ClosedChannel(self.channel_name.clone()))?;
        handle
            .insert_rows(batch.rows(), batch.first_offset(), batch.last_offset())
            .await
    }

    async fn handle_insert_failure(
        &mut self,
        batch: PartitionBuffer,
        cause: IngestError,
    ) -> Result<InsertOutcome> {
        match ErrorKind::classify(&cause) {
            ErrorKind::ChannelInvalidated => {
                warn!(
                    channel = self.channel_name,
                    table = self.table,
                    ?cause,
                    "Channel is invalidated, re-opening it"
                );
                self.state = ChannelState::Reopening;
                match self.reopen(batch.first_offset()).await {
                    Ok(committed_offset) => Ok(InsertOutcome::Reopened { committed_offset }),
                    Err(recovery) => {
                        error!(
                            channel = self.channel_name,
                            ?cause,
                            ?recovery,
                            "Failed to re-open invalidated channel"
                        );
                        self.fail(batch);
                        Err(Error::ChannelRecovery {
                            channel: self.channel_name.clone(),
                            cause,
                            recovery,
                        })
                    }
                }
            }
            kind => {
                error!(
                    channel = self.channel_name,
                    table = self.table,
                    %kind,
                    ?cause,
                    "Failed to insert rows"
                );
                self.fail(batch);
                Err(Error::Ingest {
                    channel: self.channel_name.clone(),
                    table: self.table.clone(),
                    source: cause,
                })
            }
        }
    }

    /// Re-opens the remote channel and adopts its committed offset. Returns that offset.
    /// The upstream is asked to rewind to the offset after it, or to `batch_start` when the
    /// destination committed nothing for the channel.
    async fn reopen(
        &mut self,
        batch_start: Option<i64>,
    ) -> std::result::Result<Option<i64>, IngestError> {
        self.handle = None;
        let mut handle = self
            .client
            .open_channel(OpenChannelRequest {
                channel_name: self.channel_name.clone(),
                table: self.table.clone(),
            })
            .await?;
        let committed = handle.latest_committed_offset_token().await?;

        self.handle = Some(handle);
        self.last_flushed_offset = committed;
        self.processed_offset = committed;
        // records past the committed offset will be delivered again after the rewind
        self.buffer = PartitionBuffer::new();
        self.update_buffered_gauge();
        let rewind_offset = committed.map(|offset| offset + 1).or(batch_start);
        self.awaiting_offset = rewind_offset;
        self.pending_rewind = rewind_offset;
        self.state = ChannelState::Open;

        sink_metrics()
            .channel_reopens
            .get_or_create(&self.labels)
            .inc();
        info!(
            channel = self.channel_name,
            committed_offset = committed,
            rewind_offset,
            "Re-opened channel"
        );
        Ok(committed)
    }

    async fn evolve_schema(&mut self, change: &SchemaChange) -> Result<()> {
        if change.is_empty() {
            return Ok(());
        }
        let to_error = |e: IngestError| Error::SchemaEvolution {
            table: self.table.clone(),
            message: e.to_string(),
        };

        if !change.columns_to_add.is_empty() {
            self.schema_store
                .append_columns(&self.table, &change.columns_to_add)
                .await
                .map_err(to_error)?;
        }
        if !change.columns_to_relax.is_empty() {
            self.schema_store
                .drop_not_null(&self.table, &change.columns_to_relax)
                .await
                .map_err(to_error)?;
        }

        sink_metrics()
            .schema_evolutions
            .get_or_create(&self.labels)
            .inc();
        info!(
            table = self.table,
            added = ?change.columns_to_add,
            relaxed = ?change.columns_to_relax,
            "Evolved table schema"
        );
        Ok(())
    }

    /// Applies the error tolerance to the refused rows of a completed insert call and advances the
    /// flushed offset past the accepted ones.
    fn complete(
        &mut self,
        batch: PartitionBuffer,
        response: InsertValidationResponse,
        retried: bool,
    ) -> Result<InsertOutcome> {
        if !response.has_errors() {
            let max_offset = batch.last_offset();
            self.advance(max_offset, batch.len());
            return Ok(InsertOutcome::Success { max_offset });
        }

        let errors = response.into_errors();
        match self.errors.tolerance {
            ErrorTolerance::None => Err(self.fail_validation(batch, &errors)),
            ErrorTolerance::All => {
                // a row may be reported more than once, the first error wins
                let mut refused: BTreeMap<usize, &InsertError> = BTreeMap::new();
                for e in &errors {
                    refused.entry(e.row_index).or_insert(e);
                }

                let dead_letter = self.errors.dead_letter_enabled();
                let mut accepted_max_offset = None;
                let mut accepted = 0;
                let mut rejected = Vec::with_capacity(refused.len());
                for (index, record) in batch.into_records().into_iter().enumerate() {
                    let Some(e) = refused.get(&index) else {
                        accepted += 1;
                        accepted_max_offset = accepted_max_offset.max(Some(record.offset));
                        continue;
                    };
                    let kind = if retried {
                        ErrorKind::ValidationError
                    } else {
                        e.kind()
                    };
                    if self.errors.log_enable {
                        warn!(
                            channel = self.channel_name,
                            offset = record.offset,
                            %kind,
                            reason = e.message,
                            "Record refused by destination"
                        );
                    }
                    if dead_letter {
                        self.reporters.error.report_record(&record, &e.message);
                        sink_metrics()
                            .dead_lettered_records
                            .get_or_create(&self.labels)
                            .inc();
                    }
                    rejected.push((record, kind));
                }

                warn!(
                    channel = self.channel_name,
                    refused = rejected.len(),
                    dead_letter,
                    "Skipped records refused by destination"
                );
                self.advance(accepted_max_offset, accepted);
                Ok(InsertOutcome::PartialErrors {
                    accepted_max_offset,
                    rejected,
                })
            }
        }
    }

    fn fail_validation(&mut self, batch: PartitionBuffer, errors: &[InsertError]) -> Error {
        let records = batch.records();
        let offsets: Vec<i64> = errors
            .iter()
            .filter_map(|e| records.get(e.row_index).map(|r| r.offset))
            .collect();
        let message = errors
            .iter()
            .map(|e| e.message.as_str())
            .collect::<Vec<_>>()
            .join("; ");

        let err = Error::Validation {
            topic: self.tp.topic.clone(),
            partition: self.tp.partition,
            table: self.table.clone(),
            offsets,
            message,
        };
        error!(channel = self.channel_name, ?err, "Records refused by destination");
        self.reporters.telemetry.report_fatal_error(&err.to_string());
        self.fail(batch);
        err
    }

    fn fail(&mut self, batch: PartitionBuffer) {
        self.state = ChannelState::Closed;
        self.retained = Some(batch);
    }

    fn advance(&mut self, max_offset: Option<i64>, count: usize) {
        if let Some(offset) = max_offset {
            self.last_flushed_offset = self.last_flushed_offset.max(Some(offset));
        }
        sink_metrics()
            .flushed_records
            .get_or_create(&self.labels)
            .inc_by(count as u64);
        debug!(
            channel = self.channel_name,
            records = count,
            last_flushed_offset = self.last_flushed_offset,
            "Flushed records"
        );
    }

    fn update_buffered_gauge(&self) {
        sink_metrics()
            .buffered_records
            .get_or_create(&self.labels)
            .set(self.buffer.len() as i64);
    }
}
