//! In-memory ingestion service for tests.
//!
//! [InMemoryService] keeps tables, channels and committed offsets in memory and hands out the
//! factory, clients and schema store the sink talks to. Failures are forced through its
//! [IngestErrorInjector], calls are counted so tests can assert on the interaction.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde_json::Value;

use crate::ingest::{
    IngestChannel, IngestClient, IngestClientFactory, IngestError, InsertError,
    InsertValidationResponse, OpenChannelRequest, SchemaStore,
};
use crate::record::{Record, Row};
use crate::report::{ErrorReporter, TelemetryReporter};
use crate::schema::ColumnSpec;

/// A row holding this value in any column is refused as invalid.
pub(crate) const INVALID_VALUE: &str = "<invalid>";

pub(crate) fn record(topic: &str, partition: i32, offset: i64, value: Value) -> Record {
    let value: Row = match value {
        Value::Object(map) => map,
        other => panic!("a row must be a JSON object, got {other}"),
    };
    Record {
        topic: topic.to_string(),
        partition,
        offset,
        key: None,
        value,
        timestamp: None,
    }
}

/// Errors to return from the next calls, per operation.
#[derive(Debug, Default)]
pub(crate) struct IngestErrorInjector {
    client_creation: Mutex<VecDeque<Result<(), IngestError>>>,
    open: Mutex<VecDeque<IngestError>>,
    insert: Mutex<VecDeque<IngestError>>,
    offset_fetch: Mutex<VecDeque<IngestError>>,
    schema: Mutex<VecDeque<IngestError>>,
}

impl IngestErrorInjector {
    fn next_client_creation(&self) -> Result<(), IngestError> {
        self.client_creation.lock().pop_front().unwrap_or(Ok(()))
    }

    fn next(queue: &Mutex<VecDeque<IngestError>>) -> Result<(), IngestError> {
        match queue.lock().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Default)]
struct Table {
    /// `None` accepts any column.
    columns: Option<BTreeSet<String>>,
    not_null: BTreeSet<String>,
    rows: Vec<Row>,
    appended: Vec<ColumnSpec>,
    relaxed: Vec<String>,
}

impl Table {
    fn validate(&self, row_index: usize, row: &Row) -> Option<InsertError> {
        let extra: Vec<String> = match &self.columns {
            Some(columns) => row
                .keys()
                .filter(|key| !columns.contains(*key))
                .cloned()
                .collect(),
            None => Vec::new(),
        };
        let missing: Vec<String> = self
            .not_null
            .iter()
            .filter(|column| row.get(*column).is_none_or(Value::is_null))
            .cloned()
            .collect();
        let invalid = row
            .values()
            .any(|value| value.as_str() == Some(INVALID_VALUE));

        if extra.is_empty() && missing.is_empty() && !invalid {
            return None;
        }
        let message = if invalid {
            "The given row cannot be converted to the internal format"
        } else {
            "The given row does not match the table schema"
        };
        Some(
            InsertError::new(row_index, message)
                .with_extra_columns(extra)
                .with_missing_not_null_columns(missing),
        )
    }
}

#[derive(Debug, Default)]
struct State {
    tables: HashMap<String, Table>,
    /// Latest generation per channel name, a handle of an older generation is invalid.
    generations: HashMap<String, u64>,
    committed: HashMap<String, Option<i64>>,
    created_clients: Vec<String>,
    closed_clients: Vec<String>,
    closed_channels: Vec<String>,
}

#[derive(Debug, Default)]
struct Counters {
    open_channel: AtomicUsize,
    insert: AtomicUsize,
    offset_fetch: AtomicUsize,
    permission_checks: AtomicUsize,
    append: AtomicUsize,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<State>,
    counters: Counters,
    injector: IngestErrorInjector,
    /// Schema changes are acknowledged but never applied to the tables.
    detached_schema: AtomicBool,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct InMemoryService {
    inner: Arc<Inner>,
}

impl InMemoryService {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Creates a table with a fixed set of columns.
    pub(crate) fn create_table(&self, name: &str, columns: &[&str], not_null: &[&str]) {
        let table = Table {
            columns: Some(columns.iter().map(|c| c.to_string()).collect()),
            not_null: not_null.iter().map(|c| c.to_string()).collect(),
            ..Default::default()
        };
        self.inner
            .state
            .lock()
            .tables
            .insert(name.to_string(), table);
    }

    pub(crate) fn factory(&self) -> InMemoryFactory {
        InMemoryFactory {
            service: self.clone(),
        }
    }

    pub(crate) fn client(&self, name: &str) -> InMemoryClient {
        self.inner
            .state
            .lock()
            .created_clients
            .push(name.to_string());
        InMemoryClient {
            name: name.to_string(),
            service: self.clone(),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn schema_store(&self, permitted: bool) -> InMemorySchemaStore {
        InMemorySchemaStore {
            service: self.clone(),
            permitted,
        }
    }

    pub(crate) fn script_client_creation(&self, outcomes: Vec<Result<(), IngestError>>) {
        self.inner
            .injector
            .client_creation
            .lock()
            .extend(outcomes);
    }

    pub(crate) fn inject_open_error(&self, err: IngestError) {
        self.inner.injector.open.lock().push_back(err);
    }

    pub(crate) fn inject_insert_error(&self, err: IngestError) {
        self.inner.injector.insert.lock().push_back(err);
    }

    pub(crate) fn inject_offset_fetch_error(&self, err: IngestError) {
        self.inner.injector.offset_fetch.lock().push_back(err);
    }

    pub(crate) fn inject_schema_error(&self, err: IngestError) {
        self.inner.injector.schema.lock().push_back(err);
    }

    /// Makes the schema store report success for changes it does not apply.
    pub(crate) fn detach_schema(&self) {
        self.inner.detached_schema.store(true, Ordering::Relaxed);
    }

    /// Simulates another writer opening the channel, which invalidates the existing handle.
    pub(crate) fn invalidate_channel(&self, channel_name: &str) {
        *self
            .inner
            .state
            .lock()
            .generations
            .entry(channel_name.to_string())
            .or_default() += 1;
    }

    pub(crate) fn rows(&self, table: &str) -> Vec<Row> {
        self.inner
            .state
            .lock()
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub(crate) fn committed_offset(&self, channel_name: &str) -> Option<i64> {
        self.inner
            .state
            .lock()
            .committed
            .get(channel_name)
            .copied()
            .flatten()
    }

    pub(crate) fn appended_columns(&self, table: &str) -> Vec<ColumnSpec> {
        self.inner
            .state
            .lock()
            .tables
            .get(table)
            .map(|t| t.appended.clone())
            .unwrap_or_default()
    }

    pub(crate) fn relaxed_columns(&self, table: &str) -> Vec<String> {
        self.inner
            .state
            .lock()
            .tables
            .get(table)
            .map(|t| t.relaxed.clone())
            .unwrap_or_default()
    }

    pub(crate) fn created_clients(&self) -> Vec<String> {
        self.inner.state.lock().created_clients.clone()
    }

    pub(crate) fn closed_clients(&self) -> Vec<String> {
        self.inner.state.lock().closed_clients.clone()
    }

    pub(crate) fn closed_channels(&self) -> Vec<String> {
        self.inner.state.lock().closed_channels.clone()
    }

    pub(crate) fn open_channel_calls(&self) -> usize {
        self.inner.counters.open_channel.load(Ordering::Relaxed)
    }

    pub(crate) fn insert_calls(&self) -> usize {
        self.inner.counters.insert.load(Ordering::Relaxed)
    }

    pub(crate) fn offset_fetch_calls(&self) -> usize {
        self.inner.counters.offset_fetch.load(Ordering::Relaxed)
    }

    pub(crate) fn permission_checks(&self) -> usize {
        self.inner.counters.permission_checks.load(Ordering::Relaxed)
    }

    pub(crate) fn append_calls(&self) -> usize {
        self.inner.counters.append.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct InMemoryFactory {
    service: InMemoryService,
}

impl IngestClientFactory for InMemoryFactory {
    type Client = InMemoryClient;

    async fn create_client(&self, name: &str) -> Result<Self::Client, IngestError> {
        self.service.inner.injector.next_client_creation()?;
        Ok(self.service.client(name))
    }
}

#[derive(Debug)]
pub(crate) struct InMemoryClient {
    name: String,
    service: InMemoryService,
    closed: AtomicBool,
}

impl IngestClient for InMemoryClient {
    type Channel = InMemoryChannel;

    fn name(&self) -> &str {
        &self.name
    }

    async fn open_channel(
        &self,
        request: OpenChannelRequest,
    ) -> Result<Self::Channel, IngestError> {
        let inner = &self.service.inner;
        inner.counters.open_channel.fetch_add(1, Ordering::Relaxed);
        if self.is_closed() {
            return Err(IngestError::ClientClosed);
        }
        IngestErrorInjector::next(&inner.injector.open)?;

        let mut state = inner.state.lock();
        let generation = state
            .generations
            .entry(request.channel_name.clone())
            .or_default();
        *generation += 1;
        Ok(InMemoryChannel {
            name: request.channel_name,
            table: request.table,
            generation: *generation,
            service: self.service.clone(),
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    async fn close(&self) -> Result<(), IngestError> {
        self.closed.store(true, Ordering::Relaxed);
        self.service
            .inner
            .state
            .lock()
            .closed_clients
            .push(self.name.clone());
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) struct InMemoryChannel {
    name: String,
    table: String,
    generation: u64,
    service: InMemoryService,
}

impl IngestChannel for InMemoryChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn insert_rows(
        &mut self,
        rows: Vec<Row>,
        _start_offset_token: Option<i64>,
        end_offset_token: Option<i64>,
    ) -> Result<InsertValidationResponse, IngestError> {
        let inner = &self.service.inner;
        inner.counters.insert.fetch_add(1, Ordering::Relaxed);
        IngestErrorInjector::next(&inner.injector.insert)?;

        let mut state = inner.state.lock();
        if state.generations.get(&self.name) != Some(&self.generation) {
            return Err(IngestError::InvalidChannel(format!(
                "channel {} was opened by another writer",
                self.name
            )));
        }

        let table = state.tables.entry(self.table.clone()).or_default();
        let mut response = InsertValidationResponse::new();
        for (index, row) in rows.into_iter().enumerate() {
            match table.validate(index, &row) {
                Some(err) => response.add_error(err),
                None => table.rows.push(row),
            }
        }
        state.committed.insert(self.name.clone(), end_offset_token);
        Ok(response)
    }

    async fn latest_committed_offset_token(&mut self) -> Result<Option<i64>, IngestError> {
        let inner = &self.service.inner;
        inner.counters.offset_fetch.fetch_add(1, Ordering::Relaxed);
        IngestErrorInjector::next(&inner.injector.offset_fetch)?;
        Ok(inner
            .state
            .lock()
            .committed
            .get(&self.name)
            .copied()
            .flatten())
    }

    async fn close(&mut self) -> Result<(), IngestError> {
        self.service
            .inner
            .state
            .lock()
            .closed_channels
            .push(self.name.clone());
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub(crate) struct InMemorySchemaStore {
    service: InMemoryService,
    permitted: bool,
}

impl SchemaStore for InMemorySchemaStore {
    async fn has_schema_evolution_permission(
        &self,
        _table: &str,
        _role: Option<&str>,
    ) -> Result<bool, IngestError> {
        self.service
            .inner
            .counters
            .permission_checks
            .fetch_add(1, Ordering::Relaxed);
        Ok(self.permitted)
    }

    async fn append_columns(&self, table: &str, columns: &[ColumnSpec]) -> Result<(), IngestError> {
        let inner = &self.service.inner;
        inner.counters.append.fetch_add(1, Ordering::Relaxed);
        IngestErrorInjector::next(&inner.injector.schema)?;
        if inner.detached_schema.load(Ordering::Relaxed) {
            return Ok(());
        }

        let mut state = inner.state.lock();
        let table = state.tables.entry(table.to_string()).or_default();
        if let Some(existing) = table.columns.as_mut() {
            existing.extend(columns.iter().map(|c| c.name.clone()));
        }
        table.appended.extend_from_slice(columns);
        Ok(())
    }

    async fn drop_not_null(&self, table: &str, columns: &[String]) -> Result<(), IngestError> {
        let inner = &self.service.inner;
        IngestErrorInjector::next(&inner.injector.schema)?;
        if inner.detached_schema.load(Ordering::Relaxed) {
            return Ok(());
        }

        let mut state = inner.state.lock();
        let table = state.tables.entry(table.to_string()).or_default();
        for column in columns {
            table.not_null.remove(column);
        }
        table.relaxed.extend_from_slice(columns);
        Ok(())
    }
}

/// Records everything sent to the dead-letter target.
#[derive(Debug, Default)]
pub(crate) struct RecordingErrorReporter {
    records: Mutex<Vec<(Record, String)>>,
}

impl RecordingErrorReporter {
    pub(crate) fn offsets(&self) -> Vec<i64> {
        self.records.lock().iter().map(|(r, _)| r.offset).collect()
    }

    pub(crate) fn reasons(&self) -> Vec<String> {
        self.records
            .lock()
            .iter()
            .map(|(_, reason)| reason.clone())
            .collect()
    }
}

impl ErrorReporter for RecordingErrorReporter {
    fn report_record(&self, record: &Record, reason: &str) {
        self.records
            .lock()
            .push((record.clone(), reason.to_string()));
    }
}

#[derive(Debug, Default)]
pub(crate) struct RecordingTelemetry {
    errors: Mutex<Vec<String>>,
}

impl RecordingTelemetry {
    pub(crate) fn errors(&self) -> Vec<String> {
        self.errors.lock().clone()
    }
}

impl TelemetryReporter for RecordingTelemetry {
    fn report_fatal_error(&self, message: &str) {
        self.errors.lock().push(message.to_string());
    }
}
