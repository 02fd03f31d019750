//! Interfaces of the remote ingestion service and of the destination's schema management. The
//! sink only consumes these; the concrete clients (and how they connect and authenticate) live
//! outside this crate.

use thiserror::Error;

use crate::error::ErrorKind;
use crate::record::Row;
use crate::schema::ColumnSpec;

/// Failure of a call to the remote ingestion service.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IngestError {
    /// The channel handle was invalidated by the service (e.g. another writer opened it).
    #[error("Invalid Channel - {0}")]
    InvalidChannel(String),

    #[error("Closed Channel - {0}")]
    ClosedChannel(String),

    #[error("Client is closed")]
    ClientClosed,

    #[error("Connection Error - {0}")]
    Connection(String),

    #[error("Internal Error - {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

/// Request to open (or re-open) the remote channel of a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenChannelRequest {
    pub channel_name: String,
    pub table: String,
}

/// A row the service refused, identified by its position in the submitted batch.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InsertError {
    pub row_index: usize,
    pub message: String,
    /// Columns present in the row but unknown to the table.
    pub extra_col_names: Vec<String>,
    /// Non-nullable columns of the table the row has no value for.
    pub missing_not_null_col_names: Vec<String>,
}

impl InsertError {
    pub fn new(row_index: usize, message: impl Into<String>) -> Self {
        Self {
            row_index,
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_extra_columns(mut self, columns: Vec<String>) -> Self {
        self.extra_col_names = columns;
        self
    }

    pub fn with_missing_not_null_columns(mut self, columns: Vec<String>) -> Self {
        self.missing_not_null_col_names = columns;
        self
    }

    /// A row error is recoverable by schema evolution only if it is about the column set.
    pub fn kind(&self) -> ErrorKind {
        if self.extra_col_names.is_empty() && self.missing_not_null_col_names.is_empty() {
            ErrorKind::ValidationError
        } else {
            ErrorKind::SchemaMismatchRecoverable
        }
    }
}

/// Outcome of a successful `insert_rows` call, which may still have refused individual rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsertValidationResponse {
    errors: Vec<InsertError>,
}

impl InsertValidationResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, error: InsertError) {
        self.errors.push(error);
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn errors(&self) -> &[InsertError] {
        &self.errors
    }

    pub fn into_errors(self) -> Vec<InsertError> {
        self.errors
    }
}

impl From<Vec<InsertError>> for InsertValidationResponse {
    fn from(errors: Vec<InsertError>) -> Self {
        Self { errors }
    }
}

/// Handle to a remote channel. Owned by exactly one partition channel, never shared.
#[trait_variant::make(IngestChannel: Send)]
#[allow(dead_code)]
pub trait LocalIngestChannel {
    /// Fully qualified name of the channel.
    fn name(&self) -> &str;

    /// Inserts the rows; the offset tokens are the first and last upstream offsets of the batch.
    async fn insert_rows(
        &mut self,
        rows: Vec<Row>,
        start_offset_token: Option<i64>,
        end_offset_token: Option<i64>,
    ) -> Result<InsertValidationResponse, IngestError>;

    /// Last offset token the service durably committed for this channel, if any.
    async fn latest_committed_offset_token(&mut self) -> Result<Option<i64>, IngestError>;

    async fn close(&mut self) -> Result<(), IngestError>;
}

/// A connection to the ingestion service. Pooled and shared by many partitions and tasks, hence
/// implementations are expected to be `Sync` and to keep no per-caller state.
#[trait_variant::make(IngestClient: Send)]
#[allow(dead_code)]
pub trait LocalIngestClient {
    type Channel: IngestChannel + 'static;

    fn name(&self) -> &str;

    async fn open_channel(&self, request: OpenChannelRequest)
    -> Result<Self::Channel, IngestError>;

    fn is_closed(&self) -> bool;

    async fn close(&self) -> Result<(), IngestError>;
}

/// Creates the pooled clients. Hides connection bootstrapping and authentication.
#[trait_variant::make(IngestClientFactory: Send)]
#[allow(dead_code)]
pub trait LocalIngestClientFactory {
    type Client: IngestClient + Send + Sync + 'static;

    async fn create_client(&self, name: &str) -> Result<Self::Client, IngestError>;
}

/// Schema management of the destination, used for schema evolution.
#[trait_variant::make(SchemaStore: Send)]
#[allow(dead_code)]
pub trait LocalSchemaStore {
    async fn has_schema_evolution_permission(
        &self,
        table: &str,
        role: Option<&str>,
    ) -> Result<bool, IngestError>;

    async fn append_columns(&self, table: &str, columns: &[ColumnSpec])
    -> Result<(), IngestError>;

    /// Makes the given columns nullable.
    async fn drop_not_null(&self, table: &str, columns: &[String]) -> Result<(), IngestError>;
}

/// [SchemaStore] of a destination that never evolves.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSchemaEvolution;

impl SchemaStore for NoSchemaEvolution {
    async fn has_schema_evolution_permission(
        &self,
        _table: &str,
        _role: Option<&str>,
    ) -> Result<bool, IngestError> {
        Ok(false)
    }

    async fn append_columns(
        &self,
        table: &str,
        _columns: &[ColumnSpec],
    ) -> Result<(), IngestError> {
        Err(IngestError::Other(format!(
            "schema evolution is not available for table {table}"
        )))
    }

    async fn drop_not_null(&self, table: &str, _columns: &[String]) -> Result<(), IngestError> {
        Err(IngestError::Other(format!(
            "schema evolution is not available for table {table}"
        )))
    }
}
