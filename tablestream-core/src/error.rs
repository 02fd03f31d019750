use thiserror::Error;

use crate::ingest::IngestError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Config Error - {0}")]
    Config(String),

    #[error("Client Pool Error - {0}")]
    ClientPool(String),

    #[error("Channel {channel} is closed and accepts no more work")]
    ChannelClosed { channel: String },

    #[error("Ingest Error - channel {channel}, table {table}: {source}")]
    Ingest {
        channel: String,
        table: String,
        #[source]
        source: IngestError,
    },

    /// The channel was invalidated and re-opening it (or re-fetching its committed offset) failed
    /// as well. `cause` is the insert failure that triggered the recovery.
    #[error("Channel Recovery Error - channel {channel}: insert failed with '{cause}', recovery failed with '{recovery}'")]
    ChannelRecovery {
        channel: String,
        cause: IngestError,
        recovery: IngestError,
    },

    #[error(
        "Validation Error - topic {topic}, partition {partition}, table {table}, offsets {offsets:?}: {message}"
    )]
    Validation {
        topic: String,
        partition: i32,
        table: String,
        offsets: Vec<i64>,
        message: String,
    },

    #[error("Schema Evolution Error - table {table}: {message}")]
    SchemaEvolution { table: String, message: String },

    #[error("Metrics Error - {0}")]
    Metrics(String),

    #[error("Sink service is stopped")]
    Stopped,
}

impl Error {
    /// Classification of the flush failure behind this error, if it is one.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Error::Ingest { source, .. } => Some(ErrorKind::classify(source)),
            Error::ChannelRecovery { .. } => Some(ErrorKind::ChannelInvalidated),
            Error::Validation { .. } => Some(ErrorKind::ValidationError),
            // the evolution meant to recover from the mismatch failed
            Error::SchemaEvolution { .. } => Some(ErrorKind::Unclassified),
            Error::Config(_)
            | Error::ClientPool(_)
            | Error::ChannelClosed { .. }
            | Error::Metrics(_)
            | Error::Stopped => None,
        }
    }
}

/// Classification of a flush failure. Recovery in the channel is driven entirely by this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The remote channel handle is stale; the channel re-opens it and adopts the remote offset.
    ChannelInvalidated,
    /// The rows carry columns the table lacks (or omit non-nullable ones) and the table may evolve.
    SchemaMismatchRecoverable,
    /// The remote rejected specific rows and nothing can be done about it here.
    ValidationError,
    /// Anything else. Always fatal.
    Unclassified,
}

impl ErrorKind {
    /// Classifies a failed remote call.
    pub fn classify(err: &IngestError) -> Self {
        match err {
            IngestError::InvalidChannel(_) | IngestError::ClosedChannel(_) => {
                ErrorKind::ChannelInvalidated
            }
            IngestError::ClientClosed
            | IngestError::Connection(_)
            | IngestError::Internal(_)
            | IngestError::Other(_) => ErrorKind::Unclassified,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::ChannelInvalidated => write!(f, "channelInvalidated"),
            ErrorKind::SchemaMismatchRecoverable => write!(f, "schemaMismatchRecoverable"),
            ErrorKind::ValidationError => write!(f, "validationError"),
            ErrorKind::Unclassified => write!(f, "unclassified"),
        }
    }
}
