//! Streaming sink that ingests partitioned records into a remote table store.
//!
//! Every upstream partition gets a [TopicPartitionChannel] that buffers its records and flushes
//! them to the remote channel when one of the count, byte or age thresholds is reached. An offset
//! is reported back as committable only once the destination has durably ingested it.
//!
//! A [SinkService] drives the channels of one sink task:
//! - records handed over by the host are routed to the channel of their partition.
//! - channels are opened on assignment and flushed and closed on revocation or stop.
//! - `precommit` answers which offsets may be committed upstream.
//!
//! The remote ingestion clients are pooled by a [ClientManager] shared by all the tasks of a
//! connector.

pub use self::error::{Error, ErrorKind, Result};

mod error;

pub mod buffer;
pub mod channel;
pub mod client;
pub mod config;
pub mod ingest;
pub mod metrics;
pub mod record;
pub mod report;
pub mod schema;
pub mod setup_tracing;
pub mod sink;

#[cfg(test)]
mod test_utils;

pub use crate::channel::{ChannelState, InsertOutcome, Reporters, TopicPartitionChannel};
pub use crate::client::ClientManager;
pub use crate::config::SinkConfig;
pub use crate::record::{Record, Row, TopicPartition};
pub use crate::sink::{SinkService, SinkServiceBuilder};
