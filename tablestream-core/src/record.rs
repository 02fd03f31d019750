use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

/// A row as handed to the remote ingestion service: column name to JSON value. Conversion from the
/// upstream wire format happens before the record reaches the sink.
pub type Row = Map<String, Value>;

/// Identity of an upstream partition. Each one is served by exactly one channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }

    /// Name of the remote channel that ingests this partition.
    pub fn channel_name(&self) -> String {
        format!("{}_{}", self.topic, self.partition)
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// Record read from the upstream stream, already converted into a row.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub topic: String,
    pub partition: i32,
    /// Offset relative to the partition.
    pub offset: i64,
    pub key: Option<Bytes>,
    pub value: Row,
    pub timestamp: Option<DateTime<Utc>>,
}

impl Record {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }

    /// Estimated in-memory size used for the byte threshold of the buffer.
    pub fn estimated_size(&self) -> usize {
        let key_len = self.key.as_ref().map_or(0, |k| k.len());
        // serializing a Map of JSON values cannot fail, the fallback is only a formality
        let value_len = serde_json::to_vec(&self.value).map_or(0, |v| v.len());
        key_len + value_len
    }
}
