//! Configuration of the sink, read from a base64 encoded JSON object in the environment.

use std::collections::HashMap;
use std::time::Duration;

use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use serde::Deserialize;

use crate::buffer::BufferThreshold;
use crate::error::{Error, Result};

/// Env var carrying the base64 encoded JSON sink configuration.
pub const ENV_SINK_OBJECT: &str = "TABLESTREAM_SINK_OBJECT";

const DEFAULT_BUFFER_COUNT_RECORDS: usize = 10_000;
const DEFAULT_BUFFER_BYTE_SIZE: usize = 20 * 1024 * 1024;
const DEFAULT_BUFFER_FLUSH_TIME_SECS: u64 = 10;
const DEFAULT_CLIENT_NAME_PREFIX: &str = "TS_CLIENT";
const DEFAULT_CONNECTOR_NAME: &str = "tablestream";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SinkConfig {
    pub connector_name: String,
    pub buffer: BufferConfig,
    pub errors: ErrorConfig,
    pub schema_evolution: SchemaEvolutionConfig,
    pub client_pool: ClientPoolConfig,
    /// Destination table per topic. Topics not listed go to a table named after the topic.
    pub topic_to_table: HashMap<String, String>,
}

impl Default for SinkConfig {
    fn default() -> Self {
        SinkConfig {
            connector_name: DEFAULT_CONNECTOR_NAME.to_string(),
            buffer: BufferConfig::default(),
            errors: ErrorConfig::default(),
            schema_evolution: SchemaEvolutionConfig::default(),
            client_pool: ClientPoolConfig::default(),
            topic_to_table: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BufferConfig {
    pub count_records: usize,
    pub byte_size: usize,
    pub flush_time_seconds: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        BufferConfig {
            count_records: DEFAULT_BUFFER_COUNT_RECORDS,
            byte_size: DEFAULT_BUFFER_BYTE_SIZE,
            flush_time_seconds: DEFAULT_BUFFER_FLUSH_TIME_SECS,
        }
    }
}

impl From<BufferConfig> for BufferThreshold {
    fn from(value: BufferConfig) -> Self {
        BufferThreshold::new(
            value.count_records,
            value.byte_size,
            Duration::from_secs(value.flush_time_seconds),
        )
    }
}

/// What to do with rows the destination refuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorTolerance {
    /// A refused row fails the channel.
    #[default]
    #[serde(alias = "NONE")]
    None,
    /// Refused rows are skipped (and dead-lettered when a dead-letter topic is set).
    #[serde(alias = "ALL")]
    All,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ErrorConfig {
    pub tolerance: ErrorTolerance,
    pub dead_letter_queue_topic: Option<String>,
    /// Log every refused row, not only the count.
    pub log_enable: bool,
}

impl ErrorConfig {
    pub fn dead_letter_enabled(&self) -> bool {
        self.tolerance == ErrorTolerance::All
            && self
                .dead_letter_queue_topic
                .as_deref()
                .is_some_and(|topic| !topic.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchemaEvolutionConfig {
    pub enabled: bool,
    /// Role whose privileges are checked before altering a table.
    pub role: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientPoolConfig {
    pub size: usize,
    /// Number of sink tasks sharing the pool.
    pub task_count: usize,
    pub name_prefix: String,
}

impl Default for ClientPoolConfig {
    fn default() -> Self {
        ClientPoolConfig {
            size: 1,
            task_count: 1,
            name_prefix: DEFAULT_CLIENT_NAME_PREFIX.to_string(),
        }
    }
}

impl SinkConfig {
    /// Loads the configuration from the given environment, falling back to the defaults when
    /// [ENV_SINK_OBJECT] is not set.
    pub fn load(
        env_vars: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Result<Self> {
        let env_vars: HashMap<String, String> = env_vars
            .into_iter()
            .map(|(key, val)| (key.into(), val.into()))
            .filter(|(key, _val)| key == ENV_SINK_OBJECT)
            .collect();

        let config = match env_vars.get(ENV_SINK_OBJECT) {
            Some(encoded) => {
                let decoded = BASE64_STANDARD.decode(encoded.as_bytes()).map_err(|e| {
                    Error::Config(format!("Failed to decode sink config: {e:?}"))
                })?;
                serde_json::from_slice(&decoded)
                    .map_err(|e| Error::Config(format!("Failed to parse sink config: {e:?}")))?
            }
            None => SinkConfig::default(),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.connector_name.trim().is_empty() {
            return Err(Error::Config("connector name must not be empty".to_string()));
        }
        if self.buffer.count_records == 0 {
            return Err(Error::Config(
                "buffer count threshold must be greater than 0".to_string(),
            ));
        }
        if self.buffer.byte_size == 0 {
            return Err(Error::Config(
                "buffer byte size threshold must be greater than 0".to_string(),
            ));
        }
        if self.buffer.flush_time_seconds < 1 {
            return Err(Error::Config(
                "buffer flush time must be at least 1 second".to_string(),
            ));
        }
        if self.client_pool.task_count == 0 {
            return Err(Error::Config("task count must be greater than 0".to_string()));
        }
        if self.client_pool.size == 0 || self.client_pool.size > self.client_pool.task_count {
            return Err(Error::Config(format!(
                "client pool size must be between 1 and the task count ({}), got {}",
                self.client_pool.task_count, self.client_pool.size
            )));
        }
        Ok(())
    }

    pub fn buffer_threshold(&self) -> BufferThreshold {
        self.buffer.into()
    }

    /// Destination table of the given topic.
    pub fn table_for(&self, topic: &str) -> String {
        self.topic_to_table
            .get(topic)
            .cloned()
            .unwrap_or_else(|| topic.to_string())
    }
}
