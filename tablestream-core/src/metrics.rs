//! Prometheus metrics of the sink, kept in a process wide registry and labelled by partition.

use std::iter;
use std::sync::OnceLock;

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

use crate::error::{Error, Result};
use crate::record::TopicPartition;

const REGISTRY_GLOBAL_PREFIX: &str = "tablestream";

const TOPIC_LABEL: &str = "topic";
const PARTITION_LABEL: &str = "partition";
const TABLE_LABEL: &str = "table";

const FLUSHED_RECORDS: &str = "flushed_records";
const DEAD_LETTERED_RECORDS: &str = "dead_lettered_records";
const CHANNEL_REOPENS: &str = "channel_reopens";
const SCHEMA_EVOLUTIONS: &str = "schema_evolutions";
const BUFFERED_RECORDS: &str = "buffered_records";
const FLUSH_TIME: &str = "flush_time";

/// The global register of all metrics.
#[derive(Default)]
struct GlobalRegistry {
    // metrics are registered once, a blocking mutex is fine
    registry: parking_lot::Mutex<Registry>,
}

impl GlobalRegistry {
    fn new() -> Self {
        GlobalRegistry {
            registry: parking_lot::Mutex::new(Registry::default()),
        }
    }
}

static GLOBAL_REGISTRY: OnceLock<GlobalRegistry> = OnceLock::new();

fn global_registry() -> &'static GlobalRegistry {
    GLOBAL_REGISTRY.get_or_init(GlobalRegistry::new)
}

/// Metric families of the sink. Each family is keyed by [partition_labels].
pub(crate) struct SinkMetrics {
    pub(crate) flushed_records: Family<Vec<(String, String)>, Counter>,
    pub(crate) dead_lettered_records: Family<Vec<(String, String)>, Counter>,
    pub(crate) channel_reopens: Family<Vec<(String, String)>, Counter>,
    pub(crate) schema_evolutions: Family<Vec<(String, String)>, Counter>,
    pub(crate) buffered_records: Family<Vec<(String, String)>, Gauge>,
    /// Flush latency in microseconds.
    pub(crate) flush_time: Family<Vec<(String, String)>, Histogram>,
}

impl SinkMetrics {
    fn new() -> Self {
        let metrics = Self {
            flushed_records: Family::<Vec<(String, String)>, Counter>::default(),
            dead_lettered_records: Family::<Vec<(String, String)>, Counter>::default(),
            channel_reopens: Family::<Vec<(String, String)>, Counter>::default(),
            schema_evolutions: Family::<Vec<(String, String)>, Counter>::default(),
            buffered_records: Family::<Vec<(String, String)>, Gauge>::default(),
            flush_time: Family::<Vec<(String, String)>, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets_range(100.0, 60000000.0 * 15.0, 10))
            }),
        };

        let mut registry = global_registry().registry.lock();
        let registry = registry.sub_registry_with_prefix(REGISTRY_GLOBAL_PREFIX);
        registry.register(
            FLUSHED_RECORDS,
            "A Counter to keep track of the records durably ingested into the destination",
            metrics.flushed_records.clone(),
        );
        registry.register(
            DEAD_LETTERED_RECORDS,
            "A Counter to keep track of the records refused by the destination and dead-lettered",
            metrics.dead_lettered_records.clone(),
        );
        registry.register(
            CHANNEL_REOPENS,
            "A Counter to keep track of the channels re-opened after being invalidated",
            metrics.channel_reopens.clone(),
        );
        registry.register(
            SCHEMA_EVOLUTIONS,
            "A Counter to keep track of the schema changes applied to destination tables",
            metrics.schema_evolutions.clone(),
        );
        registry.register(
            BUFFERED_RECORDS,
            "A Gauge to keep track of the records waiting in a partition buffer",
            metrics.buffered_records.clone(),
        );
        registry.register(
            FLUSH_TIME,
            "A Histogram to keep track of the time taken to flush a buffer in microseconds",
            metrics.flush_time.clone(),
        );
        metrics
    }
}

static SINK_METRICS: OnceLock<SinkMetrics> = OnceLock::new();

pub(crate) fn sink_metrics() -> &'static SinkMetrics {
    SINK_METRICS.get_or_init(SinkMetrics::new)
}

/// Labels identifying the partition a metric is about.
pub(crate) fn partition_labels(tp: &TopicPartition, table: &str) -> Vec<(String, String)> {
    vec![
        (TOPIC_LABEL.to_string(), tp.topic.clone()),
        (PARTITION_LABEL.to_string(), tp.partition.to_string()),
        (TABLE_LABEL.to_string(), table.to_string()),
    ]
}

/// Snapshot of every registered metric in the OpenMetrics text format.
pub fn metrics_text() -> Result<String> {
    // make sure the families are registered even before the first channel is created
    sink_metrics();
    let state = global_registry().registry.lock();
    let mut buffer = String::new();
    encode(&mut buffer, &state).map_err(|e| Error::Metrics(format!("Failed to encode: {e}")))?;
    Ok(buffer)
}

/// Exponential bucket distribution with range.
/// Creates `length` buckets, where the lowest bucket is `min` and the highest bucket is `max`.
/// The final +Inf bucket is not counted and not included in the returned iterator.
fn exponential_buckets_range(min: f64, max: f64, length: u16) -> impl Iterator<Item = f64> {
    let growth_factor = (max / min).powf(1.0 / (length as f64 - 1.0));

    iter::repeat(())
        .enumerate()
        .map(move |(i, _)| min * growth_factor.powf(i as f64))
        .take(length.into())
}
