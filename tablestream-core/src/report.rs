//! Reporting hooks for records and failures the sink cannot ingest. Delivery of dead-lettered
//! records and the content of telemetry belong to the host; the sink only decides what is reported.

use tracing::{error, warn};

use crate::record::Record;

/// Receives records that were refused by the destination and must go to the dead-letter target.
pub trait ErrorReporter: Send + Sync {
    fn report_record(&self, record: &Record, reason: &str);
}

/// Receives fatal ingestion failures.
pub trait TelemetryReporter: Send + Sync {
    fn report_fatal_error(&self, message: &str);
}

/// Default [ErrorReporter], only logs what would have been dead-lettered.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogErrorReporter;

impl ErrorReporter for LogErrorReporter {
    fn report_record(&self, record: &Record, reason: &str) {
        warn!(
            topic = record.topic,
            partition = record.partition,
            offset = record.offset,
            reason,
            "Record refused by destination"
        );
    }
}

/// Default [TelemetryReporter], logs the failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTelemetryReporter;

impl TelemetryReporter for LogTelemetryReporter {
    fn report_fatal_error(&self, message: &str) {
        error!(message, "Fatal ingestion error");
    }
}
