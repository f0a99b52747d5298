//! Pipeline metrics recorded through the `metrics` facade.
//!
//! Nothing is exported unless `init_metrics` installs the Prometheus recorder;
//! without it every call below is a no-op.

use std::fmt;
use std::net::SocketAddr;
use tracing::{info, warn};

/// Enum representing all metric names used in the system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricName {
    // Fetch
    FetchDuration,
    RawRecords,

    // Transform
    RecordsRejected,
    RecordsDeduplicated,

    // Load
    Batches,
    BatchDuration,
    RowsWritten,

    // Run
    PipelineRuns,
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MetricName::FetchDuration => "eod_fetch_duration_seconds",
            MetricName::RawRecords => "eod_raw_records_total",
            MetricName::RecordsRejected => "eod_records_rejected_total",
            MetricName::RecordsDeduplicated => "eod_records_deduplicated_total",
            MetricName::Batches => "eod_batches_total",
            MetricName::BatchDuration => "eod_batch_duration_seconds",
            MetricName::RowsWritten => "eod_rows_written_total",
            MetricName::PipelineRuns => "eod_pipeline_runs_total",
        };
        write!(f, "{name}")
    }
}

/// Install the Prometheus exporter when `EOD_METRICS_PORT` is set.
pub fn init_metrics() {
    let Some(port) = std::env::var("EOD_METRICS_PORT")
        .ok()
        .and_then(|s| s.parse::<u16>().ok())
    else {
        return;
    };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(addr);
    match builder.install() {
        Ok(()) => info!("Prometheus exporter listening on http://{}/metrics", addr),
        Err(e) => warn!("Prometheus exporter install failed: {}", e),
    }
}

pub mod fetch {
    use super::MetricName;

    pub fn duration(secs: f64) {
        ::metrics::histogram!(MetricName::FetchDuration.to_string()).record(secs);
    }

    pub fn raw_records(count: usize) {
        ::metrics::counter!(MetricName::RawRecords.to_string()).increment(count as u64);
    }
}

pub mod transform {
    use super::MetricName;

    pub fn rejected(count: usize) {
        ::metrics::counter!(MetricName::RecordsRejected.to_string()).increment(count as u64);
    }

    pub fn deduplicated(count: usize) {
        ::metrics::counter!(MetricName::RecordsDeduplicated.to_string()).increment(count as u64);
    }
}

pub mod load {
    use super::MetricName;

    pub fn batch_succeeded(rows: usize) {
        ::metrics::counter!(MetricName::Batches.to_string(), "outcome" => "success").increment(1);
        ::metrics::counter!(MetricName::RowsWritten.to_string()).increment(rows as u64);
    }

    pub fn batch_failed(kind: &'static str) {
        ::metrics::counter!(MetricName::Batches.to_string(), "outcome" => "failure", "kind" => kind).increment(1);
    }

    pub fn batch_duration(secs: f64) {
        ::metrics::histogram!(MetricName::BatchDuration.to_string()).record(secs);
    }
}

pub mod run {
    use super::MetricName;

    pub fn finished(outcome: &'static str) {
        ::metrics::counter!(MetricName::PipelineRuns.to_string(), "outcome" => outcome).increment(1);
    }
}
