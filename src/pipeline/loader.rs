use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tracing::{debug, instrument, warn};

use crate::error::{IngestError, Result};
use crate::metrics;
use crate::pipeline::storage::{PriceStore, StoreError};
use crate::types::Batch;

/// Outcome of applying one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchResult {
    pub index: usize,
    pub records: usize,
    pub rows_written: usize,
    pub error: Option<StoreError>,
}

impl BatchResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn failure(&self) -> Option<BatchFailure> {
        self.error.as_ref().map(|err| BatchFailure {
            index: self.index,
            records: self.records,
            kind: err.kind().to_string(),
            message: err.to_string(),
        })
    }

    /// The failure as a pipeline error, if any.
    pub fn to_error(&self) -> Option<IngestError> {
        self.error.clone().map(|source| IngestError::BatchWrite {
            batch: self.index,
            source,
        })
    }
}

/// Report-friendly view of a failed batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchFailure {
    pub index: usize,
    pub records: usize,
    pub kind: String,
    pub message: String,
}

/// Writes batches to a store as atomic upserts keyed on the identity key.
///
/// The loader never retries and never drops records: a failed batch is
/// reported back with its error and left to the caller.
pub struct UpsertLoader {
    store: Arc<dyn PriceStore>,
    timeout: Duration,
    schema: OnceCell<()>,
}

impl UpsertLoader {
    pub fn new(store: Arc<dyn PriceStore>, timeout: Duration) -> Self {
        Self {
            store,
            timeout,
            schema: OnceCell::new(),
        }
    }

    /// Create the destination table if needed. Runs against the store once per loader.
    pub async fn ensure_schema(&self) -> Result<()> {
        self.schema
            .get_or_try_init(|| async {
                match tokio::time::timeout(self.timeout, self.store.ensure_schema()).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(IngestError::Schema(e)),
                    Err(_) => Err(IngestError::Schema(StoreError::Timeout(self.timeout))),
                }
            })
            .await?;
        Ok(())
    }

    #[instrument(skip(self, batch), fields(records = batch.records.len()))]
    pub async fn apply(&self, index: usize, batch: &Batch) -> BatchResult {
        let records = batch.records.len();
        let started = Instant::now();

        let outcome = match self.ensure_schema().await {
            Err(IngestError::Schema(e)) => Err(e),
            Err(other) => Err(StoreError::Backend(other.to_string())),
            Ok(()) => match tokio::time::timeout(self.timeout, self.store.upsert_batch(&batch.records)).await {
                Ok(res) => res,
                Err(_) => Err(StoreError::Timeout(self.timeout)),
            },
        };
        metrics::load::batch_duration(started.elapsed().as_secs_f64());

        match outcome {
            Ok(rows_written) => {
                debug!(index, rows_written, "Batch committed");
                metrics::load::batch_succeeded(rows_written);
                BatchResult {
                    index,
                    records,
                    rows_written,
                    error: None,
                }
            }
            Err(error) => {
                warn!(index, kind = error.kind(), "Batch failed: {}", error);
                metrics::load::batch_failed(error.kind());
                BatchResult {
                    index,
                    records,
                    rows_written: 0,
                    error: Some(error),
                }
            }
        }
    }
}
