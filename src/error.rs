use thiserror::Error;

use crate::pipeline::storage::StoreError;
use crate::types::{RecordRejection, RejectReason};

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Fetch failed: {0}")]
    Fetch(String),

    #[error("Record {index} rejected: {reason}")]
    RecordRejected { index: usize, reason: RejectReason },

    #[error("Batch {batch} write failed: {source}")]
    BatchWrite {
        batch: usize,
        #[source]
        source: StoreError,
    },

    #[error("Schema error: {0}")]
    Schema(#[source] StoreError),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),
}

impl From<reqwest::Error> for IngestError {
    fn from(err: reqwest::Error) -> Self {
        // The request URL carries the access key; never let it into messages.
        IngestError::Fetch(err.without_url().to_string())
    }
}

impl From<RecordRejection> for IngestError {
    fn from(rejection: RecordRejection) -> Self {
        IngestError::RecordRejected {
            index: rejection.index,
            reason: rejection.reason,
        }
    }
}

impl From<serde_json::Error> for IngestError {
    fn from(err: serde_json::Error) -> Self {
        IngestError::Fetch(format!("malformed provider response: {err}"))
    }
}

impl IngestError {
    /// Short stable label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            IngestError::Configuration(_) | IngestError::Toml(_) => "configuration",
            IngestError::Fetch(_) => "fetch",
            IngestError::RecordRejected { .. } => "record_rejected",
            IngestError::BatchWrite { .. } => "batch_write",
            IngestError::Schema(_) => "schema",
        }
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;
