// Data processing pipeline: ingestion, processing, loading and storage

pub mod ingestion;
pub mod loader;
pub mod orchestrator;
pub mod processing;
pub mod storage;

// Re-export key types from each stage
pub use loader::{BatchResult, UpsertLoader};
pub use orchestrator::{AbortReason, CancelFlag, Pipeline, RunReport, RunState};
