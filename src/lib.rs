pub mod config;
pub mod constants;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod types;

pub use config::{PipelineConfig, RunConfig, Settings};
pub use error::{IngestError, Result};
pub use pipeline::{CancelFlag, Pipeline, RunReport, RunState};
