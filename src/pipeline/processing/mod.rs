// Pipeline processing: canonicalization, deduplication and batching

pub mod batch;
pub mod canonicalize;
pub mod dedupe;

pub use batch::batch;
pub use canonicalize::{canonicalize, canonicalize_all};
pub use dedupe::{dedupe, DedupeOutcome};
