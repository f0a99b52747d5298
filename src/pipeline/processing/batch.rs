use crate::error::{IngestError, Result};
use crate::types::{Batch, CanonicalRecord};

/// Split records into ordered batches of at most `size` records.
///
/// Records with the same identity key that sit next to each other at a batch
/// boundary move together into the next batch, so one key is never written by
/// two different transactions. A run of equal keys that would fill an entire
/// batch on its own is cut at `size`.
pub fn batch(records: Vec<CanonicalRecord>, size: usize) -> Result<Vec<Batch>> {
    if size == 0 {
        return Err(IngestError::Configuration(
            "batch size must be a positive integer".to_string(),
        ));
    }

    let mut batches = Vec::with_capacity(records.len().div_ceil(size));
    let mut current: Vec<CanonicalRecord> = Vec::with_capacity(size.min(records.len()));

    for record in records {
        if current.len() == size {
            let split_at = carry_point(&current, &record);
            let carried = current.split_off(split_at);
            batches.push(Batch { records: current });
            current = carried;
        }
        current.push(record);
    }

    if !current.is_empty() {
        batches.push(Batch { records: current });
    }

    Ok(batches)
}

/// Index where the full batch should be cut before `next` is appended.
fn carry_point(full: &[CanonicalRecord], next: &CanonicalRecord) -> usize {
    let key = next.identity_key();
    let run = full
        .iter()
        .rev()
        .take_while(|r| r.identity_key() == key)
        .count();

    if run == 0 || run == full.len() {
        full.len()
    } else {
        full.len() - run
    }
}
