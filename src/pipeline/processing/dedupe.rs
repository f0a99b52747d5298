use std::collections::HashMap;

use crate::types::CanonicalRecord;

/// Output of a dedupe pass.
#[derive(Debug, Clone, Default)]
pub struct DedupeOutcome {
    pub records: Vec<CanonicalRecord>,
    /// Input records dropped because a later record shared their identity key.
    pub collapsed: usize,
}

/// Collapse records sharing an identity key.
///
/// The value kept for a key is the last one encountered in input order, while
/// the position of that key in the output is where it was first encountered.
pub fn dedupe(records: Vec<CanonicalRecord>) -> DedupeOutcome {
    let input_len = records.len();
    let mut slots: HashMap<String, usize> = HashMap::with_capacity(input_len);
    let mut out: Vec<CanonicalRecord> = Vec::with_capacity(input_len);

    for record in records {
        let key = record.identity_key();
        match slots.get(&key) {
            Some(&slot) => out[slot] = record,
            None => {
                slots.insert(key, out.len());
                out.push(record);
            }
        }
    }

    DedupeOutcome {
        collapsed: input_len - out.len(),
        records: out,
    }
}
