use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Raw quote record as returned by the provider, one JSON object per symbol-day.
pub type RawRecord = serde_json::Map<String, serde_json::Value>;

/// Normalized end-of-day price for one symbol on one trading day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub open: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<f64>,
    pub dividend: Option<f64>,
    pub symbol: String,
    pub exchange: String,
    /// Midnight UTC of the reported calendar date.
    pub trading_date: DateTime<Utc>,
}

impl CanonicalRecord {
    /// `SYMBOL_YYYY-MM-DD`, recomputed on every call.
    pub fn identity_key(&self) -> String {
        identity_key(&self.symbol, self.trading_date.date_naive())
    }
}

pub fn identity_key(symbol: &str, day: NaiveDate) -> String {
    format!("{}_{}", symbol, day.format("%Y-%m-%d"))
}

/// Ordered group of records written in one transaction.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Batch {
    pub records: Vec<CanonicalRecord>,
}

/// Why a raw record could not become a canonical one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    MissingSymbol,
    MissingDate,
    UnparsableDate { value: String },
    InvalidNumber { field: String },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::MissingSymbol => write!(f, "symbol is missing or empty"),
            RejectReason::MissingDate => write!(f, "date is missing"),
            RejectReason::UnparsableDate { value } => write!(f, "date '{value}' could not be parsed"),
            RejectReason::InvalidNumber { field } => write!(f, "field '{field}' is not numeric"),
        }
    }
}

/// A rejected raw record, located by its position in the fetched sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordRejection {
    pub index: usize,
    #[serde(flatten)]
    pub reason: RejectReason,
}
