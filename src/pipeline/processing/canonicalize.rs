use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;
use tracing::debug;

use crate::types::{CanonicalRecord, RawRecord, RecordRejection, RejectReason};

/// Provider field names.
const FIELD_SYMBOL: &str = "symbol";
const FIELD_EXCHANGE: &str = "exchange";
const FIELD_DATE: &str = "date";
const NUMERIC_FIELDS: [&str; 4] = ["open", "close", "volume", "dividend"];

/// Offset-carrying formats. Marketstack sends `2024-01-02T00:00:00+0000`.
const OFFSET_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%z", "%Y-%m-%dT%H:%M:%S%.f%z"];
const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];

/// Turn one provider record into a canonical record.
///
/// A numeric field that is present but not a number is rejected as
/// `InvalidNumber` instead of nulled: null already means "the provider sent
/// no value", and a garbled value would otherwise overwrite a good stored row.
pub fn canonicalize(raw: &RawRecord) -> Result<CanonicalRecord, RejectReason> {
    let symbol = match raw.get(FIELD_SYMBOL) {
        Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
        _ => return Err(RejectReason::MissingSymbol),
    };

    let date_value = match raw.get(FIELD_DATE) {
        Some(Value::String(s)) if !s.trim().is_empty() => s.as_str(),
        Some(Value::Null) | None => return Err(RejectReason::MissingDate),
        Some(Value::String(_)) => return Err(RejectReason::MissingDate),
        Some(other) => {
            return Err(RejectReason::UnparsableDate {
                value: other.to_string(),
            })
        }
    };
    let day = parse_trading_day(date_value).ok_or_else(|| RejectReason::UnparsableDate {
        value: date_value.to_string(),
    })?;

    let exchange = match raw.get(FIELD_EXCHANGE) {
        Some(Value::String(s)) => s.clone(),
        _ => String::new(),
    };

    let [open, close, volume, dividend] = {
        let mut values = [None; 4];
        for (slot, field) in values.iter_mut().zip(NUMERIC_FIELDS) {
            *slot = numeric_field(raw, field)?;
        }
        values
    };

    Ok(CanonicalRecord {
        open,
        close,
        volume,
        dividend,
        symbol,
        exchange,
        trading_date: utc_midnight(day),
    })
}

/// Canonicalize a fetched sequence, keeping rejections alongside their input index.
pub fn canonicalize_all(raws: &[RawRecord]) -> (Vec<CanonicalRecord>, Vec<RecordRejection>) {
    let mut records = Vec::with_capacity(raws.len());
    let mut rejections = Vec::new();

    for (index, raw) in raws.iter().enumerate() {
        match canonicalize(raw) {
            Ok(record) => records.push(record),
            Err(reason) => {
                debug!(index, %reason, "Rejected raw record");
                rejections.push(RecordRejection { index, reason });
            }
        }
    }

    (records, rejections)
}

/// Calendar date as reported by the source.
///
/// Any UTC offset on the input is dropped rather than applied, so
/// `2024-01-02T23:00:00-0500` is still 2024-01-02.
pub fn parse_trading_day(value: &str) -> Option<NaiveDate> {
    let value = value.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.naive_local().date());
    }
    for fmt in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(value, fmt) {
            return Some(dt.naive_local().date());
        }
    }
    for fmt in NAIVE_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, fmt) {
            return Some(dt.date());
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d").ok()
}

pub fn utc_midnight(day: NaiveDate) -> DateTime<Utc> {
    day.and_time(chrono::NaiveTime::MIN).and_utc()
}

/// Re-normalize an already canonical timestamp. A no-op for values produced by `canonicalize`.
pub fn normalize_timestamp(ts: DateTime<Utc>) -> DateTime<Utc> {
    utc_midnight(ts.date_naive())
}

fn numeric_field(raw: &RawRecord, field: &str) -> Result<Option<f64>, RejectReason> {
    let invalid = || RejectReason::InvalidNumber {
        field: field.to_string(),
    };
    match raw.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n.as_f64().map(Some).ok_or_else(invalid),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(Some)
            .ok_or_else(invalid),
        Some(_) => Err(invalid()),
    }
}
