// Pipeline ingestion: the quote fetcher contract and the Marketstack client

pub mod marketstack;

pub use marketstack::MarketstackClient;

use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::BTreeSet;

use crate::error::Result;
use crate::types::RawRecord;

/// What to pull from the provider for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub symbols: BTreeSet<String>,
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
}

/// Source of raw end-of-day records.
///
/// Implementations own retries, rate limiting and authentication. The
/// pipeline only sees the finished, finite sequence or a fetch error.
#[async_trait]
pub trait QuoteFetcher: Send + Sync {
    fn provider_name(&self) -> &'static str;

    async fn fetch(&self, request: &FetchRequest) -> Result<Vec<RawRecord>>;
}
