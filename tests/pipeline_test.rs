use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

use eod_ingest::config::RunConfig;
use eod_ingest::error::IngestError;
use eod_ingest::pipeline::ingestion::{FetchRequest, QuoteFetcher};
use eod_ingest::pipeline::processing::{batch, canonicalize_all, dedupe};
use eod_ingest::pipeline::storage::{InMemoryStore, PriceStore, SqliteStore, StoreError};
use eod_ingest::pipeline::{AbortReason, CancelFlag, Pipeline, RunState, UpsertLoader};
use eod_ingest::types::{CanonicalRecord, RawRecord, RejectReason};

/// Serves a fixed, provider-ordered (newest first) feed.
struct FeedFetcher {
    feed: Vec<Value>,
}

impl FeedFetcher {
    fn new(feed: Vec<Value>) -> Arc<Self> {
        Arc::new(Self { feed })
    }
}

#[async_trait]
impl QuoteFetcher for FeedFetcher {
    fn provider_name(&self) -> &'static str {
        "feed"
    }

    async fn fetch(&self, _request: &FetchRequest) -> eod_ingest::Result<Vec<RawRecord>> {
        Ok(self.feed.iter().filter_map(|v| v.as_object().cloned()).collect())
    }
}

struct StalledFetcher;

#[async_trait]
impl QuoteFetcher for StalledFetcher {
    fn provider_name(&self) -> &'static str {
        "stalled"
    }

    async fn fetch(&self, _request: &FetchRequest) -> eod_ingest::Result<Vec<RawRecord>> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(Vec::new())
    }
}

/// Rejects any batch that carries the symbol `BAD`, otherwise delegates.
struct PoisonStore {
    inner: InMemoryStore,
    upserts: AtomicUsize,
}

impl PoisonStore {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryStore::new(),
            upserts: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl PriceStore for PoisonStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn upsert_batch(&self, records: &[CanonicalRecord]) -> Result<usize, StoreError> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        if records.iter().any(|r| r.symbol == "BAD") {
            return Err(StoreError::Constraint("CHECK constraint failed: symbol".to_string()));
        }
        self.inner.upsert_batch(records).await
    }

    async fn load_all(&self) -> Result<Vec<CanonicalRecord>, StoreError> {
        self.inner.load_all().await
    }

    async fn count(&self) -> Result<usize, StoreError> {
        self.inner.count().await
    }
}

/// Trips the cancel flag as soon as the first batch lands.
struct CancellingStore {
    inner: InMemoryStore,
    cancel: CancelFlag,
}

#[async_trait]
impl PriceStore for CancellingStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn upsert_batch(&self, records: &[CanonicalRecord]) -> Result<usize, StoreError> {
        let written = self.inner.upsert_batch(records).await?;
        self.cancel.cancel();
        Ok(written)
    }

    async fn load_all(&self) -> Result<Vec<CanonicalRecord>, StoreError> {
        self.inner.load_all().await
    }

    async fn count(&self) -> Result<usize, StoreError> {
        self.inner.count().await
    }
}

struct ReadOnlyStore;

#[async_trait]
impl PriceStore for ReadOnlyStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("attempt to write a readonly database".to_string()))
    }

    async fn upsert_batch(&self, _records: &[CanonicalRecord]) -> Result<usize, StoreError> {
        panic!("no write may be attempted without a schema")
    }

    async fn load_all(&self) -> Result<Vec<CanonicalRecord>, StoreError> {
        Ok(Vec::new())
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(0)
    }
}

fn day(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn run_config(symbols: &[&str]) -> RunConfig {
    RunConfig::new(symbols.iter().copied(), day(2024, 1, 1), day(2024, 1, 31))
}

fn quote(symbol: &str, date: &str, close: f64) -> Value {
    json!({
        "open": close - 1.0,
        "high": close + 1.0,
        "low": close - 2.0,
        "close": close,
        "volume": 1_000_000.0,
        "dividend": 0.0,
        "symbol": symbol,
        "exchange": "XNAS",
        "date": date,
    })
}

fn distinct_quotes(n: usize) -> Vec<Value> {
    (0..n)
        .map(|i| quote(&format!("SYM{i}"), "2024-01-02T00:00:00+0000", 10.0 + i as f64))
        .collect()
}

#[tokio::test]
async fn test_end_to_end_keeps_most_recent_publication() -> Result<()> {
    let dir = tempdir()?;
    let store = Arc::new(SqliteStore::open(dir.path().join("eod.db"), "stocks_data")?);

    // Provider order: newest publication first.
    let fetcher = FeedFetcher::new(vec![
        quote("AAPL", "2024-01-02T00:00:00+0000", 185.64),
        quote("MSFT", "2024-01-02T00:00:00+0000", 370.87),
        quote("AAPL", "2024-01-02T00:00:00+0000", 185.10),
        quote("MSFT", "2024-01-02T00:00:00+0000", 370.00),
    ]);
    let pipeline = Pipeline::new(run_config(&["AAPL", "MSFT"]), fetcher, store.clone())?;

    let report = pipeline.run(&CancelFlag::new()).await?;
    assert_eq!(report.state, RunState::Done);
    assert_eq!(report.raw_records, 4);
    assert_eq!(report.deduplicated, 2);
    assert_eq!(report.rows_written, 2);
    assert!(report.is_clean());

    let rows = store.load_all().await?;
    let keys: Vec<String> = rows.iter().map(|r| r.identity_key()).collect();
    assert_eq!(keys, vec!["AAPL_2024-01-02", "MSFT_2024-01-02"]);
    assert_eq!(rows[0].close, Some(185.64));
    assert_eq!(rows[1].close, Some(370.87));
    for row in &rows {
        assert_eq!(row.trading_date.to_rfc3339(), "2024-01-02T00:00:00+00:00");
    }
    Ok(())
}

#[tokio::test]
async fn test_rerun_is_idempotent() -> Result<()> {
    let dir = tempdir()?;
    let store = Arc::new(SqliteStore::open(dir.path().join("eod.db"), "stocks_data")?);
    let mut feed = distinct_quotes(7);
    feed.push(quote("SYM3", "2024-01-02", 99.0));
    let pipeline = Pipeline::new(run_config(&["SYM"]), FeedFetcher::new(feed), store.clone())?;

    let first = pipeline.run(&CancelFlag::new()).await?;
    let after_first = store.load_all().await?;
    let second = pipeline.run(&CancelFlag::new()).await?;

    assert_eq!(first.state, RunState::Done);
    assert_eq!(second.state, RunState::Done);
    assert_eq!(second.batches_failed, 0);
    assert_ne!(first.run_id, second.run_id);
    assert_eq!(store.count().await?, 7);
    assert_eq!(store.load_all().await?, after_first);
    Ok(())
}

#[tokio::test]
async fn test_colliding_keys_leave_last_input() -> Result<()> {
    let store = Arc::new(SqliteStore::open_in_memory("stocks_data")?);
    let loader = UpsertLoader::new(store.clone(), Duration::from_secs(5));

    let raws: Vec<RawRecord> = [
        quote("AAPL", "2024-01-02", 1.0),
        quote("MSFT", "2024-01-02", 2.0),
        quote("AAPL", "2024-01-02T16:00:00+0000", 3.0),
        quote("AAPL", "2024-01-03", 4.0),
        quote("MSFT", "2024-01-02 09:30:00", 5.0),
        quote("AAPL", "2024-01-02", 6.0),
    ]
    .iter()
    .filter_map(|v| v.as_object().cloned())
    .collect();

    let (canonical, rejections) = canonicalize_all(&raws);
    assert!(rejections.is_empty());
    let deduped = dedupe(canonical);
    assert_eq!(deduped.collapsed, 3);

    for (index, b) in batch(deduped.records, 2)?.iter().enumerate() {
        assert!(loader.apply(index, b).await.is_success());
    }

    let rows = store.load_all().await?;
    let summary: Vec<(String, Option<f64>)> = rows.iter().map(|r| (r.identity_key(), r.close)).collect();
    assert_eq!(
        summary,
        vec![
            ("AAPL_2024-01-02".to_string(), Some(6.0)),
            ("AAPL_2024-01-03".to_string(), Some(4.0)),
            ("MSFT_2024-01-02".to_string(), Some(5.0)),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn test_malformed_record_is_isolated() -> Result<()> {
    let store = Arc::new(InMemoryStore::new());
    let mut feed = distinct_quotes(9);
    feed.insert(4, json!({"close": 1.0, "date": "2024-01-02", "symbol": "  "}));
    let pipeline = Pipeline::new(run_config(&["SYM"]), FeedFetcher::new(feed), store.clone())?;

    let report = pipeline.run(&CancelFlag::new()).await?;
    assert_eq!(report.state, RunState::Done);
    assert_eq!(report.raw_records, 10);
    assert_eq!(report.rejected, 1);
    assert_eq!(report.canonical_records, 9);
    assert_eq!(report.rejections[0].index, 4);
    assert_eq!(report.rejections[0].reason, RejectReason::MissingSymbol);
    assert!(!report.is_clean());
    assert_eq!(store.count().await?, 9);
    Ok(())
}

#[tokio::test]
async fn test_failed_batch_does_not_stop_best_effort_run() -> Result<()> {
    let store = PoisonStore::new();
    let feed = vec![
        quote("XOM", "2024-01-02", 1.0),
        quote("BAD", "2024-01-02", 2.0),
        quote("CVX", "2024-01-02", 3.0),
    ];
    let mut cfg = run_config(&["XOM", "BAD", "CVX"]);
    cfg.batch_size = 1;
    let pipeline = Pipeline::new(cfg, FeedFetcher::new(feed), store.clone())?;

    let report = pipeline.run(&CancelFlag::new()).await?;
    assert_eq!(report.state, RunState::Done);
    assert_eq!(report.abort, None);
    assert_eq!(report.batches_total, 3);
    assert_eq!(report.batches_attempted, 3);
    assert_eq!(report.batches_succeeded, 2);
    assert_eq!(report.batches_failed, 1);
    assert_eq!(report.batch_failures[0].index, 1);
    assert_eq!(report.batch_failures[0].kind, "constraint");
    assert_eq!(store.count().await?, 2);
    Ok(())
}

#[tokio::test]
async fn test_fail_fast_stops_after_first_failure() -> Result<()> {
    let store = PoisonStore::new();
    let feed = vec![
        quote("XOM", "2024-01-02", 1.0),
        quote("BAD", "2024-01-02", 2.0),
        quote("CVX", "2024-01-02", 3.0),
    ];
    let mut cfg = run_config(&["XOM", "BAD", "CVX"]);
    cfg.batch_size = 1;
    cfg.fail_fast = true;
    let pipeline = Pipeline::new(cfg, FeedFetcher::new(feed), store.clone())?;

    let report = pipeline.run(&CancelFlag::new()).await?;
    assert_eq!(report.state, RunState::Failed);
    assert_eq!(report.abort, Some(AbortReason::BatchFailed { index: 1 }));
    assert_eq!(report.batches_attempted, 2);
    assert_eq!(store.upserts.load(Ordering::SeqCst), 2);
    assert_eq!(store.count().await?, 1);
    Ok(())
}

#[tokio::test]
async fn test_cancel_at_batch_boundary() -> Result<()> {
    let cancel = CancelFlag::new();
    let store = Arc::new(CancellingStore {
        inner: InMemoryStore::new(),
        cancel: cancel.clone(),
    });
    let mut cfg = run_config(&["SYM"]);
    cfg.batch_size = 2;
    let pipeline = Pipeline::new(cfg, FeedFetcher::new(distinct_quotes(6)), store.clone())?;

    let report = pipeline.run(&cancel).await?;
    assert_eq!(report.state, RunState::Failed);
    assert_eq!(report.abort, Some(AbortReason::Cancelled { during: RunState::Loading }));
    assert_eq!(report.batches_total, 3);
    assert_eq!(report.batches_attempted, 1);
    assert_eq!(report.rows_written, 2);
    assert_eq!(store.count().await?, 2);
    Ok(())
}

#[tokio::test]
async fn test_cancel_stops_concurrent_submission() -> Result<()> {
    let cancel = CancelFlag::new();
    let store = Arc::new(CancellingStore {
        inner: InMemoryStore::new(),
        cancel: cancel.clone(),
    });
    let mut cfg = run_config(&["SYM"]);
    cfg.batch_size = 2;
    cfg.load_workers = 2;
    let pipeline = Pipeline::new(cfg, FeedFetcher::new(distinct_quotes(12)), store.clone())?;

    let report = pipeline.run(&cancel).await?;
    assert_eq!(report.state, RunState::Failed);
    assert_eq!(report.abort, Some(AbortReason::Cancelled { during: RunState::Loading }));
    assert_eq!(report.batches_total, 6);
    assert!(report.batches_attempted >= 1);
    assert!(report.batches_attempted < report.batches_total);
    assert_eq!(report.batches_failed, 0);
    assert_eq!(store.count().await?, report.rows_written);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_workers_load_everything() -> Result<()> {
    let dir = tempdir()?;
    let store = Arc::new(SqliteStore::open(dir.path().join("eod.db"), "stocks_data")?);
    let mut cfg = run_config(&["SYM"]);
    cfg.batch_size = 3;
    cfg.load_workers = 4;
    let pipeline = Pipeline::new(cfg, FeedFetcher::new(distinct_quotes(20)), store.clone())?;

    let report = pipeline.run(&CancelFlag::new()).await?;
    assert_eq!(report.state, RunState::Done);
    assert_eq!(report.batches_total, 7);
    assert_eq!(report.batches_succeeded, 7);
    assert_eq!(report.rows_written, 20);
    assert_eq!(store.count().await?, 20);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_fail_fast_reports_failure() -> Result<()> {
    let store = PoisonStore::new();
    let mut feed = distinct_quotes(8);
    feed.push(quote("BAD", "2024-01-02", 1.0));
    let mut cfg = run_config(&["SYM"]);
    cfg.batch_size = 1;
    cfg.load_workers = 2;
    cfg.fail_fast = true;
    let pipeline = Pipeline::new(cfg, FeedFetcher::new(feed), store.clone())?;

    let report = pipeline.run(&CancelFlag::new()).await?;
    assert_eq!(report.state, RunState::Failed);
    assert_eq!(report.abort, Some(AbortReason::BatchFailed { index: 0 }));
    assert_eq!(report.batches_failed, 1);
    assert!(report.batches_attempted < report.batches_total);
    Ok(())
}

#[tokio::test]
async fn test_schema_failure_aborts_before_writes() {
    let pipeline = Pipeline::new(
        run_config(&["SYM"]),
        FeedFetcher::new(distinct_quotes(3)),
        Arc::new(ReadOnlyStore),
    )
    .unwrap();

    let err = pipeline.run(&CancelFlag::new()).await.unwrap_err();
    assert!(matches!(err, IngestError::Schema(StoreError::Unavailable(_))));
}

#[tokio::test]
async fn test_stalled_fetch_times_out() {
    let store = Arc::new(InMemoryStore::new());
    let mut cfg = run_config(&["SYM"]);
    cfg.fetch_timeout = Duration::from_millis(50);
    let pipeline = Pipeline::new(cfg, Arc::new(StalledFetcher), store.clone()).unwrap();

    let err = pipeline.run(&CancelFlag::new()).await.unwrap_err();
    match err {
        IngestError::Fetch(msg) => assert!(msg.contains("timed out")),
        other => panic!("expected fetch error, got {other:?}"),
    }
    assert_eq!(store.count().await.unwrap(), 0);
}
