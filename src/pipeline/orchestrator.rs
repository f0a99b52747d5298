use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::RunConfig;
use crate::error::{IngestError, Result};
use crate::metrics;
use crate::pipeline::ingestion::{FetchRequest, QuoteFetcher};
use crate::pipeline::loader::{BatchFailure, BatchResult, UpsertLoader};
use crate::pipeline::processing::{batch, canonicalize_all, dedupe};
use crate::pipeline::storage::{PriceStore, StoreError};
use crate::types::{Batch, RecordRejection};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Fetching,
    Transforming,
    Loading,
    Done,
    Failed,
}

/// Why a run that produced a report still ended `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum AbortReason {
    Cancelled { during: RunState },
    BatchFailed { index: usize },
}

/// Caller-side abort switch. Cloned handles share one flag.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Terminal summary of one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub state: RunState,
    pub abort: Option<AbortReason>,
    pub raw_records: usize,
    pub rejected: usize,
    pub deduplicated: usize,
    pub canonical_records: usize,
    pub batches_total: usize,
    pub batches_attempted: usize,
    pub batches_succeeded: usize,
    pub batches_failed: usize,
    pub rows_written: usize,
    pub rejections: Vec<RecordRejection>,
    pub batch_failures: Vec<BatchFailure>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunReport {
    fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            state: RunState::Idle,
            abort: None,
            raw_records: 0,
            rejected: 0,
            deduplicated: 0,
            canonical_records: 0,
            batches_total: 0,
            batches_attempted: 0,
            batches_succeeded: 0,
            batches_failed: 0,
            rows_written: 0,
            rejections: Vec::new(),
            batch_failures: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    fn enter(&mut self, state: RunState) {
        debug!(run_id = %self.run_id, from = ?self.state, to = ?state, "State transition");
        self.state = state;
    }

    /// True when nothing was rejected and every batch committed.
    pub fn is_clean(&self) -> bool {
        self.state == RunState::Done && self.rejected == 0 && self.batches_failed == 0
    }
}

#[derive(Debug, Default)]
struct LoadOutcome {
    results: Vec<BatchResult>,
    cancelled: bool,
}

/// Fetch → canonicalize → dedupe → batch → upsert, for one configured window.
///
/// Each call to `run` owns its records end to end; nothing is shared between
/// runs except the store.
pub struct Pipeline {
    config: RunConfig,
    fetcher: Arc<dyn QuoteFetcher>,
    loader: Arc<UpsertLoader>,
}

impl Pipeline {
    pub fn new(config: RunConfig, fetcher: Arc<dyn QuoteFetcher>, store: Arc<dyn PriceStore>) -> Result<Self> {
        config.validate()?;
        let loader = Arc::new(UpsertLoader::new(store, config.store_timeout));
        Ok(Self {
            config,
            fetcher,
            loader,
        })
    }

    /// Execute one run.
    ///
    /// Configuration, fetch and schema problems abort with `Err`. Rejected
    /// records and failed batches never do; they are counted in the report.
    #[instrument(skip(self, cancel), fields(provider = self.fetcher.provider_name()))]
    pub async fn run(&self, cancel: &CancelFlag) -> Result<RunReport> {
        let mut report = RunReport::new();
        info!(
            run_id = %report.run_id,
            "Starting run for {} symbol(s), {} to {}",
            self.config.symbols.len(),
            self.config.date_from,
            self.config.date_to
        );

        // Step 1: Fetch raw records
        report.enter(RunState::Fetching);
        let raws = match self.fetch().await {
            Ok(raws) => raws,
            Err(e) => return Err(self.fail(&mut report, e)),
        };
        report.raw_records = raws.len();
        metrics::fetch::raw_records(raws.len());

        if raws.is_empty() {
            info!("Provider returned no records; nothing to load");
            return Ok(self.finish(report, RunState::Done));
        }
        if cancel.is_cancelled() {
            return Ok(self.abort(report, AbortReason::Cancelled { during: RunState::Fetching }));
        }

        // Step 2: Canonicalize and dedupe
        report.enter(RunState::Transforming);
        let (mut canonical, rejections) = canonicalize_all(&raws);
        drop(raws);
        // The feed is newest-first; replay it oldest-first so the most recent
        // re-publication of a key is the last one dedupe sees.
        canonical.reverse();
        for rejection in &rejections {
            debug!("{}", IngestError::from(rejection.clone()));
        }
        let deduped = dedupe(canonical);

        report.rejected = rejections.len();
        report.rejections = rejections;
        report.deduplicated = deduped.collapsed;
        report.canonical_records = deduped.records.len();
        metrics::transform::rejected(report.rejected);
        metrics::transform::deduplicated(report.deduplicated);
        info!(
            "Transformed {} raw records: {} canonical, {} rejected, {} collapsed as duplicates",
            report.raw_records, report.canonical_records, report.rejected, report.deduplicated
        );
        if report.rejected > 0 {
            warn!("{} raw records were rejected", report.rejected);
        }

        // Step 3: Batch and upsert
        report.enter(RunState::Loading);
        let batches = match batch(deduped.records, self.config.batch_size) {
            Ok(b) => b,
            Err(e) => return Err(self.fail(&mut report, e)),
        };
        report.batches_total = batches.len();
        if batches.is_empty() {
            return Ok(self.finish(report, RunState::Done));
        }
        if let Err(e) = self.loader.ensure_schema().await {
            return Err(self.fail(&mut report, e));
        }

        let outcome = if self.config.load_workers > 1 {
            self.load_concurrent(batches, cancel).await
        } else {
            self.load_sequential(batches, cancel).await
        };

        let mut first_failure = None;
        report.batches_attempted = outcome.results.len();
        for result in &outcome.results {
            match result.failure() {
                None => {
                    report.batches_succeeded += 1;
                    report.rows_written += result.rows_written;
                }
                Some(failure) => {
                    report.batches_failed += 1;
                    first_failure.get_or_insert(result.index);
                    report.batch_failures.push(failure);
                }
            }
        }

        if outcome.cancelled {
            return Ok(self.abort(report, AbortReason::Cancelled { during: RunState::Loading }));
        }
        if self.config.fail_fast {
            if let Some(index) = first_failure {
                return Ok(self.abort(report, AbortReason::BatchFailed { index }));
            }
        }
        Ok(self.finish(report, RunState::Done))
    }

    async fn fetch(&self) -> Result<Vec<crate::types::RawRecord>> {
        let request = FetchRequest {
            symbols: self.config.symbols.clone(),
            date_from: self.config.date_from,
            date_to: self.config.date_to,
        };
        let started = Instant::now();
        let fetched = tokio::time::timeout(self.config.fetch_timeout, self.fetcher.fetch(&request)).await;
        metrics::fetch::duration(started.elapsed().as_secs_f64());

        match fetched {
            Ok(res) => res,
            Err(_) => Err(IngestError::Fetch(format!(
                "{} fetch timed out after {:?}",
                self.fetcher.provider_name(),
                self.config.fetch_timeout
            ))),
        }
    }

    async fn load_sequential(&self, batches: Vec<Batch>, cancel: &CancelFlag) -> LoadOutcome {
        let mut outcome = LoadOutcome::default();
        for (index, batch) in batches.iter().enumerate() {
            if cancel.is_cancelled() {
                warn!("Run cancelled before batch {}", index);
                outcome.cancelled = true;
                break;
            }
            let result = self.loader.apply(index, batch).await;
            let halt = match result.to_error() {
                Some(err) if self.config.fail_fast => {
                    warn!("Stopping after {} (fail-fast)", err);
                    true
                }
                _ => false,
            };
            outcome.results.push(result);
            if halt {
                break;
            }
        }
        outcome
    }

    async fn load_concurrent(&self, batches: Vec<Batch>, cancel: &CancelFlag) -> LoadOutcome {
        let mut outcome = LoadOutcome::default();
        let semaphore = Arc::new(Semaphore::new(self.config.load_workers));
        let halted = Arc::new(AtomicBool::new(false));
        let mut tasks = JoinSet::new();
        let mut spawned = Vec::new();

        for (index, batch) in batches.into_iter().enumerate() {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            if cancel.is_cancelled() {
                warn!("Run cancelled before batch {}", index);
                outcome.cancelled = true;
                break;
            }
            if halted.load(Ordering::SeqCst) {
                warn!("Not submitting batch {} after a failure (fail-fast)", index);
                break;
            }

            let loader = self.loader.clone();
            let halted = halted.clone();
            let fail_fast = self.config.fail_fast;
            let records = batch.records.len();
            tasks.spawn(async move {
                let result = loader.apply(index, &batch).await;
                if fail_fast && !result.is_success() {
                    halted.store(true, Ordering::SeqCst);
                }
                drop(permit);
                result
            });
            spawned.push((index, records));
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => outcome.results.push(result),
                Err(e) => error!("Batch task did not complete: {}", e),
            }
        }

        // A panicked task left no result; it still counts as a failed batch.
        let finished: HashSet<usize> = outcome.results.iter().map(|r| r.index).collect();
        for (index, records) in spawned {
            if !finished.contains(&index) {
                outcome.results.push(BatchResult {
                    index,
                    records,
                    rows_written: 0,
                    error: Some(StoreError::Backend("batch task did not complete".to_string())),
                });
            }
        }
        outcome.results.sort_by_key(|r| r.index);
        outcome
    }

    fn finish(&self, mut report: RunReport, state: RunState) -> RunReport {
        report.enter(state);
        report.finished_at = Some(Utc::now());
        metrics::run::finished(if state == RunState::Done { "done" } else { "failed" });
        info!(
            run_id = %report.run_id,
            state = ?report.state,
            "Run finished: {} raw, {} rejected, {} deduplicated, {}/{} batches committed, {} failed, {} rows written",
            report.raw_records,
            report.rejected,
            report.deduplicated,
            report.batches_succeeded,
            report.batches_total,
            report.batches_failed,
            report.rows_written
        );
        for failure in &report.batch_failures {
            warn!("Batch {} ({} records) failed [{}]: {}", failure.index, failure.records, failure.kind, failure.message);
        }
        report
    }

    fn abort(&self, mut report: RunReport, reason: AbortReason) -> RunReport {
        warn!(run_id = %report.run_id, ?reason, "Run aborted");
        report.abort = Some(reason);
        self.finish(report, RunState::Failed)
    }

    fn fail(&self, report: &mut RunReport, err: IngestError) -> IngestError {
        let during = report.state;
        report.enter(RunState::Failed);
        report.finished_at = Some(Utc::now());
        metrics::run::finished("error");
        error!(run_id = %report.run_id, ?during, kind = err.kind(), "Run failed: {}", err);
        err
    }
}
