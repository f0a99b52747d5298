use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::{IngestError, Result};
use crate::pipeline::storage::is_valid_table_name;

/// Settings as written in `eod_ingest.toml`; every field is optional so the
/// file, the environment and CLI flags can each fill in part of it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub provider: ProviderSettings,
    pub run: RunSettings,
    pub storage: StorageSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub page_limit: Option<u32>,
    pub request_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    pub symbols: Option<Vec<String>>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub batch_size: Option<i64>,
    pub load_workers: Option<i64>,
    pub fail_fast: Option<bool>,
    pub fetch_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub path: Option<PathBuf>,
    pub table: Option<String>,
    pub timeout_secs: Option<u64>,
}

/// Validated configuration for one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub provider: ProviderConfig,
    pub storage: StorageConfig,
    pub run: RunConfig,
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: String,
    pub page_limit: u32,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub path: PathBuf,
    pub table: String,
}

/// The part of the configuration the orchestrator itself consumes.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub symbols: BTreeSet<String>,
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
    pub batch_size: usize,
    pub load_workers: usize,
    pub fail_fast: bool,
    pub fetch_timeout: Duration,
    pub store_timeout: Duration,
}

impl RunConfig {
    /// Run settings with defaults for everything but the window.
    pub fn new(symbols: impl IntoIterator<Item = impl Into<String>>, date_from: NaiveDate, date_to: NaiveDate) -> Self {
        Self {
            symbols: symbols.into_iter().map(Into::into).collect(),
            date_from,
            date_to,
            batch_size: DEFAULT_BATCH_SIZE,
            load_workers: DEFAULT_LOAD_WORKERS,
            fail_fast: false,
            fetch_timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS * 10),
            store_timeout: Duration::from_secs(DEFAULT_STORE_TIMEOUT_SECS),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.symbols.is_empty() {
            return Err(config_err("symbol list is empty"));
        }
        if self.symbols.iter().any(|s| s.trim().is_empty()) {
            return Err(config_err("symbol list contains an empty symbol"));
        }
        if self.date_from > self.date_to {
            return Err(config_err(format!(
                "date_from {} is after date_to {}",
                self.date_from, self.date_to
            )));
        }
        if self.batch_size == 0 {
            return Err(config_err("batch_size must be positive"));
        }
        if self.load_workers == 0 {
            return Err(config_err("load_workers must be positive"));
        }
        Ok(())
    }
}

impl Settings {
    /// Read settings from `path`, or from `eod_ingest.toml` in the working
    /// directory when no path is given. A missing default file is not an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };
        if !path.exists() {
            if required {
                return Err(config_err(format!("config file '{}' not found", path.display())));
            }
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path).map_err(|e| {
            config_err(format!("Failed to read config file '{}': {}", path.display(), e))
        })?;
        Ok(toml::from_str(&content)?)
    }

    /// Apply environment overrides. `.env` is expected to be loaded already.
    pub fn apply_env(mut self) -> Result<Self> {
        self.apply_env_with(|key| std::env::var(key).ok())?;
        Ok(self)
    }

    fn apply_env_with(&mut self, get: impl Fn(&str) -> Option<String>) -> Result<()> {
        let get = |key: &str| get(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("API_KEY") {
            self.provider.api_key = Some(v);
        }
        if let Some(v) = get("EOD_SYMBOLS") {
            self.run.symbols = Some(split_symbols(&v));
        }
        if let Some(v) = get("EOD_DATE_FROM") {
            self.run.date_from = Some(parse_date("EOD_DATE_FROM", &v)?);
        }
        if let Some(v) = get("EOD_DATE_TO") {
            self.run.date_to = Some(parse_date("EOD_DATE_TO", &v)?);
        }
        if let Some(v) = get("EOD_BATCH_SIZE") {
            let n = v
                .trim()
                .parse()
                .map_err(|_| config_err(format!("EOD_BATCH_SIZE '{v}' is not an integer")))?;
            self.run.batch_size = Some(n);
        }
        if let Some(v) = get("EOD_DB_PATH") {
            self.storage.path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("EOD_TABLE") {
            self.storage.table = Some(v);
        }
        Ok(())
    }

    /// Resolve only the storage section; enough for schema setup without an API key.
    pub fn storage_config(&self) -> Result<StorageConfig> {
        let table = self.storage.table.clone().unwrap_or_else(|| DEFAULT_TABLE.to_string());
        if !is_valid_table_name(&table) {
            return Err(config_err(format!("table name '{table}' is not a plain identifier")));
        }
        Ok(StorageConfig {
            path: self
                .storage
                .path
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH)),
            table,
        })
    }

    /// Check that every required value is present and sane.
    pub fn validate(self) -> Result<PipelineConfig> {
        let storage = self.storage_config()?;
        let api_key = self
            .provider
            .api_key
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| config_err("API_KEY is missing"))?;

        let symbols = self
            .run
            .symbols
            .unwrap_or_else(|| DEFAULT_SYMBOLS.iter().map(|s| s.to_string()).collect());
        let date_from = match self.run.date_from {
            Some(d) => d,
            None => parse_date("date_from", DEFAULT_DATE_FROM)?,
        };
        let date_to = self.run.date_to.unwrap_or_else(|| Utc::now().date_naive());

        let batch_size = positive("batch_size", self.run.batch_size, DEFAULT_BATCH_SIZE)?;
        let load_workers = positive("load_workers", self.run.load_workers, DEFAULT_LOAD_WORKERS)?;

        let page_limit = self.provider.page_limit.unwrap_or(DEFAULT_PAGE_LIMIT);
        if page_limit == 0 {
            return Err(config_err("page_limit must be positive"));
        }

        let request_timeout = self
            .provider
            .request_timeout_secs
            .unwrap_or(DEFAULT_FETCH_TIMEOUT_SECS);

        let run = RunConfig {
            symbols: symbols.into_iter().map(|s| s.trim().to_string()).collect(),
            date_from,
            date_to,
            batch_size,
            load_workers,
            fail_fast: self.run.fail_fast.unwrap_or(false),
            fetch_timeout: Duration::from_secs(
                self.run.fetch_timeout_secs.unwrap_or(request_timeout.saturating_mul(10)),
            ),
            store_timeout: Duration::from_secs(
                self.storage.timeout_secs.unwrap_or(DEFAULT_STORE_TIMEOUT_SECS),
            ),
        };
        run.validate()?;

        Ok(PipelineConfig {
            provider: ProviderConfig {
                base_url: self
                    .provider
                    .base_url
                    .unwrap_or_else(|| MARKETSTACK_EOD_URL.to_string()),
                api_key,
                page_limit,
                request_timeout: Duration::from_secs(request_timeout),
            },
            storage,
            run,
        })
    }
}

pub fn split_symbols(list: &str) -> Vec<String> {
    list.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

pub fn parse_date(name: &str, value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|e| config_err(format!("{name} '{value}' is not a YYYY-MM-DD date: {e}")))
}

fn positive(name: &str, value: Option<i64>, default: usize) -> Result<usize> {
    match value {
        None => Ok(default),
        Some(n) if n > 0 => Ok(n as usize),
        Some(n) => Err(config_err(format!("{name} must be positive, got {n}"))),
    }
}

fn config_err(msg: impl Into<String>) -> IngestError {
    IngestError::Configuration(msg.into())
}
