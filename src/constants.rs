//! Defaults shared by the config layer, the fetcher and the store.

// Provider
pub const MARKETSTACK_EOD_URL: &str = "https://api.marketstack.com/v1/eod";
pub const DEFAULT_PAGE_LIMIT: u32 = 1000;
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;

// Run
pub const DEFAULT_SYMBOLS: &[&str] = &["AAPL", "AMZN", "GOOGL", "MSFT", "NFLX"];
pub const DEFAULT_DATE_FROM: &str = "2021-01-01";
pub const DEFAULT_BATCH_SIZE: usize = 1000;
pub const DEFAULT_LOAD_WORKERS: usize = 1;

// Storage
pub const DEFAULT_DB_PATH: &str = "data/eod_prices.db";
pub const DEFAULT_TABLE: &str = "stocks_data";
pub const DEFAULT_STORE_TIMEOUT_SECS: u64 = 30;

// Config discovery
pub const DEFAULT_CONFIG_FILE: &str = "eod_ingest.toml";
