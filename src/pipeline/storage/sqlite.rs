use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, InterruptHandle};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

use super::{is_valid_table_name, PriceStore, StoreError};
use crate::types::CanonicalRecord;

const REQUIRED_COLUMNS: [&str; 8] = [
    "unique_id", "open", "close", "volume", "dividend", "symbol", "exchange", "date",
];

/// SQLite-backed price store. One connection, serialized behind a mutex and
/// driven from tokio's blocking pool.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    interrupt: Arc<InterruptHandle>,
    table: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteState {
    Pending,
    Running,
    Committing,
    Abandoned,
    Finished,
}

/// Shared between an upsert future and its blocking closure. Once the future
/// is dropped (caller timeout) the write may no longer commit.
struct WriteTicket {
    state: Mutex<WriteState>,
    interrupt: Arc<InterruptHandle>,
}

impl WriteTicket {
    fn new(interrupt: Arc<InterruptHandle>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(WriteState::Pending),
            interrupt,
        })
    }

    fn transition(&self, from: WriteState, to: WriteState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == from {
            *state = to;
            true
        } else {
            false
        }
    }

    fn finish(&self) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = WriteState::Finished;
    }

    /// Called when the caller stops waiting. A write still queued on the lock
    /// is skipped; one holding the lock has its current statement interrupted.
    fn abandon(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match *state {
            WriteState::Pending => *state = WriteState::Abandoned,
            WriteState::Running => {
                // The closure holds the connection until it marks Finished,
                // which needs this lock, so only its own statement is hit.
                self.interrupt.interrupt();
                *state = WriteState::Abandoned;
            }
            WriteState::Committing | WriteState::Abandoned | WriteState::Finished => {}
        }
    }
}

struct AbandonOnDrop(Arc<WriteTicket>);

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        self.0.abandon();
    }
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P, table: &str) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Unavailable(format!("creating {}: {e}", parent.display())))?;
            }
        }
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::from_connection(conn, table)
    }

    pub fn open_in_memory(table: &str) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?, table)
    }

    fn from_connection(conn: Connection, table: &str) -> Result<Self, StoreError> {
        if !is_valid_table_name(table) {
            return Err(StoreError::Schema(format!("invalid table name '{table}'")));
        }
        conn.busy_timeout(Duration::from_secs(5))?;
        let interrupt = Arc::new(conn.get_interrupt_handle());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            interrupt,
            table: table.to_string(),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection, &str) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        let table = self.table.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Backend("connection mutex poisoned".to_string()))?;
            f(&mut guard, &table)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("blocking task failed: {e}")))?
    }
}

fn create_table_sql(table: &str) -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {table} (
            unique_id TEXT PRIMARY KEY,
            open      REAL,
            close     REAL,
            volume    REAL,
            dividend  REAL,
            symbol    TEXT NOT NULL,
            exchange  TEXT NOT NULL,
            date      TEXT NOT NULL
        );
        "#
    )
}

fn upsert_sql(table: &str) -> String {
    format!(
        "INSERT INTO {table} (unique_id, open, close, volume, dividend, symbol, exchange, date)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(unique_id) DO UPDATE SET
             open=excluded.open,
             close=excluded.close,
             volume=excluded.volume,
             dividend=excluded.dividend,
             symbol=excluded.symbol,
             exchange=excluded.exchange,
             date=excluded.date"
    )
}

fn existing_columns(conn: &Connection, table: &str) -> Result<Vec<String>, StoreError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    let mut columns = Vec::new();
    for name in rows {
        columns.push(name?);
    }
    Ok(columns)
}

fn write_batch(
    conn: &mut Connection,
    table: &str,
    records: &[CanonicalRecord],
    ticket: &WriteTicket,
) -> Result<usize, StoreError> {
    let tx = conn.transaction()?;
    let mut written = 0;
    {
        let mut stmt = tx.prepare_cached(&upsert_sql(table))?;
        for r in records {
            written += stmt.execute(params![
                r.identity_key(),
                r.open,
                r.close,
                r.volume,
                r.dividend,
                r.symbol,
                r.exchange,
                r.trading_date.to_rfc3339(),
            ])?;
        }
    }
    // Dropping the uncommitted transaction rolls it back.
    if !ticket.transition(WriteState::Running, WriteState::Committing) {
        return Err(StoreError::Backend("write abandoned before commit".to_string()));
    }
    tx.commit()?;
    Ok(written)
}

#[async_trait]
impl PriceStore for SqliteStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.with_conn(|conn, table| {
            conn.execute_batch(&create_table_sql(table))
                .map_err(|e| StoreError::Schema(e.to_string()))?;

            let columns = existing_columns(conn, table)?;
            let missing: Vec<&str> = REQUIRED_COLUMNS
                .iter()
                .copied()
                .filter(|c| !columns.iter().any(|have| have == c))
                .collect();
            if !missing.is_empty() {
                return Err(StoreError::Schema(format!(
                    "table {table} exists without columns: {}",
                    missing.join(", ")
                )));
            }
            debug!(table, "Schema ready");
            Ok(())
        })
        .await
    }

    async fn upsert_batch(&self, records: &[CanonicalRecord]) -> Result<usize, StoreError> {
        let records = records.to_vec();
        let ticket = WriteTicket::new(self.interrupt.clone());
        let on_drop = AbandonOnDrop(ticket.clone());

        let result = self
            .with_conn(move |conn, table| {
                if !ticket.transition(WriteState::Pending, WriteState::Running) {
                    return Err(StoreError::Backend("write abandoned before it started".to_string()));
                }
                let result = write_batch(conn, table, &records, &ticket);
                ticket.finish();
                result
            })
            .await;

        // Completed (or the closure died): nothing is left to abandon.
        on_drop.0.finish();
        result
    }

    async fn load_all(&self) -> Result<Vec<CanonicalRecord>, StoreError> {
        self.with_conn(|conn, table| {
            let mut stmt = conn.prepare(&format!(
                "SELECT open, close, volume, dividend, symbol, exchange, date FROM {table} ORDER BY unique_id"
            ))?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, Option<f64>>(0)?,
                    row.get::<_, Option<f64>>(1)?,
                    row.get::<_, Option<f64>>(2)?,
                    row.get::<_, Option<f64>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })?;

            let mut out = Vec::new();
            for row in rows {
                let (open, close, volume, dividend, symbol, exchange, date) = row?;
                let trading_date = DateTime::parse_from_rfc3339(&date)
                    .map_err(|e| StoreError::InvalidValue(format!("stored date '{date}': {e}")))?
                    .with_timezone(&Utc);
                out.push(CanonicalRecord {
                    open,
                    close,
                    volume,
                    dividend,
                    symbol,
                    exchange,
                    trading_date,
                });
            }
            Ok(out)
        })
        .await
    }

    async fn count(&self) -> Result<usize, StoreError> {
        self.with_conn(|conn, table| {
            let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
            Ok(n as usize)
        })
        .await
    }
}
