//! Remote candle store.
//!
//! Rows are keyed by `(asset, time)`. Conflicts are resolved by the storage
//! layer itself: extremes accumulate, the incoming close wins, the first
//! open is kept.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use tracing::{debug, info};

use crate::types::Candle;

#[derive(Debug, Clone, PartialEq)]
pub struct CandleRow {
    pub asset: String,
    pub candle: Candle,
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Upsert-merge every row. Returns the number of rows written.
    async fn upsert_merge(&self, rows: &[CandleRow]) -> Result<usize>;

    /// Delete rows whose bucket starts before `cutoff`. Returns the count.
    async fn prune_before(&self, cutoff: i64) -> Result<usize>;

    /// Newest `limit` candles for `asset`, oldest first.
    async fn fetch_recent(&self, asset: &str, limit: usize) -> Result<Vec<Candle>>;

    /// Candles for `asset` with `from <= time < to`, oldest first.
    async fn fetch_range(&self, asset: &str, from: i64, to: i64) -> Result<Vec<Candle>>;
}

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS candles (
        asset TEXT NOT NULL,
        time INTEGER NOT NULL,
        open REAL NOT NULL,
        high REAL NOT NULL,
        low REAL NOT NULL,
        close REAL NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (asset, time)
    );
    CREATE INDEX IF NOT EXISTS idx_candles_time ON candles(time);
"#;

const UPSERT_SQL: &str = r#"
    INSERT INTO candles (asset, time, open, high, low, close, updated_at)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
    ON CONFLICT(asset, time) DO UPDATE SET
        high = MAX(candles.high, excluded.high),
        low = MIN(candles.low, excluded.low),
        close = excluded.close,
        updated_at = excluded.updated_at
"#;

/// SQLite-backed [`RemoteStore`]. Calls run on the blocking pool.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open remote store {}", path.display()))?;
        // Best effort; in-memory and some filesystems refuse WAL.
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;");
        let store = Self::init(conn)?;
        info!(path = %path.display(), "remote store opened");
        Ok(store)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().context("failed to open in-memory store")?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("failed to create candles table")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || f(&mut conn.lock()))
            .await
            .context("remote store task panicked")?
    }
}

#[async_trait]
impl RemoteStore for SqliteStore {
    async fn upsert_merge(&self, rows: &[CandleRow]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let rows = rows.to_vec();
        let now = chrono::Utc::now().timestamp();
        let written = self
            .blocking(move |conn| {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare_cached(UPSERT_SQL)?;
                    for row in &rows {
                        let c = &row.candle;
                        stmt.execute(params![row.asset, c.time, c.open, c.high, c.low, c.close, now])?;
                    }
                }
                tx.commit()?;
                Ok(rows.len())
            })
            .await
            .context("remote upsert failed")?;
        debug!(rows = written, "remote upsert committed");
        Ok(written)
    }

    async fn prune_before(&self, cutoff: i64) -> Result<usize> {
        let deleted = self
            .blocking(move |conn| {
                Ok(conn.execute("DELETE FROM candles WHERE time < ?1", params![cutoff])?)
            })
            .await
            .context("remote prune failed")?;
        debug!(cutoff, deleted, "remote rows pruned");
        Ok(deleted)
    }

    async fn fetch_recent(&self, asset: &str, limit: usize) -> Result<Vec<Candle>> {
        let asset = asset.to_string();
        let limit = limit as i64;
        self.blocking(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT time, open, high, low, close FROM candles
                 WHERE asset = ?1 ORDER BY time DESC LIMIT ?2",
            )?;
            let mut candles = stmt
                .query_map(params![asset, limit], candle_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            candles.reverse();
            Ok(candles)
        })
        .await
        .context("remote fetch failed")
    }

    async fn fetch_range(&self, asset: &str, from: i64, to: i64) -> Result<Vec<Candle>> {
        let asset = asset.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT time, open, high, low, close FROM candles
                 WHERE asset = ?1 AND time >= ?2 AND time < ?3 ORDER BY time ASC",
            )?;
            let candles = stmt
                .query_map(params![asset, from, to], candle_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(candles)
        })
        .await
        .context("remote range fetch failed")
    }
}

fn candle_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Candle> {
    Ok(Candle {
        time: row.get(0)?,
        open: row.get(1)?,
        high: row.get(2)?,
        low: row.get(3)?,
        close: row.get(4)?,
    })
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}
