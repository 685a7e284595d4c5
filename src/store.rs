//! Record-store collaborator: an append-only usage-log collection and a
//! read-mostly pricing-rate collection.
//!
//! The SQLite implementation opens a connection per operation behind
//! `spawn_blocking`; SQLite serializes writers itself, so no in-process
//! locking sits above it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::store_types::{PricingRateRow, UsageRecord};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Appends one usage record. Callers on the proxy path must treat a
    /// failure as report-only; it never gates response delivery.
    async fn append_usage(&self, record: UsageRecord) -> Result<(), StoreError>;

    /// Full record set, oldest first. Aggregation recomputes from this on
    /// every read call.
    async fn list_usage(&self) -> Result<Vec<UsageRecord>, StoreError>;

    async fn load_rates(&self) -> Result<Vec<PricingRateRow>, StoreError>;

    /// Replaces the whole pricing collection, used when seeding rates at
    /// startup.
    async fn replace_rates(&self, rows: Vec<PricingRateRow>) -> Result<(), StoreError>;
}

#[derive(Clone, Debug)]
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            Ok(())
        })
        .await?
    }
}

#[async_trait]
impl UsageStore for SqliteStore {
    async fn append_usage(&self, record: UsageRecord) -> Result<(), StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT INTO usage_log (
                    user_id, service_name, endpoint, status_code, latency_ms,
                    model, input_tokens, output_tokens, estimated_cost, created_at_ms
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                rusqlite::params![
                    record.user_id,
                    record.service_name,
                    record.endpoint,
                    record.status_code,
                    u64_to_i64(record.latency_ms),
                    record.model,
                    u64_to_i64(record.input_tokens),
                    u64_to_i64(record.output_tokens),
                    record.estimated_cost,
                    u64_to_i64(record.created_at_ms),
                ],
            )?;
            Ok(())
        })
        .await?
    }

    async fn list_usage(&self) -> Result<Vec<UsageRecord>, StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<UsageRecord>, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let mut stmt = conn.prepare(
                "SELECT user_id, service_name, endpoint, status_code, latency_ms,
                        model, input_tokens, output_tokens, estimated_cost, created_at_ms
                 FROM usage_log ORDER BY created_at_ms, id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(UsageRecord {
                    user_id: row.get(0)?,
                    service_name: row.get(1)?,
                    endpoint: row.get(2)?,
                    status_code: row.get(3)?,
                    latency_ms: i64_to_u64(row.get(4)?),
                    model: row.get(5)?,
                    input_tokens: i64_to_u64(row.get(6)?),
                    output_tokens: i64_to_u64(row.get(7)?),
                    estimated_cost: row.get(8)?,
                    created_at_ms: i64_to_u64(row.get(9)?),
                })
            })?;

            let mut records = Vec::new();
            for row in rows {
                records.push(row?);
            }
            Ok(records)
        })
        .await?
    }

    async fn load_rates(&self) -> Result<Vec<PricingRateRow>, StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<PricingRateRow>, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let mut stmt = conn.prepare(
                "SELECT model, tier, category, input_per_million, output_per_million,
                        cached_input_per_million
                 FROM pricing_rates ORDER BY tier, category, model",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(PricingRateRow {
                    model: row.get(0)?,
                    tier: row.get(1)?,
                    category: row.get(2)?,
                    input_per_million: row.get(3)?,
                    output_per_million: row.get(4)?,
                    cached_input_per_million: row.get(5)?,
                })
            })?;

            let mut rates = Vec::new();
            for row in rows {
                rates.push(row?);
            }
            Ok(rates)
        })
        .await?
    }

    async fn replace_rates(&self, rows: Vec<PricingRateRow>) -> Result<(), StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;

            let tx = conn.transaction()?;
            tx.execute("DELETE FROM pricing_rates", [])?;
            for row in rows {
                tx.execute(
                    "INSERT INTO pricing_rates (
                        model, tier, category, input_per_million, output_per_million,
                        cached_input_per_million
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    rusqlite::params![
                        row.model,
                        row.tier,
                        row.category,
                        row.input_per_million,
                        row.output_per_million,
                        row.cached_input_per_million,
                    ],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await?
    }
}

fn open_connection(path: PathBuf) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS usage_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            service_name TEXT NOT NULL,
            endpoint TEXT NOT NULL,
            status_code INTEGER NOT NULL,
            latency_ms INTEGER NOT NULL,
            model TEXT NOT NULL,
            input_tokens INTEGER NOT NULL,
            output_tokens INTEGER NOT NULL,
            estimated_cost REAL NOT NULL,
            created_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_usage_log_created_at
            ON usage_log(created_at_ms);

        CREATE TABLE IF NOT EXISTS pricing_rates (
            model TEXT NOT NULL,
            tier TEXT NOT NULL DEFAULT 'standard',
            category TEXT NOT NULL DEFAULT 'text',
            input_per_million REAL NOT NULL,
            output_per_million REAL NOT NULL,
            cached_input_per_million REAL NOT NULL DEFAULT 0,
            PRIMARY KEY (model, tier, category)
        );",
    )
}

fn u64_to_i64(value: u64) -> i64 {
    if value > i64::MAX as u64 {
        i64::MAX
    } else {
        value as i64
    }
}

fn i64_to_u64(value: i64) -> u64 {
    if value <= 0 { 0 } else { value as u64 }
}
