use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::OptionalExtension;
use time::Date;

use super::{Meter, UsageRecord, UsageStore};
use crate::clock::{format_date, parse_date};
use crate::config::DEFAULT_STORE_TIMEOUT_MS;
use crate::error::StoreError;
use crate::keys::AccountKey;

/// SQLite-backed usage counters. One row per `(account_id, usage_date)`.
#[derive(Clone, Debug)]
pub struct SqliteUsageStore {
    path: PathBuf,
    timeout: Duration,
}

impl SqliteUsageStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            timeout: Duration::from_millis(DEFAULT_STORE_TIMEOUT_MS),
        }
    }

    /// Bounds every call, including time spent waiting on the database lock.
    ///
    /// SQLite's own busy timeout is set to three quarters of this, so a call
    /// stuck on a lock fails inside SQLite and rolls back before the outer
    /// timeout fires. If the outer timeout fires anyway (slow disk, a blocked
    /// thread pool) the write may still commit after `StoreError::Timeout` was
    /// returned; callers must not retry an increment on timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        self.run(|conn| {
            let _ = conn.execute_batch("PRAGMA journal_mode = WAL;");
            init_schema(conn)?;
            Ok(())
        })
        .await
    }

    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut rusqlite::Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let path = self.path.clone();
        let busy_timeout = self.timeout * 3 / 4;
        let task = tokio::task::spawn_blocking(move || -> Result<T, StoreError> {
            let mut conn = open_connection(path, busy_timeout)?;
            f(&mut conn)
        });

        match tokio::time::timeout(self.timeout, task).await {
            Ok(joined) => joined?,
            Err(_) => Err(StoreError::Timeout {
                timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }
}

#[async_trait]
impl UsageStore for SqliteUsageStore {
    async fn increment(
        &self,
        account: &AccountKey,
        date: Date,
        meter: Meter,
        amount: u64,
    ) -> Result<(), StoreError> {
        let account_id = account.as_str().to_string();
        let usage_date = format_date(date)?;
        let amount_i64 = units_to_i64(amount)?;
        let ts_ms = now_millis();
        let sql = match meter {
            Meter::GenerationTokens => {
                "INSERT INTO api_usage (account_id, usage_date, generation_tokens, news_lookups, updated_at_ms)
                 VALUES (?1, ?2, ?3, 0, ?4)
                 ON CONFLICT(account_id, usage_date) DO UPDATE
                 SET generation_tokens = generation_tokens + excluded.generation_tokens,
                     updated_at_ms = excluded.updated_at_ms"
            }
            Meter::NewsLookups => {
                "INSERT INTO api_usage (account_id, usage_date, generation_tokens, news_lookups, updated_at_ms)
                 VALUES (?1, ?2, 0, ?3, ?4)
                 ON CONFLICT(account_id, usage_date) DO UPDATE
                 SET news_lookups = news_lookups + excluded.news_lookups,
                     updated_at_ms = excluded.updated_at_ms"
            }
        };

        self.run(move |conn| {
            conn.execute(
                sql,
                rusqlite::params![account_id, usage_date, amount_i64, ts_ms],
            )?;
            Ok(())
        })
        .await
    }

    async fn read(
        &self,
        account: &AccountKey,
        date: Date,
    ) -> Result<Option<UsageRecord>, StoreError> {
        let account_id = account.as_str().to_string();
        let usage_date = format_date(date)?;
        self.run(move |conn| select_row(conn, &account_id, &usage_date))
            .await
    }

    async fn ensure(&self, account: &AccountKey, date: Date) -> Result<UsageRecord, StoreError> {
        let account_id = account.as_str().to_string();
        let usage_date = format_date(date)?;
        let ts_ms = now_millis();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO api_usage (account_id, usage_date, generation_tokens, news_lookups, updated_at_ms)
                 VALUES (?1, ?2, 0, 0, ?3)
                 ON CONFLICT(account_id, usage_date) DO NOTHING",
                rusqlite::params![account_id, usage_date, ts_ms],
            )?;
            select_row(conn, &account_id, &usage_date)?.ok_or_else(|| {
                StoreError::Corrupt(format!(
                    "usage row for {account_id} on {usage_date} missing after insert"
                ))
            })
        })
        .await
    }

    async fn list_for_date(&self, date: Date) -> Result<Vec<UsageRecord>, StoreError> {
        let usage_date = format_date(date)?;
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT account_id, usage_date, generation_tokens, news_lookups
                 FROM api_usage
                 WHERE usage_date = ?1
                 ORDER BY account_id",
            )?;
            let rows = stmt.query_map(rusqlite::params![usage_date], raw_row)?;

            let mut out = Vec::new();
            for row in rows {
                out.push(into_record(row?)?);
            }
            Ok(out)
        })
        .await
    }
}

type RawRow = (String, String, i64, i64);

fn raw_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn select_row(
    conn: &rusqlite::Connection,
    account_id: &str,
    usage_date: &str,
) -> Result<Option<UsageRecord>, StoreError> {
    let raw = conn
        .query_row(
            "SELECT account_id, usage_date, generation_tokens, news_lookups
             FROM api_usage
             WHERE account_id = ?1 AND usage_date = ?2",
            rusqlite::params![account_id, usage_date],
            raw_row,
        )
        .optional()?;
    raw.map(into_record).transpose()
}

fn into_record((account_id, usage_date, tokens, lookups): RawRow) -> Result<UsageRecord, StoreError> {
    let account = AccountKey::parse(&account_id)
        .map_err(|err| StoreError::Corrupt(format!("account_id {account_id:?}: {err}")))?;
    let date = parse_date(&usage_date)
        .ok_or_else(|| StoreError::Corrupt(format!("usage_date {usage_date:?}")))?;
    Ok(UsageRecord {
        account,
        date,
        generation_tokens: i64_to_u64(tokens),
        news_lookups: i64_to_u64(lookups),
    })
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS api_usage (
            account_id TEXT NOT NULL,
            usage_date TEXT NOT NULL,
            generation_tokens INTEGER NOT NULL DEFAULT 0 CHECK (generation_tokens >= 0),
            news_lookups INTEGER NOT NULL DEFAULT 0 CHECK (news_lookups >= 0),
            updated_at_ms INTEGER NOT NULL,
            PRIMARY KEY (account_id, usage_date)
        );
        CREATE INDEX IF NOT EXISTS idx_api_usage_date
            ON api_usage(usage_date);",
    )?;
    Ok(())
}

fn open_connection(
    path: PathBuf,
    busy_timeout: Duration,
) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    let _ = conn.busy_timeout(busy_timeout);
    let _ = conn.execute_batch("PRAGMA synchronous = NORMAL;");
    Ok(conn)
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}

fn units_to_i64(units: u64) -> Result<i64, StoreError> {
    i64::try_from(units).map_err(|_| StoreError::AmountOutOfRange(units))
}

fn i64_to_u64(value: i64) -> u64 {
    if value <= 0 { 0 } else { value as u64 }
}
