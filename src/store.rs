//! Durable per-account, per-day usage counters.
//!
//! Stores expose increments as a single atomic upsert. Callers never read a
//! counter, add to it, and write it back; concurrent increments for the same
//! `(account, date)` are serialised by the store itself.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::Date;

use crate::error::StoreError;
use crate::keys::AccountKey;

#[cfg(feature = "store-sqlite")]
pub mod sqlite;

#[cfg(feature = "store-sqlite")]
pub use sqlite::SqliteUsageStore;

/// The two metered external services.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Meter {
    /// Tokens consumed by the text-generation backend.
    GenerationTokens,
    /// Calls made to the news lookup service.
    NewsLookups,
}

impl Meter {
    pub const ALL: [Meter; 2] = [Meter::GenerationTokens, Meter::NewsLookups];

    pub fn as_str(self) -> &'static str {
        match self {
            Meter::GenerationTokens => "generation_tokens",
            Meter::NewsLookups => "news_lookups",
        }
    }
}

impl fmt::Display for Meter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub account: AccountKey,
    pub date: Date,
    pub generation_tokens: u64,
    pub news_lookups: u64,
}

impl UsageRecord {
    pub fn zero(account: AccountKey, date: Date) -> Self {
        Self {
            account,
            date,
            generation_tokens: 0,
            news_lookups: 0,
        }
    }

    pub fn used(&self, meter: Meter) -> u64 {
        match meter {
            Meter::GenerationTokens => self.generation_tokens,
            Meter::NewsLookups => self.news_lookups,
        }
    }
}

#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Atomically adds `amount` to `meter` for `(account, date)`, creating the
    /// row if it does not exist yet.
    async fn increment(
        &self,
        account: &AccountKey,
        date: Date,
        meter: Meter,
        amount: u64,
    ) -> Result<(), StoreError>;

    /// Reads the row without creating it. Absence means zero usage.
    async fn read(
        &self,
        account: &AccountKey,
        date: Date,
    ) -> Result<Option<UsageRecord>, StoreError>;

    /// Creates a zero row if missing and returns the current row.
    async fn ensure(&self, account: &AccountKey, date: Date) -> Result<UsageRecord, StoreError>;

    async fn list_for_date(&self, date: Date) -> Result<Vec<UsageRecord>, StoreError>;
}

/// Process-local store. Counters do not survive a restart.
#[derive(Debug, Default)]
pub struct MemoryUsageStore {
    rows: Mutex<BTreeMap<(Date, AccountKey), Counters>>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    generation_tokens: u64,
    news_lookups: u64,
}

impl MemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(account: AccountKey, date: Date, counters: Counters) -> UsageRecord {
        UsageRecord {
            account,
            date,
            generation_tokens: counters.generation_tokens,
            news_lookups: counters.news_lookups,
        }
    }
}

#[async_trait]
impl UsageStore for MemoryUsageStore {
    async fn increment(
        &self,
        account: &AccountKey,
        date: Date,
        meter: Meter,
        amount: u64,
    ) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        let counters = rows.entry((date, account.clone())).or_default();
        let slot = match meter {
            Meter::GenerationTokens => &mut counters.generation_tokens,
            Meter::NewsLookups => &mut counters.news_lookups,
        };
        *slot = slot.saturating_add(amount);
        Ok(())
    }

    async fn read(
        &self,
        account: &AccountKey,
        date: Date,
    ) -> Result<Option<UsageRecord>, StoreError> {
        let rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(rows
            .get(&(date, account.clone()))
            .map(|counters| Self::record(account.clone(), date, *counters)))
    }

    async fn ensure(&self, account: &AccountKey, date: Date) -> Result<UsageRecord, StoreError> {
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        let counters = *rows.entry((date, account.clone())).or_default();
        Ok(Self::record(account.clone(), date, counters))
    }

    async fn list_for_date(&self, date: Date) -> Result<Vec<UsageRecord>, StoreError> {
        let rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(rows
            .iter()
            .filter(|((row_date, _), _)| *row_date == date)
            .map(|((row_date, account), counters)| {
                Self::record(account.clone(), *row_date, *counters)
            })
            .collect())
    }
}
