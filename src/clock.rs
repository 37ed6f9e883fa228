use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use time::format_description::FormatItem;
use time::macros::format_description;
use time::{Date, OffsetDateTime};

/// Wall-clock source shared by every window and day calculation.
pub trait Clock: Send + Sync {
    fn now_epoch_seconds(&self) -> u64;

    /// Calendar day (UTC) that `now_epoch_seconds` falls on.
    fn today(&self) -> Date {
        date_for_epoch_seconds(self.now_epoch_seconds())
    }
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch_seconds(&self) -> u64 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_else(|_| Duration::from_secs(0));
        now.as_secs()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(now_epoch_seconds: u64) -> Self {
        Self {
            now: AtomicU64::new(now_epoch_seconds),
        }
    }

    pub fn set(&self, now_epoch_seconds: u64) {
        self.now.store(now_epoch_seconds, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_secs(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_epoch_seconds(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

pub fn date_for_epoch_seconds(epoch_seconds: u64) -> Date {
    let seconds = i64::try_from(epoch_seconds).unwrap_or(i64::MAX);
    OffsetDateTime::from_unix_timestamp(seconds)
        .map(|ts| ts.date())
        .unwrap_or(Date::MAX)
}

/// `YYYY-MM-DD`, the form dates take in storage and on the command line.
const DATE_FORMAT: &[FormatItem<'_>] = format_description!("[year]-[month]-[day]");

pub fn format_date(date: Date) -> Result<String, time::error::Format> {
    date.format(DATE_FORMAT)
}

pub fn parse_date(raw: &str) -> Option<Date> {
    Date::parse(raw.trim(), DATE_FORMAT).ok()
}
