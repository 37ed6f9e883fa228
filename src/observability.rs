use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::Layer as _;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardStatsSnapshot {
    pub requests_admitted: u64,
    pub requests_rejected: u64,
    pub logins_refused: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_backend_errors: u64,
    pub degraded_responses: u64,
    pub usage_recorded: u64,
}

/// Lock-free counters shared by every component of a guard.
#[derive(Debug, Default)]
pub struct GuardStats {
    requests_admitted: AtomicU64,
    requests_rejected: AtomicU64,
    logins_refused: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_backend_errors: AtomicU64,
    degraded_responses: AtomicU64,
    usage_recorded: AtomicU64,
}

impl GuardStats {
    pub fn record_request(&self, admitted: bool) {
        if admitted {
            bump(&self.requests_admitted);
        } else {
            bump(&self.requests_rejected);
        }
    }

    pub fn record_login_refused(&self) {
        bump(&self.logins_refused);
    }

    pub fn record_cache_hit(&self) {
        bump(&self.cache_hits);
    }

    pub fn record_cache_miss(&self) {
        bump(&self.cache_misses);
    }

    pub fn record_cache_backend_error(&self) {
        bump(&self.cache_backend_errors);
    }

    pub fn record_degraded(&self) {
        bump(&self.degraded_responses);
    }

    pub fn record_usage(&self) {
        bump(&self.usage_recorded);
    }

    pub fn snapshot(&self) -> GuardStatsSnapshot {
        GuardStatsSnapshot {
            requests_admitted: self.requests_admitted.load(Ordering::Relaxed),
            requests_rejected: self.requests_rejected.load(Ordering::Relaxed),
            logins_refused: self.logins_refused.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_backend_errors: self.cache_backend_errors.load(Ordering::Relaxed),
            degraded_responses: self.degraded_responses.load(Ordering::Relaxed),
            usage_recorded: self.usage_recorded.load(Ordering::Relaxed),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Installs the global subscriber. `RUST_LOG` overrides the `info` default.
pub fn init_tracing(json_logs: bool) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let fmt_layer = if json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(false).boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_events() {
        let stats = GuardStats::default();
        stats.record_request(true);
        stats.record_request(true);
        stats.record_request(false);
        stats.record_cache_backend_error();
        stats.record_degraded();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.requests_admitted, 2);
        assert_eq!(snapshot.requests_rejected, 1);
        assert_eq!(snapshot.cache_backend_errors, 1);
        assert_eq!(snapshot.degraded_responses, 1);
        assert_eq!(snapshot.cache_hits, 0);
    }
}
