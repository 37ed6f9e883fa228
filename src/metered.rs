//! Guarded execution of calls against a metered external service.
//!
//! The quota is checked before the call. A reached limit or a failed call
//! yields the caller's fallback, tagged with the reason, and records nothing.
//! A successful call records the units it reports; if that write fails the
//! whole operation fails, since the call's usage would otherwise go uncounted.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::cache::CacheLayer;
use crate::error::GuardError;
use crate::keys::AccountKey;
use crate::observability::GuardStats;
use crate::quota::QuotaEngine;
use crate::store::Meter;

/// What a metered call produced and how many units it consumed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MeteredOutput<T> {
    pub value: T,
    pub units: u64,
}

impl<T> MeteredOutput<T> {
    pub fn new(value: T, units: u64) -> Self {
        Self { value, units }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "meter")]
pub enum DegradeReason {
    LimitReached(Meter),
    CallFailed,
}

impl DegradeReason {
    /// Tag callers prepend to fallback content shown to users.
    pub fn label(&self) -> &'static str {
        match self {
            DegradeReason::LimitReached(_) => "[DAILY LIMIT REACHED]",
            DegradeReason::CallFailed => "[SERVICE UNAVAILABLE]",
        }
    }
}

impl fmt::Display for DegradeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DegradeReason::LimitReached(meter) => write!(f, "daily {meter} limit reached"),
            DegradeReason::CallFailed => f.write_str("metered call failed"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MeteredOutcome<T> {
    /// The call ran and its usage was recorded. `warning` is set when the
    /// meter was already at or above the warning threshold.
    Fresh { value: T, warning: bool },
    /// Served from cache; no quota was checked or spent.
    Cached { value: T },
    Degraded { value: T, reason: DegradeReason },
}

impl<T> MeteredOutcome<T> {
    pub fn value(&self) -> &T {
        match self {
            MeteredOutcome::Fresh { value, .. }
            | MeteredOutcome::Cached { value }
            | MeteredOutcome::Degraded { value, .. } => value,
        }
    }

    pub fn into_value(self) -> T {
        match self {
            MeteredOutcome::Fresh { value, .. }
            | MeteredOutcome::Cached { value }
            | MeteredOutcome::Degraded { value, .. } => value,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, MeteredOutcome::Degraded { .. })
    }

    pub fn degrade_reason(&self) -> Option<DegradeReason> {
        match self {
            MeteredOutcome::Degraded { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

enum Interrupted {
    Degraded(DegradeReason),
    Guard(GuardError),
}

impl From<GuardError> for Interrupted {
    fn from(err: GuardError) -> Self {
        Interrupted::Guard(err)
    }
}

pub struct MeteredRunner {
    engine: Arc<QuotaEngine>,
    cache: Arc<CacheLayer>,
    stats: Arc<GuardStats>,
}

impl MeteredRunner {
    pub fn new(engine: Arc<QuotaEngine>, cache: Arc<CacheLayer>, stats: Arc<GuardStats>) -> Self {
        Self {
            engine,
            cache,
            stats,
        }
    }

    pub async fn run<T, E, F, Fut, D>(
        &self,
        account: &AccountKey,
        meter: Meter,
        call: F,
        fallback: D,
    ) -> Result<MeteredOutcome<T>, GuardError>
    where
        E: fmt::Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<MeteredOutput<T>, E>>,
        D: FnOnce(DegradeReason) -> T,
    {
        match self.attempt(account, meter, call).await {
            Ok((value, warning)) => Ok(MeteredOutcome::Fresh { value, warning }),
            Err(interrupted) => self.degrade(interrupted, fallback),
        }
    }

    /// Like [`run`](Self::run), with successful results cached under
    /// `operation` and `args`. Degraded results are never cached.
    pub async fn run_cached<A, T, E, F, Fut, D>(
        &self,
        operation: &str,
        args: &A,
        account: &AccountKey,
        meter: Meter,
        call: F,
        fallback: D,
    ) -> Result<MeteredOutcome<T>, GuardError>
    where
        A: Serialize + ?Sized,
        T: Serialize + DeserializeOwned,
        E: fmt::Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<MeteredOutput<T>, E>>,
        D: FnOnce(DegradeReason) -> T,
    {
        let ttl = self.cache.ttl_for(operation);
        let attempted = AtomicBool::new(false);
        let warned = AtomicBool::new(false);

        let result = self
            .cache
            .with_cache(operation, args, ttl, || async {
                attempted.store(true, Ordering::Relaxed);
                let (value, warning) = self.attempt(account, meter, call).await?;
                warned.store(warning, Ordering::Relaxed);
                Ok::<T, Interrupted>(value)
            })
            .await;

        match result {
            Ok(value) if attempted.load(Ordering::Relaxed) => Ok(MeteredOutcome::Fresh {
                value,
                warning: warned.load(Ordering::Relaxed),
            }),
            Ok(value) => Ok(MeteredOutcome::Cached { value }),
            Err(interrupted) => self.degrade(interrupted, fallback),
        }
    }

    async fn attempt<T, E, F, Fut>(
        &self,
        account: &AccountKey,
        meter: Meter,
        call: F,
    ) -> Result<(T, bool), Interrupted>
    where
        E: fmt::Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<MeteredOutput<T>, E>>,
    {
        let status = self.engine.check_limits(account).await?;
        if status.limit_reached(meter) {
            return Err(Interrupted::Degraded(DegradeReason::LimitReached(meter)));
        }
        let warning = status.is_warning(meter);

        let output = match call().await {
            Ok(output) => output,
            Err(err) => {
                tracing::warn!(account = %account, meter = %meter, error = %err, "metered call failed, serving fallback");
                return Err(Interrupted::Degraded(DegradeReason::CallFailed));
            }
        };
        self.engine.increment(account, meter, output.units).await?;
        Ok((output.value, warning))
    }

    fn degrade<T, D>(&self, interrupted: Interrupted, fallback: D) -> Result<MeteredOutcome<T>, GuardError>
    where
        D: FnOnce(DegradeReason) -> T,
    {
        match interrupted {
            Interrupted::Degraded(reason) => {
                self.stats.record_degraded();
                tracing::debug!(reason = %reason, "serving degraded response");
                Ok(MeteredOutcome::Degraded {
                    value: fallback(reason),
                    reason,
                })
            }
            Interrupted::Guard(err) => Err(err),
        }
    }
}

impl fmt::Debug for MeteredRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeteredRunner")
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}
