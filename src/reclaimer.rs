//! Periodic eviction of idle limiter state.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::limits::RequestLimiter;
use crate::lockout::LockoutLimiter;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReclaimReport {
    pub request_windows_evicted: usize,
    pub lockouts_evicted: usize,
}

/// Sweeps both limiters. Each shard is locked only while it is being swept,
/// so live traffic on other shards is never blocked.
#[derive(Debug, Clone)]
pub struct Reclaimer {
    requests: Arc<RequestLimiter>,
    lockout: Arc<LockoutLimiter>,
}

impl Reclaimer {
    pub fn new(requests: Arc<RequestLimiter>, lockout: Arc<LockoutLimiter>) -> Self {
        Self { requests, lockout }
    }

    pub fn sweep(&self) -> ReclaimReport {
        let report = ReclaimReport {
            request_windows_evicted: self.requests.reclaim_idle(),
            lockouts_evicted: self.lockout.reclaim_idle(),
        };
        tracing::debug!(
            request_windows_evicted = report.request_windows_evicted,
            lockouts_evicted = report.lockouts_evicted,
            tracked_clients = self.requests.tracked_clients(),
            tracked_accounts = self.lockout.tracked_accounts(),
            "reclaimer sweep finished"
        );
        report
    }

    /// Runs [`sweep`](Self::sweep) every `period` until the handle is shut
    /// down. The first sweep happens one full period after spawning.
    pub fn spawn(self, period: Duration) -> ReclaimerHandle {
        let token = CancellationToken::new();
        let child = token.clone();
        let period = period.max(Duration::from_secs(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sweep();
                    }
                }
            }
            tracing::debug!("reclaimer stopped");
        });

        ReclaimerHandle {
            token,
            handle: Some(handle),
        }
    }
}

/// Owns the running reclaimer task. Dropping it cancels the task.
#[derive(Debug)]
pub struct ReclaimerHandle {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ReclaimerHandle {
    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Cancels the task and waits for it to exit.
    pub async fn shutdown(mut self) {
        self.token.cancel();
        let Some(handle) = self.handle.take() else {
            return;
        };
        if let Err(err) = handle.await {
            tracing::warn!(error = %err, "reclaimer task ended abnormally");
        }
    }
}

impl Drop for ReclaimerHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
