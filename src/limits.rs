//! Per-client request limiter over a fixed-length window.
//!
//! A window opens on the first request from a client and is reset once
//! `window` has elapsed since it opened. The reset is a hard reset: a
//! client may spend its whole budget right before a reset and again right
//! after it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::config::RequestLimitConfig;
use crate::error::GuardError;
use crate::keys::ClientKey;
use crate::shards::ShardedMap;

/// Outcome of an admission check.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub allowed: bool,
    pub retry_after_seconds: u64,
}

impl Decision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            retry_after_seconds: 0,
        }
    }

    /// Rejection; the retry hint is never reported as zero.
    pub fn reject(retry_after_seconds: u64) -> Self {
        Self {
            allowed: false,
            retry_after_seconds: retry_after_seconds.max(1),
        }
    }

    pub fn into_result(
        self,
        on_reject: impl FnOnce(u64) -> GuardError,
    ) -> Result<(), GuardError> {
        if self.allowed {
            Ok(())
        } else {
            Err(on_reject(self.retry_after_seconds))
        }
    }
}

#[derive(Debug, Clone)]
struct RequestWindow {
    count: u32,
    window_start: u64,
}

pub struct RequestLimiter {
    window_secs: u64,
    max_requests: u32,
    windows: ShardedMap<RequestWindow>,
    clock: Arc<dyn Clock>,
}

impl RequestLimiter {
    pub fn new(config: &RequestLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            window_secs: config.window_secs,
            max_requests: config.max_requests,
            windows: ShardedMap::new(config.shards),
            clock,
        }
    }

    pub fn admit(&self, client: &ClientKey) -> Decision {
        let now = self.clock.now_epoch_seconds();
        let decision = self.windows.with_entry(
            client.as_str(),
            || RequestWindow {
                count: 0,
                window_start: now,
            },
            |window| {
                if now.saturating_sub(window.window_start) >= self.window_secs {
                    window.count = 0;
                    window.window_start = now;
                }
                if window.count >= self.max_requests {
                    let elapsed = now.saturating_sub(window.window_start);
                    return Decision::reject(self.window_secs.saturating_sub(elapsed));
                }
                window.count += 1;
                Decision::allow()
            },
        );

        if !decision.allowed {
            tracing::debug!(
                client = %client,
                retry_after_seconds = decision.retry_after_seconds,
                "request rate limit exceeded"
            );
        }
        decision
    }

    /// Requests counted in the client's current window.
    pub fn request_count(&self, client: &ClientKey) -> Option<u32> {
        self.windows
            .with_existing(client.as_str(), |window| window.count)
    }

    pub fn tracked_clients(&self) -> usize {
        self.windows.len()
    }

    /// Drops windows that have fully elapsed. Such a window would be reset by
    /// the next request anyway, so dropping it never changes a decision.
    pub fn reclaim_idle(&self) -> usize {
        let now = self.clock.now_epoch_seconds();
        self.windows
            .retain(|_, window| now.saturating_sub(window.window_start) < self.window_secs)
    }
}

impl std::fmt::Debug for RequestLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestLimiter")
            .field("window_secs", &self.window_secs)
            .field("max_requests", &self.max_requests)
            .field("tracked_clients", &self.tracked_clients())
            .finish()
    }
}
