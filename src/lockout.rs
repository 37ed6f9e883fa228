//! Failed-login lockout keyed by account.
//!
//! Each account keeps the timestamps of its recent failures. Timestamps older
//! than the window are pruned lazily on every touch; once `max_attempts`
//! failures remain inside the window further attempts are refused until the
//! oldest of them ages out.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::clock::Clock;
use crate::config::LockoutConfig;
use crate::keys::AccountKey;
use crate::limits::Decision;
use crate::shards::ShardedMap;

pub struct LockoutLimiter {
    window_secs: u64,
    max_attempts: usize,
    attempts: ShardedMap<VecDeque<u64>>,
    clock: Arc<dyn Clock>,
}

impl LockoutLimiter {
    pub fn new(config: &LockoutConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            window_secs: config.window_secs,
            max_attempts: config.max_attempts.max(1) as usize,
            attempts: ShardedMap::new(config.shards),
            clock,
        }
    }

    pub fn is_allowed(&self, account: &AccountKey) -> Decision {
        let now = self.clock.now_epoch_seconds();
        let decision = self
            .attempts
            .with_existing(account.as_str(), |attempts| {
                prune(attempts, now, self.window_secs);
                if attempts.len() < self.max_attempts {
                    return Decision::allow();
                }
                // The deque never holds more than `max_attempts` entries, so
                // the lock lifts when its oldest entry leaves the window.
                let oldest = attempts.front().copied().unwrap_or(now);
                let elapsed = now.saturating_sub(oldest);
                Decision::reject(self.window_secs.saturating_sub(elapsed))
            })
            .unwrap_or_else(Decision::allow);

        if !decision.allowed {
            tracing::info!(
                account = %account,
                retry_after_seconds = decision.retry_after_seconds,
                "login attempt refused, account locked"
            );
        }
        decision
    }

    pub fn record_failure(&self, account: &AccountKey) {
        let now = self.clock.now_epoch_seconds();
        let failures = self.attempts.with_entry(
            account.as_str(),
            VecDeque::new,
            |attempts| {
                prune(attempts, now, self.window_secs);
                attempts.push_back(now);
                while attempts.len() > self.max_attempts {
                    attempts.pop_front();
                }
                attempts.len()
            },
        );

        if failures >= self.max_attempts {
            tracing::warn!(account = %account, failures, "account locked after repeated failures");
        } else {
            tracing::debug!(account = %account, failures, "failed login recorded");
        }
    }

    /// Forgets every recorded failure, e.g. after a successful login.
    pub fn clear(&self, account: &AccountKey) {
        if self.attempts.remove(account.as_str()).is_some() {
            tracing::debug!(account = %account, "login failures cleared");
        }
    }

    pub fn failure_count(&self, account: &AccountKey) -> usize {
        let now = self.clock.now_epoch_seconds();
        self.attempts
            .with_existing(account.as_str(), |attempts| {
                prune(attempts, now, self.window_secs);
                attempts.len()
            })
            .unwrap_or(0)
    }

    pub fn tracked_accounts(&self) -> usize {
        self.attempts.len()
    }

    /// Prunes every account and drops the ones left without failures.
    pub fn reclaim_idle(&self) -> usize {
        let now = self.clock.now_epoch_seconds();
        self.attempts.retain(|_, attempts| {
            prune(attempts, now, self.window_secs);
            !attempts.is_empty()
        })
    }
}

impl std::fmt::Debug for LockoutLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockoutLimiter")
            .field("window_secs", &self.window_secs)
            .field("max_attempts", &self.max_attempts)
            .field("tracked_accounts", &self.tracked_accounts())
            .finish()
    }
}

fn prune(attempts: &mut VecDeque<u64>, now: u64, window_secs: u64) {
    while let Some(&oldest) = attempts.front() {
        if now.saturating_sub(oldest) < window_secs {
            break;
        }
        attempts.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;

    fn setup() -> (Arc<ManualClock>, LockoutLimiter, AccountKey) {
        let clock = Arc::new(ManualClock::new(10_000));
        let limiter = LockoutLimiter::new(&LockoutConfig::default(), clock.clone());
        let account = AccountKey::parse("user@example.com").unwrap();
        (clock, limiter, account)
    }

    #[test]
    fn five_failures_lock_until_the_window_passes() {
        let (clock, limiter, account) = setup();
        for _ in 0..5 {
            assert!(limiter.is_allowed(&account).allowed);
            limiter.record_failure(&account);
        }
        assert!(!limiter.is_allowed(&account).allowed);

        clock.advance(Duration::from_secs(10 * 60));
        let decision = limiter.is_allowed(&account);
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after_seconds, 300);

        clock.advance(Duration::from_secs(6 * 60));
        assert!(limiter.is_allowed(&account).allowed);
        assert_eq!(limiter.failure_count(&account), 0);
    }

    #[test]
    fn clear_unlocks_immediately() {
        let (_clock, limiter, account) = setup();
        for _ in 0..12 {
            limiter.record_failure(&account);
        }
        assert!(!limiter.is_allowed(&account).allowed);

        limiter.clear(&account);
        assert!(limiter.is_allowed(&account).allowed);
        assert_eq!(limiter.failure_count(&account), 0);
    }

    #[test]
    fn retry_hint_tracks_the_oldest_retained_failure() {
        let (clock, limiter, account) = setup();
        for _ in 0..5 {
            limiter.record_failure(&account);
            clock.advance(Duration::from_secs(60));
        }
        // Failures at +0..+4 min; now at +5 min.
        let decision = limiter.is_allowed(&account);
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after_seconds, 600);

        // Oldest failure ages out at +15 min, leaving four.
        clock.advance(Duration::from_secs(600));
        assert!(limiter.is_allowed(&account).allowed);
        assert_eq!(limiter.failure_count(&account), 4);
    }

    #[test]
    fn lockout_is_independent_per_account() {
        let (_clock, limiter, account) = setup();
        let other = AccountKey::parse("other@example.com").unwrap();
        for _ in 0..5 {
            limiter.record_failure(&account);
        }
        assert!(!limiter.is_allowed(&account).allowed);
        assert!(limiter.is_allowed(&other).allowed);
    }

    #[test]
    fn reclaim_drops_only_accounts_without_live_failures() {
        let (clock, limiter, account) = setup();
        let recent = AccountKey::parse("recent@example.com").unwrap();
        limiter.record_failure(&account);
        clock.advance(Duration::from_secs(14 * 60));
        limiter.record_failure(&recent);
        clock.advance(Duration::from_secs(2 * 60));

        assert_eq!(limiter.reclaim_idle(), 1);
        assert_eq!(limiter.tracked_accounts(), 1);
        assert_eq!(limiter.failure_count(&recent), 1);
    }

    #[test]
    fn concurrent_failures_all_count() {
        let clock = Arc::new(ManualClock::new(0));
        let config = LockoutConfig {
            max_attempts: 1_000,
            ..LockoutConfig::default()
        };
        let limiter = Arc::new(LockoutLimiter::new(&config, clock));
        let account = AccountKey::parse("hot@example.com").unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let account = account.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        limiter.record_failure(&account);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(limiter.failure_count(&account), 800);
    }
}
