//! The admission decision.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use taskforge_core::OwnerId;

use crate::bucket::WindowCounter;
use crate::config::{Budget, LimitConfigError, RateLimitConfig, RouteLimit};
use crate::tier::Tier;

/// Sweep expired buckets once per this many admissions.
const PRUNE_EVERY: u64 = 4096;

/// Outcome of [`RateLimiter::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow {
        limit: Budget,
        remaining: u32,
        /// Time until the current window ends
        reset_after: Duration,
    },
    Deny {
        limit: Budget,
        /// Wait until the next request can be admitted. At most one window
        /// past the end of the caller's own window.
        retry_after: Duration,
    },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow { .. })
    }

    pub fn limit(&self) -> Budget {
        match self {
            Decision::Allow { limit, .. } | Decision::Deny { limit, .. } => *limit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BucketKey {
    /// Index into the sorted route table; `None` for the global default
    route: Option<usize>,
    tier: Tier,
    principal: OwnerId,
}

/// Tiered fixed-window rate limiter.
///
/// Bucket lookup takes a shared read lock; the write lock is only taken the
/// first time a key is seen (and by [`RateLimiter::prune`]). Counting itself
/// is lock-free.
#[derive(Debug)]
pub struct RateLimiter {
    routes: Vec<RouteLimit>,
    default: crate::config::TierBudgets,
    buckets: RwLock<HashMap<BucketKey, Arc<WindowCounter>>>,
    admissions: AtomicU64,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Result<Self, LimitConfigError> {
        config.validate()?;
        let mut routes = config.routes;
        // Longest prefix first
        routes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Ok(Self {
            routes,
            default: config.default,
            buckets: RwLock::new(HashMap::new()),
            admissions: AtomicU64::new(0),
        })
    }

    /// Budget that applies to `path` for `tier`.
    pub fn budget_for(&self, path: &str, tier: Tier) -> Budget {
        self.resolve(path, tier).1
    }

    fn resolve(&self, path: &str, tier: Tier) -> (Option<usize>, Budget) {
        match self.routes.iter().position(|r| r.matches(path)) {
            Some(idx) => (Some(idx), self.routes[idx].budgets.get(tier)),
            None => (None, self.default.get(tier)),
        }
    }

    /// Decide whether one request may pass.
    pub fn admit(&self, path: &str, principal: &OwnerId, tier: Tier, now: DateTime<Utc>) -> Decision {
        let (route, limit) = self.resolve(path, tier);
        let window_ms = limit.window_ms();
        let now_ms = now.timestamp_millis().max(0) as u64;
        let window = now_ms / window_ms;

        let key = BucketKey {
            route,
            tier,
            principal: principal.clone(),
        };
        let counter = self.counter(key);

        if self.admissions.fetch_add(1, Ordering::Relaxed) % PRUNE_EVERY == PRUNE_EVERY - 1 {
            self.prune(now);
        }

        let admission = counter.try_acquire(window, limit.requests);
        // The counter may already sit in a later window than this caller's clock.
        let counted = admission.window.max(window);
        let until_reset = Duration::from_millis((counted + 1) * window_ms - now_ms);

        match admission.remaining {
            Some(remaining) => Decision::Allow {
                limit,
                remaining,
                reset_after: until_reset,
            },
            None => {
                debug!(
                    path,
                    principal = %principal,
                    tier = %tier,
                    limit = %limit,
                    retry_after_ms = until_reset.as_millis() as u64,
                    "rate limit exceeded"
                );
                Decision::Deny {
                    limit,
                    retry_after: until_reset,
                }
            }
        }
    }

    fn counter(&self, key: BucketKey) -> Arc<WindowCounter> {
        if let Some(c) = self.buckets.read().unwrap().get(&key) {
            return c.clone();
        }
        self.buckets
            .write()
            .unwrap()
            .entry(key)
            .or_insert_with(|| Arc::new(WindowCounter::new()))
            .clone()
    }

    /// Drop buckets whose window has passed. Returns how many were removed.
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let now_ms = now.timestamp_millis().max(0) as u64;
        let mut buckets = self.buckets.write().unwrap();
        let before = buckets.len();
        buckets.retain(|key, counter| {
            let budget = match key.route {
                Some(idx) => self.routes[idx].budgets.get(key.tier),
                None => self.default.get(key.tier),
            };
            // Someone may be about to count on this bucket.
            Arc::strong_count(counter) > 1 || !counter.is_stale(now_ms / budget.window_ms())
        });
        before - buckets.len()
    }

    /// Number of live buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.read().unwrap().len()
    }
}
