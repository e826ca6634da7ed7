//! Shared state handed to every route.

use std::sync::Arc;

use taskforge_infra::{InMemoryTaskStore, TaskService, TaskStore};
use taskforge_ratelimit::{LimitConfigError, RateLimitConfig, RateLimiter, StaticSubscriptions, SubscriptionDirectory};

pub struct AppServices {
    pub tasks: TaskService<dyn TaskStore>,
    pub limiter: RateLimiter,
    pub subscriptions: Arc<dyn SubscriptionDirectory>,
}

impl AppServices {
    pub fn new(
        store: Arc<dyn TaskStore>,
        limits: RateLimitConfig,
        subscriptions: Arc<dyn SubscriptionDirectory>,
    ) -> Result<Self, LimitConfigError> {
        Ok(Self {
            tasks: TaskService::new(store),
            limiter: RateLimiter::new(limits)?,
            subscriptions,
        })
    }

    /// In-memory store, default limits, everyone on the free tier.
    pub fn in_memory() -> Result<Self, LimitConfigError> {
        Self::new(
            Arc::new(InMemoryTaskStore::new()),
            RateLimitConfig::default(),
            Arc::new(StaticSubscriptions::default()),
        )
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        self.tasks.store()
    }
}
