//! Budgets and the route table.

use std::time::Duration;

use thiserror::Error;

use crate::tier::Tier;

/// N requests per fixed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    pub requests: u32,
    pub window: Duration,
}

impl Budget {
    pub const fn new(requests: u32, window: Duration) -> Self {
        Self { requests, window }
    }

    pub const fn per_minute(requests: u32) -> Self {
        Self::new(requests, Duration::from_secs(60))
    }

    pub(crate) fn window_ms(&self) -> u64 {
        self.window.as_millis().max(1) as u64
    }
}

impl core::fmt::Display for Budget {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let window = self.window.as_secs_f64();
        if window.fract() == 0.0 {
            write!(f, "{}/{}s", self.requests, window as u64)
        } else {
            write!(f, "{}/{}ms", self.requests, self.window.as_millis())
        }
    }
}

/// One budget per tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierBudgets {
    pub free: Budget,
    pub basic: Budget,
    pub pro: Budget,
}

impl TierBudgets {
    pub const fn new(free: Budget, basic: Budget, pro: Budget) -> Self {
        Self { free, basic, pro }
    }

    pub fn get(&self, tier: Tier) -> Budget {
        match tier {
            Tier::Free => self.free,
            Tier::Basic => self.basic,
            Tier::Pro => self.pro,
        }
    }

    fn budgets(&self) -> [Budget; 3] {
        [self.free, self.basic, self.pro]
    }
}

/// Budgets for every path under `prefix`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteLimit {
    pub prefix: String,
    pub budgets: TierBudgets,
}

impl RouteLimit {
    /// Segment-aware prefix match: `/tasks` matches `/tasks` and `/tasks/1`,
    /// not `/tasksets`.
    pub fn matches(&self, path: &str) -> bool {
        let Some(rest) = path.strip_prefix(self.prefix.as_str()) else {
            return false;
        };
        rest.is_empty() || self.prefix.ends_with('/') || rest.starts_with('/')
    }
}

/// Route table plus the global fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub routes: Vec<RouteLimit>,
    pub default: TierBudgets,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::new(TierBudgets::new(
            Budget::per_minute(60),
            Budget::per_minute(300),
            Budget::per_minute(1200),
        ))
        .route(
            "/tasks",
            TierBudgets::new(
                Budget::per_minute(30),
                Budget::per_minute(120),
                Budget::per_minute(600),
            ),
        )
    }
}

impl RateLimitConfig {
    pub fn new(default: TierBudgets) -> Self {
        Self {
            routes: Vec::new(),
            default,
        }
    }

    pub fn route(mut self, prefix: impl Into<String>, budgets: TierBudgets) -> Self {
        self.routes.push(RouteLimit {
            prefix: prefix.into(),
            budgets,
        });
        self
    }

    pub(crate) fn validate(&self) -> Result<(), LimitConfigError> {
        for r in &self.routes {
            if !r.prefix.starts_with('/') {
                return Err(LimitConfigError::InvalidPrefix(r.prefix.clone()));
            }
            if self.routes.iter().filter(|o| o.prefix == r.prefix).count() > 1 {
                return Err(LimitConfigError::DuplicatePrefix(r.prefix.clone()));
            }
        }
        let all = self
            .routes
            .iter()
            .flat_map(|r| r.budgets.budgets())
            .chain(self.default.budgets());
        for b in all {
            if b.window.is_zero() {
                return Err(LimitConfigError::ZeroWindow);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LimitConfigError {
    #[error("route prefix must start with '/': {0}")]
    InvalidPrefix(String),
    #[error("route prefix configured twice: {0}")]
    DuplicatePrefix(String),
    #[error("budget window must be non-zero")]
    ZeroWindow,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_match_respects_segments() {
        let r = RouteLimit {
            prefix: "/tasks".into(),
            budgets: RateLimitConfig::default().default,
        };
        assert!(r.matches("/tasks"));
        assert!(r.matches("/tasks/123"));
        assert!(!r.matches("/tasksets"));
        assert!(!r.matches("/health"));
    }

    #[test]
    fn budget_display() {
        assert_eq!(Budget::per_minute(30).to_string(), "30/60s");
        assert_eq!(
            Budget::new(5, Duration::from_millis(1500)).to_string(),
            "5/1500ms"
        );
    }

    #[test]
    fn validation_rejects_bad_tables() {
        let b = Budget::per_minute(1);
        let tb = TierBudgets::new(b, b, b);
        assert_eq!(
            RateLimitConfig::new(tb).route("tasks", tb).validate(),
            Err(LimitConfigError::InvalidPrefix("tasks".into()))
        );
        assert_eq!(
            RateLimitConfig::new(tb).route("/a", tb).route("/a", tb).validate(),
            Err(LimitConfigError::DuplicatePrefix("/a".into()))
        );
        let zero = Budget::new(1, Duration::ZERO);
        assert_eq!(
            RateLimitConfig::new(TierBudgets::new(zero, b, b)).validate(),
            Err(LimitConfigError::ZeroWindow)
        );
        assert!(RateLimitConfig::default().validate().is_ok());
    }
}
