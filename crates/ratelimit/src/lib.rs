//! Tiered admission control for the submission surface.
//!
//! ## Design
//!
//! - A small ordered table of route prefixes, matched longest-prefix-first,
//!   with a global default budget when nothing matches
//! - Each (route, tier) pair has a budget of N requests per fixed window
//! - One bucket per (route, tier, principal); buckets are independent, so a
//!   burst from one principal never touches another principal's budget
//! - The bucket counter is a single atomic word updated by compare-and-swap;
//!   a denied request never modifies it
//! - Tier is resolved per request through [`SubscriptionDirectory`]

pub mod bucket;
pub mod config;
pub mod limiter;
pub mod tier;

pub use config::{Budget, LimitConfigError, RateLimitConfig, RouteLimit, TierBudgets};
pub use limiter::{Decision, RateLimiter};
pub use tier::{StaticSubscriptions, SubscriptionDirectory, Tier};
