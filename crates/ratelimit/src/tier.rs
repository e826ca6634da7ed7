//! Subscription tiers and how they are looked up.

use core::str::FromStr;
use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use taskforge_core::{DomainError, OwnerId};

/// Subscription class selecting a rate-limit budget.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Basic,
    Pro,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Basic => "basic",
            Tier::Pro => "pro",
        }
    }
}

impl core::fmt::Display for Tier {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(Tier::Free),
            "basic" => Ok(Tier::Basic),
            "pro" => Ok(Tier::Pro),
            other => Err(DomainError::validation(format!("unknown tier: {other}"))),
        }
    }
}

/// Source of a principal's current subscription tier.
///
/// Consulted on every admission; implementations must not assume the answer
/// can be cached by the caller.
pub trait SubscriptionDirectory: Send + Sync {
    fn tier_for(&self, principal: &OwnerId) -> Tier;
}

/// In-memory directory for tests/dev.
#[derive(Debug)]
pub struct StaticSubscriptions {
    tiers: RwLock<HashMap<OwnerId, Tier>>,
    default_tier: Tier,
}

impl StaticSubscriptions {
    pub fn new(default_tier: Tier) -> Self {
        Self {
            tiers: RwLock::new(HashMap::new()),
            default_tier,
        }
    }

    pub fn set(&self, principal: OwnerId, tier: Tier) {
        self.tiers.write().unwrap().insert(principal, tier);
    }

    pub fn remove(&self, principal: &OwnerId) {
        self.tiers.write().unwrap().remove(principal);
    }
}

impl Default for StaticSubscriptions {
    fn default() -> Self {
        Self::new(Tier::Free)
    }
}

impl SubscriptionDirectory for StaticSubscriptions {
    fn tier_for(&self, principal: &OwnerId) -> Tier {
        self.tiers
            .read()
            .unwrap()
            .get(principal)
            .copied()
            .unwrap_or(self.default_tier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_reflects_upgrades_immediately() {
        let dir = StaticSubscriptions::default();
        let who: OwnerId = "alice".parse().unwrap();

        assert_eq!(dir.tier_for(&who), Tier::Free);
        dir.set(who.clone(), Tier::Pro);
        assert_eq!(dir.tier_for(&who), Tier::Pro);
        dir.remove(&who);
        assert_eq!(dir.tier_for(&who), Tier::Free);
    }

    #[test]
    fn tier_parses_wire_names() {
        assert_eq!("basic".parse::<Tier>().unwrap(), Tier::Basic);
        assert!("gold".parse::<Tier>().is_err());
    }
}
