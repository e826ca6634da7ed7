use taskforge_core::OwnerId;
use taskforge_ratelimit::Tier;

/// Caller identity for a request, set by the principal middleware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrincipalContext {
    owner_id: OwnerId,
}

impl PrincipalContext {
    pub fn new(owner_id: OwnerId) -> Self {
        Self { owner_id }
    }

    pub fn owner_id(&self) -> &OwnerId {
        &self.owner_id
    }
}

/// Tier the request was admitted under.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TierContext(pub Tier);
