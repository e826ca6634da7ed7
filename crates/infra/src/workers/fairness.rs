//! Lane choice with bounded starvation.
//!
//! Strict priority normally: high, then medium, then low. Each lower lane
//! counts how many picks it lost while it had claimable work; once that reaches
//! its `max_skips` the lane gets the next pick regardless of priority.

use taskforge_tasks::{Lane, LaneDepths};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FairnessConfig {
    /// Picks medium may lose to high before it is served
    pub medium_max_skips: u32,
    /// Picks low may lose to higher lanes before it is served
    pub low_max_skips: u32,
}

impl Default for FairnessConfig {
    fn default() -> Self {
        Self {
            medium_max_skips: 8,
            low_max_skips: 16,
        }
    }
}

impl FairnessConfig {
    pub fn with_medium_max_skips(mut self, skips: u32) -> Self {
        self.medium_max_skips = skips;
        self
    }

    pub fn with_low_max_skips(mut self, skips: u32) -> Self {
        self.low_max_skips = skips;
        self
    }

    fn max_skips(&self, lane: Lane) -> Option<u32> {
        match lane {
            Lane::High => None,
            Lane::Medium => Some(self.medium_max_skips),
            Lane::Low => Some(self.low_max_skips),
        }
    }
}

/// Shared by all workers of a pool (behind a mutex).
#[derive(Debug, Clone)]
pub struct LaneSelector {
    config: FairnessConfig,
    skips: [u32; 3],
}

fn slot(lane: Lane) -> usize {
    match lane {
        Lane::High => 0,
        Lane::Medium => 1,
        Lane::Low => 2,
    }
}

fn ready(depths: &LaneDepths) -> Vec<Lane> {
    Lane::ALL
        .into_iter()
        .filter(|l| depths.get(*l) > 0)
        .collect()
}

impl LaneSelector {
    pub fn new(config: FairnessConfig) -> Self {
        Self {
            config,
            skips: [0; 3],
        }
    }

    /// Lanes to try, in order, given the current ready depths.
    ///
    /// The first entry is the fair pick; the rest are fallbacks for when the
    /// claim on the pick loses a race. Empty lanes are left out. Nothing is
    /// counted until [`LaneSelector::record`] names the lane actually served.
    pub fn order(&self, depths: &LaneDepths) -> Vec<Lane> {
        let ready = ready(depths);
        let Some(first) = self.pick_from(&ready) else {
            return Vec::new();
        };
        let mut order = vec![first];
        order.extend(ready.into_iter().filter(|l| *l != first));
        order
    }

    /// Account for a claim served from `served` while `depths` were ready.
    pub fn record(&mut self, served: Lane, depths: &LaneDepths) {
        for lane in ready(depths) {
            let skips = &mut self.skips[slot(lane)];
            *skips = if lane == served { 0 } else { skips.saturating_add(1) };
        }
    }

    /// The single fair pick, recorded as served.
    pub fn pick(&mut self, depths: &LaneDepths) -> Option<Lane> {
        let lane = self.order(depths).into_iter().next()?;
        self.record(lane, depths);
        Some(lane)
    }

    fn pick_from(&self, ready: &[Lane]) -> Option<Lane> {
        // Among starving lanes the one furthest past its budget goes first; ties go low.
        let starving = ready
            .iter()
            .copied()
            .filter_map(|lane| {
                let max = self.config.max_skips(lane)?;
                let skips = self.skips[slot(lane)];
                (skips >= max).then_some((skips - max, lane))
            })
            .max_by_key(|(overshoot, _)| *overshoot)
            .map(|(_, lane)| lane);
        starving.or_else(|| ready.first().copied())
    }

    pub fn skips(&self, lane: Lane) -> u32 {
        self.skips[slot(lane)]
    }
}

impl Default for LaneSelector {
    fn default() -> Self {
        Self::new(FairnessConfig::default())
    }
}
