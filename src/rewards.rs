//! Forging reward schedule: a pure function from height to reward,
//! milestone, and total supply.
//!
//! Rewards start at `offset` and step down through the configured
//! milestones every `distance` blocks; past the last milestone the final
//! reward applies forever. Supply is the genesis amount plus every reward
//! minted up to the given height.

use crate::{Amount, ChainParams};

#[derive(Clone, Debug)]
pub struct RewardSchedule {
    offset: u32,
    distance: u32,
    milestones: Vec<Amount>,
    supply_base: Amount,
}

impl RewardSchedule {
    pub fn from_params(params: &ChainParams) -> Self {
        RewardSchedule {
            offset: params.reward_offset.max(1),
            distance: params.reward_distance.max(1),
            milestones: params.reward_milestones.clone(),
            supply_base: params.total_amount,
        }
    }

    /// Index into the milestone table for a height.
    pub fn milestone(&self, height: u32) -> usize {
        if height < self.offset {
            return 0;
        }
        let step = ((height - self.offset) / self.distance) as usize;
        step.min(self.milestones.len().saturating_sub(1))
    }

    /// Reward minted by the block at `height`.
    pub fn reward(&self, height: u32) -> Amount {
        if height < self.offset || self.milestones.is_empty() {
            return 0;
        }
        self.milestones[self.milestone(height)]
    }

    /// Total supply after the block at `height`.
    pub fn supply(&self, height: u32) -> Amount {
        let mut supply = self.supply_base;
        if height < self.offset || self.milestones.is_empty() {
            return supply;
        }
        let mut remaining = (height - self.offset + 1) as u128;
        for (i, reward) in self.milestones.iter().enumerate() {
            let band = if i + 1 == self.milestones.len() {
                remaining
            } else {
                remaining.min(self.distance as u128)
            };
            supply += band * reward;
            remaining -= band;
            if remaining == 0 {
                break;
            }
        }
        supply
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule() -> RewardSchedule {
        RewardSchedule {
            offset: 10,
            distance: 100,
            milestones: vec![500, 400, 300, 200, 100],
            supply_base: 1_000_000,
        }
    }

    #[test]
    fn no_reward_before_offset() {
        let s = schedule();
        assert_eq!(s.reward(1), 0);
        assert_eq!(s.reward(9), 0);
        assert_eq!(s.reward(10), 500);
        assert_eq!(s.supply(9), 1_000_000);
    }

    #[test]
    fn milestones_step_down_and_clamp() {
        let s = schedule();
        assert_eq!(s.milestone(10), 0);
        assert_eq!(s.milestone(109), 0);
        assert_eq!(s.milestone(110), 1);
        assert_eq!(s.reward(110), 400);
        // Far past the table: last milestone holds.
        assert_eq!(s.milestone(100_000), 4);
        assert_eq!(s.reward(100_000), 100);
    }

    #[test]
    fn supply_accumulates_exactly() {
        let s = schedule();
        // One rewarded block.
        assert_eq!(s.supply(10), 1_000_000 + 500);
        // Whole first band plus two blocks of the second.
        assert_eq!(s.supply(111), 1_000_000 + 100 * 500 + 2 * 400);
        // Supply is monotonic.
        let mut previous = 0;
        for height in 1..400 {
            let now = s.supply(height);
            assert!(now >= previous);
            previous = now;
        }
    }
}
