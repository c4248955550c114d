use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{MatrixError, Result};
use crate::registry::{Level, MemberId, ROOT_ID};

/// Which generation of descendants a bump is credited to.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Direct sponsees.
    First,
    /// Sponsees of sponsees.
    Second,
}

impl Tier {
    pub fn capacity(self, width: u32) -> u32 {
        match self {
            Tier::First => width,
            Tier::Second => width.saturating_mul(width),
        }
    }
}

/// Fill state of one (member, level) pair.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct LevelState {
    pub tier1: u32,
    pub tier2: u32,
    pub cycles: u32,
}

impl LevelState {
    pub fn count(&self, tier: Tier) -> u32 {
        match tier {
            Tier::First => self.tier1,
            Tier::Second => self.tier2,
        }
    }

    pub fn has_room(&self, tier: Tier, width: u32) -> bool {
        self.count(tier) < tier.capacity(width)
    }

    pub fn is_full(&self, width: u32) -> bool {
        !self.has_room(Tier::First, width) && !self.has_room(Tier::Second, width)
    }

    /// The state after one more purchase in `tier`, or `None` at capacity.
    pub fn bumped(mut self, tier: Tier, width: u32) -> Option<Self> {
        if !self.has_room(tier, width) {
            return None;
        }
        match tier {
            Tier::First => self.tier1 += 1,
            Tier::Second => self.tier2 += 1,
        }
        Some(self)
    }

    /// Counters zeroed for a new cycle; the cycle counter is kept for audit.
    pub fn reset(self) -> Self {
        Self {
            tier1: 0,
            tier2: 0,
            cycles: self.cycles + 1,
        }
    }
}

/// Read access to level fill state. Root is exempt from capacity.
pub trait LevelView {
    fn width(&self) -> u32;

    fn level_state(&self, member: MemberId, level: Level) -> LevelState;

    fn is_full(&self, member: MemberId, level: Level) -> bool {
        member != ROOT_ID && self.level_state(member, level).is_full(self.width())
    }

    fn has_room(&self, member: MemberId, level: Level, tier: Tier) -> bool {
        member == ROOT_ID || self.level_state(member, level).has_room(tier, self.width())
    }
}

/// Next state for a bump of `tier` against `view`. `None` for Root, which is
/// never counted.
fn bumped_in(
    view: &impl LevelView,
    member: MemberId,
    level: Level,
    tier: Tier,
) -> Result<Option<LevelState>> {
    if member == ROOT_ID {
        return Ok(None);
    }
    view.level_state(member, level)
        .bumped(tier, view.width())
        .map(Some)
        .ok_or(MatrixError::CapacityExceeded {
            member,
            level,
            tier,
        })
}

/// Per (member, level) fill counters. States are created lazily and never
/// removed.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LevelLedger {
    width: u32,
    states: BTreeMap<MemberId, BTreeMap<Level, LevelState>>,
}

impl LevelLedger {
    pub fn new(width: u32) -> Result<Self> {
        if width == 0 {
            return Err(MatrixError::InvalidWidth);
        }
        Ok(Self {
            width,
            states: BTreeMap::new(),
        })
    }

    /// Credit one purchase to `tier` of `(member, level)`. Bumping a saturated
    /// tier is a caller bug and fails without touching the counters.
    pub fn bump(&mut self, member: MemberId, level: Level, tier: Tier) -> Result<()> {
        let mut pending = PendingLevels::new(self);
        pending.bump(member, level, tier)?;
        let writes = pending.into_writes();
        self.commit(writes);
        Ok(())
    }

    pub fn reset_cycle(&mut self, member: MemberId, level: Level) {
        let mut pending = PendingLevels::new(self);
        pending.reset_cycle(member, level);
        let writes = pending.into_writes();
        self.commit(writes);
    }

    /// Apply states staged by [`PendingLevels`].
    pub(crate) fn commit(&mut self, writes: Vec<(MemberId, Level, LevelState)>) {
        for (member, level, state) in writes {
            self.states.entry(member).or_default().insert(level, state);
        }
    }

    /// Every stored state in (member, level) order.
    pub fn entries(&self) -> impl Iterator<Item = (MemberId, Level, &LevelState)> + '_ {
        self.states.iter().flat_map(|(member, levels)| {
            levels
                .iter()
                .map(move |(level, state)| (*member, *level, state))
        })
    }
}

impl LevelView for LevelLedger {
    fn width(&self) -> u32 {
        self.width
    }

    fn level_state(&self, member: MemberId, level: Level) -> LevelState {
        self.states
            .get(&member)
            .and_then(|levels| levels.get(&level))
            .copied()
            .unwrap_or_default()
    }
}

/// Staged level mutations layered over a ledger. Nothing reaches the ledger
/// until [`PendingLevels::into_writes`] is applied by the owner.
pub struct PendingLevels<'a> {
    base: &'a LevelLedger,
    staged: BTreeMap<(MemberId, Level), LevelState>,
}

impl<'a> PendingLevels<'a> {
    pub fn new(base: &'a LevelLedger) -> Self {
        Self {
            base,
            staged: BTreeMap::new(),
        }
    }

    /// Credit one purchase to `tier` of `(member, level)`. Bumping a saturated
    /// tier is a caller bug and fails without staging anything.
    pub fn bump(&mut self, member: MemberId, level: Level, tier: Tier) -> Result<()> {
        if let Some(next) = bumped_in(&*self, member, level, tier)? {
            self.staged.insert((member, level), next);
        }
        Ok(())
    }

    pub fn reset_cycle(&mut self, member: MemberId, level: Level) -> LevelState {
        let next = self.level_state(member, level).reset();
        self.staged.insert((member, level), next);
        next
    }

    pub fn into_writes(self) -> Vec<(MemberId, Level, LevelState)> {
        self.staged
            .into_iter()
            .map(|((member, level), state)| (member, level, state))
            .collect()
    }
}

impl LevelView for PendingLevels<'_> {
    fn width(&self) -> u32 {
        self.base.width
    }

    fn level_state(&self, member: MemberId, level: Level) -> LevelState {
        self.staged
            .get(&(member, level))
            .copied()
            .unwrap_or_else(|| self.base.level_state(member, level))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(ledger: &mut LevelLedger, member: MemberId, level: Level) {
        for _ in 0..3 {
            ledger.bump(member, level, Tier::First).unwrap();
        }
        for _ in 0..9 {
            ledger.bump(member, level, Tier::Second).unwrap();
        }
    }

    fn fill_to(ledger: &mut LevelLedger, member: MemberId, level: Level, t1: u32, t2: u32) {
        while ledger.level_state(member, level).tier1 < t1 {
            ledger.bump(member, level, Tier::First).unwrap();
        }
        while ledger.level_state(member, level).tier2 < t2 {
            ledger.bump(member, level, Tier::Second).unwrap();
        }
    }

    #[test]
    fn full_requires_both_tiers() {
        let mut ledger = LevelLedger::new(3).unwrap();
        for _ in 0..3 {
            ledger.bump(1, 1, Tier::First).unwrap();
        }
        assert!(!ledger.is_full(1, 1));
        for _ in 0..8 {
            ledger.bump(1, 1, Tier::Second).unwrap();
        }
        assert!(!ledger.is_full(1, 1));
        ledger.bump(1, 1, Tier::Second).unwrap();
        assert!(ledger.is_full(1, 1));
    }

    #[test]
    fn bump_past_capacity_fails_fast() {
        let mut ledger = LevelLedger::new(3).unwrap();
        fill(&mut ledger, 1, 2);
        let before = ledger.level_state(1, 2);
        assert_eq!(
            ledger.bump(1, 2, Tier::First).unwrap_err(),
            MatrixError::CapacityExceeded {
                member: 1,
                level: 2,
                tier: Tier::First
            }
        );
        assert!(ledger.bump(1, 2, Tier::Second).is_err());
        assert_eq!(ledger.level_state(1, 2), before);
    }

    #[test]
    fn root_is_never_full_and_never_counted() {
        let mut ledger = LevelLedger::new(1).unwrap();
        for _ in 0..5 {
            ledger.bump(ROOT_ID, 1, Tier::First).unwrap();
        }
        assert!(!ledger.is_full(ROOT_ID, 1));
        assert_eq!(ledger.level_state(ROOT_ID, 1), LevelState::default());
    }

    #[test]
    fn reset_only_touches_the_target_pair() {
        let mut ledger = LevelLedger::new(3).unwrap();
        fill(&mut ledger, 1, 1);
        fill(&mut ledger, 1, 2);
        fill(&mut ledger, 2, 1);
        ledger.reset_cycle(1, 1);
        assert_eq!(
            ledger.level_state(1, 1),
            LevelState {
                tier1: 0,
                tier2: 0,
                cycles: 1
            }
        );
        assert!(ledger.is_full(1, 2));
        assert!(ledger.is_full(2, 1));
        assert_eq!(ledger.level_state(1, 2).cycles, 0);
    }

    #[test]
    fn pending_levels_stay_off_the_ledger_until_written() {
        let mut ledger = LevelLedger::new(3).unwrap();
        fill(&mut ledger, 4, 1);
        let writes = {
            let mut pending = PendingLevels::new(&ledger);
            pending.reset_cycle(4, 1);
            pending.bump(4, 1, Tier::First).unwrap();
            pending.bump(5, 1, Tier::Second).unwrap();
            assert!(!pending.is_full(4, 1));
            assert_eq!(pending.level_state(4, 1).tier1, 1);
            pending.into_writes()
        };
        assert!(ledger.is_full(4, 1));
        ledger.commit(writes);
        assert_eq!(ledger.level_state(4, 1).cycles, 1);
        assert_eq!(ledger.level_state(5, 1).tier2, 1);
    }

    #[test]
    fn staged_bumps_match_direct_bumps() {
        let mut direct = LevelLedger::new(2).unwrap();
        let mut staged = LevelLedger::new(2).unwrap();
        let ops = [(1, Tier::First), (1, Tier::Second), (ROOT_ID, Tier::First), (2, Tier::First)];
        for (member, tier) in ops {
            direct.bump(member, 1, tier).unwrap();
            let mut pending = PendingLevels::new(&staged);
            pending.bump(member, 1, tier).unwrap();
            let writes = pending.into_writes();
            staged.commit(writes);
        }
        assert_eq!(direct, staged);
        assert_eq!(direct.entries().count(), 2);

        fill_to(&mut staged, 1, 1, 2, 4);
        let mut pending = PendingLevels::new(&staged);
        assert!(pending.is_full(1, 1));
        assert!(pending.bump(1, 1, Tier::Second).is_err());
        assert!(pending.into_writes().is_empty());
    }

    #[test]
    fn zero_width_is_rejected() {
        assert_eq!(LevelLedger::new(0).unwrap_err(), MatrixError::InvalidWidth);
    }
}
