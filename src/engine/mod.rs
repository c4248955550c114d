//! Placement engine: level purchases, tier propagation and payout routing.
//!
//! Every join or purchase is staged against [`PendingLevels`], routed, paid
//! through the caller's [`Treasury`] and only then committed. A refused
//! transfer leaves the engine untouched.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{MatrixConfig, PriceTable, RoutingPolicy};
use crate::error::{MatrixError, Result};
use crate::ledger::{LevelLedger, LevelState, LevelView, PendingLevels, Tier};
use crate::registry::{Address, Level, Member, MemberId, MembershipRegistry, ROOT_ID};
use crate::treasury::{Amount, Treasury};

/// Whether a purchase opens a new level or re-enters an owned one.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseKind {
    NewLevel,
    Reinvestment,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    Joined {
        member: MemberId,
        address: Address,
        sponsor: MemberId,
    },
    LevelPurchased {
        member: MemberId,
        level: Level,
        kind: PurchaseKind,
    },
    CycleReset {
        member: MemberId,
        level: Level,
        cycle: u32,
    },
    Payout {
        from: MemberId,
        recipient: MemberId,
        address: Address,
        amount: Amount,
        level: Level,
    },
}

/// Outcome of a committed join or purchase.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Payout {
    pub member: MemberId,
    pub level: Level,
    pub kind: PurchaseKind,
    pub recipient: MemberId,
    pub recipient_address: Address,
    pub amount: Amount,
}

/// Where an upward walk stopped and how many members it inspected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Resolution {
    pub member: MemberId,
    pub hops: usize,
}

struct Routed<'a> {
    pending: PendingLevels<'a>,
    reset: Option<LevelState>,
    resolution: Resolution,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlacementEngine {
    config: MatrixConfig,
    prices: PriceTable,
    registry: MembershipRegistry,
    levels: LevelLedger,
    events: Vec<LedgerEvent>,
    height: u64,
}

impl PlacementEngine {
    pub fn new(config: MatrixConfig, root_address: &str) -> Result<Self> {
        config.validate()?;
        let prices = config.price_table()?;
        let registry = MembershipRegistry::new(root_address, prices.level_count())?;
        let levels = LevelLedger::new(config.width)?;
        info!(
            root = root_address,
            width = config.width,
            levels = prices.level_count(),
            "matrix initialized"
        );
        Ok(Self {
            config,
            prices,
            registry,
            levels,
            events: Vec::new(),
            height: 0,
        })
    }

    /// Cross-check a deserialized engine: the price table and ledger width
    /// must match the config and the registry must be a Root-anchored tree.
    pub fn check_consistency(&self) -> Result<()> {
        self.config.validate()?;
        if self.config.price_table()? != self.prices {
            return Err(MatrixError::CorruptState(
                "price table differs from config".into(),
            ));
        }
        if self.levels.width() != self.config.width {
            return Err(MatrixError::CorruptState(format!(
                "ledger width {} differs from config width {}",
                self.levels.width(),
                self.config.width
            )));
        }
        self.registry.check_tree(self.prices.level_count())
    }

    pub fn config(&self) -> &MatrixConfig {
        &self.config
    }

    pub fn registry(&self) -> &MembershipRegistry {
        &self.registry
    }

    pub fn levels(&self) -> &LevelLedger {
        &self.levels
    }

    pub fn events(&self) -> &[LedgerEvent] {
        &self.events
    }

    /// Number of committed operations.
    pub fn height(&self) -> u64 {
        self.height
    }

    //==================== operations ====================//

    /// Register `address` under `sponsor` (or the default sponsor) and route
    /// the level-1 fee.
    pub fn join<T: Treasury + ?Sized>(
        &mut self,
        address: &str,
        sponsor: Option<MemberId>,
        payment: Amount,
        treasury: &mut T,
    ) -> Result<Payout> {
        let sponsor = sponsor.unwrap_or_else(|| self.next_default_sponsor());
        self.registry.check_registration(address, sponsor)?;
        let level: Level = 1;
        self.check_payment(level, payment)?;

        let member = self.registry.next_id();
        let routed = self.route(member, Some(sponsor), level, PurchaseKind::NewLevel)?;
        let resolution = routed.resolution;
        let writes = routed.pending.into_writes();
        let recipient = self.address_of(resolution.member)?;

        self.pay(treasury, &recipient, payment)?;

        self.registry.register(address, sponsor)?;
        self.apply(writes);
        self.events.push(LedgerEvent::Joined {
            member,
            address: address.to_string(),
            sponsor,
        });
        let payout = Payout {
            member,
            level,
            kind: PurchaseKind::NewLevel,
            recipient: resolution.member,
            recipient_address: recipient,
            amount: payment,
        };
        self.commit_payout(&payout);
        info!(member, sponsor, address, "member joined");
        Ok(payout)
    }

    /// Buy `level` for a registered member: either the next level up or a
    /// reinvestment of an owned level whose matrix is full.
    pub fn purchase_level<T: Treasury + ?Sized>(
        &mut self,
        address: &str,
        level: Level,
        payment: Amount,
        treasury: &mut T,
    ) -> Result<Payout> {
        let member = self.registry.by_address(address)?.clone();
        self.check_payment(level, payment)?;
        let kind = self.classify(&member, level)?;

        if kind == PurchaseKind::Reinvestment && !self.levels.is_full(member.id, level) {
            return Err(MatrixError::LevelNotFull {
                member: member.id,
                level,
            });
        }

        let routed = self.route(member.id, member.sponsor, level, kind)?;
        let (resolution, reset) = (routed.resolution, routed.reset);
        let writes = routed.pending.into_writes();
        let recipient = self.address_of(resolution.member)?;

        self.pay(treasury, &recipient, payment)?;

        self.apply(writes);
        if let Some(state) = reset {
            self.events.push(LedgerEvent::CycleReset {
                member: member.id,
                level,
                cycle: state.cycles,
            });
        }
        if kind == PurchaseKind::NewLevel {
            self.registry.raise_ceiling(member.id, level);
        }
        self.events.push(LedgerEvent::LevelPurchased {
            member: member.id,
            level,
            kind,
        });
        let payout = Payout {
            member: member.id,
            level,
            kind,
            recipient: resolution.member,
            recipient_address: recipient,
            amount: payment,
        };
        self.commit_payout(&payout);
        info!(member = member.id, level, ?kind, "level purchased");
        Ok(payout)
    }

    //==================== queries ====================//

    /// Sponsor used when a join names none. Always Root.
    pub fn next_default_sponsor(&self) -> MemberId {
        ROOT_ID
    }

    pub fn is_registered(&self, address: &str) -> bool {
        self.registry.id_of(address).is_some()
    }

    pub fn member(&self, address: &str) -> Result<&Member> {
        self.registry.by_address(address)
    }

    pub fn highest_level(&self, address: &str) -> Result<Level> {
        Ok(self.member(address)?.highest_level)
    }

    pub fn level_count(&self) -> Level {
        self.prices.level_count()
    }

    pub fn level_price(&self, level: Level) -> Result<Amount> {
        self.prices.price(level).ok_or(MatrixError::InvalidLevel(level))
    }

    pub fn prices(&self) -> &PriceTable {
        &self.prices
    }

    pub fn depth(&self, address: &str) -> Result<usize> {
        Ok(self.registry.depth(self.member(address)?.id))
    }

    pub fn level_state(&self, address: &str, level: Level) -> Result<LevelState> {
        let member = self.member(address)?;
        self.check_level(level)?;
        Ok(self.levels.level_state(member.id, level))
    }

    pub fn is_level_full(&self, address: &str, level: Level) -> Result<bool> {
        let member = self.member(address)?;
        self.check_level(level)?;
        Ok(self.levels.is_full(member.id, level))
    }

    pub fn is_current_level_full(&self, address: &str) -> Result<bool> {
        let member = self.member(address)?;
        Ok(self.levels.is_full(member.id, member.highest_level))
    }

    pub fn is_reinvestment(&self, address: &str, level: Level) -> Result<bool> {
        let member = self.member(address)?;
        Ok(self.classify(member, level)? == PurchaseKind::Reinvestment)
    }

    /// Address that a purchase of `level` by `address` would pay right now.
    pub fn resolve_recipient(&self, address: &str, level: Level) -> Result<Address> {
        let resolution = self.trace_recipient(address, level)?;
        self.address_of(resolution.member)
    }

    /// Same as [`PlacementEngine::resolve_recipient`], with the walk length.
    /// The purchase is simulated exactly as `purchase_level` would stage it,
    /// including a reinvestment's cycle reset and the tier bumps.
    pub fn trace_recipient(&self, address: &str, level: Level) -> Result<Resolution> {
        let member = self.member(address)?;
        self.check_level(level)?;
        let kind = self
            .classify(member, level)
            .unwrap_or(PurchaseKind::NewLevel);
        Ok(self.route(member.id, member.sponsor, level, kind)?.resolution)
    }

    /// First member at or above `address` whose `level` matrix has room.
    pub fn find_capacity(&self, address: &str, level: Level) -> Result<Address> {
        let member = self.member(address)?;
        self.check_level(level)?;
        let resolution = self.walk(member.id, |m| !self.levels.is_full(m.id, level));
        self.address_of(resolution.member)
    }

    //==================== internals ====================//

    fn check_level(&self, level: Level) -> Result<()> {
        self.level_price(level).map(|_| ())
    }

    fn check_payment(&self, level: Level, payment: Amount) -> Result<()> {
        let expected = self.level_price(level)?;
        if payment != expected {
            return Err(MatrixError::InvalidPayment {
                expected,
                actual: payment,
            });
        }
        Ok(())
    }

    fn classify(&self, member: &Member, level: Level) -> Result<PurchaseKind> {
        self.check_level(level)?;
        if level <= member.highest_level {
            Ok(PurchaseKind::Reinvestment)
        } else if u16::from(level) == u16::from(member.highest_level) + 1 {
            Ok(PurchaseKind::NewLevel)
        } else {
            Err(MatrixError::InvalidLevel(level))
        }
    }

    fn is_recipient(
        &self,
        view: &impl LevelView,
        candidate: &Member,
        level: Level,
        purchaser_cycle: u32,
    ) -> bool {
        if candidate.highest_level < level || view.is_full(candidate.id, level) {
            return false;
        }
        match self.config.routing {
            RoutingPolicy::Capacity => true,
            RoutingPolicy::CycleMatched => {
                view.level_state(candidate.id, level).cycles >= purchaser_cycle
            }
        }
    }

    /// Stage the ledger effects of `member` buying `level` and pick the
    /// recipient against the staged view. Nothing is written.
    fn route(
        &self,
        member: MemberId,
        sponsor: Option<MemberId>,
        level: Level,
        kind: PurchaseKind,
    ) -> Result<Routed<'_>> {
        let mut pending = PendingLevels::new(&self.levels);
        let reset = match kind {
            PurchaseKind::Reinvestment => Some(pending.reset_cycle(member, level)),
            PurchaseKind::NewLevel => None,
        };
        self.propagate(&mut pending, sponsor, level)?;

        let cycle = pending.level_state(member, level).cycles;
        let resolution = match sponsor {
            Some(sponsor) => self.walk(sponsor, |m| self.is_recipient(&pending, m, level, cycle)),
            None => Resolution {
                member: ROOT_ID,
                hops: 0,
            },
        };
        Ok(Routed {
            pending,
            reset,
            resolution,
        })
    }

    /// Walk sponsors from `start` until Root or an eligible member.
    fn walk<F>(&self, start: MemberId, mut eligible: F) -> Resolution
    where
        F: FnMut(&Member) -> bool,
    {
        let mut hops = 0;
        let mut current = self.registry.get(start);
        while let Some(member) = current {
            hops += 1;
            if member.is_root() || eligible(member) {
                debug!(member = member.id, hops, "walk stopped");
                return Resolution {
                    member: member.id,
                    hops,
                };
            }
            current = member.sponsor.and_then(|id| self.registry.get(id));
        }
        Resolution {
            member: ROOT_ID,
            hops,
        }
    }

    /// Credit a purchase to the parent (tier 1) and grandparent (tier 2).
    fn propagate(
        &self,
        pending: &mut PendingLevels<'_>,
        parent: Option<MemberId>,
        level: Level,
    ) -> Result<()> {
        let Some(parent) = parent else {
            return Ok(());
        };
        Self::credit(pending, parent, level, Tier::First)?;
        if let Some(grandparent) = self.registry.sponsor_of(parent) {
            Self::credit(pending, grandparent, level, Tier::Second)?;
        }
        Ok(())
    }

    fn credit(
        pending: &mut PendingLevels<'_>,
        member: MemberId,
        level: Level,
        tier: Tier,
    ) -> Result<()> {
        if !pending.has_room(member, level, tier) {
            debug!(member, level, ?tier, "tier saturated, purchase not counted");
            return Ok(());
        }
        pending.bump(member, level, tier)
    }

    fn address_of(&self, id: MemberId) -> Result<Address> {
        self.registry
            .get(id)
            .map(|m| m.address.clone())
            .ok_or_else(|| MatrixError::NotRegistered(format!("#{id}")))
    }

    fn pay<T: Treasury + ?Sized>(
        &self,
        treasury: &mut T,
        recipient: &Address,
        amount: Amount,
    ) -> Result<()> {
        treasury.transfer(recipient, amount).map_err(|reason| {
            warn!(recipient = recipient.as_str(), amount, %reason, "transfer refused");
            MatrixError::TransferFailed(reason)
        })
    }

    fn apply(&mut self, writes: Vec<(MemberId, Level, LevelState)>) {
        self.levels.commit(writes);
    }

    fn commit_payout(&mut self, payout: &Payout) {
        self.events.push(LedgerEvent::Payout {
            from: payout.member,
            recipient: payout.recipient,
            address: payout.recipient_address.clone(),
            amount: payout.amount,
            level: payout.level,
        });
        self.height += 1;
        info!(
            from = payout.member,
            recipient = payout.recipient_address.as_str(),
            amount = payout.amount,
            level = payout.level,
            "payout routed"
        );
    }
}
