use thiserror::Error;

use crate::ledger::Tier;
use crate::registry::{Address, Level, MemberId};
use crate::treasury::Amount;

/// Canonical error type exposed by the registry, ledger and placement engine.
///
/// Every variant is a rejection: the operation that produced it left no
/// durable mutation behind.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MatrixError {
    /// Join referenced a sponsor id that is not in the registry.
    #[error("unknown sponsor {0}")]
    UnknownSponsor(MemberId),

    /// The caller address has no member record.
    #[error("address {0} is not registered")]
    NotRegistered(Address),

    /// Join named an empty or blank address.
    #[error("invalid address {0:?}")]
    InvalidAddress(Address),

    /// The address already owns a member record.
    #[error("address {0} is already registered")]
    AlreadyRegistered(Address),

    /// Level outside the configured range, or a gap above the owned ceiling.
    #[error("invalid level {0}")]
    InvalidLevel(Level),

    /// Payment does not match the level price exactly.
    #[error("invalid payment: expected {expected}, got {actual}")]
    InvalidPayment { expected: Amount, actual: Amount },

    /// Reinvestment requested before the level matrix filled up.
    #[error("level {level} of member {member} is not full")]
    LevelNotFull { member: MemberId, level: Level },

    /// A tier counter was bumped past its capacity.
    #[error("tier {tier:?} of member {member} at level {level} is at capacity")]
    CapacityExceeded {
        member: MemberId,
        level: Level,
        tier: Tier,
    },

    /// Root address was empty at initialization.
    #[error("invalid root address")]
    InvalidRoot,

    /// The external fund transfer was refused.
    #[error("transfer failed: {0}")]
    TransferFailed(String),

    #[error("invalid price table: {0}")]
    InvalidPriceTable(String),

    #[error("matrix width must be positive")]
    InvalidWidth,

    /// A loaded matrix contradicts its own config or tree invariants.
    #[error("corrupt matrix state: {0}")]
    CorruptState(String),
}

pub type Result<T, E = MatrixError> = std::result::Result<T, E>;
