//! Referral-matrix membership ledger.
//!
//! Members join under a sponsor, buy levels in sequence and re-enter a level
//! once its matrix fills. Every purchase pays a single upliner picked by an
//! upward walk over the sponsorship tree.
//!
//! * [`registry`]: the sponsorship tree and member records.
//! * [`ledger`]: per (member, level) fill counters and cycles.
//! * [`engine`]: purchase classification, tier propagation and payout routing.
//! * [`treasury`]: the fund-transfer boundary and an in-state balance sheet.
//! * [`service`]: a lock-serialized handle for shared use.
//! * [`store`]: JSON snapshots and state roots.

pub mod config;
pub mod engine;
pub mod ledger;
pub mod registry;
pub mod service;
pub mod store;
pub mod treasury;

mod error;

pub use error::{MatrixError, Result};
