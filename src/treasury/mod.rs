//! Fund-transfer boundary. The engine decides who is paid and how much; a
//! [`Treasury`] moves the value.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::registry::Address;

pub type Amount = u64;

/// 10^15 base units; the default price table is expressed in these.
pub const MILLI_UNIT: Amount = 1_000_000_000_000_000;

pub trait Treasury {
    /// Move `amount` to `to`. A refusal carries the reason back to the caller
    /// and aborts the whole operation.
    fn transfer(&mut self, to: &Address, amount: Amount) -> Result<(), String>;
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct AccountBalance {
    pub credited: Amount,
    pub payouts: u64,
}

/// In-state credit accounts: every payout is added to the recipient's total.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct BalanceSheet {
    accounts: BTreeMap<Address, AccountBalance>,
}

impl BalanceSheet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn balance(&self, account: &str) -> Amount {
        self.accounts.get(account).map_or(0, |b| b.credited)
    }

    pub fn accounts(&self) -> &BTreeMap<Address, AccountBalance> {
        &self.accounts
    }
}

impl Treasury for BalanceSheet {
    fn transfer(&mut self, to: &Address, amount: Amount) -> Result<(), String> {
        let current = self.accounts.get(to).cloned().unwrap_or_default();
        let credited = current
            .credited
            .checked_add(amount)
            .ok_or_else(|| format!("balance overflow for {to}"))?;
        self.accounts.insert(
            to.clone(),
            AccountBalance {
                credited,
                payouts: current.payouts + 1,
            },
        );
        Ok(())
    }
}
