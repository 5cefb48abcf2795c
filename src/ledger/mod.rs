use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::auth::{AccountId, Caller};

pub type Amount = u64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("account {account} is not allowed to issue credits")]
    Unauthorized { account: AccountId },
    #[error("insufficient balance in account {account}: requested {requested}, available {available}")]
    InsufficientBalance {
        account: AccountId,
        requested: Amount,
        available: Amount,
    },
    #[error("issuing {amount} to {account} would overflow the credit supply")]
    Overflow { account: AccountId, amount: Amount },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    Issued {
        to: AccountId,
        amount: Amount,
    },
    Destroyed {
        from: AccountId,
        amount: Amount,
    },
    Transferred {
        from: AccountId,
        to: AccountId,
        amount: Amount,
    },
}

/// Plain balance bookkeeping. Every mutation either applies completely or
/// returns an error without touching the state.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct LedgerState {
    pub balances: BTreeMap<AccountId, Amount>,
    pub total_issued: u128,
    pub total_destroyed: u128,
    pub events: Vec<LedgerEvent>,
}

impl LedgerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn balance_of(&self, account: &AccountId) -> Amount {
        self.balances.get(account).copied().unwrap_or(0)
    }

    /// Sum of all balances.
    pub fn total_supply(&self) -> Amount {
        self.balances.values().sum()
    }

    /// Supply equals issued minus destroyed.
    pub fn is_consistent(&self) -> bool {
        let supply: u128 = self.balances.values().map(|amount| *amount as u128).sum();
        supply <= Amount::MAX as u128
            && self.total_issued.checked_sub(self.total_destroyed) == Some(supply)
    }

    pub fn issue(&mut self, to: &AccountId, amount: Amount) -> Result<(), LedgerError> {
        let supply = self.total_issued.saturating_sub(self.total_destroyed);
        if supply + amount as u128 > Amount::MAX as u128 {
            return Err(LedgerError::Overflow {
                account: to.clone(),
                amount,
            });
        }
        let balance = self.balances.entry(to.clone()).or_insert(0);
        *balance += amount;
        self.total_issued += amount as u128;
        self.events.push(LedgerEvent::Issued {
            to: to.clone(),
            amount,
        });
        Ok(())
    }

    pub fn destroy(&mut self, from: &AccountId, amount: Amount) -> Result<(), LedgerError> {
        self.debit(from, amount)?;
        self.total_destroyed += amount as u128;
        self.events.push(LedgerEvent::Destroyed {
            from: from.clone(),
            amount,
        });
        Ok(())
    }

    pub fn transfer(
        &mut self,
        from: &AccountId,
        to: &AccountId,
        amount: Amount,
    ) -> Result<(), LedgerError> {
        self.debit(from, amount)?;
        // Supply is bounded by u64, so the recipient cannot overflow.
        *self.balances.entry(to.clone()).or_insert(0) += amount;
        self.events.push(LedgerEvent::Transferred {
            from: from.clone(),
            to: to.clone(),
            amount,
        });
        Ok(())
    }

    fn debit(&mut self, account: &AccountId, amount: Amount) -> Result<(), LedgerError> {
        let available = self.balance_of(account);
        if available < amount {
            return Err(LedgerError::InsufficientBalance {
                account: account.clone(),
                requested: amount,
                available,
            });
        }
        if let Some(balance) = self.balances.get_mut(account) {
            *balance -= amount;
        }
        Ok(())
    }

    /// Deterministic Merkle root over the balances, in account order. An
    /// odd node at the end of a level is promoted unchanged.
    pub fn state_root(&self) -> [u8; 32] {
        let mut level: Vec<[u8; 32]> = self
            .balances
            .iter()
            .map(|(account, amount)| -> [u8; 32] {
                Sha256::new()
                    .chain_update(b"acct")
                    .chain_update(account.as_bytes())
                    .chain_update(amount.to_le_bytes())
                    .finalize()
                    .into()
            })
            .collect();
        if level.is_empty() {
            return Sha256::digest(b"cgov-ledger-empty").into();
        }
        while level.len() > 1 {
            level = level
                .chunks(2)
                .map(|pair| match pair {
                    [left, right] => Sha256::new()
                        .chain_update(b"node")
                        .chain_update(left)
                        .chain_update(right)
                        .finalize()
                        .into(),
                    _ => pair[0],
                })
                .collect();
        }
        level[0]
    }
}

/// Shared credit ledger. Issuance is restricted to the administrator the
/// ledger was created with.
#[derive(Debug)]
pub struct Ledger {
    admin: AccountId,
    state: RwLock<LedgerState>,
}

impl Ledger {
    pub fn new(admin: &Caller) -> Self {
        Self::from_state(admin.account().clone(), LedgerState::new())
    }

    pub(crate) fn from_state(admin: AccountId, state: LedgerState) -> Self {
        Self {
            admin,
            state: RwLock::new(state),
        }
    }

    pub fn admin(&self) -> &AccountId {
        &self.admin
    }

    pub fn balance_of(&self, holder: &AccountId) -> Amount {
        self.state.read().balance_of(holder)
    }

    pub fn issue(
        &self,
        caller: &Caller,
        to: &AccountId,
        amount: Amount,
    ) -> Result<(), LedgerError> {
        if caller.account() != &self.admin {
            return Err(LedgerError::Unauthorized {
                account: caller.account().clone(),
            });
        }
        self.state.write().issue(to, amount)?;
        info!(initiator = %caller, to = %to, amount, "credits issued");
        Ok(())
    }

    /// Destroy credits from the caller's own balance.
    pub fn destroy(&self, caller: &Caller, amount: Amount) -> Result<(), LedgerError> {
        self.state.write().destroy(caller.account(), amount)?;
        info!(initiator = %caller, amount, "credits destroyed");
        Ok(())
    }

    pub fn transfer(
        &self,
        caller: &Caller,
        to: &AccountId,
        amount: Amount,
    ) -> Result<(), LedgerError> {
        self.state.write().transfer(caller.account(), to, amount)?;
        info!(initiator = %caller, to = %to, amount, "credits transferred");
        Ok(())
    }

    pub fn total_supply(&self) -> Amount {
        self.state.read().total_supply()
    }

    pub fn total_issued(&self) -> u128 {
        self.state.read().total_issued
    }

    pub fn total_destroyed(&self) -> u128 {
        self.state.read().total_destroyed
    }

    pub fn events(&self) -> Vec<LedgerEvent> {
        self.state.read().events.clone()
    }

    pub fn state_root(&self) -> [u8; 32] {
        self.state.read().state_root()
    }

    pub fn snapshot(&self) -> LedgerState {
        let state = self.state.read();
        debug!(accounts = state.balances.len(), "ledger snapshot taken");
        state.clone()
    }
}
