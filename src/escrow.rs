//! In-memory escrow ledger with the settlement contract's semantics.
//!
//! This is the authoritative state behind the `mem://` chain client: per
//! `(user, token)` balances split into total and locked, wallet credits for
//! settled transfers, and per-user nonces. Invariant at every point:
//! `total >= locked >= 0` and `available = total - locked`.

use std::collections::HashMap;

use alloy::primitives::{Address, U256};

use crate::chain::ChainError;

#[derive(Debug, Clone, Copy, Default)]
pub struct EscrowAccount {
    pub total: U256,
    pub locked: U256,
}

impl EscrowAccount {
    pub fn available(&self) -> U256 {
        self.total - self.locked
    }
}

#[derive(Debug, Default)]
pub struct EscrowLedger {
    accounts: HashMap<(Address, Address), EscrowAccount>,
    /// Funds already transferred out of escrow to a receive wallet.
    wallets: HashMap<(Address, Address), U256>,
    nonces: HashMap<(Address, Address), u64>,
}

impl EscrowLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn account(&self, user: Address, token: Address) -> EscrowAccount {
        self.accounts.get(&(user, token)).copied().unwrap_or_default()
    }

    pub fn wallet_balance(&self, wallet: Address, token: Address) -> U256 {
        self.wallets.get(&(wallet, token)).copied().unwrap_or_default()
    }

    pub fn nonce(&self, user: Address, token: Address) -> u64 {
        self.nonces.get(&(user, token)).copied().unwrap_or_default()
    }

    pub fn deposit(&mut self, user: Address, token: Address, amount: U256) {
        let account = self.accounts.entry((user, token)).or_default();
        account.total += amount;
    }

    pub fn withdraw(&mut self, user: Address, token: Address, amount: U256) -> Result<(), ChainError> {
        let account = self.accounts.entry((user, token)).or_default();
        if account.available() < amount {
            return Err(ChainError::Revert("insufficient available balance".into()));
        }
        account.total -= amount;
        Ok(())
    }

    pub fn lock(&mut self, user: Address, token: Address, amount: U256) -> Result<(), ChainError> {
        let account = self.accounts.entry((user, token)).or_default();
        if account.available() < amount {
            return Err(ChainError::Revert("insufficient available balance to lock".into()));
        }
        account.locked += amount;
        Ok(())
    }

    pub fn unlock(&mut self, user: Address, token: Address, amount: U256) -> Result<(), ChainError> {
        let account = self.accounts.entry((user, token)).or_default();
        if account.locked < amount {
            return Err(ChainError::Revert("unlock exceeds locked balance".into()));
        }
        account.locked -= amount;
        Ok(())
    }

    /// Debit a settled transfer from the sender's locked escrow and credit
    /// the receiver's wallet, advancing the sender's nonce.
    pub fn settle_transfer(
        &mut self,
        sender: Address,
        token: Address,
        amount: U256,
        receiver: Address,
    ) -> Result<(), ChainError> {
        let account = self.accounts.entry((sender, token)).or_default();
        if account.locked < amount {
            return Err(ChainError::Revert("settlement exceeds locked balance".into()));
        }
        account.locked -= amount;
        account.total -= amount;
        *self.wallets.entry((receiver, token)).or_default() += amount;
        *self.nonces.entry((sender, token)).or_default() += 1;
        Ok(())
    }

    /// Reverse a settled transfer: pull the amount back out of the receive
    /// wallet and restore it to the sender's escrow total.
    pub fn refund_transfer(
        &mut self,
        receiver: Address,
        token: Address,
        amount: U256,
        sender: Address,
    ) -> Result<(), ChainError> {
        let balance = self.wallets.entry((receiver, token)).or_default();
        if *balance < amount {
            return Err(ChainError::Revert("refund exceeds receive wallet balance".into()));
        }
        *balance -= amount;
        self.accounts.entry((sender, token)).or_default().total += amount;
        Ok(())
    }
}
