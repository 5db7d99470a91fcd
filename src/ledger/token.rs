use std::collections::HashMap;

use ethers_core::types::{Address, U256};

use super::LedgerError;

/// The slice of ERC-20 behaviour the invoice book relies on
pub trait TokenLedger {
    fn balance_of(&self, token: Address, owner: Address) -> Result<U256, LedgerError>;

    fn allowance(&self, token: Address, owner: Address, spender: Address) -> Result<U256, LedgerError>;

    /// Move `amount` from `from` to `to`, spending `spender`'s allowance
    fn transfer_from(
        &mut self,
        token: Address,
        spender: Address,
        from: Address,
        to: Address,
        amount: U256,
    ) -> Result<(), LedgerError>;
}

#[derive(Debug, Default)]
struct TokenState {
    balances: HashMap<Address, U256>,
    allowances: HashMap<(Address, Address), U256>,
}

/// Local stand-in for the mock USDC contract: freely mintable, one state per
/// registered token address.
#[derive(Debug, Default)]
pub struct MockUsdc {
    tokens: HashMap<Address, TokenState>,
}

impl MockUsdc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: Address) -> Self {
        let mut ledger = Self::new();
        ledger.register(token);
        ledger
    }

    pub fn register(&mut self, token: Address) {
        self.tokens.entry(token).or_default();
    }

    pub fn mint(&mut self, token: Address, to: Address, amount: U256) -> Result<(), LedgerError> {
        let state = self.state_mut(token)?;
        let balance = state.balances.entry(to).or_default();
        *balance = balance.saturating_add(amount);
        Ok(())
    }

    pub fn approve(
        &mut self,
        token: Address,
        owner: Address,
        spender: Address,
        amount: U256,
    ) -> Result<(), LedgerError> {
        self.state_mut(token)?.allowances.insert((owner, spender), amount);
        Ok(())
    }

    fn state(&self, token: Address) -> Result<&TokenState, LedgerError> {
        self.tokens.get(&token).ok_or(LedgerError::UnknownToken(token))
    }

    fn state_mut(&mut self, token: Address) -> Result<&mut TokenState, LedgerError> {
        self.tokens.get_mut(&token).ok_or(LedgerError::UnknownToken(token))
    }
}

impl TokenLedger for MockUsdc {
    fn balance_of(&self, token: Address, owner: Address) -> Result<U256, LedgerError> {
        Ok(self.state(token)?.balances.get(&owner).copied().unwrap_or_default())
    }

    fn allowance(&self, token: Address, owner: Address, spender: Address) -> Result<U256, LedgerError> {
        Ok(self
            .state(token)?
            .allowances
            .get(&(owner, spender))
            .copied()
            .unwrap_or_default())
    }

    fn transfer_from(
        &mut self,
        token: Address,
        spender: Address,
        from: Address,
        to: Address,
        amount: U256,
    ) -> Result<(), LedgerError> {
        let state = self.state_mut(token)?;

        let allowed = state.allowances.get(&(from, spender)).copied().unwrap_or_default();
        if allowed < amount {
            return Err(LedgerError::InsufficientAllowance { needed: amount, allowed });
        }
        let balance = state.balances.get(&from).copied().unwrap_or_default();
        if balance < amount {
            return Err(LedgerError::InsufficientBalance { needed: amount, balance });
        }

        state.allowances.insert((from, spender), allowed - amount);
        state.balances.insert(from, balance - amount);
        let credited = state.balances.entry(to).or_default();
        *credited = credited.saturating_add(amount);

        Ok(())
    }
}
