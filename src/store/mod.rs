//! Account Store
//!
//! The external balance collaborator. The engine only needs atomic debit and
//! credit; persistence lives behind this trait. [`InMemoryAccountStore`]
//! serializes every mutation per account and backs the binary and tests.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use serde::{Serialize, Deserialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use crate::core::amount::Amount;

/// Account reference (16 bytes, derived from the identity provider's subject).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccountId(pub [u8; 16]);

impl AccountId {
    /// Create from raw bytes.
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Get raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Short hex prefix for logs.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Account store errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Debit refused; balance unchanged.
    #[error("insufficient balance: have {balance}, need {requested}")]
    InsufficientBalance {
        /// Balance at the time of the attempt.
        balance: Amount,
        /// Requested debit.
        requested: Amount,
    },
    /// Store unreachable, failed, or timed out.
    #[error("account store unavailable: {0}")]
    Unavailable(String),
}

/// Balance store contract. Each call is atomic for its account.
#[async_trait::async_trait]
pub trait AccountStore: Send + Sync {
    /// Remove `amount`; returns the new balance.
    async fn debit(&self, account: AccountId, amount: Amount) -> Result<Amount, StoreError>;

    /// Add `amount`; returns the new balance.
    async fn credit(&self, account: AccountId, amount: Amount) -> Result<Amount, StoreError>;

    /// Current balance.
    async fn balance(&self, account: AccountId) -> Result<Amount, StoreError>;
}

/// In-process store with one lock per account.
pub struct InMemoryAccountStore {
    /// Balances, each behind its own lock.
    accounts: RwLock<BTreeMap<AccountId, Arc<Mutex<Amount>>>>,
    /// Balance given to accounts seen for the first time.
    starting_balance: Amount,
}

impl InMemoryAccountStore {
    /// Create an empty store.
    pub fn new(starting_balance: Amount) -> Self {
        Self {
            accounts: RwLock::new(BTreeMap::new()),
            starting_balance,
        }
    }

    /// Set an account's balance outright.
    pub async fn set_balance(&self, account: AccountId, balance: Amount) {
        let slot = self.slot(account).await;
        *slot.lock().await = balance;
    }

    /// Number of known accounts.
    pub async fn account_count(&self) -> usize {
        self.accounts.read().await.len()
    }

    async fn slot(&self, account: AccountId) -> Arc<Mutex<Amount>> {
        if let Some(slot) = self.accounts.read().await.get(&account) {
            return slot.clone();
        }
        let mut accounts = self.accounts.write().await;
        accounts
            .entry(account)
            .or_insert_with(|| Arc::new(Mutex::new(self.starting_balance)))
            .clone()
    }
}

impl Default for InMemoryAccountStore {
    fn default() -> Self {
        Self::new(Amount::ZERO)
    }
}

#[async_trait::async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn debit(&self, account: AccountId, amount: Amount) -> Result<Amount, StoreError> {
        let slot = self.slot(account).await;
        let mut balance = slot.lock().await;
        match balance.checked_sub(amount) {
            Some(remaining) => {
                *balance = remaining;
                Ok(remaining)
            }
            None => Err(StoreError::InsufficientBalance {
                balance: *balance,
                requested: amount,
            }),
        }
    }

    async fn credit(&self, account: AccountId, amount: Amount) -> Result<Amount, StoreError> {
        let slot = self.slot(account).await;
        let mut balance = slot.lock().await;
        *balance = balance.saturating_add(amount);
        Ok(*balance)
    }

    async fn balance(&self, account: AccountId) -> Result<Amount, StoreError> {
        let slot = self.slot(account).await;
        let balance = *slot.lock().await;
        Ok(balance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALICE: AccountId = AccountId::new([1; 16]);

    #[tokio::test]
    async fn test_starting_balance() {
        let store = InMemoryAccountStore::new(Amount::from_units(100));
        assert_eq!(store.balance(ALICE).await, Ok(Amount::from_units(100)));
        assert_eq!(store.account_count().await, 1);
    }

    #[tokio::test]
    async fn test_debit_and_credit() {
        let store = InMemoryAccountStore::default();
        store.set_balance(ALICE, Amount::from_units(50)).await;

        assert_eq!(store.debit(ALICE, Amount::from_units(20)).await, Ok(Amount::from_units(30)));
        assert_eq!(store.credit(ALICE, Amount::from_units(5)).await, Ok(Amount::from_units(35)));
    }

    #[tokio::test]
    async fn test_insufficient_balance_leaves_balance() {
        let store = InMemoryAccountStore::default();
        store.set_balance(ALICE, Amount::from_units(10)).await;

        let result = store.debit(ALICE, Amount::from_units(11)).await;
        assert!(matches!(result, Err(StoreError::InsufficientBalance { .. })));
        assert_eq!(store.balance(ALICE).await, Ok(Amount::from_units(10)));
    }

    #[tokio::test]
    async fn test_concurrent_debits_never_overdraw() {
        let store = Arc::new(InMemoryAccountStore::default());
        store.set_balance(ALICE, Amount::from_units(100)).await;

        let mut handles = Vec::new();
        for _ in 0..50 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.debit(ALICE, Amount::from_units(10)).await.is_ok()
            }));
        }

        let mut successes = 0;
        for handle in handles {
            if handle.await.unwrap() {
                successes += 1;
            }
        }

        assert_eq!(successes, 10);
        assert_eq!(store.balance(ALICE).await, Ok(Amount::ZERO));
    }

    #[test]
    fn test_account_display() {
        let id = AccountId::new([0xab; 16]);
        assert_eq!(id.short(), "abababab");
        assert_eq!(id.to_string().len(), 32);
    }
}
