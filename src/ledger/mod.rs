//! User accounts and balance bookkeeping.
//!
//! [`Ledger`] is the only thing allowed to mutate a wallet balance. Every
//! operation is keyed on `user_id` and serialized through a per-user entry
//! lock, so a user's own debit/credit/settlement calls can never interleave
//! (I3), while different users proceed fully concurrently.

use crate::domain::{Currency, UserAccount, UserId, Wallet};
use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Storage abstraction for user accounts, kept out of scope per the
/// specification's external collaborators (§6.2).
#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_by_id(&self, user_id: &UserId) -> Result<Option<UserAccount>>;
    async fn create(&self, account: UserAccount) -> Result<()>;
    async fn save(&self, account: &UserAccount) -> Result<()>;
}

/// In-memory repository. Swappable for a real store without touching the
/// ledger's locking discipline.
#[derive(Default)]
pub struct InMemoryUserRepository {
    accounts: DashMap<UserId, UserAccount>,
}

#[async_trait]
impl UserRepository for InMemoryUserRepository {
    async fn find_by_id(&self, user_id: &UserId) -> Result<Option<UserAccount>> {
        Ok(self.accounts.get(user_id).map(|a| a.clone()))
    }

    async fn create(&self, account: UserAccount) -> Result<()> {
        self.accounts.insert(account.user_id.clone(), account);
        Ok(())
    }

    async fn save(&self, account: &UserAccount) -> Result<()> {
        self.accounts.insert(account.user_id.clone(), account.clone());
        Ok(())
    }
}

/// Per-user serialization plus the repository it fronts.
pub struct Ledger {
    repository: Arc<dyn UserRepository>,
    locks: DashMap<UserId, Arc<Mutex<()>>>,
}

impl Ledger {
    pub fn new(repository: Arc<dyn UserRepository>) -> Self {
        Self {
            repository,
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, user_id: &UserId) -> Arc<Mutex<()>> {
        self.locks
            .entry(user_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Loads an account, creating it with the starting balances from §4.3
    /// if this is the user's first appearance.
    pub async fn get_or_create(&self, user_id: &UserId, username: &str) -> Result<UserAccount> {
        let guard_lock = self.lock_for(user_id);
        let _guard = guard_lock.lock().await;

        if let Some(account) = self.repository.find_by_id(user_id).await? {
            return Ok(account);
        }

        let account = UserAccount::new(user_id.clone(), username.to_string());
        self.repository.create(account.clone()).await?;
        Ok(account)
    }

    /// Debits `amount` of `currency` from the user's wallet. Fails with
    /// `InsufficientBalance` rather than allowing a negative balance (I6).
    pub async fn debit(&self, user_id: &UserId, currency: Currency, amount: Decimal) -> Result<UserAccount> {
        let guard_lock = self.lock_for(user_id);
        let _guard = guard_lock.lock().await;

        let mut account = self
            .repository
            .find_by_id(user_id)
            .await?
            .ok_or_else(|| Error::BadRequest("unknown user".to_string()))?;

        let wallet = account
            .wallets
            .entry(currency)
            .or_insert_with(|| Wallet {
                balance: Decimal::ZERO,
                usd_value: Decimal::ZERO,
            });

        if wallet.balance < amount {
            return Err(Error::InsufficientBalance {
                needed: amount.to_string(),
                available: wallet.balance.to_string(),
            });
        }

        wallet.balance -= amount;
        self.repository.save(&account).await?;
        Ok(account)
    }

    /// Credits `amount` of `currency` to the user's wallet.
    pub async fn credit(&self, user_id: &UserId, currency: Currency, amount: Decimal) -> Result<UserAccount> {
        let guard_lock = self.lock_for(user_id);
        let _guard = guard_lock.lock().await;

        let mut account = self
            .repository
            .find_by_id(user_id)
            .await?
            .ok_or_else(|| Error::BadRequest("unknown user".to_string()))?;

        let wallet = account
            .wallets
            .entry(currency)
            .or_insert_with(|| Wallet {
                balance: Decimal::ZERO,
                usd_value: Decimal::ZERO,
            });
        wallet.balance += amount;

        self.repository.save(&account).await?;
        Ok(account)
    }

    /// Records the lifetime-stat side of a settled bet: one more bet played,
    /// a win counted when `profit_usd` is positive, and the running profit
    /// total updated. Caller has already moved the currency via `credit`.
    pub async fn record_settlement(&self, user_id: &UserId, profit_usd: Decimal) -> Result<()> {
        let guard_lock = self.lock_for(user_id);
        let _guard = guard_lock.lock().await;

        let mut account = self
            .repository
            .find_by_id(user_id)
            .await?
            .ok_or_else(|| Error::BadRequest("unknown user".to_string()))?;

        account.total_bets += 1;
        if profit_usd > Decimal::ZERO {
            account.total_wins += 1;
        }
        account.total_profit += profit_usd;

        self.repository.save(&account).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ledger() -> Ledger {
        Ledger::new(Arc::new(InMemoryUserRepository::default()))
    }

    #[tokio::test]
    async fn debit_rejects_insufficient_balance() {
        let ledger = ledger();
        let user_id = "u1".to_string();
        ledger.get_or_create(&user_id, "alice").await.unwrap();

        let result = ledger.debit(&user_id, Currency::Btc, dec!(999)).await;
        assert!(matches!(result, Err(Error::InsufficientBalance { .. })));
    }

    #[tokio::test]
    async fn debit_then_credit_round_trips_balance() {
        let ledger = ledger();
        let user_id = "u2".to_string();
        let before = ledger.get_or_create(&user_id, "bob").await.unwrap();
        let starting = before.wallets[&Currency::Btc].balance;

        ledger.debit(&user_id, Currency::Btc, dec!(0.0001)).await.unwrap();
        let after_credit = ledger
            .credit(&user_id, Currency::Btc, dec!(0.0001))
            .await
            .unwrap();

        assert_eq!(after_credit.wallets[&Currency::Btc].balance, starting);
    }

    #[tokio::test]
    async fn record_settlement_tracks_wins_and_profit() {
        let ledger = ledger();
        let user_id = "u3".to_string();
        ledger.get_or_create(&user_id, "carol").await.unwrap();

        ledger.record_settlement(&user_id, dec!(5.00)).await.unwrap();
        ledger.record_settlement(&user_id, dec!(-2.00)).await.unwrap();

        let account = ledger.get_or_create(&user_id, "carol").await.unwrap();
        assert_eq!(account.total_bets, 2);
        assert_eq!(account.total_wins, 1);
        assert_eq!(account.total_profit, dec!(3.00));
    }
}
