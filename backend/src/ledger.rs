use std::sync::Arc;

use wheel_core::{BalancePolicy, PrizeEntry, SpinRecord, UserAccount, UserId, WheelError};

use crate::error::AppError;
use crate::locks::KeyedLocks;
use crate::now_millis;
use crate::storage::{retry_read, RetryPolicy, Storage};

#[derive(Clone)]
pub struct LedgerService {
    storage: Arc<dyn Storage>,
    locks: Arc<KeyedLocks<UserId>>,
    award_locks: Arc<KeyedLocks<u64>>,
    retry: RetryPolicy,
    starting_balance: i64,
    policy: BalancePolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerOutcome {
    pub new_balance: i64,
    pub spin_count: u64,
    pub record: SpinRecord,
}

impl LedgerService {
    pub fn new(
        storage: Arc<dyn Storage>,
        retry: RetryPolicy,
        starting_balance: i64,
        policy: BalancePolicy,
    ) -> Self {
        Self {
            storage,
            locks: Arc::new(KeyedLocks::new()),
            award_locks: Arc::new(KeyedLocks::new()),
            retry,
            starting_balance,
            policy,
        }
    }

    /// Credits `prize` to `user_id`, creating the account on first use.
    ///
    /// The account write and the history append either both land or neither
    /// does: if the append fails the account is put back as it was.
    pub async fn apply_spin_result(
        &self,
        user_id: &str,
        prize: &PrizeEntry,
    ) -> Result<LedgerOutcome, AppError> {
        let _guard = self.locks.lock(&user_id.to_string()).await;

        let existing = self.account(user_id).await?;
        let now = now_millis();
        let before = existing
            .clone()
            .unwrap_or_else(|| UserAccount::new(user_id, self.starting_balance, now));

        let updated = UserAccount {
            points_balance: self.policy.apply(before.points_balance, prize.points_delta),
            spin_count: before.spin_count + 1,
            last_spin_at: Some(now),
            ..before
        };
        self.storage.put_account(updated.clone()).await?;

        let record = SpinRecord {
            id: 0,
            user_id: user_id.to_string(),
            prize_id: prize.id,
            label: prize.label.clone(),
            category: prize.category,
            points_delta: prize.points_delta,
            balance_after: updated.points_balance,
            timestamp: now,
            redeemed_at: None,
        };
        match self.storage.append_spin(record).await {
            Ok(record) => Ok(LedgerOutcome {
                new_balance: updated.points_balance,
                spin_count: updated.spin_count,
                record,
            }),
            Err(err) => {
                self.revert_account(user_id, existing).await;
                Err(err.into())
            }
        }
    }

    async fn revert_account(&self, user_id: &str, previous: Option<UserAccount>) {
        let result = match previous {
            Some(account) => self.storage.put_account(account).await,
            None => self.storage.delete_account(user_id).await.map(|_| ()),
        };
        if let Err(err) = result {
            tracing::error!(user_id, error = %err, "could not revert account after failed ledger write");
        }
    }

    pub async fn account(&self, user_id: &str) -> Result<Option<UserAccount>, AppError> {
        let storage = self.storage.clone();
        let user_id = user_id.to_string();
        Ok(retry_read(self.retry, move || {
            let storage = storage.clone();
            let user_id = user_id.clone();
            async move { storage.get_account(&user_id).await }
        })
        .await?)
    }

    pub async fn account_or_default(&self, user_id: &str) -> Result<UserAccount, AppError> {
        Ok(self
            .account(user_id)
            .await?
            .unwrap_or_else(|| UserAccount::new(user_id, self.starting_balance, now_millis())))
    }

    pub async fn accounts(&self) -> Result<Vec<UserAccount>, AppError> {
        let storage = self.storage.clone();
        Ok(retry_read(self.retry, move || {
            let storage = storage.clone();
            async move { storage.list_accounts().await }
        })
        .await?)
    }

    pub async fn leaderboard(&self, limit: usize) -> Result<Vec<UserAccount>, AppError> {
        let mut accounts = self.accounts().await?;
        accounts.sort_by(|a, b| {
            b.points_balance
                .cmp(&a.points_balance)
                .then(b.spin_count.cmp(&a.spin_count))
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        accounts.truncate(limit);
        Ok(accounts)
    }

    pub async fn redeem(&self, award_id: u64) -> Result<SpinRecord, AppError> {
        let _guard = self.award_locks.lock(&award_id).await;
        let storage = self.storage.clone();
        let record = retry_read(self.retry, move || {
            let storage = storage.clone();
            async move { storage.get_spin(award_id).await }
        })
        .await?
        .ok_or(WheelError::AwardNotFound(award_id))?;

        let redeemed = record.redeem(now_millis())?;
        self.storage.put_spin(redeemed.clone()).await?;
        tracing::info!(award_id, user_id = %redeemed.user_id, "award redeemed");
        Ok(redeemed)
    }

    pub async fn history(&self, user_id: Option<&str>) -> Result<Vec<SpinRecord>, AppError> {
        let storage = self.storage.clone();
        let spins = retry_read(self.retry, move || {
            let storage = storage.clone();
            async move { storage.list_spins().await }
        })
        .await?;
        Ok(match user_id {
            Some(user_id) => spins.into_iter().filter(|s| s.user_id == user_id).collect(),
            None => spins,
        })
    }
}
