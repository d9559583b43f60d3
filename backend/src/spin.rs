use std::sync::{Arc, Mutex};

use rand::RngCore;
use wheel_core::{PrizeEntry, Selection, UserId, WheelError};

use crate::catalog::CatalogStore;
use crate::error::AppError;
use crate::ledger::{LedgerOutcome, LedgerService};

pub type SharedRng = Arc<Mutex<Box<dyn RngCore + Send>>>;

#[derive(Debug, Clone, PartialEq)]
pub struct SpinOutcome {
    pub user_id: UserId,
    pub prize: PrizeEntry,
    pub roll: f64,
    pub new_balance: i64,
    pub spin_count: u64,
    pub attempts: u32,
}

#[derive(Clone)]
pub struct SpinService {
    catalog: CatalogStore,
    ledger: LedgerService,
    rng: SharedRng,
    max_conflict_retries: u32,
}

impl SpinService {
    pub fn new(
        catalog: CatalogStore,
        ledger: LedgerService,
        rng: Box<dyn RngCore + Send>,
        max_conflict_retries: u32,
    ) -> Self {
        Self {
            catalog,
            ledger,
            rng: Arc::new(Mutex::new(rng)),
            max_conflict_retries,
        }
    }

    pub async fn spin(&self, user_id: &str) -> Result<SpinOutcome, AppError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let prizes = self.catalog.list().await?;
            // NoPrizesAvailable is final; it is never retried.
            let selection = self.draw(&prizes)?;
            tracing::debug!(
                user_id,
                prize_id = selection.prize.id,
                roll = selection.roll,
                total_weight = selection.total_weight,
                "prize selected"
            );

            match self.commit(user_id, &selection).await {
                Ok((won, outcome)) => {
                    tracing::info!(
                        user_id,
                        prize_id = won.id,
                        label = %won.label,
                        points_delta = won.points_delta,
                        new_balance = outcome.new_balance,
                        "wheel spun"
                    );
                    return Ok(SpinOutcome {
                        user_id: user_id.to_string(),
                        prize: won,
                        roll: selection.roll,
                        new_balance: outcome.new_balance,
                        spin_count: outcome.spin_count,
                        attempts,
                    });
                }
                Err(AppError::Wheel(WheelError::Conflict(id) | WheelError::NotFound(id)))
                    if id == selection.prize.id =>
                {
                    if attempts > self.max_conflict_retries {
                        tracing::warn!(user_id, prize_id = id, attempts, "giving up after repeated stock conflicts");
                        return Err(AppError::Busy);
                    }
                    tracing::warn!(user_id, prize_id = id, attempts, "lost race for prize, drawing again");
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn draw(&self, prizes: &[PrizeEntry]) -> Result<Selection, WheelError> {
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        wheel_core::select(prizes, &mut **rng)
    }

    // Prize lock first, user lock second (inside the ledger). The ledger is
    // credited from the entry as re-read under the lock, not the draw snapshot.
    async fn commit(
        &self,
        user_id: &str,
        selection: &Selection,
    ) -> Result<(PrizeEntry, LedgerOutcome), AppError> {
        let guard = self.catalog.lock(selection.prize.id).await;
        let won = self.catalog.decrement_stock_held(&guard).await?;

        match self.ledger.apply_spin_result(user_id, &won).await {
            Ok(outcome) => Ok((won, outcome)),
            Err(err) => {
                tracing::error!(user_id, prize_id = guard.id(), error = %err, "ledger update failed, rolling back stock");
                if let Err(restore_err) = self.catalog.restore_stock_held(&guard).await {
                    tracing::error!(prize_id = guard.id(), error = %restore_err, "stock rollback failed");
                }
                Err(err)
            }
        }
    }
}
