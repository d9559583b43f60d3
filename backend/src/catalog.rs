use std::sync::Arc;

use tokio::sync::OwnedMutexGuard;
use wheel_core::{Category, PrizeEntry, PrizeId, PrizePatch, PrizeSpec, WheelError};

use crate::error::AppError;
use crate::locks::KeyedLocks;
use crate::now_millis;
use crate::storage::{retry_read, RetryPolicy, Storage};

#[derive(Clone)]
pub struct CatalogStore {
    storage: Arc<dyn Storage>,
    locks: Arc<KeyedLocks<PrizeId>>,
    retry: RetryPolicy,
}

pub struct PrizeGuard {
    id: PrizeId,
    _guard: OwnedMutexGuard<()>,
}

impl PrizeGuard {
    pub fn id(&self) -> PrizeId {
        self.id
    }
}

impl CatalogStore {
    pub fn new(storage: Arc<dyn Storage>, retry: RetryPolicy) -> Self {
        Self {
            storage,
            locks: Arc::new(KeyedLocks::new()),
            retry,
        }
    }

    pub async fn list(&self) -> Result<Vec<PrizeEntry>, AppError> {
        let storage = self.storage.clone();
        let mut prizes = retry_read(self.retry, move || {
            let storage = storage.clone();
            async move { storage.list_prizes().await }
        })
        .await?;
        prizes.sort_by_key(|p| p.id);
        Ok(prizes)
    }

    pub async fn get(&self, id: PrizeId) -> Result<PrizeEntry, AppError> {
        let storage = self.storage.clone();
        retry_read(self.retry, move || {
            let storage = storage.clone();
            async move { storage.get_prize(id).await }
        })
        .await?
        .ok_or(AppError::Wheel(WheelError::NotFound(id)))
    }

    pub async fn create(&self, spec: PrizeSpec) -> Result<PrizeEntry, AppError> {
        spec.validate()?;
        let id = self.storage.next_prize_id().await?;
        let entry = spec.into_entry(id, now_millis())?;
        self.storage.put_prize(entry.clone()).await?;
        tracing::info!(prize_id = id, label = %entry.label, "prize created");
        Ok(entry)
    }

    pub async fn update(&self, id: PrizeId, patch: PrizePatch) -> Result<PrizeEntry, AppError> {
        let _guard = self.lock(id).await;
        let current = self.get(id).await?;
        let next = current.apply_patch(patch, now_millis())?;
        self.storage.put_prize(next.clone()).await?;
        tracing::info!(prize_id = id, "prize updated");
        Ok(next)
    }

    pub async fn delete(&self, id: PrizeId) -> Result<(), AppError> {
        let _guard = self.lock(id).await;
        if !self.storage.delete_prize(id).await? {
            return Err(WheelError::NotFound(id).into());
        }
        tracing::info!(prize_id = id, "prize deleted");
        Ok(())
    }

    pub async fn lock(&self, id: PrizeId) -> PrizeGuard {
        PrizeGuard {
            id,
            _guard: self.locks.lock(&id).await,
        }
    }

    pub async fn decrement_stock(&self, id: PrizeId) -> Result<PrizeEntry, AppError> {
        let guard = self.lock(id).await;
        self.decrement_stock_held(&guard).await
    }

    /// Takes one unit of stock from the guarded entry. Fails with `Conflict`
    /// when the entry stopped being drawable since it was selected.
    pub async fn decrement_stock_held(&self, guard: &PrizeGuard) -> Result<PrizeEntry, AppError> {
        let current = self.get(guard.id).await?;
        if !current.is_drawable() {
            return Err(WheelError::Conflict(guard.id).into());
        }
        let stock = current
            .stock
            .take_one()
            .ok_or(WheelError::Conflict(guard.id))?;
        if stock == current.stock {
            return Ok(current);
        }
        let next = PrizeEntry {
            stock,
            updated_at: now_millis(),
            ..current
        };
        self.storage.put_prize(next.clone()).await?;
        Ok(next)
    }

    pub async fn restore_stock_held(&self, guard: &PrizeGuard) -> Result<PrizeEntry, AppError> {
        let current = self.get(guard.id).await?;
        let stock = current.stock.give_back();
        if stock == current.stock {
            return Ok(current);
        }
        let next = PrizeEntry {
            stock,
            updated_at: now_millis(),
            ..current
        };
        self.storage.put_prize(next.clone()).await?;
        Ok(next)
    }

    pub async fn seed_defaults(&self) -> Result<usize, AppError> {
        if !self.list().await?.is_empty() {
            return Ok(0);
        }
        let defaults = default_catalog();
        let count = defaults.len();
        for spec in defaults {
            self.create(spec).await?;
        }
        tracing::info!(count, "seeded default catalog");
        Ok(count)
    }
}

fn default_catalog() -> Vec<PrizeSpec> {
    let spec = |label: &str, category, points_delta, stock, weight, color: &str| PrizeSpec {
        label: label.to_string(),
        category,
        points_delta,
        stock,
        weight,
        color: Some(color.to_string()),
        image_url: None,
    };
    vec![
        spec("Premio Mayor", Category::Prize, 100, Some(1), 0.05, "#FFD700"),
        spec("Viaje a la Playa", Category::Prize, 80, Some(1), 0.08, "#4CAF50"),
        spec("Tarjeta Regalo $50", Category::Prize, 60, Some(1), 0.1, "#2196F3"),
        spec("Pierdes Turno", Category::Penalty, -10, Some(1), 0.15, "#F44336"),
        spec("Giro Extra", Category::Bonus, 0, Some(1), 0.07, "#9C27B0"),
    ]
}
