use serde::Serialize;
use wheel_core::{PrizeEntry, PrizeId, PrizePatch, PrizeSpec, SpinRecord, UserAccount};

use crate::catalog::CatalogStore;
use crate::error::AppError;
use crate::ledger::LedgerService;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub total_usuarios: usize,
    pub total_giros: u64,
    pub productos_activos: usize,
    pub productos_disponibles: usize,
}

#[derive(Clone)]
pub struct AdminGateway {
    catalog: CatalogStore,
    ledger: LedgerService,
}

impl AdminGateway {
    pub fn new(catalog: CatalogStore, ledger: LedgerService) -> Self {
        Self { catalog, ledger }
    }

    pub async fn list_products(&self) -> Result<Vec<PrizeEntry>, AppError> {
        self.catalog.list().await
    }

    pub async fn create_product(&self, spec: PrizeSpec) -> Result<PrizeEntry, AppError> {
        self.catalog.create(spec).await
    }

    pub async fn update_product(&self, id: PrizeId, patch: PrizePatch) -> Result<PrizeEntry, AppError> {
        self.catalog.update(id, patch).await
    }

    pub async fn delete_product(&self, id: PrizeId) -> Result<(), AppError> {
        self.catalog.delete(id).await
    }

    pub async fn stats(&self) -> Result<Stats, AppError> {
        let accounts = self.ledger.accounts().await?;
        let prizes = self.catalog.list().await?;
        Ok(Stats {
            total_usuarios: accounts.len(),
            total_giros: accounts.iter().map(|a| a.spin_count).sum(),
            productos_activos: prizes.iter().filter(|p| p.active).count(),
            productos_disponibles: prizes.iter().filter(|p| p.is_drawable()).count(),
        })
    }

    pub async fn leaderboard(&self, limit: usize) -> Result<Vec<UserAccount>, AppError> {
        self.ledger.leaderboard(limit).await
    }

    pub async fn redeem_award(&self, award_id: u64) -> Result<SpinRecord, AppError> {
        self.ledger.redeem(award_id).await
    }

    pub async fn awards(&self, user_id: Option<&str>) -> Result<Vec<SpinRecord>, AppError> {
        self.ledger.history(user_id).await
    }
}
