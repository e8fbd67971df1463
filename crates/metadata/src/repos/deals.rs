//! Deal repository.

use crate::error::MetadataResult;
use crate::models::{DealRow, NewDeal};
use crate::query::DealQuery;
use async_trait::async_trait;
use strata_core::DealStatus;

/// Repository for storage deals.
#[async_trait]
pub trait DealRepo: Send + Sync {
    /// Record a deal. `DanglingReference` if the content does not exist.
    async fn create_deal(&self, deal: &NewDeal) -> MetadataResult<DealRow>;

    async fn list_deals(&self, query: &DealQuery) -> MetadataResult<Vec<DealRow>>;

    async fn count_deals(&self, query: &DealQuery) -> MetadataResult<u64>;

    /// Persist a status transition. Moving to `failed` stamps `failed_at`.
    async fn set_deal_status(&self, deal_id: i64, status: DealStatus) -> MetadataResult<DealRow>;

    /// Delete matching deals, returning how many were removed.
    async fn delete_deals(&self, query: &DealQuery) -> MetadataResult<u64>;
}
