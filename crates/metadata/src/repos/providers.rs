//! Storage provider registry.

use crate::error::MetadataResult;
use crate::models::StorageProviderRow;
use async_trait::async_trait;

#[async_trait]
pub trait ProviderRepo: Send + Sync {
    async fn list_providers(&self) -> MetadataResult<Vec<StorageProviderRow>>;

    async fn count_providers(&self) -> MetadataResult<u64>;

    /// Register a provider by ID address (`f0...`). Idempotent.
    async fn add_provider(&self, address: &str) -> MetadataResult<StorageProviderRow>;

    /// Insert `addresses` if the registry is empty, in one transaction.
    ///
    /// Returns the number of providers inserted; zero when the registry was
    /// already populated.
    async fn seed_providers(&self, addresses: &[&str]) -> MetadataResult<u64>;
}
