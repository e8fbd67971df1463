//! Store bootstrap.

use crate::error::MetadataResult;
use crate::store::MetadataStore;
use strata_core::DEFAULT_PROVIDERS;

/// Seed the provider registry with [`DEFAULT_PROVIDERS`] if it is empty.
///
/// Returns the number of providers added; zero on every run after the first.
pub async fn ensure_default_providers(store: &dyn MetadataStore) -> MetadataResult<u64> {
    if store.count_providers().await? > 0 {
        tracing::debug!("provider registry already populated");
        return Ok(0);
    }

    tracing::info!("adding default provider list");
    let added = store.seed_providers(DEFAULT_PROVIDERS).await?;
    tracing::info!(added, "default providers added");
    Ok(added)
}
