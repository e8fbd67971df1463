//! Garbage collection of unreferenced objects.
//!
//! Objects are shared between contents and live as long as one object
//! reference names them. Collection runs in two steps: pick candidates with
//! no references, then delete each one with a statement that re-checks the
//! condition. A reference added between the two steps keeps its object.

use crate::error::MetadataResult;
use crate::store::MetadataStore;
use serde::{Deserialize, Serialize};
use strata_core::config::GcConfig;

/// Outcome of a garbage collection run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcStats {
    /// Batches of candidates examined.
    pub batches: u64,
    /// Candidate objects examined.
    pub items_processed: u64,
    /// Objects deleted.
    pub items_deleted: u64,
}

/// Sweep unreferenced objects in batches until none remain.
///
/// Stops early when `max_batches` is reached, or when a whole batch was
/// re-referenced before it could be deleted.
pub async fn sweep_unreferenced_objects(
    store: &dyn MetadataStore,
    config: &GcConfig,
) -> MetadataResult<GcStats> {
    let mut stats = GcStats::default();

    loop {
        if config.max_batches > 0 && stats.batches >= config.max_batches {
            tracing::warn!(
                batches = stats.batches,
                max_batches = config.max_batches,
                "GC stopped at batch limit; unreferenced objects may remain"
            );
            break;
        }

        let candidates = store
            .list_unreferenced_objects(i64::from(config.batch_size))
            .await?;
        if candidates.is_empty() {
            break;
        }

        stats.batches += 1;
        stats.items_processed += candidates.len() as u64;

        let deleted = store.sweep_unreferenced(&candidates).await?;
        stats.items_deleted += deleted;
        if deleted == 0 {
            break;
        }
    }

    tracing::info!(
        batches = stats.batches,
        processed = stats.items_processed,
        deleted = stats.items_deleted,
        "GC sweep finished"
    );
    Ok(stats)
}

/// Drop every object reference of a content and sweep the objects that lost
/// their last one. Returns the number of objects deleted.
pub async fn release_content(store: &dyn MetadataStore, content_id: i64) -> MetadataResult<u64> {
    let candidates = store.unlink_all(content_id).await?;
    tracing::debug!(
        content_id,
        candidates = candidates.len(),
        "released content references"
    );
    store.sweep_unreferenced(&candidates).await
}
