//! Object repository and sweep.

use crate::error::MetadataResult;
use crate::models::{NewObject, ObjectRow};
use crate::query::ObjectQuery;
use async_trait::async_trait;

/// Repository for deduplicated objects.
#[async_trait]
pub trait ObjectRepo: Send + Sync {
    /// Return the object for an address, inserting it on first sight.
    ///
    /// A single upsert statement, so concurrent callers converge on one row.
    /// The size recorded by the first insert wins.
    async fn find_or_create_object(&self, object: NewObject) -> MetadataResult<ObjectRow>;

    /// Get the first matching object, or `NotFound`.
    async fn get_object(&self, query: &ObjectQuery) -> MetadataResult<ObjectRow>;

    async fn list_objects(&self, query: &ObjectQuery) -> MetadataResult<Vec<ObjectRow>>;

    async fn count_objects(&self, query: &ObjectQuery) -> MetadataResult<u64>;

    async fn object_exists(&self, query: &ObjectQuery) -> MetadataResult<bool> {
        Ok(self.count_objects(query).await? > 0)
    }

    /// Ids of objects with no references, lowest first.
    async fn list_unreferenced_objects(&self, limit: i64) -> MetadataResult<Vec<i64>>;

    /// Delete candidates that are still unreferenced.
    ///
    /// Each candidate is removed by its own conditional statement; one that
    /// gained a reference in the meantime is left alone. Returns the number
    /// of objects deleted.
    async fn sweep_unreferenced(&self, candidates: &[i64]) -> MetadataResult<u64>;
}
