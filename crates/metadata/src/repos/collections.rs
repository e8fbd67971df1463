//! Collection repository.

use crate::error::MetadataResult;
use crate::models::{CollectionRefRow, CollectionRow, NewCollection, NewCollectionRef};
use crate::query::CollectionQuery;
use async_trait::async_trait;

/// Repository for collections and their content references.
#[async_trait]
pub trait CollectionRepo: Send + Sync {
    async fn create_collection(&self, collection: &NewCollection) -> MetadataResult<CollectionRow>;

    /// Get the first matching collection, or `NotFound`.
    async fn get_collection(&self, query: &CollectionQuery) -> MetadataResult<CollectionRow>;

    async fn list_collections(&self, query: &CollectionQuery) -> MetadataResult<Vec<CollectionRow>>;

    /// Delete matching collections and their references. Contents are kept.
    async fn expect_delete_collections(&self, query: &CollectionQuery) -> MetadataResult<u64>;

    /// Add a content to a collection. Duplicate entries are allowed.
    async fn create_collection_ref(
        &self,
        collection_ref: &NewCollectionRef,
    ) -> MetadataResult<CollectionRefRow>;

    async fn list_collection_refs(&self, collection_id: i64)
    -> MetadataResult<Vec<CollectionRefRow>>;
}
