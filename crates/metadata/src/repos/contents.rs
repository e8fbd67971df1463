//! Content repository.

use crate::error::MetadataResult;
use crate::models::{ContentRow, IngestedContent, NewContent, NewObject};
use crate::query::ContentQuery;
use async_trait::async_trait;

/// Repository for content items.
#[async_trait]
pub trait ContentRepo: Send + Sync {
    /// Create a content item.
    ///
    /// A non-null `aggregated_in` must name an existing aggregate content,
    /// otherwise the insert is refused with `DanglingReference`.
    async fn create_content(&self, content: &NewContent) -> MetadataResult<ContentRow>;

    /// Create several content items in one transaction. All or nothing.
    async fn create_contents(&self, contents: &[NewContent]) -> MetadataResult<Vec<ContentRow>>;

    /// Ingest a content item together with the blocks it pins.
    ///
    /// Inserts the content, finds or creates each object and links it, all in
    /// one transaction. Aggregates cannot own objects (`InvalidAggregate`).
    async fn create_content_with_objects(
        &self,
        content: &NewContent,
        objects: &[NewObject],
    ) -> MetadataResult<IngestedContent>;

    /// Get the first matching content, or `NotFound`.
    async fn get_content(&self, query: &ContentQuery) -> MetadataResult<ContentRow>;

    async fn list_contents(&self, query: &ContentQuery) -> MetadataResult<Vec<ContentRow>>;

    /// Count matching contents. Ordering and paging are ignored.
    async fn count_contents(&self, query: &ContentQuery) -> MetadataResult<u64>;

    async fn content_exists(&self, query: &ContentQuery) -> MetadataResult<bool> {
        Ok(self.count_contents(query).await? > 0)
    }

    /// Mark a content inactive, together with every member of an aggregate,
    /// including members of nested aggregates.
    ///
    /// Returns the number of rows deactivated. `NotFound` if `id` is unknown.
    async fn soft_delete_content(&self, id: i64) -> MetadataResult<u64>;

    /// Remove a content row for good.
    ///
    /// Refused with `ContentInUse` while object references, non-failed deals
    /// or aggregated children remain. Failed deals and collection references
    /// are removed with the row.
    async fn hard_delete_content(&self, id: i64) -> MetadataResult<()>;
}
