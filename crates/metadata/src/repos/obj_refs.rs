//! Object reference repository.

use crate::error::MetadataResult;
use crate::models::{NewObjRef, ObjRefRow};
use crate::query::ObjRefQuery;
use async_trait::async_trait;

/// Repository for content-to-object references.
#[async_trait]
pub trait ObjRefRepo: Send + Sync {
    /// Reference an object from a content item.
    ///
    /// `DanglingReference` if either row is missing, `InvalidAggregate` if the
    /// content is an aggregate.
    async fn link_object(&self, obj_ref: NewObjRef) -> MetadataResult<ObjRefRow>;

    /// Drop every reference held by a content item.
    ///
    /// Returns the distinct object ids that lost a reference; these are the
    /// candidates for [`ObjectRepo::sweep_unreferenced`](super::ObjectRepo::sweep_unreferenced).
    async fn unlink_all(&self, content_id: i64) -> MetadataResult<Vec<i64>>;

    async fn list_obj_refs(&self, query: &ObjRefQuery) -> MetadataResult<Vec<ObjRefRow>>;

    async fn count_obj_refs(&self, query: &ObjRefQuery) -> MetadataResult<u64>;

    async fn delete_obj_refs(&self, query: &ObjRefQuery) -> MetadataResult<u64>;
}
