//! Database models mapping to the metadata schema.
//!
//! `*Row` types are read back from the store; `New*` types carry the columns a
//! caller supplies on insert (ids and defaults are assigned by the database).

use sqlx::FromRow;
use strata_core::{ContentAddress, DealStatus};
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// Identity
// =============================================================================

/// User record owned by the authentication component.
#[derive(Debug, Clone, FromRow)]
pub struct UserRow {
    pub id: i64,
    pub username: String,
    pub perm: i32,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub perm: i32,
}

/// API token issued to a user.
#[derive(Debug, Clone, FromRow)]
pub struct AuthTokenRow {
    pub id: i64,
    pub token: String,
    pub user_id: i64,
    pub expiry: OffsetDateTime,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewAuthToken {
    pub token: String,
    pub user_id: i64,
    pub expiry: OffsetDateTime,
}

// =============================================================================
// Contents
// =============================================================================

/// A logical pinned item: object-backed leaf or aggregate of other contents.
#[derive(Debug, Clone, FromRow)]
pub struct ContentRow {
    pub id: i64,
    #[sqlx(try_from = "Option<Vec<u8>>")]
    pub cid: ContentAddress,
    pub name: String,
    pub user_id: i64,
    pub size: i64,
    pub active: bool,
    pub offloaded: bool,
    pub replication: i32,
    pub aggregate: bool,
    /// Aggregate content this item is bundled into.
    pub aggregated_in: Option<i64>,
    /// Node (shuttle) holding the data, if not the primary.
    pub location: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewContent {
    pub cid: ContentAddress,
    pub name: String,
    pub user_id: i64,
    pub size: i64,
    pub active: bool,
    pub replication: i32,
    pub aggregate: bool,
    pub aggregated_in: Option<i64>,
    pub location: Option<String>,
    pub created_at: OffsetDateTime,
}

impl NewContent {
    /// An active, non-aggregate content item created now.
    pub fn new(user_id: i64, name: impl Into<String>, cid: ContentAddress) -> Self {
        Self {
            cid,
            name: name.into(),
            user_id,
            size: 0,
            active: true,
            replication: 6,
            aggregate: false,
            aggregated_in: None,
            location: None,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    /// An aggregate (bundle) content item.
    pub fn aggregate(user_id: i64, name: impl Into<String>) -> Self {
        Self {
            aggregate: true,
            ..Self::new(user_id, name, ContentAddress::UNDEF)
        }
    }

    /// Mark this item as a member of `aggregate_id`.
    pub fn in_aggregate(mut self, aggregate_id: i64) -> Self {
        self.aggregated_in = Some(aggregate_id);
        self
    }
}

// =============================================================================
// Objects and references
// =============================================================================

/// A deduplicated block, unique per content address.
#[derive(Debug, Clone, FromRow)]
pub struct ObjectRow {
    pub id: i64,
    #[sqlx(try_from = "Option<Vec<u8>>")]
    pub cid: ContentAddress,
    pub size: i64,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy)]
pub struct NewObject {
    pub cid: ContentAddress,
    pub size: i64,
}

/// Reference from a content item (`pin`) to an object it depends on.
#[derive(Debug, Clone, FromRow)]
pub struct ObjRefRow {
    pub id: i64,
    pub object: i64,
    pub pin: i64,
    pub offloaded: bool,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy)]
pub struct NewObjRef {
    pub object: i64,
    pub pin: i64,
    pub offloaded: bool,
}

/// Result of ingesting a content item together with its blocks.
#[derive(Debug, Clone)]
pub struct IngestedContent {
    pub content: ContentRow,
    pub objects: Vec<ObjectRow>,
    pub obj_refs: Vec<ObjRefRow>,
}

// =============================================================================
// Deals
// =============================================================================

/// Storage-provider deal backing a content item.
#[derive(Debug, Clone, FromRow)]
pub struct DealRow {
    pub id: i64,
    pub content: i64,
    pub provider: String,
    #[sqlx(try_from = "String")]
    pub status: DealStatus,
    /// On-chain deal id, once published.
    pub deal_id: Option<i64>,
    #[sqlx(try_from = "Option<Vec<u8>>")]
    pub proposal_cid: ContentAddress,
    pub verified: bool,
    pub failed_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewDeal {
    pub content: i64,
    pub provider: String,
    pub status: DealStatus,
    pub deal_id: Option<i64>,
    pub proposal_cid: ContentAddress,
    pub verified: bool,
}

impl NewDeal {
    /// A freshly proposed deal.
    pub fn proposed(content: i64, provider: impl Into<String>) -> Self {
        Self {
            content,
            provider: provider.into(),
            status: DealStatus::Proposed,
            deal_id: None,
            proposal_cid: ContentAddress::UNDEF,
            verified: false,
        }
    }
}

// =============================================================================
// Collections
// =============================================================================

/// User-owned named grouping of contents.
#[derive(Debug, Clone, FromRow)]
pub struct CollectionRow {
    pub id: i64,
    pub uuid: Uuid,
    pub user_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewCollection {
    pub uuid: Uuid,
    pub user_id: i64,
    pub name: String,
    pub description: Option<String>,
}

impl NewCollection {
    pub fn new(user_id: i64, name: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            user_id,
            name: name.into(),
            description: None,
        }
    }
}

/// Association of a content item with a collection.
#[derive(Debug, Clone, FromRow)]
pub struct CollectionRefRow {
    pub id: i64,
    pub collection: i64,
    pub content: i64,
    pub path: Option<String>,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewCollectionRef {
    pub collection: i64,
    pub content: i64,
    pub path: Option<String>,
}

// =============================================================================
// Storage providers
// =============================================================================

/// Provider (miner) registry entry.
#[derive(Debug, Clone, FromRow)]
pub struct StorageProviderRow {
    pub id: i64,
    pub address: String,
    pub created_at: OffsetDateTime,
}

/// Row counts per entity.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct StoreStats {
    pub users: u64,
    pub contents: u64,
    pub active_contents: u64,
    pub objects: u64,
    pub obj_refs: u64,
    pub deals: u64,
    pub collections: u64,
    pub providers: u64,
}
