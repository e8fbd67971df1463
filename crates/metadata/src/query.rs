//! Query filters.
//!
//! Each entity has a plain value type describing "which rows": optional
//! equality filters, ordering and paging. Building one performs no I/O; it is handed
//! to a single terminal method on the store (`get_*`, `list_*`, `count_*`,
//! `*_exists`, `delete_*`, `expect_delete_*`). Filters are AND-combined.
//! There is no OR support.
//!
//! Backends render a query into an [`SqlWriter`] over `sqlx::QueryBuilder`,
//! which numbers placeholders for the target database.

use crate::error::{MetadataError, MetadataResult};
use sqlx::{Database, Encode, Postgres, QueryBuilder, Sqlite, Type};
use strata_core::ContentAddress;
use uuid::Uuid;

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

impl SortOrder {
    fn as_sql(&self) -> &'static str {
        match self {
            Self::Ascending => "ASC",
            Self::Descending => "DESC",
        }
    }
}

/// Sort key for content listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentOrder {
    CreatedAt,
    Id,
}

/// Paging window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Page {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

// =============================================================================
// Per-entity queries
// =============================================================================

/// Users filter.
#[derive(Debug, Clone, Default)]
pub struct UserQuery {
    pub id: Option<i64>,
    pub username: Option<String>,
}

impl UserQuery {
    pub fn by_id(id: i64) -> Self {
        Self {
            id: Some(id),
            ..Self::default()
        }
    }

    pub fn by_username(username: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            ..Self::default()
        }
    }

    pub(crate) fn apply<'args, DB: Dialect>(&self, sql: &mut SqlWriter<'args, DB>)
    where
        i64: Encode<'args, DB> + Type<DB>,
        String: Encode<'args, DB> + Type<DB>,
    {
        if let Some(id) = self.id {
            sql.and_eq("id", id);
        }
        if let Some(username) = &self.username {
            sql.and_eq("username", username.clone());
        }
    }
}

/// Contents filter, ordering and paging.
#[derive(Debug, Clone, Default)]
pub struct ContentQuery {
    pub id: Option<i64>,
    pub user_id: Option<i64>,
    pub active: Option<bool>,
    pub aggregate: Option<bool>,
    pub aggregated_in: Option<i64>,
    /// Match any of these addresses. An empty list matches nothing;
    /// [`ContentAddress::UNDEF`] matches contents without an address.
    pub cids: Option<Vec<ContentAddress>>,
    pub order: Vec<(ContentOrder, SortOrder)>,
    pub page: Page,
}

impl ContentQuery {
    /// Every content row.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn by_id(id: i64) -> Self {
        Self::all().with_id(id)
    }

    /// Members of an aggregate.
    pub fn children_of(aggregate_id: i64) -> Self {
        Self::all().with_aggregated_in(aggregate_id)
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_user_id(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_active(mut self, active: bool) -> Self {
        self.active = Some(active);
        self
    }

    pub fn with_aggregate(mut self, aggregate: bool) -> Self {
        self.aggregate = Some(aggregate);
        self
    }

    pub fn with_aggregated_in(mut self, content_id: i64) -> Self {
        self.aggregated_in = Some(content_id);
        self
    }

    pub fn with_cid(self, cid: ContentAddress) -> Self {
        self.with_cids(vec![cid])
    }

    pub fn with_cids(mut self, cids: Vec<ContentAddress>) -> Self {
        self.cids = Some(cids);
        self
    }

    pub fn order_by_creation_date(mut self, order: SortOrder) -> Self {
        self.order.push((ContentOrder::CreatedAt, order));
        self
    }

    pub fn order_by_id(mut self, order: SortOrder) -> Self {
        self.order.push((ContentOrder::Id, order));
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.page.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: i64) -> Self {
        self.page.offset = Some(offset);
        self
    }

    pub(crate) fn apply<'args, DB: Dialect>(&self, sql: &mut SqlWriter<'args, DB>)
    where
        i64: Encode<'args, DB> + Type<DB>,
        bool: Encode<'args, DB> + Type<DB>,
        Vec<u8>: Encode<'args, DB> + Type<DB>,
    {
        if let Some(id) = self.id {
            sql.and_eq("id", id);
        }
        if let Some(user_id) = self.user_id {
            sql.and_eq("user_id", user_id);
        }
        if let Some(active) = self.active {
            sql.and_eq("active", active);
        }
        if let Some(aggregate) = self.aggregate {
            sql.and_eq("aggregate", aggregate);
        }
        if let Some(aggregated_in) = self.aggregated_in {
            sql.and_eq("aggregated_in", aggregated_in);
        }
        if let Some(cids) = &self.cids {
            sql.and_address_in("cid", cids);
        }
    }

    pub(crate) fn apply_order_and_page<'args, DB: Dialect>(&self, sql: &mut SqlWriter<'args, DB>)
    where
        i64: Encode<'args, DB> + Type<DB>,
    {
        self.apply_order(sql);
        sql.page(self.page);
    }

    /// Ordering plus a one-row window, for `get`. Unordered queries take the
    /// lowest id.
    pub(crate) fn apply_first<'args, DB: Dialect>(&self, sql: &mut SqlWriter<'args, DB>)
    where
        i64: Encode<'args, DB> + Type<DB>,
    {
        if self.order.is_empty() {
            sql.order_by("id", SortOrder::Ascending);
        } else {
            self.apply_order(sql);
        }
        sql.page(Page {
            limit: Some(1),
            offset: self.page.offset,
        });
    }

    fn apply_order<DB: Dialect>(&self, sql: &mut SqlWriter<'_, DB>) {
        for (key, order) in &self.order {
            let column = match key {
                ContentOrder::CreatedAt => "created_at",
                ContentOrder::Id => "id",
            };
            sql.order_by(column, *order);
        }
        // Keep pagination stable when creation times collide.
        if !self.order.is_empty() && !self.order.iter().any(|(k, _)| *k == ContentOrder::Id) {
            sql.order_by("id", self.order[0].1);
        }
    }
}

/// Objects filter.
#[derive(Debug, Clone, Default)]
pub struct ObjectQuery {
    pub id: Option<i64>,
    pub cid: Option<ContentAddress>,
}

impl ObjectQuery {
    pub fn by_id(id: i64) -> Self {
        Self {
            id: Some(id),
            ..Self::default()
        }
    }

    pub fn by_cid(cid: ContentAddress) -> Self {
        Self {
            cid: Some(cid),
            ..Self::default()
        }
    }

    pub(crate) fn apply<'args, DB: Dialect>(&self, sql: &mut SqlWriter<'args, DB>)
    where
        i64: Encode<'args, DB> + Type<DB>,
        Vec<u8>: Encode<'args, DB> + Type<DB>,
    {
        if let Some(id) = self.id {
            sql.and_eq("id", id);
        }
        if let Some(cid) = &self.cid {
            sql.and_address_in("cid", std::slice::from_ref(cid));
        }
    }
}

/// Object references filter.
#[derive(Debug, Clone, Default)]
pub struct ObjRefQuery {
    pub pin: Option<i64>,
    pub object: Option<i64>,
}

impl ObjRefQuery {
    pub fn by_pin(pin: i64) -> Self {
        Self {
            pin: Some(pin),
            ..Self::default()
        }
    }

    pub fn by_object(object: i64) -> Self {
        Self {
            object: Some(object),
            ..Self::default()
        }
    }

    pub(crate) fn apply<'args, DB: Dialect>(&self, sql: &mut SqlWriter<'args, DB>)
    where
        i64: Encode<'args, DB> + Type<DB>,
    {
        if let Some(pin) = self.pin {
            sql.and_eq("pin", pin);
        }
        if let Some(object) = self.object {
            sql.and_eq("object", object);
        }
    }
}

/// Deals filter.
#[derive(Debug, Clone, Default)]
pub struct DealQuery {
    pub content_id: Option<i64>,
    /// Batched lookup: deals of any of these contents. Empty matches nothing.
    pub content_ids: Option<Vec<i64>>,
}

impl DealQuery {
    pub fn by_content(content_id: i64) -> Self {
        Self {
            content_id: Some(content_id),
            ..Self::default()
        }
    }

    pub fn by_contents(content_ids: Vec<i64>) -> Self {
        Self {
            content_ids: Some(content_ids),
            ..Self::default()
        }
    }

    pub(crate) fn apply<'args, DB: Dialect>(&self, sql: &mut SqlWriter<'args, DB>)
    where
        i64: Encode<'args, DB> + Type<DB>,
    {
        if let Some(content_id) = self.content_id {
            sql.and_eq("content", content_id);
        }
        if let Some(ids) = &self.content_ids {
            sql.and_in("content", ids.clone());
        }
    }
}

/// Collections filter.
#[derive(Debug, Clone, Default)]
pub struct CollectionQuery {
    pub uuid: Option<Uuid>,
    pub user_id: Option<i64>,
}

impl CollectionQuery {
    pub fn by_uuid(uuid: Uuid) -> Self {
        Self {
            uuid: Some(uuid),
            ..Self::default()
        }
    }

    pub fn by_user(user_id: i64) -> Self {
        Self {
            user_id: Some(user_id),
            ..Self::default()
        }
    }

    pub fn with_user_id(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub(crate) fn apply<'args, DB: Dialect>(&self, sql: &mut SqlWriter<'args, DB>)
    where
        i64: Encode<'args, DB> + Type<DB>,
        Uuid: Encode<'args, DB> + Type<DB>,
    {
        if let Some(uuid) = self.uuid {
            sql.and_eq("uuid", uuid);
        }
        if let Some(user_id) = self.user_id {
            sql.and_eq("user_id", user_id);
        }
    }
}

// =============================================================================
// Statement rendering
// =============================================================================

/// Backend details that affect rendering.
pub(crate) trait Dialect: Database {
    /// SQLite only accepts `OFFSET` after a `LIMIT` clause.
    const OFFSET_NEEDS_LIMIT: bool;
}

impl Dialect for Sqlite {
    const OFFSET_NEEDS_LIMIT: bool = true;
}

impl Dialect for Postgres {
    const OFFSET_NEEDS_LIMIT: bool = false;
}

/// A [`QueryBuilder`] that tracks its `WHERE` and `ORDER BY` clauses so
/// filters can be appended in any number.
pub(crate) struct SqlWriter<'args, DB: Database> {
    builder: QueryBuilder<'args, DB>,
    has_where: bool,
    has_order: bool,
}

impl<'args, DB: Dialect> SqlWriter<'args, DB>
where
    <DB as Database>::Arguments<'args>: Default,
{
    pub fn new(base: &str) -> Self {
        Self {
            builder: QueryBuilder::new(base),
            has_where: false,
            has_order: false,
        }
    }
}

impl<'args, DB: Dialect> SqlWriter<'args, DB> {
    /// Open the next predicate with `WHERE` or `AND`.
    fn predicate(&mut self) -> &mut QueryBuilder<'args, DB> {
        self.builder
            .push(if self.has_where { " AND " } else { " WHERE " });
        self.has_where = true;
        &mut self.builder
    }

    pub fn and_eq<T>(&mut self, column: &str, value: T)
    where
        T: 'args + Encode<'args, DB> + Type<DB>,
    {
        self.predicate().push(column).push(" = ").push_bind(value);
    }

    /// `column IN (...)`. An empty list matches nothing.
    pub fn and_in<T>(&mut self, column: &str, values: Vec<T>)
    where
        T: 'args + Encode<'args, DB> + Type<DB>,
    {
        if values.is_empty() {
            self.predicate().push("1 = 0");
            return;
        }
        let builder = self.predicate();
        builder.push(column).push(" IN (");
        let mut list = builder.separated(", ");
        for value in values {
            list.push_bind(value);
        }
        list.push_unseparated(")");
    }

    /// Match any of `addresses`. The undefined address is stored as NULL and
    /// matched with `IS NULL`.
    pub fn and_address_in(&mut self, column: &str, addresses: &[ContentAddress])
    where
        Vec<u8>: Encode<'args, DB> + Type<DB>,
    {
        let defined: Vec<Vec<u8>> = addresses
            .iter()
            .filter(|a| a.is_defined())
            .map(ContentAddress::to_bytes)
            .collect();
        let wants_null = defined.len() < addresses.len();

        if !wants_null {
            self.and_in(column, defined);
            return;
        }
        let builder = self.predicate();
        if defined.is_empty() {
            builder.push(column).push(" IS NULL");
            return;
        }
        builder
            .push("(")
            .push(column)
            .push(" IS NULL OR ")
            .push(column)
            .push(" IN (");
        let mut list = builder.separated(", ");
        for value in defined {
            list.push_bind(value);
        }
        list.push_unseparated("))");
    }

    pub fn order_by(&mut self, column: &str, order: SortOrder) {
        self.builder
            .push(if self.has_order { ", " } else { " ORDER BY " });
        self.has_order = true;
        self.builder.push(column).push(" ").push(order.as_sql());
    }

    pub fn page(&mut self, page: Page)
    where
        i64: Encode<'args, DB> + Type<DB>,
    {
        if let Some(limit) = page.limit {
            self.builder.push(" LIMIT ").push_bind(limit);
        } else if page.offset.is_some() && DB::OFFSET_NEEDS_LIMIT {
            self.builder.push(" LIMIT -1");
        }
        if let Some(offset) = page.offset {
            self.builder.push(" OFFSET ").push_bind(offset);
        }
    }

    /// Append a trailing clause such as `ORDER BY id`.
    pub fn push(&mut self, clause: &str) {
        self.builder.push(" ").push(clause);
    }

    /// Refuse to run a `DELETE` without any filter, which would empty `table`.
    pub fn ensure_filtered(&self, table: &str) -> MetadataResult<()> {
        if self.has_where {
            return Ok(());
        }
        Err(MetadataError::Constraint(format!(
            "refusing to delete from {table} without conditions"
        )))
    }

    pub fn sql(&self) -> &str {
        self.builder.sql()
    }

    pub fn builder(&mut self) -> &mut QueryBuilder<'args, DB> {
        &mut self.builder
    }
}
