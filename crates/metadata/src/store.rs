//! Metadata store trait and implementations.

use crate::error::{MetadataError, MetadataResult};
use crate::models::StoreStats;
use crate::repos::{
    CollectionRepo, ContentRepo, DealRepo, ObjRefRepo, ObjectRepo, ProviderRepo, UserRepo,
};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore:
    UserRepo
    + ContentRepo
    + ObjectRepo
    + ObjRefRepo
    + DealRepo
    + CollectionRepo
    + ProviderRepo
    + Send
    + Sync
{
    /// Create the schema if it does not exist yet. Idempotent.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;

    /// Row counts per entity.
    async fn stats(&self) -> MetadataResult<StoreStats>;
}

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (creating if needed) a SQLite store and apply the schema.
    pub async fn new(
        path: impl AsRef<Path>,
        query_timeout_secs: Option<u64>,
    ) -> MetadataResult<Self> {
        let path = path.as_ref();
        let query_timeout_secs = query_timeout_secs.unwrap_or(600);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            // One writer at a time; a single connection also keeps `:memory:`
            // databases alive for the lifetime of the pool.
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;

        tracing::warn!(
            path = %path.display(),
            query_timeout_secs,
            "SQLite query timeout is advisory only; use PostgreSQL for concurrent deployments"
        );

        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        tracing::debug!("SQLite schema applied");
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn stats(&self) -> MetadataResult<StoreStats> {
        let count = |sql: &'static str| async move {
            let n: i64 = sqlx::query_scalar(sql).fetch_one(&self.pool).await?;
            Ok::<u64, MetadataError>(n as u64)
        };

        Ok(StoreStats {
            users: count("SELECT COUNT(*) FROM users").await?,
            contents: count("SELECT COUNT(*) FROM contents").await?,
            active_contents: count("SELECT COUNT(*) FROM contents WHERE active = 1").await?,
            objects: count("SELECT COUNT(*) FROM objects").await?,
            obj_refs: count("SELECT COUNT(*) FROM obj_refs").await?,
            deals: count("SELECT COUNT(*) FROM deals").await?,
            collections: count("SELECT COUNT(*) FROM collections").await?,
            providers: count("SELECT COUNT(*) FROM storage_providers").await?,
        })
    }
}

// Implement all the repository traits for SqliteStore
mod sqlite_impl {
    use super::*;
    use crate::error::{is_foreign_key_violation, is_unique_violation};
    use crate::models::*;
    use crate::query::{
        CollectionQuery, ContentQuery, DealQuery, ObjRefQuery, ObjectQuery, SqlWriter,
        UserQuery,
    };
    use sqlx::encode::IsNull;
    use sqlx::error::BoxDynError;
    use sqlx::sqlite::SqliteTypeInfo;
    use sqlx::{Database, Encode, SqliteConnection, Type};
    use strata_core::DealStatus;
    use strata_core::provider::is_id_address;
    use time::macros::format_description;
    use time::{OffsetDateTime, UtcOffset};

    fn writer(base: &str) -> SqlWriter<'static, Sqlite> {
        SqlWriter::new(base)
    }

    /// A timestamp stored as fixed-width UTC text, so that SQLite's string
    /// comparison orders rows by instant. Reads decode it as RFC 3339.
    #[derive(Debug, Clone, Copy)]
    struct SortableTimestamp(OffsetDateTime);

    impl SortableTimestamp {
        fn now() -> Self {
            Self(OffsetDateTime::now_utc())
        }
    }

    impl<'q> Encode<'q, Sqlite> for SortableTimestamp {
        fn encode_by_ref(
            &self,
            buf: &mut <Sqlite as Database>::ArgumentBuffer<'q>,
        ) -> Result<IsNull, BoxDynError> {
            let text = self.0.to_offset(UtcOffset::UTC).format(format_description!(
                "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:9]Z"
            ))?;
            Encode::<'q, Sqlite>::encode(text, buf)
        }
    }

    impl Type<Sqlite> for SortableTimestamp {
        fn type_info() -> SqliteTypeInfo {
            <String as Type<Sqlite>>::type_info()
        }

        fn compatible(ty: &SqliteTypeInfo) -> bool {
            <String as Type<Sqlite>>::compatible(ty)
        }
    }

    // -------------------------------------------------------------------------
    // Shared statements, usable on the pool or inside a transaction
    // -------------------------------------------------------------------------

    async fn insert_content(
        conn: &mut SqliteConnection,
        content: &NewContent,
    ) -> MetadataResult<ContentRow> {
        let now = SortableTimestamp::now();
        let row = sqlx::query_as::<_, ContentRow>(
            r#"
            INSERT INTO contents (
                cid, name, user_id, size, active, offloaded, replication,
                aggregate, aggregated_in, location, created_at, updated_at
            )
            SELECT ?1, ?2, ?3, ?4, ?5, 0, ?6, ?7, ?8, ?9, ?10, ?11
            WHERE ?8 IS NULL
               OR EXISTS (SELECT 1 FROM contents WHERE id = ?8 AND aggregate = 1)
            RETURNING *
            "#,
        )
        .bind(content.cid.to_column())
        .bind(&content.name)
        .bind(content.user_id)
        .bind(content.size)
        .bind(content.active)
        .bind(content.replication)
        .bind(content.aggregate)
        .bind(content.aggregated_in)
        .bind(&content.location)
        .bind(SortableTimestamp(content.created_at))
        .bind(now)
        .fetch_optional(&mut *conn)
        .await?;

        row.ok_or_else(|| {
            MetadataError::DanglingReference(format!(
                "aggregated_in {} is not an existing aggregate content",
                content.aggregated_in.unwrap_or_default()
            ))
        })
    }

    async fn upsert_object(
        conn: &mut SqliteConnection,
        object: NewObject,
    ) -> MetadataResult<ObjectRow> {
        if !object.cid.is_defined() {
            return Err(MetadataError::MalformedIdentifier(
                "object address must be defined".to_string(),
            ));
        }

        let row = sqlx::query_as::<_, ObjectRow>(
            r#"
            INSERT INTO objects (cid, size, created_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(cid) DO UPDATE SET size = objects.size
            RETURNING *
            "#,
        )
        .bind(object.cid.to_bytes())
        .bind(object.size)
        .bind(SortableTimestamp::now())
        .fetch_one(&mut *conn)
        .await?;
        Ok(row)
    }

    async fn insert_obj_ref(
        conn: &mut SqliteConnection,
        obj_ref: NewObjRef,
    ) -> MetadataResult<ObjRefRow> {
        let result = sqlx::query_as::<_, ObjRefRow>(
            r#"
            INSERT INTO obj_refs (object, pin, offloaded, created_at)
            SELECT ?1, ?2, ?3, ?4
            WHERE EXISTS (SELECT 1 FROM objects WHERE id = ?1)
              AND EXISTS (SELECT 1 FROM contents WHERE id = ?2 AND aggregate = 0)
            RETURNING *
            "#,
        )
        .bind(obj_ref.object)
        .bind(obj_ref.pin)
        .bind(obj_ref.offloaded)
        .bind(SortableTimestamp::now())
        .fetch_optional(&mut *conn)
        .await;

        match result {
            Ok(Some(row)) => Ok(row),
            Ok(None) => Err(link_refusal(conn, obj_ref).await?),
            Err(e) if is_foreign_key_violation(&e) => Err(link_refusal(conn, obj_ref).await?),
            Err(e) => Err(e.into()),
        }
    }

    /// Work out why a link was refused.
    async fn link_refusal(
        conn: &mut SqliteConnection,
        obj_ref: NewObjRef,
    ) -> MetadataResult<MetadataError> {
        let aggregate: Option<bool> =
            sqlx::query_scalar("SELECT aggregate FROM contents WHERE id = ?")
                .bind(obj_ref.pin)
                .fetch_optional(&mut *conn)
                .await?;

        Ok(match aggregate {
            None => MetadataError::DanglingReference(format!("content {} not found", obj_ref.pin)),
            Some(true) => MetadataError::InvalidAggregate(format!(
                "content {} is an aggregate and cannot reference objects",
                obj_ref.pin
            )),
            Some(false) => {
                MetadataError::DanglingReference(format!("object {} not found", obj_ref.object))
            }
        })
    }

    // -------------------------------------------------------------------------
    // Users
    // -------------------------------------------------------------------------

    #[async_trait]
    impl UserRepo for SqliteStore {
        async fn create_user(&self, user: &NewUser) -> MetadataResult<UserRow> {
            let result = sqlx::query_as::<_, UserRow>(
                "INSERT INTO users (username, perm, created_at) VALUES (?, ?, ?) RETURNING *",
            )
            .bind(&user.username)
            .bind(user.perm)
            .bind(SortableTimestamp::now())
            .fetch_one(&self.pool)
            .await;

            match result {
                Ok(row) => Ok(row),
                Err(e) if is_unique_violation(&e) => Err(MetadataError::Constraint(format!(
                    "username '{}' already exists",
                    user.username
                ))),
                Err(e) => Err(e.into()),
            }
        }

        async fn get_user(&self, query: &UserQuery) -> MetadataResult<UserRow> {
            let mut sql = writer("SELECT * FROM users");
            query.apply(&mut sql);
            sql.push("ORDER BY id LIMIT 1");
            sql
                .builder()
                .build_query_as::<UserRow>()
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| MetadataError::NotFound(format!("user matching {query:?}")))
        }

        async fn count_users(&self, query: &UserQuery) -> MetadataResult<u64> {
            let mut sql = writer("SELECT COUNT(*) FROM users");
            query.apply(&mut sql);
            let count: i64 = sql
                .builder()
                .build_query_scalar()
                .fetch_one(&self.pool)
                .await?;
            Ok(count as u64)
        }

        async fn expect_delete_users(&self, query: &UserQuery) -> MetadataResult<u64> {
            let mut sql = writer("DELETE FROM users");
            query.apply(&mut sql);
            sql.ensure_filtered("users")?;
            let result = sql
                .builder()
                .build()
                .execute(&self.pool)
                .await?;
            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!("no user matching {query:?}")));
            }
            Ok(result.rows_affected())
        }

        async fn create_auth_token(&self, token: &NewAuthToken) -> MetadataResult<AuthTokenRow> {
            let result = sqlx::query_as::<_, AuthTokenRow>(
                "INSERT INTO auth_tokens (token, user_id, expiry, created_at) VALUES (?, ?, ?, ?) RETURNING *",
            )
            .bind(&token.token)
            .bind(token.user_id)
            .bind(SortableTimestamp(token.expiry))
            .bind(SortableTimestamp::now())
            .fetch_one(&self.pool)
            .await;

            match result {
                Ok(row) => Ok(row),
                Err(e) if is_foreign_key_violation(&e) => Err(MetadataError::DanglingReference(
                    format!("user {} not found", token.user_id),
                )),
                Err(e) if is_unique_violation(&e) => Err(MetadataError::Constraint(
                    "auth token already exists".to_string(),
                )),
                Err(e) => Err(e.into()),
            }
        }

        async fn get_auth_token(&self, token: &str) -> MetadataResult<Option<AuthTokenRow>> {
            let row =
                sqlx::query_as::<_, AuthTokenRow>("SELECT * FROM auth_tokens WHERE token = ?")
                    .bind(token)
                    .fetch_optional(&self.pool)
                    .await?;
            Ok(row)
        }
    }

    // -------------------------------------------------------------------------
    // Contents
    // -------------------------------------------------------------------------

    #[async_trait]
    impl ContentRepo for SqliteStore {
        async fn create_content(&self, content: &NewContent) -> MetadataResult<ContentRow> {
            let mut conn = self.pool.acquire().await?;
            insert_content(&mut conn, content).await
        }

        async fn create_contents(
            &self,
            contents: &[NewContent],
        ) -> MetadataResult<Vec<ContentRow>> {
            let mut tx = self.pool.begin().await?;
            let mut rows = Vec::with_capacity(contents.len());
            for content in contents {
                rows.push(insert_content(&mut tx, content).await?);
            }
            tx.commit().await?;
            Ok(rows)
        }

        async fn create_content_with_objects(
            &self,
            content: &NewContent,
            objects: &[NewObject],
        ) -> MetadataResult<IngestedContent> {
            if content.aggregate && !objects.is_empty() {
                return Err(MetadataError::InvalidAggregate(format!(
                    "aggregate content '{}' cannot own {} objects",
                    content.name,
                    objects.len()
                )));
            }

            let mut tx = self.pool.begin().await?;
            let content_row = insert_content(&mut tx, content).await?;

            let mut object_rows = Vec::with_capacity(objects.len());
            let mut ref_rows = Vec::with_capacity(objects.len());
            for object in objects {
                let object_row = upsert_object(&mut tx, *object).await?;
                let ref_row = insert_obj_ref(
                    &mut tx,
                    NewObjRef {
                        object: object_row.id,
                        pin: content_row.id,
                        offloaded: false,
                    },
                )
                .await?;
                object_rows.push(object_row);
                ref_rows.push(ref_row);
            }
            tx.commit().await?;

            tracing::debug!(
                content_id = content_row.id,
                objects = object_rows.len(),
                "ingested content"
            );

            Ok(IngestedContent {
                content: content_row,
                objects: object_rows,
                obj_refs: ref_rows,
            })
        }

        async fn get_content(&self, query: &ContentQuery) -> MetadataResult<ContentRow> {
            let mut sql = writer("SELECT * FROM contents");
            query.apply(&mut sql);
            query.apply_first(&mut sql);
            sql
                .builder()
                .build_query_as::<ContentRow>()
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| MetadataError::NotFound(format!("content matching {query:?}")))
        }

        async fn list_contents(&self, query: &ContentQuery) -> MetadataResult<Vec<ContentRow>> {
            let mut sql = writer("SELECT * FROM contents");
            query.apply(&mut sql);
            query.apply_order_and_page(&mut sql);
            let rows = sql
                .builder()
                .build_query_as::<ContentRow>()
                .fetch_all(&self.pool)
                .await?;
            Ok(rows)
        }

        async fn count_contents(&self, query: &ContentQuery) -> MetadataResult<u64> {
            let mut sql = writer("SELECT COUNT(*) FROM contents");
            query.apply(&mut sql);
            let count: i64 = sql
                .builder()
                .build_query_scalar()
                .fetch_one(&self.pool)
                .await?;
            Ok(count as u64)
        }

        async fn soft_delete_content(&self, id: i64) -> MetadataResult<u64> {
            let result = sqlx::query(
                r#"
                WITH RECURSIVE tree(id) AS (
                    SELECT id FROM contents WHERE id = ?1
                    UNION
                    SELECT child.id FROM contents AS child JOIN tree ON child.aggregated_in = tree.id
                )
                UPDATE contents SET active = 0, updated_at = ?2
                WHERE id IN (SELECT id FROM tree)
                "#,
            )
            .bind(id)
            .bind(SortableTimestamp::now())
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!("content {id} not found")));
            }
            Ok(result.rows_affected())
        }

        async fn hard_delete_content(&self, id: i64) -> MetadataResult<()> {
            let result = sqlx::query(
                r#"
                DELETE FROM contents
                WHERE id = ?1
                  AND NOT EXISTS (SELECT 1 FROM obj_refs WHERE pin = ?1)
                  AND NOT EXISTS (SELECT 1 FROM deals WHERE content = ?1 AND status <> 'failed')
                  AND NOT EXISTS (SELECT 1 FROM contents AS child WHERE child.aggregated_in = ?1)
                "#,
            )
            .bind(id)
            .execute(&self.pool)
            .await;

            match result {
                Ok(r) if r.rows_affected() > 0 => return Ok(()),
                Ok(_) => {}
                Err(e) if is_foreign_key_violation(&e) => {}
                Err(e) => return Err(e.into()),
            }

            let (exists, obj_refs, deals, children): (bool, i64, i64, i64) = sqlx::query_as(
                r#"
                SELECT
                    EXISTS (SELECT 1 FROM contents WHERE id = ?1),
                    (SELECT COUNT(*) FROM obj_refs WHERE pin = ?1),
                    (SELECT COUNT(*) FROM deals WHERE content = ?1 AND status <> 'failed'),
                    (SELECT COUNT(*) FROM contents WHERE aggregated_in = ?1)
                "#,
            )
            .bind(id)
            .fetch_one(&self.pool)
            .await?;

            if !exists {
                return Err(MetadataError::NotFound(format!("content {id} not found")));
            }
            Err(MetadataError::ContentInUse {
                content_id: id,
                deals: deals as u64,
                obj_refs: obj_refs as u64,
                children: children as u64,
            })
        }
    }

    // -------------------------------------------------------------------------
    // Objects
    // -------------------------------------------------------------------------

    #[async_trait]
    impl ObjectRepo for SqliteStore {
        async fn find_or_create_object(&self, object: NewObject) -> MetadataResult<ObjectRow> {
            let mut conn = self.pool.acquire().await?;
            upsert_object(&mut conn, object).await
        }

        async fn get_object(&self, query: &ObjectQuery) -> MetadataResult<ObjectRow> {
            let mut sql = writer("SELECT * FROM objects");
            query.apply(&mut sql);
            sql.push("ORDER BY id LIMIT 1");
            sql
                .builder()
                .build_query_as::<ObjectRow>()
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| MetadataError::NotFound(format!("object matching {query:?}")))
        }

        async fn list_objects(&self, query: &ObjectQuery) -> MetadataResult<Vec<ObjectRow>> {
            let mut sql = writer("SELECT * FROM objects");
            query.apply(&mut sql);
            sql.push("ORDER BY id");
            let rows = sql
                .builder()
                .build_query_as::<ObjectRow>()
                .fetch_all(&self.pool)
                .await?;
            Ok(rows)
        }

        async fn count_objects(&self, query: &ObjectQuery) -> MetadataResult<u64> {
            let mut sql = writer("SELECT COUNT(*) FROM objects");
            query.apply(&mut sql);
            let count: i64 = sql
                .builder()
                .build_query_scalar()
                .fetch_one(&self.pool)
                .await?;
            Ok(count as u64)
        }

        async fn list_unreferenced_objects(&self, limit: i64) -> MetadataResult<Vec<i64>> {
            let ids = sqlx::query_scalar(
                r#"
                SELECT id FROM objects
                WHERE NOT EXISTS (SELECT 1 FROM obj_refs WHERE obj_refs.object = objects.id)
                ORDER BY id
                LIMIT ?
                "#,
            )
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            Ok(ids)
        }

        async fn sweep_unreferenced(&self, candidates: &[i64]) -> MetadataResult<u64> {
            let mut deleted = 0u64;
            for &object_id in candidates {
                let result = sqlx::query(
                    r#"
                    DELETE FROM objects
                    WHERE id = ?
                      AND NOT EXISTS (SELECT 1 FROM obj_refs WHERE obj_refs.object = objects.id)
                    "#,
                )
                .bind(object_id)
                .execute(&self.pool)
                .await;

                match result {
                    Ok(r) if r.rows_affected() > 0 => deleted += r.rows_affected(),
                    Ok(_) => {
                        tracing::debug!(object_id, "sweep skipped object: referenced or gone");
                    }
                    Err(e) if is_foreign_key_violation(&e) => {
                        tracing::debug!(object_id, "sweep skipped object: gained a reference");
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            if !candidates.is_empty() {
                tracing::info!(
                    candidates = candidates.len(),
                    deleted,
                    "swept unreferenced objects"
                );
            }
            Ok(deleted)
        }
    }

    // -------------------------------------------------------------------------
    // Object references
    // -------------------------------------------------------------------------

    #[async_trait]
    impl ObjRefRepo for SqliteStore {
        async fn link_object(&self, obj_ref: NewObjRef) -> MetadataResult<ObjRefRow> {
            let mut conn = self.pool.acquire().await?;
            insert_obj_ref(&mut conn, obj_ref).await
        }

        async fn unlink_all(&self, content_id: i64) -> MetadataResult<Vec<i64>> {
            let mut objects: Vec<i64> =
                sqlx::query_scalar("DELETE FROM obj_refs WHERE pin = ? RETURNING object")
                    .bind(content_id)
                    .fetch_all(&self.pool)
                    .await?;
            objects.sort_unstable();
            objects.dedup();
            Ok(objects)
        }

        async fn list_obj_refs(&self, query: &ObjRefQuery) -> MetadataResult<Vec<ObjRefRow>> {
            let mut sql = writer("SELECT * FROM obj_refs");
            query.apply(&mut sql);
            sql.push("ORDER BY id");
            let rows = sql
                .builder()
                .build_query_as::<ObjRefRow>()
                .fetch_all(&self.pool)
                .await?;
            Ok(rows)
        }

        async fn count_obj_refs(&self, query: &ObjRefQuery) -> MetadataResult<u64> {
            let mut sql = writer("SELECT COUNT(*) FROM obj_refs");
            query.apply(&mut sql);
            let count: i64 = sql
                .builder()
                .build_query_scalar()
                .fetch_one(&self.pool)
                .await?;
            Ok(count as u64)
        }

        async fn delete_obj_refs(&self, query: &ObjRefQuery) -> MetadataResult<u64> {
            let mut sql = writer("DELETE FROM obj_refs");
            query.apply(&mut sql);
            sql.ensure_filtered("obj_refs")?;
            let result = sql
                .builder()
                .build()
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected())
        }
    }

    // -------------------------------------------------------------------------
    // Deals
    // -------------------------------------------------------------------------

    #[async_trait]
    impl DealRepo for SqliteStore {
        async fn create_deal(&self, deal: &NewDeal) -> MetadataResult<DealRow> {
            let now = SortableTimestamp::now();
            let result = sqlx::query_as::<_, DealRow>(
                r#"
                INSERT INTO deals (
                    content, provider, status, deal_id, proposal_cid, verified,
                    failed_at, created_at, updated_at
                )
                SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8
                WHERE EXISTS (SELECT 1 FROM contents WHERE id = ?1)
                RETURNING *
                "#,
            )
            .bind(deal.content)
            .bind(&deal.provider)
            .bind(deal.status.as_str())
            .bind(deal.deal_id)
            .bind(deal.proposal_cid.to_column())
            .bind(deal.verified)
            .bind((deal.status == DealStatus::Failed).then_some(now))
            .bind(now)
            .fetch_optional(&self.pool)
            .await;

            match result {
                Ok(Some(row)) => Ok(row),
                Ok(None) => Err(MetadataError::DanglingReference(format!(
                    "content {} not found",
                    deal.content
                ))),
                Err(e) if is_foreign_key_violation(&e) => Err(MetadataError::DanglingReference(
                    format!("content {} not found", deal.content),
                )),
                Err(e) => Err(e.into()),
            }
        }

        async fn list_deals(&self, query: &DealQuery) -> MetadataResult<Vec<DealRow>> {
            let mut sql = writer("SELECT * FROM deals");
            query.apply(&mut sql);
            sql.push("ORDER BY id");
            let rows = sql
                .builder()
                .build_query_as::<DealRow>()
                .fetch_all(&self.pool)
                .await?;
            Ok(rows)
        }

        async fn count_deals(&self, query: &DealQuery) -> MetadataResult<u64> {
            let mut sql = writer("SELECT COUNT(*) FROM deals");
            query.apply(&mut sql);
            let count: i64 = sql
                .builder()
                .build_query_scalar()
                .fetch_one(&self.pool)
                .await?;
            Ok(count as u64)
        }

        async fn set_deal_status(
            &self,
            deal_id: i64,
            status: DealStatus,
        ) -> MetadataResult<DealRow> {
            let now = SortableTimestamp::now();
            let row = sqlx::query_as::<_, DealRow>(
                r#"
                UPDATE deals
                SET status = ?1, updated_at = ?2, failed_at = COALESCE(?3, failed_at)
                WHERE id = ?4
                RETURNING *
                "#,
            )
            .bind(status.as_str())
            .bind(now)
            .bind((status == DealStatus::Failed).then_some(now))
            .bind(deal_id)
            .fetch_optional(&self.pool)
            .await?;

            row.ok_or_else(|| MetadataError::NotFound(format!("deal {deal_id} not found")))
        }

        async fn delete_deals(&self, query: &DealQuery) -> MetadataResult<u64> {
            let mut sql = writer("DELETE FROM deals");
            query.apply(&mut sql);
            sql.ensure_filtered("deals")?;
            let result = sql
                .builder()
                .build()
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected())
        }
    }

    // -------------------------------------------------------------------------
    // Collections
    // -------------------------------------------------------------------------

    #[async_trait]
    impl CollectionRepo for SqliteStore {
        async fn create_collection(
            &self,
            collection: &NewCollection,
        ) -> MetadataResult<CollectionRow> {
            let result = sqlx::query_as::<_, CollectionRow>(
                r#"
                INSERT INTO collections (uuid, user_id, name, description, created_at)
                VALUES (?, ?, ?, ?, ?)
                RETURNING *
                "#,
            )
            .bind(collection.uuid)
            .bind(collection.user_id)
            .bind(&collection.name)
            .bind(&collection.description)
            .bind(SortableTimestamp::now())
            .fetch_one(&self.pool)
            .await;

            match result {
                Ok(row) => Ok(row),
                Err(e) if is_unique_violation(&e) => Err(MetadataError::Constraint(format!(
                    "collection {} already exists",
                    collection.uuid
                ))),
                Err(e) => Err(e.into()),
            }
        }

        async fn get_collection(&self, query: &CollectionQuery) -> MetadataResult<CollectionRow> {
            let mut sql = writer("SELECT * FROM collections");
            query.apply(&mut sql);
            sql.push("ORDER BY id LIMIT 1");
            sql
                .builder()
                .build_query_as::<CollectionRow>()
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| MetadataError::NotFound(format!("collection matching {query:?}")))
        }

        async fn list_collections(
            &self,
            query: &CollectionQuery,
        ) -> MetadataResult<Vec<CollectionRow>> {
            let mut sql = writer("SELECT * FROM collections");
            query.apply(&mut sql);
            sql.push("ORDER BY id");
            let rows = sql
                .builder()
                .build_query_as::<CollectionRow>()
                .fetch_all(&self.pool)
                .await?;
            Ok(rows)
        }

        async fn expect_delete_collections(&self, query: &CollectionQuery) -> MetadataResult<u64> {
            let mut sql = writer("DELETE FROM collections");
            query.apply(&mut sql);
            sql.ensure_filtered("collections")?;
            let result = sql
                .builder()
                .build()
                .execute(&self.pool)
                .await?;
            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!(
                    "no collection matching {query:?}"
                )));
            }
            Ok(result.rows_affected())
        }

        async fn create_collection_ref(
            &self,
            collection_ref: &NewCollectionRef,
        ) -> MetadataResult<CollectionRefRow> {
            let result = sqlx::query_as::<_, CollectionRefRow>(
                r#"
                INSERT INTO collection_refs (collection, content, path, created_at)
                SELECT ?1, ?2, ?3, ?4
                WHERE EXISTS (SELECT 1 FROM collections WHERE id = ?1)
                  AND EXISTS (SELECT 1 FROM contents WHERE id = ?2)
                RETURNING *
                "#,
            )
            .bind(collection_ref.collection)
            .bind(collection_ref.content)
            .bind(&collection_ref.path)
            .bind(SortableTimestamp::now())
            .fetch_optional(&self.pool)
            .await;

            match result {
                Ok(Some(row)) => Ok(row),
                Ok(None) => Err(MetadataError::DanglingReference(format!(
                    "collection {} or content {} not found",
                    collection_ref.collection, collection_ref.content
                ))),
                Err(e) if is_foreign_key_violation(&e) => {
                    Err(MetadataError::DanglingReference(format!(
                        "collection {} or content {} not found",
                        collection_ref.collection, collection_ref.content
                    )))
                }
                Err(e) => Err(e.into()),
            }
        }

        async fn list_collection_refs(
            &self,
            collection_id: i64,
        ) -> MetadataResult<Vec<CollectionRefRow>> {
            let rows = sqlx::query_as::<_, CollectionRefRow>(
                "SELECT * FROM collection_refs WHERE collection = ? ORDER BY id",
            )
            .bind(collection_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }
    }

    // -------------------------------------------------------------------------
    // Storage providers
    // -------------------------------------------------------------------------

    #[async_trait]
    impl ProviderRepo for SqliteStore {
        async fn list_providers(&self) -> MetadataResult<Vec<StorageProviderRow>> {
            let rows = sqlx::query_as::<_, StorageProviderRow>(
                "SELECT * FROM storage_providers ORDER BY id",
            )
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn count_providers(&self) -> MetadataResult<u64> {
            let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM storage_providers")
                .fetch_one(&self.pool)
                .await?;
            Ok(count as u64)
        }

        async fn add_provider(&self, address: &str) -> MetadataResult<StorageProviderRow> {
            if !is_id_address(address) {
                return Err(MetadataError::Constraint(format!(
                    "'{address}' is not a provider ID address"
                )));
            }

            sqlx::query(
                "INSERT INTO storage_providers (address, created_at) VALUES (?, ?) ON CONFLICT(address) DO NOTHING",
            )
            .bind(address)
            .bind(SortableTimestamp::now())
            .execute(&self.pool)
            .await?;

            let row = sqlx::query_as::<_, StorageProviderRow>(
                "SELECT * FROM storage_providers WHERE address = ?",
            )
            .bind(address)
            .fetch_one(&self.pool)
            .await?;
            Ok(row)
        }

        async fn seed_providers(&self, addresses: &[&str]) -> MetadataResult<u64> {
            let mut tx = self.pool.begin().await?;

            let existing: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM storage_providers")
                .fetch_one(&mut *tx)
                .await?;
            if existing > 0 {
                return Ok(0);
            }

            let now = SortableTimestamp::now();
            let mut inserted = 0u64;
            for address in addresses {
                let result = sqlx::query(
                    "INSERT INTO storage_providers (address, created_at) VALUES (?, ?) ON CONFLICT(address) DO NOTHING",
                )
                .bind(*address)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                inserted += result.rows_affected();
            }
            tx.commit().await?;
            Ok(inserted)
        }
    }
}

/// SQLite schema.
const SCHEMA_SQL: &str = r#"
-- Timestamps are fixed-width UTC text (see SortableTimestamp).

-- Identity records
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL UNIQUE,
    perm INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS auth_tokens (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    token TEXT NOT NULL UNIQUE,
    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    expiry TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_auth_tokens_user ON auth_tokens(user_id);

-- Contents (leaf items and aggregates)
CREATE TABLE IF NOT EXISTS contents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    cid BLOB,
    name TEXT NOT NULL DEFAULT '',
    user_id INTEGER NOT NULL,
    size INTEGER NOT NULL DEFAULT 0,
    active INTEGER NOT NULL DEFAULT 1,
    offloaded INTEGER NOT NULL DEFAULT 0,
    replication INTEGER NOT NULL DEFAULT 0,
    aggregate INTEGER NOT NULL DEFAULT 0,
    aggregated_in INTEGER REFERENCES contents(id),
    location TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_contents_cid ON contents(cid);
CREATE INDEX IF NOT EXISTS idx_contents_user ON contents(user_id);
CREATE INDEX IF NOT EXISTS idx_contents_aggregated_in ON contents(aggregated_in);

-- Deduplicated objects: one row per address
CREATE TABLE IF NOT EXISTS objects (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    cid BLOB NOT NULL UNIQUE,
    size INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

-- Content -> object references
CREATE TABLE IF NOT EXISTS obj_refs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    object INTEGER NOT NULL REFERENCES objects(id),
    pin INTEGER NOT NULL REFERENCES contents(id),
    offloaded INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_obj_refs_object ON obj_refs(object);
CREATE INDEX IF NOT EXISTS idx_obj_refs_pin ON obj_refs(pin);

-- Storage deals
CREATE TABLE IF NOT EXISTS deals (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    content INTEGER NOT NULL REFERENCES contents(id) ON DELETE CASCADE,
    provider TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'proposed',
    deal_id INTEGER,
    proposal_cid BLOB,
    verified INTEGER NOT NULL DEFAULT 0,
    failed_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_deals_content ON deals(content, status);

-- Collections
CREATE TABLE IF NOT EXISTS collections (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    uuid BLOB NOT NULL UNIQUE,
    user_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    description TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_collections_user ON collections(user_id);

CREATE TABLE IF NOT EXISTS collection_refs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    collection INTEGER NOT NULL REFERENCES collections(id) ON DELETE CASCADE,
    content INTEGER NOT NULL REFERENCES contents(id) ON DELETE CASCADE,
    path TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_collection_refs_collection ON collection_refs(collection);
CREATE INDEX IF NOT EXISTS idx_collection_refs_content ON collection_refs(content);

-- Storage provider registry
CREATE TABLE IF NOT EXISTS storage_providers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    address TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL
);
"#;
