//! PostgreSQL-based metadata store implementation.

use crate::error::{MetadataError, MetadataResult, is_foreign_key_violation, is_unique_violation};
use crate::models::*;
use crate::query::{
    CollectionQuery, ContentQuery, DealQuery, ObjRefQuery, ObjectQuery, SqlWriter, UserQuery,
};
use crate::repos::{
    CollectionRepo, ContentRepo, DealRepo, ObjRefRepo, ObjectRepo, ProviderRepo, UserRepo,
};
use crate::store::MetadataStore;
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode as SqlxPgSslMode};
use sqlx::{PgConnection, Pool, Postgres};
use std::str::FromStr;
use strata_core::DealStatus;
use strata_core::config::PgSslMode;
use strata_core::provider::is_id_address;
use time::OffsetDateTime;

/// PostgreSQL schema (embedded).
const POSTGRES_SCHEMA: &str = include_str!("postgres_schema.sql");

fn postgres_schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            if trimmed.is_empty() {
                return None;
            }
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

/// PostgreSQL-based metadata store.
pub struct PostgresStore {
    pool: Pool<Postgres>,
}

impl PostgresStore {
    /// Connect using a full connection URL.
    pub async fn from_url(
        url: &str,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let opts = PgConnectOptions::from_str(url)?;
        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    /// Connect using individual parameters, so the password can come from
    /// the environment rather than a URL in a config file.
    #[allow(clippy::too_many_arguments)]
    pub async fn from_params(
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
        database: &str,
        ssl_mode: Option<PgSslMode>,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let mut opts = PgConnectOptions::new()
            .host(host)
            .port(port)
            .database(database);

        if let Some(user) = username {
            opts = opts.username(user);
        }

        if let Some(pass) = password {
            opts = opts.password(pass);
        }

        if let Some(mode) = ssl_mode {
            let sqlx_mode = match mode {
                PgSslMode::Disable => SqlxPgSslMode::Disable,
                PgSslMode::Prefer => SqlxPgSslMode::Prefer,
                PgSslMode::Require => SqlxPgSslMode::Require,
            };
            opts = opts.ssl_mode(sqlx_mode);
        }

        tracing::info!(
            host = host,
            port = port,
            database = database,
            username = username.unwrap_or("<none>"),
            ssl_mode = ?ssl_mode,
            "Connecting to PostgreSQL with individual parameters"
        );

        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    async fn connect(
        mut opts: PgConnectOptions,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        if let Some(timeout_ms) = statement_timeout_ms {
            opts = opts.options([("statement_timeout", format!("{}ms", timeout_ms))]);
            tracing::info!("PostgreSQL statement_timeout set to {}ms", timeout_ms);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;

        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for PostgresStore {
    async fn migrate(&self) -> MetadataResult<()> {
        // A prepared statement holds a single command, so run them one by one.
        for statement in postgres_schema_statements(POSTGRES_SCHEMA) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        tracing::debug!("PostgreSQL schema applied");
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn stats(&self) -> MetadataResult<StoreStats> {
        let row: (i64, i64, i64, i64, i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                (SELECT COUNT(*) FROM users),
                (SELECT COUNT(*) FROM contents),
                (SELECT COUNT(*) FROM contents WHERE active),
                (SELECT COUNT(*) FROM objects),
                (SELECT COUNT(*) FROM obj_refs),
                (SELECT COUNT(*) FROM deals),
                (SELECT COUNT(*) FROM collections),
                (SELECT COUNT(*) FROM storage_providers)
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(StoreStats {
            users: row.0 as u64,
            contents: row.1 as u64,
            active_contents: row.2 as u64,
            objects: row.3 as u64,
            obj_refs: row.4 as u64,
            deals: row.5 as u64,
            collections: row.6 as u64,
            providers: row.7 as u64,
        })
    }
}

fn writer(base: &str) -> SqlWriter<'static, Postgres> {
    SqlWriter::new(base)
}

// -------------------------------------------------------------------------
// Shared statements, usable on the pool or inside a transaction
// -------------------------------------------------------------------------

async fn insert_content(
    conn: &mut PgConnection,
    content: &NewContent,
) -> MetadataResult<ContentRow> {
    let now = OffsetDateTime::now_utc();
    let row = sqlx::query_as::<_, ContentRow>(
        r#"
        INSERT INTO contents (
            cid, name, user_id, size, active, offloaded, replication,
            aggregate, aggregated_in, location, created_at, updated_at
        )
        SELECT $1, $2, $3, $4, $5, false, $6, $7, $8, $9, $10, $11
        WHERE $8 IS NULL
           OR EXISTS (SELECT 1 FROM contents WHERE id = $8 AND aggregate)
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
    .bind(content.created_at)
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
    conn: &mut PgConnection,
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
        VALUES ($1, $2, $3)
        ON CONFLICT (cid) DO UPDATE SET size = objects.size
        RETURNING *
        "#,
    )
    .bind(object.cid.to_bytes())
    .bind(object.size)
    .bind(OffsetDateTime::now_utc())
    .fetch_one(&mut *conn)
    .await?;
    Ok(row)
}

async fn insert_obj_ref(
    conn: &mut PgConnection,
    obj_ref: NewObjRef,
) -> MetadataResult<ObjRefRow> {
    let result = sqlx::query_as::<_, ObjRefRow>(
        r#"
        INSERT INTO obj_refs (object, pin, offloaded, created_at)
        SELECT $1, $2, $3, $4
        WHERE EXISTS (SELECT 1 FROM objects WHERE id = $1)
          AND EXISTS (SELECT 1 FROM contents WHERE id = $2 AND NOT aggregate)
        RETURNING *
        "#,
    )
    .bind(obj_ref.object)
    .bind(obj_ref.pin)
    .bind(obj_ref.offloaded)
    .bind(OffsetDateTime::now_utc())
    .fetch_optional(&mut *conn)
    .await;

    match result {
        Ok(Some(row)) => Ok(row),
        Ok(None) => Err(link_refusal(conn, obj_ref).await?),
        // The failed statement aborts any enclosing transaction, so no
        // follow-up lookup is possible here.
        Err(e) if is_foreign_key_violation(&e) => Err(MetadataError::DanglingReference(format!(
            "object {} or content {} was removed",
            obj_ref.object, obj_ref.pin
        ))),
        Err(e) => Err(e.into()),
    }
}

/// Work out why a link was refused.
async fn link_refusal(
    conn: &mut PgConnection,
    obj_ref: NewObjRef,
) -> MetadataResult<MetadataError> {
    let aggregate: Option<bool> =
        sqlx::query_scalar("SELECT aggregate FROM contents WHERE id = $1")
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
impl UserRepo for PostgresStore {
    async fn create_user(&self, user: &NewUser) -> MetadataResult<UserRow> {
        let result = sqlx::query_as::<_, UserRow>(
            "INSERT INTO users (username, perm, created_at) VALUES ($1, $2, $3) RETURNING *",
        )
        .bind(&user.username)
        .bind(user.perm)
        .bind(OffsetDateTime::now_utc())
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
            "INSERT INTO auth_tokens (token, user_id, expiry, created_at) VALUES ($1, $2, $3, $4) RETURNING *",
        )
        .bind(&token.token)
        .bind(token.user_id)
        .bind(token.expiry)
        .bind(OffsetDateTime::now_utc())
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
            sqlx::query_as::<_, AuthTokenRow>("SELECT * FROM auth_tokens WHERE token = $1")
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
impl ContentRepo for PostgresStore {
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
                SELECT id FROM contents WHERE id = $1
                UNION
                SELECT child.id FROM contents AS child JOIN tree ON child.aggregated_in = tree.id
            )
            UPDATE contents SET active = false, updated_at = $2
            WHERE id IN (SELECT id FROM tree)
            "#,
        )
        .bind(id)
        .bind(OffsetDateTime::now_utc())
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
            WHERE id = $1
              AND NOT EXISTS (SELECT 1 FROM obj_refs WHERE pin = $1)
              AND NOT EXISTS (SELECT 1 FROM deals WHERE content = $1 AND status <> 'failed')
              AND NOT EXISTS (SELECT 1 FROM contents AS child WHERE child.aggregated_in = $1)
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
                EXISTS (SELECT 1 FROM contents WHERE id = $1),
                (SELECT COUNT(*) FROM obj_refs WHERE pin = $1),
                (SELECT COUNT(*) FROM deals WHERE content = $1 AND status <> 'failed'),
                (SELECT COUNT(*) FROM contents WHERE aggregated_in = $1)
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
impl ObjectRepo for PostgresStore {
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
            LIMIT $1
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
                WHERE id = $1
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
impl ObjRefRepo for PostgresStore {
    async fn link_object(&self, obj_ref: NewObjRef) -> MetadataResult<ObjRefRow> {
        let mut conn = self.pool.acquire().await?;
        insert_obj_ref(&mut conn, obj_ref).await
    }

    async fn unlink_all(&self, content_id: i64) -> MetadataResult<Vec<i64>> {
        let mut objects: Vec<i64> =
            sqlx::query_scalar("DELETE FROM obj_refs WHERE pin = $1 RETURNING object")
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
impl DealRepo for PostgresStore {
    async fn create_deal(&self, deal: &NewDeal) -> MetadataResult<DealRow> {
        let now = OffsetDateTime::now_utc();
        let result = sqlx::query_as::<_, DealRow>(
            r#"
            INSERT INTO deals (
                content, provider, status, deal_id, proposal_cid, verified,
                failed_at, created_at, updated_at
            )
            SELECT $1, $2, $3, $4, $5, $6, $7, $8, $8
            WHERE EXISTS (SELECT 1 FROM contents WHERE id = $1)
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
        let now = OffsetDateTime::now_utc();
        let row = sqlx::query_as::<_, DealRow>(
            r#"
            UPDATE deals
            SET status = $1, updated_at = $2, failed_at = COALESCE($3, failed_at)
            WHERE id = $4
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
impl CollectionRepo for PostgresStore {
    async fn create_collection(
        &self,
        collection: &NewCollection,
    ) -> MetadataResult<CollectionRow> {
        let result = sqlx::query_as::<_, CollectionRow>(
            r#"
            INSERT INTO collections (uuid, user_id, name, description, created_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(collection.uuid)
        .bind(collection.user_id)
        .bind(&collection.name)
        .bind(&collection.description)
        .bind(OffsetDateTime::now_utc())
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
            SELECT $1, $2, $3, $4
            WHERE EXISTS (SELECT 1 FROM collections WHERE id = $1)
              AND EXISTS (SELECT 1 FROM contents WHERE id = $2)
            RETURNING *
            "#,
        )
        .bind(collection_ref.collection)
        .bind(collection_ref.content)
        .bind(&collection_ref.path)
        .bind(OffsetDateTime::now_utc())
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
            "SELECT * FROM collection_refs WHERE collection = $1 ORDER BY id",
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
impl ProviderRepo for PostgresStore {
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
            "INSERT INTO storage_providers (address, created_at) VALUES ($1, $2) ON CONFLICT (address) DO NOTHING",
        )
        .bind(address)
        .bind(OffsetDateTime::now_utc())
        .execute(&self.pool)
        .await?;

        let row = sqlx::query_as::<_, StorageProviderRow>(
            "SELECT * FROM storage_providers WHERE address = $1",
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

        let now = OffsetDateTime::now_utc();
        let mut inserted = 0u64;
        for address in addresses {
            let result = sqlx::query(
                "INSERT INTO storage_providers (address, created_at) VALUES ($1, $2) ON CONFLICT (address) DO NOTHING",
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
