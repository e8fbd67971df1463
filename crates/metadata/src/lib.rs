//! Metadata store abstraction and implementations for Strata.
//!
//! This crate persists the pinning data model:
//! - Contents, their aggregates and soft/hard deletion
//! - Deduplicated objects and the references that keep them alive
//! - Storage deals and collections
//! - User and token records, and the storage provider registry
//! - Garbage collection of unreferenced objects

pub mod bootstrap;
pub mod error;
pub mod gc;
pub mod models;
pub mod postgres;
pub mod query;
pub mod repos;
pub mod store;

pub use error::{MetadataError, MetadataResult};
pub use gc::GcStats;
pub use postgres::PostgresStore;
pub use query::SortOrder;
pub use store::{MetadataStore, SqliteStore};

use std::sync::Arc;
use strata_core::config::MetadataConfig;

/// Create a metadata store from configuration.
///
/// The schema is applied and the provider registry seeded before the store
/// is returned.
pub async fn from_config(config: &MetadataConfig) -> MetadataResult<Arc<dyn MetadataStore>> {
    config.validate().map_err(MetadataError::Config)?;

    let store: Arc<dyn MetadataStore> = match config {
        MetadataConfig::Sqlite {
            path,
            query_timeout_secs,
        } => Arc::new(SqliteStore::new(path, *query_timeout_secs).await?),
        MetadataConfig::Postgres {
            url,
            host,
            port,
            username,
            password,
            database,
            ssl_mode,
            max_connections,
            statement_timeout_ms,
        } => {
            if let Some(url) = url {
                tracing::info!("Connecting to PostgreSQL using connection URL");
                Arc::new(PostgresStore::from_url(url, *max_connections, *statement_timeout_ms).await?)
            } else if let (Some(host), Some(database)) = (host.as_ref(), database.as_ref()) {
                Arc::new(
                    PostgresStore::from_params(
                        host,
                        port.unwrap_or(5432),
                        username.as_deref(),
                        password.as_deref(),
                        database,
                        *ssl_mode,
                        *max_connections,
                        *statement_timeout_ms,
                    )
                    .await?,
                )
            } else {
                return Err(MetadataError::Config(
                    "postgres config requires either 'url' or 'host' + 'database'".to_string(),
                ));
            }
        }
    };

    bootstrap::ensure_default_providers(store.as_ref()).await?;
    Ok(store)
}
