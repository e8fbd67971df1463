//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// PostgreSQL SSL mode configuration.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PgSslMode {
    /// Disable SSL/TLS entirely.
    Disable,
    /// Prefer SSL/TLS but allow unencrypted connections (default).
    #[default]
    Prefer,
    /// Require SSL/TLS for all connections.
    Require,
}

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database (testing and single-node deployments).
    Sqlite {
        /// Database file path (`:memory:` for a private in-memory database).
        path: PathBuf,
        /// Query timeout in seconds (advisory only - SQLite cannot cancel statements).
        #[serde(default = "default_sqlite_query_timeout_secs")]
        query_timeout_secs: Option<u64>,
    },
    /// PostgreSQL database.
    Postgres {
        /// Connection URL. Takes precedence over individual fields.
        url: Option<String>,
        /// Database host.
        host: Option<String>,
        /// Database port (default: 5432).
        #[serde(default = "default_pg_port")]
        port: Option<u16>,
        /// Database username.
        username: Option<String>,
        /// Database password.
        /// WARNING: Prefer STRATA_METADATA__PASSWORD over storing it in a file.
        password: Option<String>,
        /// Database name.
        database: Option<String>,
        /// SSL mode for connections.
        ssl_mode: Option<PgSslMode>,
        /// Maximum connections in the pool.
        #[serde(default = "default_max_connections")]
        max_connections: u32,
        /// Statement timeout in milliseconds; PostgreSQL cancels statements exceeding it.
        #[serde(default = "default_statement_timeout_ms")]
        statement_timeout_ms: Option<u64>,
    },
}

fn default_max_connections() -> u32 {
    99
}

fn default_pg_port() -> Option<u16> {
    Some(5432)
}

fn default_statement_timeout_ms() -> Option<u64> {
    Some(300000) // 5 minutes
}

fn default_sqlite_query_timeout_secs() -> Option<u64> {
    Some(600) // 10 minutes (advisory only)
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/strata.db"),
            query_timeout_secs: default_sqlite_query_timeout_secs(),
        }
    }
}

impl MetadataConfig {
    /// Parse a `DBTYPE=PARAMS` connection string.
    ///
    /// Supported types are `sqlite` (PARAMS is a file path) and `postgres`
    /// (PARAMS is a connection URL or keyword/value string).
    pub fn from_dsn(dsn: &str) -> crate::Result<Self> {
        let Some((kind, params)) = dsn.split_once('=') else {
            return Err(crate::Error::Config(
                "format for database string is 'DBTYPE=PARAMS'".to_string(),
            ));
        };

        match kind {
            "sqlite" => Ok(Self::Sqlite {
                path: PathBuf::from(params),
                query_timeout_secs: default_sqlite_query_timeout_secs(),
            }),
            "postgres" => Ok(Self::Postgres {
                url: Some(params.to_string()),
                host: None,
                port: default_pg_port(),
                username: None,
                password: None,
                database: None,
                ssl_mode: None,
                max_connections: default_max_connections(),
                statement_timeout_ms: default_statement_timeout_ms(),
            }),
            other => Err(crate::Error::Config(format!(
                "unsupported or unrecognized db type: {other}"
            ))),
        }
    }

    /// Validate metadata configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            MetadataConfig::Sqlite { path, .. } => {
                if path.as_os_str().is_empty() {
                    return Err("sqlite config requires a non-empty 'path'".to_string());
                }
                Ok(())
            }
            MetadataConfig::Postgres {
                url,
                host,
                database,
                max_connections,
                ..
            } => {
                if *max_connections == 0 {
                    return Err("postgres max_connections must be at least 1".to_string());
                }
                match (url.as_ref(), host.as_ref(), database.as_ref()) {
                    (Some(_), _, _) => Ok(()),
                    (None, Some(_), Some(_)) => Ok(()),
                    (None, None, _) => Err(
                        "postgres config requires either 'url' or 'host' + 'database'".to_string(),
                    ),
                    (None, Some(_), None) => Err(
                        "postgres config requires 'database' when using individual fields"
                            .to_string(),
                    ),
                }
            }
        }
    }
}

/// Garbage collection configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GcConfig {
    /// Number of unreferenced objects examined per sweep batch.
    #[serde(default = "default_gc_batch_size")]
    pub batch_size: u32,
    /// Upper bound on batches per run (0 = until no candidates remain).
    #[serde(default)]
    pub max_batches: u64,
}

fn default_gc_batch_size() -> u32 {
    500
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            batch_size: default_gc_batch_size(),
            max_batches: 0,
        }
    }
}

impl GcConfig {
    /// Validate garbage collection settings.
    pub fn validate(&self) -> Result<(), String> {
        if self.batch_size == 0 {
            return Err("gc batch_size must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Metadata store configuration.
    #[serde(default)]
    pub metadata: MetadataConfig,
    /// Garbage collection configuration.
    #[serde(default)]
    pub gc: GcConfig,
}

impl AppConfig {
    /// Validate every section, returning the first error.
    pub fn validate(&self) -> Result<(), String> {
        self.metadata.validate()?;
        self.gc.validate()
    }
}
