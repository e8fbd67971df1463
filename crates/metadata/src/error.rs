//! Metadata store error types.

use thiserror::Error;

/// Metadata store operation errors.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("malformed identifier: {0}")]
    MalformedIdentifier(String),

    #[error("dangling reference: {0}")]
    DanglingReference(String),

    #[error(
        "content {content_id} is in use: {deals} deals, {obj_refs} object references, {children} aggregated children"
    )]
    ContentInUse {
        content_id: i64,
        deals: u64,
        obj_refs: u64,
        children: u64,
    },

    #[error("invalid aggregate: {0}")]
    InvalidAggregate(String),

    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for metadata operations.
pub type MetadataResult<T> = std::result::Result<T, MetadataError>;

impl From<sqlx::Error> for MetadataError {
    fn from(err: sqlx::Error) -> Self {
        // Rows decode addresses through `ContentAddress::try_from`; surface those
        // failures as identifier errors rather than generic database errors.
        if let sqlx::Error::ColumnDecode { source, .. } = &err
            && let Some(strata_core::Error::MalformedIdentifier(msg)) =
                source.downcast_ref::<strata_core::Error>()
        {
            return Self::MalformedIdentifier(msg.clone());
        }
        Self::Database(err)
    }
}

/// Whether a database error is a unique constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

/// Whether a database error is a foreign key violation.
pub(crate) fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation())
}

impl From<strata_core::Error> for MetadataError {
    fn from(err: strata_core::Error) -> Self {
        match err {
            strata_core::Error::MalformedIdentifier(msg) => Self::MalformedIdentifier(msg),
            strata_core::Error::Config(msg) => Self::Config(msg),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<std::io::Error> for MetadataError {
    fn from(e: std::io::Error) -> Self {
        Self::Config(e.to_string())
    }
}
