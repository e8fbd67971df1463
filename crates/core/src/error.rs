//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed identifier: {0}")]
    MalformedIdentifier(String),

    #[error("invalid deal status: {0}")]
    InvalidDealStatus(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
