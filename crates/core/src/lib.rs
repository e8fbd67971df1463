//! Core domain types for Strata, the pin and deal tracking layer.
//!
//! This crate defines the values shared by the metadata store and its callers:
//! - Content addresses and their byte encoding
//! - Deal status
//! - The default storage provider list
//! - Configuration

pub mod address;
pub mod config;
pub mod deal;
pub mod error;
pub mod provider;

pub use address::{ContentAddress, decode_all, encode_all};
pub use deal::DealStatus;
pub use error::{Error, Result};
pub use provider::DEFAULT_PROVIDERS;
