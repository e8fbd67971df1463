//! Test data builders.

use strata_core::ContentAddress;
use strata_metadata::models::{NewContent, NewObject};

/// Owner used by fixtures that do not care about users.
pub const TEST_USER: i64 = 1;

/// A deterministic raw-codec address derived from `seed`.
pub fn address(seed: &str) -> ContentAddress {
    ContentAddress::for_raw(seed.as_bytes())
}

/// An object of `size` bytes addressed by `seed`.
pub fn object(seed: &str, size: i64) -> NewObject {
    NewObject {
        cid: address(seed),
        size,
    }
}

/// A leaf content item owned by [`TEST_USER`].
pub fn content(name: &str) -> NewContent {
    NewContent::new(TEST_USER, name, address(name))
}
