//! Content addresses and their byte encoding.
//!
//! A [`ContentAddress`] is either a CID or the undefined sentinel. The byte
//! form is what the metadata store persists: a defined address encodes to the
//! binary CID, the sentinel encodes to zero bytes (and to `NULL` in nullable
//! columns).

use cid::Cid;
use multihash::Multihash;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// SHA2-256 multihash code.
const SHA2_256_CODE: u64 = 0x12;

/// Raw binary codec.
pub const RAW_CODEC: u64 = 0x55;

/// DAG-PB codec (UnixFS DAG nodes).
pub const DAG_PB_CODEC: u64 = 0x70;

/// A content address, or the undefined sentinel used for unresolved items.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentAddress(Option<Cid>);

impl ContentAddress {
    /// The undefined address.
    pub const UNDEF: Self = Self(None);

    /// Wrap an existing CID.
    pub fn from_cid(cid: Cid) -> Self {
        Self(Some(cid))
    }

    /// Compute a CIDv1 (sha2-256) over `data` with the given codec.
    pub fn compute(codec: u64, data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        // A 32-byte digest always fits in a 64-byte multihash.
        let hash = Multihash::<64>::wrap(SHA2_256_CODE, &digest)
            .unwrap_or_else(|_| unreachable!("sha2-256 digest exceeds multihash capacity"));
        Self(Some(Cid::new_v1(codec, hash)))
    }

    /// Compute a raw-codec CIDv1 over `data`.
    pub fn for_raw(data: &[u8]) -> Self {
        Self::compute(RAW_CODEC, data)
    }

    /// Parse the multibase text form. An empty string yields [`Self::UNDEF`].
    pub fn parse(s: &str) -> crate::Result<Self> {
        if s.is_empty() {
            return Ok(Self::UNDEF);
        }
        Cid::from_str(s)
            .map(Self::from_cid)
            .map_err(|e| crate::Error::MalformedIdentifier(format!("{s}: {e}")))
    }

    /// The wrapped CID, if defined.
    pub fn cid(&self) -> Option<&Cid> {
        self.0.as_ref()
    }

    pub fn is_defined(&self) -> bool {
        self.0.is_some()
    }

    /// Encode to bytes. The undefined address encodes to an empty vector.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.map(|cid| cid.to_bytes()).unwrap_or_default()
    }

    /// Decode from bytes.
    ///
    /// Zero-length input yields [`Self::UNDEF`]. Any other input must be
    /// exactly one binary CID with no trailing bytes.
    pub fn from_bytes(bytes: &[u8]) -> crate::Result<Self> {
        if bytes.is_empty() {
            return Ok(Self::UNDEF);
        }
        let mut reader = bytes;
        let cid = Cid::read_bytes(&mut reader)
            .map_err(|e| crate::Error::MalformedIdentifier(e.to_string()))?;
        if !reader.is_empty() {
            return Err(crate::Error::MalformedIdentifier(format!(
                "{} trailing bytes after cid",
                reader.len()
            )));
        }
        Ok(Self::from_cid(cid))
    }

    /// Column form: `NULL` for the undefined address.
    pub fn to_column(&self) -> Option<Vec<u8>> {
        self.0.map(|cid| cid.to_bytes())
    }
}

/// Encode every address, preserving order and length.
pub fn encode_all(addresses: &[ContentAddress]) -> Vec<Vec<u8>> {
    addresses.iter().map(ContentAddress::to_bytes).collect()
}

/// Decode every element, preserving order and length.
///
/// Fails without partial results if any element is malformed.
pub fn decode_all<B: AsRef<[u8]>>(encoded: &[B]) -> crate::Result<Vec<ContentAddress>> {
    encoded
        .iter()
        .map(|bytes| ContentAddress::from_bytes(bytes.as_ref()))
        .collect()
}

impl From<Cid> for ContentAddress {
    fn from(cid: Cid) -> Self {
        Self::from_cid(cid)
    }
}

impl TryFrom<Option<Vec<u8>>> for ContentAddress {
    type Error = crate::Error;

    fn try_from(column: Option<Vec<u8>>) -> crate::Result<Self> {
        match column {
            Some(bytes) => Self::from_bytes(&bytes),
            None => Ok(Self::UNDEF),
        }
    }
}

impl FromStr for ContentAddress {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Debug for ContentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(cid) => write!(f, "ContentAddress({cid})"),
            None => write!(f, "ContentAddress(undef)"),
        }
    }
}

impl fmt::Display for ContentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(cid) => write!(f, "{cid}"),
            None => Ok(()),
        }
    }
}

impl Serialize for ContentAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ContentAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
