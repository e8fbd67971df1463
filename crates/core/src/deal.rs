//! Storage deal status.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a storage-provider deal.
///
/// Transitions are driven by the external deal negotiator; this type only
/// names the persisted states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DealStatus {
    /// Proposal sent, not yet accepted on chain.
    Proposed,
    /// Deal is active on chain.
    Active,
    /// Deal reached its end (expired or slashed).
    Terminated,
    /// Deal failed before or during activation.
    Failed,
}

impl DealStatus {
    /// Parse from string.
    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "proposed" => Ok(Self::Proposed),
            "active" => Ok(Self::Active),
            "terminated" => Ok(Self::Terminated),
            "failed" => Ok(Self::Failed),
            _ => Err(crate::Error::InvalidDealStatus(s.to_string())),
        }
    }

    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Proposed => "proposed",
            Self::Active => "active",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        }
    }

    /// Whether a deal in this state keeps its content from being hard-deleted.
    pub fn blocks_deletion(&self) -> bool {
        !matches!(self, Self::Failed)
    }
}

impl TryFrom<String> for DealStatus {
    type Error = crate::Error;

    fn try_from(s: String) -> crate::Result<Self> {
        Self::parse(&s)
    }
}

impl fmt::Display for DealStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
