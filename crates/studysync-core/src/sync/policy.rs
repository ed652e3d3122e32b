//! Drain policies

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// What a drain does with a change the backend refused for good
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PoisonPolicy {
    /// Stop draining the source; the entry stays at the head of the queue
    Block,
    /// Drop the entry and keep draining
    Skip,
    /// Move the entry to the parked list and keep draining
    #[default]
    Park,
}

/// How a queued write is weighed against a newer remote copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// A queued change no newer than the remote copy is superseded
    #[default]
    TimestampWins,
    /// Queued changes are always sent
    LocalOverwrites,
}

/// Policies applied by every coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncPolicy {
    #[serde(default)]
    pub poison: PoisonPolicy,
    #[serde(default)]
    pub conflict: ConflictPolicy,
}

impl PoisonPolicy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Skip => "skip",
            Self::Park => "park",
        }
    }
}

impl ConflictPolicy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TimestampWins => "timestamp-wins",
            Self::LocalOverwrites => "local-overwrites",
        }
    }
}

impl fmt::Display for PoisonPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PoisonPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "block" => Ok(Self::Block),
            "skip" => Ok(Self::Skip),
            "park" => Ok(Self::Park),
            other => Err(Error::InvalidInput(format!(
                "unknown poison policy '{other}' (expected block, skip or park)"
            ))),
        }
    }
}

impl FromStr for ConflictPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "timestamp-wins" | "remote-wins" => Ok(Self::TimestampWins),
            "local-overwrites" | "local-wins" => Ok(Self::LocalOverwrites),
            other => Err(Error::InvalidInput(format!(
                "unknown conflict policy '{other}' (expected timestamp-wins or local-overwrites)"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_park_and_timestamp_wins() {
        let policy = SyncPolicy::default();
        assert_eq!(policy.poison, PoisonPolicy::Park);
        assert_eq!(policy.conflict, ConflictPolicy::TimestampWins);
    }

    #[test]
    fn parse_and_display_roundtrip() {
        for poison in [PoisonPolicy::Block, PoisonPolicy::Skip, PoisonPolicy::Park] {
            assert_eq!(poison.to_string().parse::<PoisonPolicy>().unwrap(), poison);
        }
        assert_eq!(
            " Local-Overwrites ".parse::<ConflictPolicy>().unwrap(),
            ConflictPolicy::LocalOverwrites
        );
        assert!("merge".parse::<ConflictPolicy>().is_err());
    }

    #[test]
    fn serde_uses_kebab_case() {
        let policy: SyncPolicy =
            serde_json::from_str(r#"{"poison":"skip","conflict":"local-overwrites"}"#).unwrap();
        assert_eq!(policy.poison, PoisonPolicy::Skip);
        assert_eq!(policy.conflict, ConflictPolicy::LocalOverwrites);
    }
}
