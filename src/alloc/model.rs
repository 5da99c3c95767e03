use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One capacity bucket. `used_quota` moves only through the repository's
/// conditional updates and stays within `[0, capacity_m]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Node {
    pub id: i64,
    pub capacity_m: i64,
    pub used_quota: i64,
}

impl Node {
    pub fn remaining(&self) -> i64 {
        self.capacity_m - self.used_quota
    }
}

/// Lifecycle of an allocation row: inserted as `Allocated`, flipped exactly
/// once to `Freed`, never deleted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocationStatus {
    Allocated,
    Freed,
}

impl AllocationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationStatus::Allocated => "allocated",
            AllocationStatus::Freed => "freed",
        }
    }
}

impl FromStr for AllocationStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allocated" => Ok(AllocationStatus::Allocated),
            "freed" => Ok(AllocationStatus::Freed),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown allocation status: {0}")]
pub struct ParseStatusError(String);

/// Durable record tying a request id to a node and a token count.
#[derive(Clone, Debug)]
pub struct Allocation {
    pub request_id: String,
    pub node_id: i64,
    pub token_count: i64,
    pub status: AllocationStatus,
    pub created_ms: u64,
    pub updated_ms: u64,
}

/// Placement strategy.
///
/// `Best` packs requests into the tightest node that still fits, keeping at
/// least one node wide open for future big arrivals. `Largest` spreads load
/// onto the node with the most headroom, trading packing density for a lower
/// rejection rate on large requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Best,
    Largest,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Best => "best",
            Strategy::Largest => "largest",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = ParseStrategyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "best" => Ok(Strategy::Best),
            "largest" => Ok(Strategy::Largest),
            other => Err(ParseStrategyError(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown strategy: {0} (expected \"best\" or \"largest\")")]
pub struct ParseStrategyError(String);

/// Candidate ordering handed to the repository select.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CandidateOrder {
    RemainingAsc,
    RemainingDesc,
}
