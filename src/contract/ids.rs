//! Identifiers and timestamps

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A server in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServerId(pub Uuid);

/// Identifies one contract. A contract whose content changes gets a new ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContractId(pub Uuid);

/// Identifies one branch of write history. The nil branch is the universal root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BranchId(pub Uuid);

/// A server's identity inside the table's Raft cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RaftMemberId(pub Uuid);

impl ServerId {
    pub fn generate() -> Self {
        ServerId(Uuid::new_v4())
    }

    pub fn from_u128(v: u128) -> Self {
        ServerId(Uuid::from_u128(v))
    }
}

impl ContractId {
    pub fn generate() -> Self {
        ContractId(Uuid::new_v4())
    }
}

impl BranchId {
    pub fn generate() -> Self {
        BranchId(Uuid::new_v4())
    }

    pub fn nil() -> Self {
        BranchId(Uuid::nil())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl RaftMemberId {
    pub fn generate() -> Self {
        RaftMemberId(Uuid::new_v4())
    }
}

// Short forms keep log lines readable; the full UUID is in the Debug output.
impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server:{}", &self.0.simple().to_string()[..8])
    }
}

impl fmt::Display for ContractId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "contract:{}", &self.0.simple().to_string()[..8])
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nil() {
            return write!(f, "branch:root");
        }
        write!(f, "branch:{}", &self.0.simple().to_string()[..8])
    }
}

impl fmt::Display for RaftMemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "member:{}", &self.0.simple().to_string()[..8])
    }
}

/// Position in a branch's write history
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct StateTimestamp(pub u64);

impl StateTimestamp {
    pub fn zero() -> Self {
        StateTimestamp(0)
    }

    pub fn max() -> Self {
        StateTimestamp(u64::MAX)
    }

    pub fn next(self) -> Self {
        StateTimestamp(self.0.saturating_add(1))
    }
}

impl fmt::Display for StateTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// A point in a branch's history
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    pub branch: BranchId,
    pub timestamp: StateTimestamp,
}

impl Version {
    pub fn new(branch: BranchId, timestamp: StateTimestamp) -> Self {
        Self { branch, timestamp }
    }

    /// The empty state every branch ultimately descends from
    pub fn zero() -> Self {
        Self {
            branch: BranchId::nil(),
            timestamp: StateTimestamp::zero(),
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.branch, self.timestamp)
    }
}
