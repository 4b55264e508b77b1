//! Contracts and the acknowledgements replicas send back for them

use super::branch::BranchHistory;
use super::ids::{BranchId, ServerId, StateTimestamp, Version};
use crate::common::{Error, Result};
use crate::region::RegionMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// The primary of a contract, optionally handing its role over to another server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Primary {
    pub server: ServerId,
    pub hand_over: Option<ServerId>,
}

impl Primary {
    pub fn new(server: ServerId) -> Self {
        Self {
            server,
            hand_over: None,
        }
    }
}

/// What a shard's replicas must do over one region.
///
/// The region itself is kept next to the contract, in the table's contract map.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Contract {
    /// Every server holding a copy, voting or not
    pub replicas: BTreeSet<ServerId>,
    /// Servers counted toward write-ack majorities
    pub voters: BTreeSet<ServerId>,
    /// Staged voter set while a voter change is in flight
    pub temp_voters: Option<BTreeSet<ServerId>>,
    /// `None` while a primary is being elected
    pub primary: Option<Primary>,
    /// Set by manual repair; election falls back to a full-quorum rule
    pub after_emergency_repair: bool,
}

/// Role a server plays under a contract
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractRole {
    Primary,
    Secondary,
    NotReplica,
}

impl Contract {
    pub fn new(
        replicas: BTreeSet<ServerId>,
        voters: BTreeSet<ServerId>,
        primary: Option<ServerId>,
    ) -> Self {
        Self {
            replicas,
            voters,
            temp_voters: None,
            primary: primary.map(Primary::new),
            after_emergency_repair: false,
        }
    }

    /// Voter under either the committed or the staged voter set
    pub fn is_voter(&self, server: &ServerId) -> bool {
        self.voters.contains(server)
            || self
                .temp_voters
                .as_ref()
                .is_some_and(|temp| temp.contains(server))
    }

    pub fn is_primary(&self, server: &ServerId) -> bool {
        self.primary.as_ref().is_some_and(|p| p.server == *server)
    }

    pub fn role_of(&self, server: &ServerId) -> ContractRole {
        if self.is_primary(server) {
            ContractRole::Primary
        } else if self.replicas.contains(server) {
            ContractRole::Secondary
        } else {
            ContractRole::NotReplica
        }
    }

    /// Structural invariants every contract the coordinator emits satisfies.
    pub fn sanity_check(&self) -> Result<()> {
        if !self.voters.is_subset(&self.replicas) {
            return Err(Error::Invariant("voters must be replicas".into()));
        }
        if let Some(temp) = &self.temp_voters {
            if !temp.is_subset(&self.replicas) {
                return Err(Error::Invariant("temp voters must be replicas".into()));
            }
        }
        if let Some(primary) = &self.primary {
            if !self.replicas.contains(&primary.server) {
                return Err(Error::Invariant("primary must be a replica".into()));
            }
            if let Some(target) = primary.hand_over {
                if !self.replicas.contains(&target) {
                    return Err(Error::Invariant("hand-over target must be a replica".into()));
                }
            }
        }
        Ok(())
    }
}

/// The state a replica reports for a contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AckState {
    PrimaryNeedBranch,
    PrimaryInProgress,
    PrimaryReady,
    SecondaryNeedPrimary,
    SecondaryBackfilling,
    SecondaryStreaming,
}

impl AckState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckState::PrimaryNeedBranch => "primary_need_branch",
            AckState::PrimaryInProgress => "primary_in_progress",
            AckState::PrimaryReady => "primary_ready",
            AckState::SecondaryNeedPrimary => "secondary_need_primary",
            AckState::SecondaryBackfilling => "secondary_backfilling",
            AckState::SecondaryStreaming => "secondary_streaming",
        }
    }

    /// Which states an executor may report for the role it holds.
    pub fn is_valid_for(&self, role: ContractRole) -> bool {
        match role {
            ContractRole::Primary => matches!(
                self,
                AckState::PrimaryNeedBranch | AckState::PrimaryInProgress | AckState::PrimaryReady
            ),
            ContractRole::Secondary => matches!(
                self,
                AckState::SecondaryNeedPrimary
                    | AckState::SecondaryBackfilling
                    | AckState::SecondaryStreaming
            ),
            ContractRole::NotReplica => false,
        }
    }

    /// The replica is known to be following the region's current branch.
    pub fn is_confirmed_on_branch(&self) -> bool {
        matches!(self, AckState::PrimaryReady | AckState::SecondaryStreaming)
    }
}

impl std::fmt::Display for AckState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A replica's acknowledgement of one contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractAck {
    pub state: AckState,
    /// Only with `SecondaryNeedPrimary`
    pub version: Option<RegionMap<Version>>,
    /// Only with `PrimaryNeedBranch`
    pub branch: Option<BranchId>,
    /// Enough history to interpret `version` and `branch`
    pub branch_history: BranchHistory,
}

impl ContractAck {
    /// An ack carrying no version or branch
    pub fn new(state: AckState) -> Self {
        Self {
            state,
            version: None,
            branch: None,
            branch_history: BranchHistory::default(),
        }
    }

    pub fn need_primary(version: RegionMap<Version>, branch_history: BranchHistory) -> Self {
        Self {
            state: AckState::SecondaryNeedPrimary,
            version: Some(version),
            branch: None,
            branch_history,
        }
    }

    pub fn need_branch(branch: BranchId, branch_history: BranchHistory) -> Self {
        Self {
            state: AckState::PrimaryNeedBranch,
            version: None,
            branch: Some(branch),
            branch_history,
        }
    }

    pub fn sanity_check(&self) -> Result<()> {
        let needs_version = self.state == AckState::SecondaryNeedPrimary;
        let needs_branch = self.state == AckState::PrimaryNeedBranch;
        if self.version.is_some() != needs_version {
            return Err(Error::Invariant(format!(
                "ack state {} with version present = {}",
                self.state,
                self.version.is_some()
            )));
        }
        if self.branch.is_some() != needs_branch {
            return Err(Error::Invariant(format!(
                "ack state {} with branch present = {}",
                self.state,
                self.branch.is_some()
            )));
        }
        Ok(())
    }
}

/// A `ContractAck` restricted to a sub-region over which it is homogeneous.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContractAckFrag {
    pub state: AckState,
    pub version: Option<Version>,
    /// Last timestamp at which `version` and the region's current branch agree
    pub common_ancestor: Option<StateTimestamp>,
    pub branch: Option<BranchId>,
}
