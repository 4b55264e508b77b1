//! Raft member ids and the Raft configuration a table needs

use super::ids::{RaftMemberId, ServerId};
use super::raft_state::{Change, TableRaftState};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Membership of the table's Raft cluster
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftConfig {
    pub voting_members: BTreeSet<RaftMemberId>,
    pub non_voting_members: BTreeSet<RaftMemberId>,
}

impl RaftConfig {
    pub fn is_member(&self, member: &RaftMemberId) -> bool {
        self.voting_members.contains(member) || self.non_voting_members.contains(member)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberIdsAndConfig {
    pub remove_member_ids: BTreeSet<ServerId>,
    pub add_member_ids: BTreeMap<ServerId, RaftMemberId>,
    pub raft_config: RaftConfig,
}

impl MemberIdsAndConfig {
    /// The `NewMemberIds` change to propose, if any ids changed
    pub fn member_ids_change(&self) -> Option<Change> {
        if self.remove_member_ids.is_empty() && self.add_member_ids.is_empty() {
            return None;
        }
        Some(Change::NewMemberIds {
            remove_member_ids: self.remove_member_ids.clone(),
            add_member_ids: self.add_member_ids.clone(),
        })
    }
}

/// Every server named by a contract or by the config needs a member id; any
/// other id is dropped.
///
/// The Raft config is built from ids that already exist and survive, so a
/// freshly added server joins the Raft cluster on the pass after its id
/// commits. Servers voting in any contract or configured shard are voting
/// members.
pub fn calculate_member_ids_and_raft_config(state: &TableRaftState) -> MemberIdsAndConfig {
    let mut needed: BTreeSet<ServerId> = state.config.all_servers();
    let mut voting: BTreeSet<ServerId> = BTreeSet::new();
    for (_, contract) in state.contracts.values() {
        needed.extend(contract.replicas.iter().copied());
        voting.extend(contract.voters.iter().copied());
        voting.extend(contract.temp_voters.iter().flatten().copied());
    }
    for shard in &state.config.shards {
        voting.extend(shard.voting_replicas());
    }

    let remove_member_ids: BTreeSet<ServerId> = state
        .member_ids
        .keys()
        .filter(|server| !needed.contains(*server))
        .copied()
        .collect();
    let add_member_ids: BTreeMap<ServerId, RaftMemberId> = needed
        .iter()
        .filter(|server| !state.member_ids.contains_key(*server))
        .map(|server| (*server, RaftMemberId::generate()))
        .collect();

    let mut raft_config = RaftConfig::default();
    for (server, member) in &state.member_ids {
        if remove_member_ids.contains(server) {
            continue;
        }
        if voting.contains(server) {
            raft_config.voting_members.insert(*member);
        } else {
            raft_config.non_voting_members.insert(*member);
        }
    }

    MemberIdsAndConfig {
        remove_member_ids,
        add_member_ids,
        raft_config,
    }
}
