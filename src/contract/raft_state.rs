//! The Raft-replicated table state and the changes that mutate it

use super::branch::BranchHistory;
use super::ids::{BranchId, ContractId, RaftMemberId, ServerId};
use super::types::Contract;
use crate::common::{Error, Result};
use crate::region::{
    cpu_sharding_subspace, KeyRange, Region, RegionMap, RightBound, StoreKey, CPU_SHARDING_FACTOR,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Desired replica layout of one user shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardConfig {
    pub all_replicas: BTreeSet<ServerId>,
    pub nonvoting_replicas: BTreeSet<ServerId>,
    pub primary_replica: Option<ServerId>,
}

impl ShardConfig {
    pub fn voting_replicas(&self) -> BTreeSet<ServerId> {
        self.all_replicas
            .difference(&self.nonvoting_replicas)
            .copied()
            .collect()
    }
}

/// Split points dividing the key space into user shards
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ShardScheme {
    pub split_points: Vec<StoreKey>,
}

impl ShardScheme {
    pub fn num_shards(&self) -> usize {
        self.split_points.len() + 1
    }

    pub fn get_shard_range(&self, index: usize) -> KeyRange {
        let left = if index == 0 {
            StoreKey::min()
        } else {
            self.split_points[index - 1].clone()
        };
        let right = match self.split_points.get(index) {
            Some(key) => RightBound::Key(key.clone()),
            None => RightBound::Unbounded,
        };
        KeyRange::new(left, right)
    }
}

/// User intent for a table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableConfig {
    pub name: String,
    pub shards: Vec<ShardConfig>,
    pub shard_scheme: ShardScheme,
}

impl TableConfig {
    pub fn validate(&self) -> Result<()> {
        if self.shards.len() != self.shard_scheme.num_shards() {
            return Err(Error::InvalidConfig(format!(
                "{} shards but {} split points",
                self.shards.len(),
                self.shard_scheme.split_points.len()
            )));
        }
        let mut previous = StoreKey::min();
        for point in &self.shard_scheme.split_points {
            if *point <= previous {
                return Err(Error::InvalidConfig(format!(
                    "split point {} out of order",
                    point
                )));
            }
            previous = point.clone();
        }
        for (index, shard) in self.shards.iter().enumerate() {
            if !shard.nonvoting_replicas.is_subset(&shard.all_replicas) {
                return Err(Error::InvalidConfig(format!(
                    "shard {}: non-voting replicas must be replicas",
                    index
                )));
            }
            let voters = shard.voting_replicas();
            if voters.is_empty() {
                return Err(Error::InvalidConfig(format!("shard {}: no voters", index)));
            }
            if let Some(primary) = &shard.primary_replica {
                if !voters.contains(primary) {
                    return Err(Error::InvalidConfig(format!(
                        "shard {}: primary {} is not a voter",
                        index, primary
                    )));
                }
            }
        }
        Ok(())
    }

    /// Every server named anywhere in the config
    pub fn all_servers(&self) -> BTreeSet<ServerId> {
        self.shards
            .iter()
            .flat_map(|shard| shard.all_replicas.iter().copied())
            .collect()
    }
}

/// Server name cache, so the table can be described without the server directory
pub type ServerNames = BTreeMap<ServerId, String>;

/// Payload of `Change::NewContracts`
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NewContracts {
    pub remove_contracts: BTreeSet<ContractId>,
    pub add_contracts: BTreeMap<ContractId, (Region, Contract)>,
    pub register_current_branches: RegionMap<BranchId>,
    pub remove_branches: BTreeSet<BranchId>,
    pub add_branches: BranchHistory,
}

impl NewContracts {
    pub fn is_empty(&self) -> bool {
        self.remove_contracts.is_empty()
            && self.add_contracts.is_empty()
            && self.register_current_branches.is_empty()
            && self.remove_branches.is_empty()
            && self.add_branches.is_empty()
    }
}

/// Everything that can be committed through Raft
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change {
    SetTableConfig {
        new_config: TableConfig,
    },
    NewContracts(NewContracts),
    NewMemberIds {
        remove_member_ids: BTreeSet<ServerId>,
        add_member_ids: BTreeMap<ServerId, RaftMemberId>,
    },
    NewServerNames {
        names: ServerNames,
    },
}

impl Change {
    pub fn kind(&self) -> &'static str {
        match self {
            Change::SetTableConfig { .. } => "set_table_config",
            Change::NewContracts(_) => "new_contracts",
            Change::NewMemberIds { .. } => "new_member_ids",
            Change::NewServerNames { .. } => "new_server_names",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRaftState {
    pub config: TableConfig,
    pub contracts: BTreeMap<ContractId, (Region, Contract)>,
    pub current_branches: RegionMap<BranchId>,
    pub branch_history: BranchHistory,
    pub member_ids: BTreeMap<ServerId, RaftMemberId>,
    pub server_names: ServerNames,
}

impl TableRaftState {
    /// Apply a committed change. This is the only place the state is mutated.
    pub fn apply_change(&mut self, change: &Change) {
        match change {
            Change::SetTableConfig { new_config } => {
                self.config = new_config.clone();
            }
            Change::NewContracts(diff) => {
                for id in &diff.remove_contracts {
                    self.contracts.remove(id);
                }
                for (id, entry) in &diff.add_contracts {
                    self.contracts.insert(*id, entry.clone());
                }
                self.current_branches
                    .update_from(&diff.register_current_branches);
                for branch in &diff.remove_branches {
                    self.branch_history.branches.remove(branch);
                }
                self.branch_history.import(&diff.add_branches);
            }
            Change::NewMemberIds {
                remove_member_ids,
                add_member_ids,
            } => {
                for server in remove_member_ids {
                    self.member_ids.remove(server);
                    self.server_names.remove(server);
                }
                for (server, member) in add_member_ids {
                    self.member_ids.insert(*server, *member);
                }
            }
            Change::NewServerNames { names } => {
                for (server, name) in names {
                    self.server_names.insert(*server, name.clone());
                }
            }
        }
    }

    /// Contracts must tile the whole key space, each inside one CPU shard and
    /// one user shard, and each must be structurally sound.
    pub fn sanity_check(&self) -> Result<()> {
        let mut covered: RegionMap<ContractId> = RegionMap::empty();
        for (id, (region, contract)) in &self.contracts {
            contract.sanity_check()?;
            let mut overlap = false;
            covered.visit(region, |_, _| overlap = true);
            if overlap {
                return Err(Error::Invariant(format!("{} overlaps another contract", id)));
            }
            covered.update(region, *id);
            let in_cpu_shard = (0..CPU_SHARDING_FACTOR)
                .any(|cpu| cpu_sharding_subspace(cpu).is_superset(region));
            let in_user_shard = (0..self.config.shard_scheme.num_shards()).any(|shard| {
                Region::from_key_range(self.config.shard_scheme.get_shard_range(shard))
                    .is_superset(region)
            });
            if !in_cpu_shard || !in_user_shard {
                return Err(Error::Invariant(format!(
                    "{} at {} straddles a shard boundary",
                    id, region
                )));
            }
        }
        if !covered.covers(&Region::universe()) {
            return Err(Error::Invariant("contracts leave a gap in the key space".into()));
        }
        Ok(())
    }
}

/// Initial state of a freshly created table: one contract per user shard and
/// CPU shard, no branches yet. Fails if `config` does not validate.
pub fn make_new_table_raft_state(
    config: TableConfig,
    server_names: ServerNames,
) -> Result<TableRaftState> {
    config.validate()?;
    let mut contracts = BTreeMap::new();
    let mut member_ids = BTreeMap::new();
    for (index, shard) in config.shards.iter().enumerate() {
        let contract = Contract::new(
            shard.all_replicas.clone(),
            shard.voting_replicas(),
            shard.primary_replica,
        );
        let shard_region = Region::from_key_range(config.shard_scheme.get_shard_range(index));
        for cpu in 0..CPU_SHARDING_FACTOR {
            let region = shard_region.intersection(&cpu_sharding_subspace(cpu));
            contracts.insert(ContractId::generate(), (region, contract.clone()));
        }
        for server in &shard.all_replicas {
            member_ids
                .entry(*server)
                .or_insert_with(RaftMemberId::generate);
        }
    }
    Ok(TableRaftState {
        config,
        contracts,
        current_branches: RegionMap::new(Region::universe(), BranchId::nil()),
        branch_history: BranchHistory::new(),
        member_ids,
        server_names,
    })
}
