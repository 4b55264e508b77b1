//! Shared helpers: table layouts, ack constructors, and a stepper that runs
//! contract passes the way the pump does, minus the Raft round trip.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use tablecoord::contract::{
    calculate_all_contracts, group_acks_by_contract, make_new_table_raft_state, AckState,
    BranchBirthCertificate, BranchHistory, BranchId, CalculatedContracts, Change, Contract,
    ContractAck, ContractId, ContractRole, ConnectivityMap, ServerId, ServerNames, ShardConfig,
    ShardScheme, StateTimestamp, TableConfig, TableRaftState, Version,
};
use tablecoord::region::{KeyRange, Region, RegionMap, RightBound, StoreKey};

pub fn id(v: u128) -> ServerId {
    ServerId::from_u128(v)
}

pub fn servers(ids: &[u128]) -> BTreeSet<ServerId> {
    ids.iter().map(|v| id(*v)).collect()
}

pub fn shard(all: &[u128], nonvoting: &[u128], primary: Option<u128>) -> ShardConfig {
    ShardConfig {
        all_replicas: servers(all),
        nonvoting_replicas: servers(nonvoting),
        primary_replica: primary.map(id),
    }
}

pub fn table(shards: Vec<ShardConfig>, split_points: &[&str]) -> TableConfig {
    TableConfig {
        name: "test".into(),
        shards,
        shard_scheme: ShardScheme {
            split_points: split_points.iter().map(|k| StoreKey::from(*k)).collect(),
        },
    }
}

/// `[left, right)` over the whole hash space; `None` is unbounded.
pub fn keys(left: &str, right: Option<&str>) -> Region {
    Region::from_key_range(KeyRange::new(
        left.into(),
        right.map_or(RightBound::Unbounded, |r| RightBound::Key(r.into())),
    ))
}

pub fn ready() -> ContractAck {
    ContractAck::new(AckState::PrimaryReady)
}

pub fn streaming() -> ContractAck {
    ContractAck::new(AckState::SecondaryStreaming)
}

pub fn backfilling() -> ContractAck {
    ContractAck::new(AckState::SecondaryBackfilling)
}

pub fn need_primary(branch: BranchId, timestamp: u64) -> ContractAck {
    ContractAck::need_primary(
        RegionMap::new(
            Region::universe(),
            Version::new(branch, StateTimestamp(timestamp)),
        ),
        BranchHistory::new(),
    )
}

/// A primary asking for `branch`, born over `region` from `origin`.
pub fn need_branch(branch: BranchId, region: &Region, origin: Version) -> ContractAck {
    let mut history = BranchHistory::new();
    history.insert(
        branch,
        BranchBirthCertificate {
            region: region.clone(),
            initial_timestamp: origin.timestamp,
            origin: RegionMap::new(region.clone(), origin),
        },
    );
    ContractAck::need_branch(branch, history)
}

/// A table stepped by hand: acks go in, one contract pass runs, its diff is
/// applied as if Raft had committed it.
pub struct Table {
    pub state: TableRaftState,
    pub acks: BTreeMap<(ServerId, ContractId), ContractAck>,
    pub connectivity: ConnectivityMap,
}

impl Table {
    pub fn new(config: TableConfig) -> Self {
        let everyone = config.all_servers();
        Self {
            state: make_new_table_raft_state(config, ServerNames::new()).unwrap(),
            acks: BTreeMap::new(),
            connectivity: ConnectivityMap::fully_connected(&everyone),
        }
    }

    pub fn set_config(&mut self, config: TableConfig) {
        for server in config.all_servers() {
            for other in config.all_servers() {
                self.connectivity.connect(server, other);
            }
        }
        self.state
            .apply_change(&Change::SetTableConfig { new_config: config });
    }

    /// Ack every current contract `server` replicates whose region matches.
    pub fn ack_where(
        &mut self,
        server: u128,
        matches: impl Fn(&Region) -> bool,
        ack: ContractAck,
    ) {
        let server = id(server);
        let targets: Vec<ContractId> = self
            .state
            .contracts
            .iter()
            .filter(|(_, (region, contract))| {
                contract.replicas.contains(&server) && matches(region)
            })
            .map(|(contract_id, _)| *contract_id)
            .collect();
        for contract_id in targets {
            self.acks.insert((server, contract_id), ack.clone());
        }
    }

    pub fn ack(&mut self, server: u128, ack: ContractAck) {
        self.ack_where(server, |_| true, ack);
    }

    /// Every replica reports the steady state for the role it holds.
    pub fn ack_settled(&mut self) {
        let entries: Vec<(ServerId, ContractId, ContractRole)> = self
            .state
            .contracts
            .iter()
            .flat_map(|(contract_id, (_, contract))| {
                contract
                    .replicas
                    .iter()
                    .map(move |server| (*server, *contract_id, contract.role_of(server)))
            })
            .collect();
        for (server, contract_id, role) in entries {
            let ack = match role {
                ContractRole::Primary => ready(),
                _ => streaming(),
            };
            self.acks.insert((server, contract_id), ack);
        }
    }

    pub fn calculate(&self) -> CalculatedContracts {
        calculate_all_contracts(
            &self.state,
            &group_acks_by_contract(&self.acks),
            &self.connectivity,
        )
    }

    /// One pass, applied. Panics if the pass reported a diagnostic or left the
    /// state inconsistent.
    pub fn step(&mut self) -> CalculatedContracts {
        let calc = self.calculate();
        assert!(
            calc.diagnostics.is_empty(),
            "unexpected diagnostics: {:?}",
            calc.diagnostics
        );
        self.state
            .apply_change(&Change::NewContracts(calc.changes.clone()));
        self.state.sanity_check().expect("state stays consistent");
        calc
    }

    pub fn contracts_where(&self, matches: impl Fn(&Region) -> bool) -> Vec<Contract> {
        self.state
            .contracts
            .values()
            .filter(|(region, _)| matches(region))
            .map(|(_, contract)| contract.clone())
            .collect()
    }

    /// The contract every matching region agrees on.
    pub fn only_contract_where(&self, matches: impl Fn(&Region) -> bool) -> Contract {
        let contracts = self.contracts_where(matches);
        let first = contracts.first().cloned().expect("at least one contract");
        assert!(
            contracts.iter().all(|c| *c == first),
            "contracts disagree: {:?}",
            contracts
        );
        first
    }

    pub fn only_contract(&self) -> Contract {
        self.only_contract_where(|_| true)
    }

    pub fn current_branch(&self, region: &Region) -> Option<BranchId> {
        self.state.current_branches.constant_over(region).copied()
    }
}
