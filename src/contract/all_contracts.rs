//! Recomputing every contract of a table and diffing against the old ones

use super::branch_gc::BranchGc;
use super::calculate::{calculate_contract, AckFrags};
use super::connectivity::ConnectivityMap;
use super::fragments::break_ack_into_fragments_recovering;
use super::ids::{BranchId, ContractId, ServerId};
use super::raft_state::{NewContracts, TableRaftState};
use super::types::{AckState, Contract, ContractAck};
use crate::common::Error;
use crate::region::{cpu_sharding_subspace, Region, RegionMap, CPU_SHARDING_FACTOR};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Acks of every replica, grouped by the contract they acknowledge
pub type AcksByContract = BTreeMap<ContractId, BTreeMap<ServerId, ContractAck>>;

/// Group acks keyed by `(server, contract)` the way the calculation reads them.
pub fn group_acks_by_contract<'a>(
    acks: impl IntoIterator<Item = (&'a (ServerId, ContractId), &'a ContractAck)>,
) -> AcksByContract {
    let mut grouped = AcksByContract::new();
    for ((server, contract), ack) in acks {
        grouped
            .entry(*contract)
            .or_default()
            .insert(*server, ack.clone());
    }
    grouped
}

/// Result of one contract pass
#[derive(Debug, Clone, Default)]
pub struct CalculatedContracts {
    pub changes: NewContracts,
    /// Invariant violations the pass recovered from
    pub diagnostics: Vec<Error>,
}

/// Compute the contract diff for the whole table.
///
/// Contracts the pass would leave unchanged keep their IDs, so running it
/// twice on the same inputs produces an empty diff the second time.
pub fn calculate_all_contracts(
    old_state: &TableRaftState,
    acks: &AcksByContract,
    connectivity: &ConnectivityMap,
) -> CalculatedContracts {
    let mut diagnostics = Vec::new();
    let mut gc = BranchGc::new(&old_state.branch_history);
    let mut new_contracts: Vec<(Region, Contract)> = Vec::new();
    let mut registrations: Vec<(Region, BranchId)> = Vec::new();
    let no_acks = BTreeMap::new();
    let scheme = &old_state.config.shard_scheme;

    for (contract_id, (contract_region, old_contract)) in &old_state.contracts {
        let contract_acks = acks.get(contract_id).unwrap_or(&no_acks);
        let shards = old_state.config.shards.iter().take(scheme.num_shards());
        for (shard_index, shard_config) in shards.enumerate() {
            let shard_region = Region::from_key_range(scheme.get_shard_range(shard_index))
                .intersection(contract_region);
            if shard_region.is_empty() {
                continue;
            }

            let pieces = fragment_acks(
                &shard_region,
                old_contract,
                contract_acks,
                old_state,
                &mut diagnostics,
            );

            for (piece, piece_acks) in pieces.iter() {
                let mut new_contract =
                    calculate_contract(old_contract, shard_config, piece_acks, connectivity);

                let mut current = old_state.current_branches.mask(piece);
                if let Some(branch) = requested_branch(old_contract, &new_contract, piece_acks) {
                    if current.constant_over(piece) != Some(&branch) {
                        register_branch(
                            &mut gc,
                            branch,
                            piece,
                            &new_contract,
                            contract_acks,
                            &mut diagnostics,
                        );
                        registrations.push((piece.clone(), branch));
                        current = RegionMap::new(piece.clone(), branch);
                    }
                }

                let can_gc = new_contract
                    .replicas
                    .iter()
                    .all(|server| is_confirmed(piece_acks, server));
                for (sub_region, branch) in current.iter() {
                    gc.mark_live(branch);
                    if !can_gc {
                        gc.mark_all_ancestors_live(*branch, sub_region);
                    }
                }

                if new_contract.after_emergency_repair {
                    let voters_confirmed = new_contract
                        .voters
                        .iter()
                        .chain(new_contract.temp_voters.iter().flatten())
                        .all(|server| is_confirmed(piece_acks, server));
                    if voters_confirmed {
                        new_contract.after_emergency_repair = false;
                    }
                }

                new_contracts.push((piece.clone(), new_contract));
            }
        }
    }

    let sliced = slice_into_cells(old_state, RegionMap::from_fragments(new_contracts));
    let mut changes = diff_contracts(old_state, sliced);

    let mut register = RegionMap::from_fragments(registrations);
    register.coalesce();
    changes.register_current_branches = register;
    let (remove_branches, add_branches) = gc.finish();
    changes.remove_branches = remove_branches;
    changes.add_branches = add_branches;

    CalculatedContracts {
        changes,
        diagnostics,
    }
}

fn is_confirmed(acks: &AckFrags, server: &ServerId) -> bool {
    acks.get(server)
        .is_some_and(|frag| frag.state.is_confirmed_on_branch())
}

/// Split `region` into pieces over which every server's ack is homogeneous.
fn fragment_acks(
    region: &Region,
    old_contract: &Contract,
    contract_acks: &BTreeMap<ServerId, ContractAck>,
    old_state: &TableRaftState,
    diagnostics: &mut Vec<Error>,
) -> RegionMap<AckFrags> {
    let mut pieces = RegionMap::new(region.clone(), AckFrags::new());
    for (server, ack) in contract_acks {
        if let Err(err) = ack.sanity_check() {
            tracing::warn!(server = %server, error = %err, "ignoring malformed ack");
            diagnostics.push(err);
            continue;
        }
        let role = old_contract.role_of(server);
        if !ack.state.is_valid_for(role) {
            tracing::warn!(
                server = %server,
                state = %ack.state,
                ?role,
                "ignoring ack for the wrong role"
            );
            diagnostics.push(Error::Invariant(format!(
                "server {} acked {} as {:?}",
                server, ack.state, role
            )));
            continue;
        }
        // Ancestry is only trusted from voters, and not at all after an
        // emergency repair.
        let compute_common_ancestor =
            old_contract.is_voter(server) && !old_contract.after_emergency_repair;
        let frags = break_ack_into_fragments_recovering(
            region,
            ack,
            &old_state.current_branches,
            &old_state.branch_history,
            compute_common_ancestor,
            diagnostics,
        );
        for (frag_region, frag) in frags.iter() {
            pieces.visit_mut(frag_region, |_, by_server| {
                by_server.insert(*server, frag.clone());
            });
        }
    }
    pieces.coalesce();
    pieces
}

/// The branch a primary that keeps its role is asking to have registered.
fn requested_branch(old: &Contract, new: &Contract, acks: &AckFrags) -> Option<BranchId> {
    let old_primary = old.primary.as_ref()?;
    let new_primary = new.primary.as_ref()?;
    if old_primary.server != new_primary.server {
        return None;
    }
    acks.get(&new_primary.server)
        .filter(|frag| frag.state == AckState::PrimaryNeedBranch)
        .and_then(|frag| frag.branch)
}

fn register_branch(
    gc: &mut BranchGc<'_>,
    branch: BranchId,
    region: &Region,
    contract: &Contract,
    contract_acks: &BTreeMap<ServerId, ContractAck>,
    diagnostics: &mut Vec<Error>,
) {
    let Some(primary) = &contract.primary else {
        return;
    };
    let Some(ack) = contract_acks.get(&primary.server) else {
        return;
    };
    tracing::info!(
        branch = %branch,
        region = %region,
        primary = %primary.server,
        "registering branch"
    );
    if let Err(err) = gc.mark_ancestors_since_base_live(branch, region, &ack.branch_history) {
        if contract.after_emergency_repair {
            tracing::warn!(
                branch = %branch,
                error = %err,
                "branch history gap after emergency repair"
            );
        } else {
            tracing::error!(
                branch = %branch,
                error = %err,
                "primary sent incomplete branch history"
            );
            diagnostics.push(err);
        }
    }
}

/// Cut the contracts along CPU-shard and user-shard boundaries, merging
/// equal neighbours inside each cell.
fn slice_into_cells(
    old_state: &TableRaftState,
    contracts: RegionMap<Contract>,
) -> Vec<(Region, Contract)> {
    let scheme = &old_state.config.shard_scheme;
    let mut sliced = Vec::new();
    for shard_index in 0..scheme.num_shards() {
        let shard_region = Region::from_key_range(scheme.get_shard_range(shard_index));
        for cpu in 0..CPU_SHARDING_FACTOR {
            let cell = shard_region.intersection(&cpu_sharding_subspace(cpu));
            let mut in_cell = contracts.mask(&cell);
            in_cell.coalesce();
            sliced.extend(in_cell.into_entries());
        }
    }
    sliced
}

fn diff_contracts(
    old_state: &TableRaftState,
    new_contracts: Vec<(Region, Contract)>,
) -> NewContracts {
    let old_by_content: HashMap<(Region, Contract), ContractId> = old_state
        .contracts
        .iter()
        .map(|(id, entry)| (entry.clone(), *id))
        .collect();

    let mut changes = NewContracts::default();
    let mut kept = BTreeSet::new();
    for entry in new_contracts {
        match old_by_content.get(&entry) {
            Some(id) => {
                kept.insert(*id);
            }
            None => {
                changes.add_contracts.insert(ContractId::generate(), entry);
            }
        }
    }
    changes.remove_contracts = old_state
        .contracts
        .keys()
        .filter(|id| !kept.contains(*id))
        .copied()
        .collect();
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::branch::{BranchBirthCertificate, BranchHistory};
    use crate::contract::ids::{StateTimestamp, Version};
    use crate::contract::raft_state::{
        make_new_table_raft_state, Change, ServerNames, ShardConfig, ShardScheme, TableConfig,
    };
    use crate::contract::types::Primary;

    fn id(v: u128) -> ServerId {
        ServerId::from_u128(v)
    }

    fn set(ids: &[u128]) -> BTreeSet<ServerId> {
        ids.iter().map(|v| id(*v)).collect()
    }

    fn config(replicas: &[u128], primary: u128) -> TableConfig {
        TableConfig {
            name: "t".into(),
            shards: vec![ShardConfig {
                all_replicas: set(replicas),
                nonvoting_replicas: BTreeSet::new(),
                primary_replica: Some(id(primary)),
            }],
            shard_scheme: ShardScheme::default(),
        }
    }

    fn ack_all(state: &TableRaftState, server: u128, ack: ContractAck) -> AcksByContract {
        state
            .contracts
            .keys()
            .map(|cid| (*cid, [(id(server), ack.clone())].into_iter().collect()))
            .collect()
    }

    fn ack_each(state: &TableRaftState, acks: &[(u128, ContractAck)]) -> AcksByContract {
        state
            .contracts
            .keys()
            .map(|cid| {
                let by_server = acks
                    .iter()
                    .map(|(server, ack)| (id(*server), ack.clone()))
                    .collect();
                (*cid, by_server)
            })
            .collect()
    }

    fn after_repair(state: &mut TableRaftState) {
        for (_, contract) in state.contracts.values_mut() {
            contract.after_emergency_repair = true;
        }
    }

    fn need_branch(branch: BranchId, origin: Version) -> ContractAck {
        let mut history = BranchHistory::new();
        history.insert(
            branch,
            BranchBirthCertificate {
                region: Region::universe(),
                initial_timestamp: origin.timestamp,
                origin: RegionMap::new(Region::universe(), origin),
            },
        );
        ContractAck::need_branch(branch, history)
    }

    fn apply(state: &mut TableRaftState, calc: &CalculatedContracts) {
        state.apply_change(&Change::NewContracts(calc.changes.clone()));
        state.sanity_check().unwrap();
    }

    #[test]
    fn test_no_acks_keeps_every_contract() {
        let state = make_new_table_raft_state(config(&[1], 1), ServerNames::new()).unwrap();
        let calc = calculate_all_contracts(
            &state,
            &AcksByContract::new(),
            &ConnectivityMap::fully_connected(&set(&[1])),
        );
        assert!(calc.changes.is_empty(), "{:?}", calc.changes);
        assert!(calc.diagnostics.is_empty());
    }

    #[test]
    fn test_primary_branch_is_registered_and_kept() {
        let mut state = make_new_table_raft_state(config(&[1], 1), ServerNames::new()).unwrap();
        let conn = ConnectivityMap::fully_connected(&set(&[1]));
        let branch = BranchId::generate();
        let mut history = BranchHistory::new();
        history.insert(
            branch,
            BranchBirthCertificate {
                region: Region::universe(),
                initial_timestamp: StateTimestamp(0),
                origin: RegionMap::new(Region::universe(), Version::zero()),
            },
        );
        let acks = ack_all(&state, 1, ContractAck::need_branch(branch, history));
        let calc = calculate_all_contracts(&state, &acks, &conn);
        assert!(calc.changes.add_contracts.is_empty());
        assert_eq!(
            calc.changes.register_current_branches.constant_over(&Region::universe()),
            Some(&branch)
        );
        assert!(calc.changes.add_branches.contains(&branch));
        apply(&mut state, &calc);
        assert!(state.branch_history.contains(&branch));

        // Now ready everywhere: the branch stays, nothing else changes.
        let acks = ack_all(&state, 1, ContractAck::new(AckState::PrimaryReady));
        let calc = calculate_all_contracts(&state, &acks, &conn);
        assert!(calc.changes.is_empty(), "{:?}", calc.changes);
    }

    #[test]
    fn test_old_ancestry_is_collected_once_everyone_is_on_the_branch() {
        let mut state = make_new_table_raft_state(config(&[1], 1), ServerNames::new()).unwrap();
        let (old, current) = (BranchId::generate(), BranchId::generate());
        let cert = |origin| BranchBirthCertificate {
            region: Region::universe(),
            initial_timestamp: StateTimestamp(3),
            origin: RegionMap::new(Region::universe(), origin),
        };
        state.branch_history.insert(old, cert(Version::zero()));
        state
            .branch_history
            .insert(current, cert(Version::new(old, StateTimestamp(3))));
        state.current_branches = RegionMap::new(Region::universe(), current);
        let conn = ConnectivityMap::fully_connected(&set(&[1]));

        let backfilling = ack_all(&state, 1, ContractAck::new(AckState::PrimaryInProgress));
        let calc = calculate_all_contracts(&state, &backfilling, &conn);
        assert!(calc.changes.remove_branches.is_empty());

        let ready = ack_all(&state, 1, ContractAck::new(AckState::PrimaryReady));
        let calc = calculate_all_contracts(&state, &ready, &conn);
        assert_eq!(calc.changes.remove_branches, [old].into_iter().collect());
        apply(&mut state, &calc);
        assert!(state.branch_history.contains(&current));
    }

    #[test]
    fn test_changed_contracts_get_new_ids() {
        let mut state = make_new_table_raft_state(config(&[1], 1), ServerNames::new()).unwrap();
        state.config = config(&[1, 2], 1);
        let calc = calculate_all_contracts(
            &state,
            &AcksByContract::new(),
            &ConnectivityMap::fully_connected(&set(&[1, 2])),
        );
        assert_eq!(calc.changes.remove_contracts.len(), CPU_SHARDING_FACTOR);
        assert_eq!(calc.changes.add_contracts.len(), CPU_SHARDING_FACTOR);
        for (_, contract) in calc.changes.add_contracts.values() {
            assert_eq!(contract.replicas, set(&[1, 2]));
            assert_eq!(contract.primary, Some(Primary::new(id(1))));
        }
        apply(&mut state, &calc);

        let again = calculate_all_contracts(
            &state,
            &AcksByContract::new(),
            &ConnectivityMap::fully_connected(&set(&[1, 2])),
        );
        assert!(again.changes.is_empty());
    }

    #[test]
    fn test_malformed_ack_is_reported() {
        let state = make_new_table_raft_state(config(&[1], 1), ServerNames::new()).unwrap();
        let mut bad = ContractAck::new(AckState::SecondaryNeedPrimary);
        bad.version = None;
        let calc = calculate_all_contracts(
            &state,
            &ack_all(&state, 1, bad),
            &ConnectivityMap::fully_connected(&set(&[1])),
        );
        assert_eq!(calc.diagnostics.len(), CPU_SHARDING_FACTOR);
        assert!(calc.changes.is_empty());
    }

    #[test]
    fn test_group_acks_by_contract() {
        let (c1, c2) = (ContractId::generate(), ContractId::generate());
        let ready = ContractAck::new(AckState::PrimaryReady);
        let flat: BTreeMap<(ServerId, ContractId), ContractAck> = [
            ((id(1), c1), ready.clone()),
            ((id(2), c1), ready.clone()),
            ((id(1), c2), ready),
        ]
        .into_iter()
        .collect();
        let grouped = group_acks_by_contract(&flat);
        assert_eq!(grouped[&c1].len(), 2);
        assert_eq!(grouped[&c2].len(), 1);
    }

    #[test]
    fn test_repair_flag_clears_once_voters_confirm() {
        let mut state = make_new_table_raft_state(config(&[1, 2], 1), ServerNames::new()).unwrap();
        after_repair(&mut state);
        let conn = ConnectivityMap::fully_connected(&set(&[1, 2]));

        let backfilling = ack_each(
            &state,
            &[
                (1, ContractAck::new(AckState::PrimaryReady)),
                (2, ContractAck::new(AckState::SecondaryBackfilling)),
            ],
        );
        let calc = calculate_all_contracts(&state, &backfilling, &conn);
        assert!(calc.changes.is_empty(), "{:?}", calc.changes);

        let confirmed = ack_each(
            &state,
            &[
                (1, ContractAck::new(AckState::PrimaryReady)),
                (2, ContractAck::new(AckState::SecondaryStreaming)),
            ],
        );
        let calc = calculate_all_contracts(&state, &confirmed, &conn);
        assert!(calc.diagnostics.is_empty());
        assert_eq!(calc.changes.remove_contracts.len(), CPU_SHARDING_FACTOR);
        assert_eq!(calc.changes.add_contracts.len(), CPU_SHARDING_FACTOR);
        for (_, contract) in calc.changes.add_contracts.values() {
            assert!(!contract.after_emergency_repair);
            assert_eq!(contract.voters, set(&[1, 2]));
            assert_eq!(contract.primary, Some(Primary::new(id(1))));
        }
        apply(&mut state, &calc);
        assert!(state.contracts.values().all(|(_, c)| !c.after_emergency_repair));
    }

    #[test]
    fn test_history_gap_tolerated_after_emergency_repair() {
        let mut state = make_new_table_raft_state(config(&[1], 1), ServerNames::new()).unwrap();
        let conn = ConnectivityMap::fully_connected(&set(&[1]));
        let branch = BranchId::generate();
        // The parent is in neither the Raft history nor the ack's extract.
        let lost_parent = Version::new(BranchId::generate(), StateTimestamp(12));
        let acks = ack_all(&state, 1, need_branch(branch, lost_parent));

        let calc = calculate_all_contracts(&state, &acks, &conn);
        assert_eq!(calc.diagnostics.len(), CPU_SHARDING_FACTOR);
        assert!(calc
            .diagnostics
            .iter()
            .all(|err| matches!(err, Error::IncompleteBranchHistory(_))));

        after_repair(&mut state);
        let acks = ack_all(&state, 1, need_branch(branch, lost_parent));
        let calc = calculate_all_contracts(&state, &acks, &conn);
        assert!(calc.diagnostics.is_empty(), "{:?}", calc.diagnostics);
        assert_eq!(
            calc.changes.register_current_branches.constant_over(&Region::universe()),
            Some(&branch)
        );
        assert!(calc.changes.add_branches.contains(&branch));
        apply(&mut state, &calc);
        assert_eq!(state.current_branches.constant_over(&Region::universe()), Some(&branch));
    }

    #[test]
    fn test_ack_for_the_wrong_role_is_reported() {
        let state = make_new_table_raft_state(config(&[1, 2], 1), ServerNames::new()).unwrap();
        let acks = ack_each(
            &state,
            &[
                (1, ContractAck::new(AckState::PrimaryReady)),
                (2, ContractAck::new(AckState::PrimaryReady)),
            ],
        );
        let calc = calculate_all_contracts(
            &state,
            &acks,
            &ConnectivityMap::fully_connected(&set(&[1, 2])),
        );
        assert_eq!(calc.diagnostics.len(), CPU_SHARDING_FACTOR);
        assert!(calc.diagnostics.iter().all(Error::is_invariant_violation));
        assert!(calc.changes.is_empty(), "{:?}", calc.changes);
    }

    #[test]
    fn test_shards_beyond_the_split_points_are_ignored() {
        let mut state = make_new_table_raft_state(config(&[1], 1), ServerNames::new()).unwrap();
        let extra = state.config.shards[0].clone();
        state.config.shards.push(extra);
        let calc = calculate_all_contracts(
            &state,
            &AcksByContract::new(),
            &ConnectivityMap::fully_connected(&set(&[1])),
        );
        assert!(calc.changes.is_empty(), "{:?}", calc.changes);
    }
}
