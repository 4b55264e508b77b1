//! Next contract for one homogeneous region
//!
//! `calculate_contract` is a pure function of the old contract, the shard's
//! config, the replicas' ack fragments and a connectivity snapshot. Each step
//! below only touches the fields it names; the order matters.

use super::connectivity::ConnectivityMap;
use super::ids::{ServerId, StateTimestamp};
use super::raft_state::ShardConfig;
use super::types::{AckState, Contract, ContractAckFrag, Primary};
use std::collections::{BTreeMap, BTreeSet};

/// Ack fragments of one region, by server
pub type AckFrags = BTreeMap<ServerId, ContractAckFrag>;

fn has_state(acks: &AckFrags, server: &ServerId, state: AckState) -> bool {
    acks.get(server).is_some_and(|frag| frag.state == state)
}

/// Streaming secondaries and the current primary have every acked write of the
/// current branch; nobody else is known to.
fn is_streaming(old: &Contract, acks: &AckFrags, server: &ServerId) -> bool {
    old.is_primary(server) || has_state(acks, server, AckState::SecondaryStreaming)
}

fn voter_groups(contract: &Contract) -> Vec<&BTreeSet<ServerId>> {
    let mut groups = vec![&contract.voters];
    if let Some(temp) = &contract.temp_voters {
        groups.push(temp);
    }
    groups
}

pub fn calculate_contract(
    old: &Contract,
    config: &ShardConfig,
    acks: &AckFrags,
    connectivity: &ConnectivityMap,
) -> Contract {
    let mut new = old.clone();

    // Replicas are only ever added here; removal happens further down.
    new.replicas.extend(config.all_replicas.iter().copied());

    let wanted_voters = config.voting_replicas();
    match &old.temp_voters {
        None if old.voters != wanted_voters => {
            let voters = next_voter_set(old, &wanted_voters, &new.replicas, acks);
            if voters != old.voters {
                new.temp_voters = Some(voters);
            }
        }
        Some(temp) => {
            // A primary_ready ack for the old contract certifies that every acked
            // write is on a majority of both voter sets.
            let primary_ready = old
                .primary
                .as_ref()
                .is_some_and(|p| has_state(acks, &p.server, AckState::PrimaryReady));
            if primary_ready {
                new.voters = temp.clone();
                new.temp_voters = None;
            }
        }
        None => {}
    }

    let visible = visible_voters(&new, connectivity);

    let mut should_kill_primary = false;
    for server in &old.replicas {
        if !config.all_replicas.contains(server) && !new.is_voter(server) {
            new.replicas.remove(server);
            if old.is_primary(server) {
                should_kill_primary = true;
            }
        }
    }

    match &old.primary {
        None => {
            let elected = if old.after_emergency_repair {
                elect_after_emergency_repair(&new, acks, &visible)
            } else {
                elect_primary(&new, config, acks, &visible)
            };
            new.primary = elected.map(Primary::new);
        }
        Some(primary) => {
            new.primary = replace_or_hand_over(primary, &new, config, acks, &visible);
        }
    }

    if should_kill_primary {
        new.primary = None;
    }
    if let Some(primary) = &mut new.primary {
        if primary.hand_over.is_some_and(|target| !new.replicas.contains(&target)) {
            primary.hand_over = None;
        }
    }

    new
}

/// The voter set to stage for the transition from `old.voters` to `wanted`.
///
/// Only streaming servers are promoted, since anybody else may be missing branch
/// history. Unwanted voters go non-streaming first, never below
/// `min(|old|, |wanted|)` voters, and never so far that streaming voters stop
/// being a majority.
fn next_voter_set(
    old: &Contract,
    wanted: &BTreeSet<ServerId>,
    replicas: &BTreeSet<ServerId>,
    acks: &AckFrags,
) -> BTreeSet<ServerId> {
    let mut voters = old.voters.clone();
    for server in wanted {
        if replicas.contains(server) && is_streaming(old, acks, server) {
            voters.insert(*server);
        }
    }

    let floor = old.voters.len().min(wanted.len());
    let mut unwanted: Vec<ServerId> = old
        .voters
        .iter()
        .filter(|server| !wanted.contains(*server))
        .copied()
        .collect();
    unwanted.sort_by_key(|server| (is_streaming(old, acks, server), *server));

    for server in unwanted {
        if voters.len() <= floor {
            break;
        }
        let mut candidate = voters.clone();
        candidate.remove(&server);
        let streaming = candidate
            .iter()
            .filter(|voter| is_streaming(old, acks, voter))
            .count();
        if streaming * 2 > candidate.len() {
            voters = candidate;
        }
    }
    voters
}

/// Voters (and temp voters) seen by a majority of every voter group.
fn visible_voters(contract: &Contract, connectivity: &ConnectivityMap) -> BTreeSet<ServerId> {
    let groups = voter_groups(contract);
    contract
        .replicas
        .iter()
        .filter(|server| contract.is_voter(server))
        .filter(|server| {
            groups
                .iter()
                .all(|group| connectivity.seen_by_majority(server, group))
        })
        .copied()
        .collect()
}

fn elect_primary(
    contract: &Contract,
    config: &ShardConfig,
    acks: &AckFrags,
    visible: &BTreeSet<ServerId>,
) -> Option<ServerId> {
    let groups = voter_groups(contract);
    let pool: BTreeSet<ServerId> = groups.iter().flat_map(|g| g.iter().copied()).collect();

    let ancestor_of = |server: &ServerId| -> Option<StateTimestamp> {
        acks.get(server)
            .filter(|frag| frag.state == AckState::SecondaryNeedPrimary)
            .map(|frag| frag.common_ancestor.unwrap_or_default())
    };

    let eligible = |server: &ServerId, ancestor: StateTimestamp| -> bool {
        visible.contains(server)
            && groups.iter().all(|group| {
                let not_ahead = group
                    .iter()
                    .filter(|voter| ancestor_of(*voter).is_some_and(|t| t <= ancestor))
                    .count();
                not_ahead >= group.len() - group.len() / 2
            })
    };

    if let Some(preferred) = config.primary_replica.filter(|p| pool.contains(p)) {
        match ancestor_of(&preferred) {
            Some(ancestor) if eligible(&preferred, ancestor) => return Some(preferred),
            // Visible but silent: give it a chance rather than churning.
            None if visible.contains(&preferred) => return None,
            _ => {}
        }
    }

    let mut ranked: Vec<(StateTimestamp, ServerId)> = pool
        .iter()
        .filter_map(|server| ancestor_of(server).map(|t| (t, *server)))
        .collect();
    ranked.sort();
    ranked
        .iter()
        .rev()
        .find(|(ancestor, server)| eligible(server, *ancestor))
        .map(|(_, server)| *server)
}

/// Branch ancestry can't be trusted after an emergency repair, so every voter
/// must report, and the highest raw timestamp wins.
fn elect_after_emergency_repair(
    contract: &Contract,
    acks: &AckFrags,
    visible: &BTreeSet<ServerId>,
) -> Option<ServerId> {
    let groups = voter_groups(contract);
    let pool: BTreeSet<ServerId> = groups.iter().flat_map(|g| g.iter().copied()).collect();

    let mut best: Option<(StateTimestamp, ServerId)> = None;
    for server in &pool {
        let frag = acks
            .get(server)
            .filter(|frag| frag.state == AckState::SecondaryNeedPrimary)?;
        let timestamp = frag.version.map(|v| v.timestamp).unwrap_or_default();
        if best.map_or(true, |current| (timestamp, *server) > current) {
            best = Some((timestamp, *server));
        }
    }
    best.map(|(_, server)| server)
        .filter(|server| visible.contains(server))
}

fn replace_or_hand_over(
    primary: &Primary,
    contract: &Contract,
    config: &ShardConfig,
    acks: &AckFrags,
    visible: &BTreeSet<ServerId>,
) -> Option<Primary> {
    if !visible.contains(&primary.server) {
        return None;
    }
    let Some(target) = config.primary_replica.filter(|t| *t != primary.server) else {
        return Some(Primary::new(primary.server));
    };

    if primary.hand_over == Some(target) {
        // The primary acked a contract that already named the target; a majority
        // has stopped taking its writes, so it can step down.
        if has_state(acks, &primary.server, AckState::PrimaryReady) {
            return None;
        }
        return Some(primary.clone());
    }

    let target_ready = contract.voters.contains(&target)
        && visible.contains(&target)
        && has_state(acks, &target, AckState::SecondaryStreaming);
    Some(Primary {
        server: primary.server,
        hand_over: target_ready.then_some(target),
    })
}
