//! Contract coordinator: the per-table pump loops and admin calls
//!
//! Two tasks run per table. The contract pump recomputes contracts whenever
//! acks, connectivity or the committed state change; the config pump keeps
//! member ids and the Raft configuration in line with the contracts. Both
//! debounce, wait for Raft readiness, take the change lock, compute against the
//! latest committed snapshot, and propose.

use super::raft_member::RaftMember;
use super::watchable::WatchableMap;
use crate::common::utils::wait_until_true;
use crate::common::{init_tracing, interruptible, nap, CoordinatorSettings, Error, Result};
use crate::contract::{
    calculate_all_contracts, calculate_member_ids_and_raft_config, group_acks_by_contract,
    AckState, Change, ConnectivityMap, ContractAck, ContractId, NewContracts, ServerId,
    TableConfig, TableRaftState,
};
use futures_util::future::select_all;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Acks keyed by the replica that sent them and the contract they acknowledge
pub type AckMap = WatchableMap<(ServerId, ContractId), ContractAck>;

/// `(a, b)` present means `a` can reach `b`; `(a, a)` means the coordinator hears `a`
pub type ConnectionMap = WatchableMap<(ServerId, ServerId), ()>;

/// Counters across both pumps
#[derive(Debug, Default)]
pub struct PumpStats {
    passes: AtomicU64,
    proposals: AtomicU64,
    rejections: AtomicU64,
    diagnostics: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpStatsSnapshot {
    pub passes: u64,
    pub proposals: u64,
    pub rejections: u64,
    pub diagnostics: u64,
}

impl PumpStats {
    pub fn snapshot(&self) -> PumpStatsSnapshot {
        PumpStatsSnapshot {
            passes: self.passes.load(Ordering::Relaxed),
            proposals: self.proposals.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
            diagnostics: self.diagnostics.load(Ordering::Relaxed),
        }
    }
}

pub struct PumpHandles {
    pub contracts: JoinHandle<Result<()>>,
    pub config: JoinHandle<Result<()>>,
}

impl PumpHandles {
    /// Wait for both pumps to exit.
    pub async fn join(self) -> Result<()> {
        let contracts = self.contracts.await;
        let config = self.config.await;
        for outcome in [contracts, config] {
            outcome.map_err(|e| Error::Internal(format!("pump task failed: {}", e)))??;
        }
        Ok(())
    }
}

enum PassOutcome {
    /// Proposed or had nothing to propose; sleep until something changes
    Settled,
    /// The Raft member refused the proposal; try again
    Rejected,
}

pub struct ContractCoordinator {
    raft: Arc<dyn RaftMember>,
    acks: Arc<AckMap>,
    connections: Arc<ConnectionMap>,
    settings: CoordinatorSettings,
    stats: PumpStats,
}

impl ContractCoordinator {
    pub fn new(
        raft: Arc<dyn RaftMember>,
        acks: Arc<AckMap>,
        connections: Arc<ConnectionMap>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            raft,
            acks,
            connections,
            settings,
            stats: PumpStats::default(),
        }
    }

    pub fn stats(&self) -> PumpStatsSnapshot {
        self.stats.snapshot()
    }

    /// Start both pumps. They run until `shutdown` turns `true` (or its sender
    /// is dropped) and then exit with `Ok(())`.
    ///
    /// Installs the global tracing subscriber at `settings.log_level` unless
    /// one is already set.
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> PumpHandles {
        init_tracing(&self.settings.log_level);
        let contracts = {
            let this = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { until_shutdown(this.pump_contracts(shutdown).await) })
        };
        let config = {
            let this = self.clone();
            tokio::spawn(async move { until_shutdown(this.pump_config(shutdown).await) })
        };
        PumpHandles { contracts, config }
    }

    async fn pump_contracts(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut acks_rx = self.acks.subscribe();
        let mut connections_rx = self.connections.subscribe();
        let mut state_rx = self.raft.state_changes();
        let mut ready_rx = self.raft.readiness_for_change();
        loop {
            nap(self.settings.pump_debounce(), &mut shutdown).await?;
            wait_until_true(&mut ready_rx, &mut shutdown).await?;

            let outcome = {
                let guard = interruptible(self.raft.change_lock().lock(), &mut shutdown).await?;
                // Everything up to here is reflected in this pass.
                acks_rx.borrow_and_update();
                connections_rx.borrow_and_update();
                state_rx.borrow_and_update();

                let snapshot = self.raft.latest_state();
                let acks = group_acks_by_contract(&self.acks.snapshot());
                let connectivity = ConnectivityMap::from_links(self.connections.keys());
                let calc = calculate_all_contracts(&snapshot.state, &acks, &connectivity);
                self.stats.passes.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .diagnostics
                    .fetch_add(calc.diagnostics.len() as u64, Ordering::Relaxed);
                tracing::debug!(
                    log_index = snapshot.log_index,
                    remove = calc.changes.remove_contracts.len(),
                    add = calc.changes.add_contracts.len(),
                    diagnostics = calc.diagnostics.len(),
                    "contract pass"
                );
                if calc.diagnostics.iter().any(Error::is_invariant_violation) {
                    tracing::error!(
                        count = calc.diagnostics.len(),
                        "contract pass recovered from invariant violations"
                    );
                }

                if calc.changes.is_empty() {
                    PassOutcome::Settled
                } else {
                    self.propose(&guard, Change::NewContracts(calc.changes))
                }
            };

            match outcome {
                PassOutcome::Settled => {
                    wait_for_any(
                        [&mut acks_rx, &mut connections_rx, &mut state_rx],
                        &mut shutdown,
                    )
                    .await?;
                }
                PassOutcome::Rejected => nap(self.settings.retry_backoff(), &mut shutdown).await?,
            }
        }
    }

    async fn pump_config(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut state_rx = self.raft.state_changes();
        let mut ready_rx = self.raft.readiness_for_change();
        let mut config_ready_rx = self.raft.readiness_for_config_change();
        loop {
            nap(self.settings.pump_debounce(), &mut shutdown).await?;
            wait_until_true(&mut ready_rx, &mut shutdown).await?;
            wait_until_true(&mut config_ready_rx, &mut shutdown).await?;

            let outcome = {
                let guard = interruptible(self.raft.change_lock().lock(), &mut shutdown).await?;
                state_rx.borrow_and_update();
                let snapshot = self.raft.latest_state();
                let calc = calculate_member_ids_and_raft_config(&snapshot.state);
                self.stats.passes.fetch_add(1, Ordering::Relaxed);

                if let Some(change) = calc.member_ids_change() {
                    self.propose(&guard, change)
                } else if calc.raft_config != snapshot.config {
                    match self.raft.propose_config_change(&guard, calc.raft_config) {
                        Some(token) => {
                            self.stats.proposals.fetch_add(1, Ordering::Relaxed);
                            tracing::info!(log_index = token.log_index(), "proposed raft config");
                            PassOutcome::Settled
                        }
                        None => {
                            self.stats.rejections.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!("raft config change rejected");
                            PassOutcome::Rejected
                        }
                    }
                } else {
                    PassOutcome::Settled
                }
            };

            match outcome {
                PassOutcome::Settled => wait_for_any([&mut state_rx], &mut shutdown).await?,
                PassOutcome::Rejected => nap(self.settings.retry_backoff(), &mut shutdown).await?,
            }
        }
    }

    fn propose(&self, guard: &tokio::sync::MutexGuard<'_, ()>, change: Change) -> PassOutcome {
        let kind = change.kind();
        match self.raft.propose_change(guard, change) {
            Some(token) => {
                self.stats.proposals.fetch_add(1, Ordering::Relaxed);
                tracing::info!(kind, log_index = token.log_index(), "proposed change");
                PassOutcome::Settled
            }
            None => {
                self.stats.rejections.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(kind, "change rejected");
                PassOutcome::Rejected
            }
        }
    }

    /// Replace the table's config.
    ///
    /// Returns the log index the change committed at, or `None` if leadership
    /// was lost before the commit. Fails with `NotLeader` if this member could
    /// not propose at all.
    pub async fn change_config(
        &self,
        new_config: TableConfig,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<u64>> {
        new_config.validate()?;
        let token = {
            let guard = interruptible(self.raft.change_lock().lock(), shutdown).await?;
            self.raft.propose_change(&guard, Change::SetTableConfig { new_config })
        };
        let Some(token) = token else {
            tracing::warn!("config change rejected: not leader");
            return Err(Error::NotLeader);
        };
        let log_index = token.log_index();
        if token.wait(shutdown).await? {
            tracing::info!(log_index, "table config changed");
            Ok(Some(log_index))
        } else {
            tracing::warn!(log_index, "config change lost with leadership");
            Ok(None)
        }
    }

    /// Are all contracts exactly what the config asks for, with every replica
    /// caught up?
    ///
    /// Confirms leadership with an empty proposal before trusting the answer.
    pub async fn check_all_replicas_ready(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<bool> {
        let token = {
            let guard = interruptible(self.raft.change_lock().lock(), shutdown).await?;
            let snapshot = self.raft.latest_state();
            if !all_replicas_ready(&snapshot.state, &self.acks.snapshot()) {
                return Ok(false);
            }
            self.raft
                .propose_change(&guard, Change::NewContracts(NewContracts::default()))
        };
        match token {
            Some(token) => token.wait(shutdown).await,
            None => Ok(false),
        }
    }
}

fn until_shutdown(outcome: Result<()>) -> Result<()> {
    match outcome {
        Err(Error::Interrupted) => Ok(()),
        other => other,
    }
}

async fn wait_for_any<const N: usize>(
    receivers: [&mut watch::Receiver<u64>; N],
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()> {
    let changes = receivers.into_iter().map(|rx| Box::pin(rx.changed()));
    let (changed, _, _) = interruptible(select_all(changes), shutdown).await?;
    // Senders live as long as the coordinator's collaborators do.
    changed.map_err(|_| Error::Interrupted)
}

/// Read-only readiness check against one snapshot.
pub fn all_replicas_ready(
    state: &TableRaftState,
    acks: &BTreeMap<(ServerId, ContractId), ContractAck>,
) -> bool {
    let scheme = &state.config.shard_scheme;
    state.contracts.iter().all(|(contract_id, (region, contract))| {
        let Some(shard_index) = (0..scheme.num_shards())
            .find(|index| scheme.get_shard_range(*index) == region.inner)
        else {
            return false;
        };
        let shard = &state.config.shards[shard_index];
        let primary_matches = match (&contract.primary, shard.primary_replica) {
            (Some(primary), wanted) => {
                primary.hand_over.is_none() && wanted.map_or(true, |w| w == primary.server)
            }
            (None, _) => false,
        };
        let layout_matches = contract.replicas == shard.all_replicas
            && contract.voters == shard.voting_replicas()
            && contract.temp_voters.is_none()
            && primary_matches;
        layout_matches
            && contract.replicas.iter().all(|server| {
                let wanted = if contract.is_primary(server) {
                    AckState::PrimaryReady
                } else {
                    AckState::SecondaryStreaming
                };
                acks.get(&(*server, *contract_id))
                    .is_some_and(|ack| ack.state == wanted)
            })
    })
}
