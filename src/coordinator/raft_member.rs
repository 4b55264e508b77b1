//! The seam between the coordinator and the table's Raft log
//!
//! The coordinator never looks inside the log. It reads committed snapshots,
//! waits on readiness flags, and proposes changes while holding the change lock.

use crate::common::{interruptible, Result};
use crate::contract::{Change, RaftConfig, TableRaftState};
use std::sync::Arc;
use tokio::sync::{oneshot, watch, Mutex, MutexGuard};

/// Latest committed state of the table's Raft log
#[derive(Debug, Clone)]
pub struct RaftSnapshot {
    pub log_index: u64,
    pub state: Arc<TableRaftState>,
    pub config: RaftConfig,
}

/// Handle on a proposed change
#[derive(Debug)]
pub struct ChangeToken {
    log_index: u64,
    committed: oneshot::Receiver<bool>,
}

impl ChangeToken {
    pub fn new(log_index: u64, committed: oneshot::Receiver<bool>) -> Self {
        Self {
            log_index,
            committed,
        }
    }

    /// Index the change will have once committed
    pub fn log_index(&self) -> u64 {
        self.log_index
    }

    /// Wait for the outcome: `true` once committed, `false` if the member lost
    /// leadership before that.
    pub async fn wait(self, shutdown: &mut watch::Receiver<bool>) -> Result<bool> {
        let outcome = interruptible(self.committed, shutdown).await?;
        Ok(outcome.unwrap_or(false))
    }
}

pub trait RaftMember: Send + Sync {
    fn latest_state(&self) -> RaftSnapshot;

    /// `true` while `propose_change` can succeed
    fn readiness_for_change(&self) -> watch::Receiver<bool>;

    /// `true` while `propose_config_change` can succeed
    fn readiness_for_config_change(&self) -> watch::Receiver<bool>;

    /// Serializes proposals from this process
    fn change_lock(&self) -> &Mutex<()>;

    /// `None` if the change was rejected outright, e.g. after losing leadership.
    fn propose_change(&self, lock: &MutexGuard<'_, ()>, change: Change) -> Option<ChangeToken>;

    fn propose_config_change(
        &self,
        lock: &MutexGuard<'_, ()>,
        config: RaftConfig,
    ) -> Option<ChangeToken>;

    /// Committed log index; changes whenever the snapshot does
    fn state_changes(&self) -> watch::Receiver<u64>;
}
