//! Single-process Raft member
//!
//! Tracks role, term and log the way a replicated node does, but commits on its
//! own: an appended entry commits at once, or on `commit_pending` when
//! auto-commit is off. Stepping down drops the uncommitted tail and fails its
//! proposals. Log entries are kept as framed wire records so a log can be
//! exported and replayed.

use super::raft_member::{ChangeToken, RaftMember, RaftSnapshot};
use crate::common::Result;
use crate::contract::{wire, Change, RaftConfig, TableRaftState};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard, PoisonError};
use tokio::sync::{oneshot, watch, Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Follower,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogPayload {
    Change(Change),
    Config(RaftConfig),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub payload: LogPayload,
}

struct Pending {
    payload: LogPayload,
    committed: oneshot::Sender<bool>,
}

struct Inner {
    role: RaftRole,
    term: u64,
    /// Encoded `LogEntry` records; entry `i` has index `i + 1`
    log: Vec<Vec<u8>>,
    commit_index: u64,
    state: Arc<TableRaftState>,
    config: RaftConfig,
    /// Appended but not committed, in log order
    pending: Vec<Pending>,
    auto_commit: bool,
}

pub struct LocalRaftMember {
    inner: StdMutex<Inner>,
    change_lock: Mutex<()>,
    ready: watch::Sender<bool>,
    committed: watch::Sender<u64>,
}

impl LocalRaftMember {
    /// A follower holding `state` as its committed state at index 0
    pub fn new(state: TableRaftState, config: RaftConfig) -> Self {
        let (ready, _) = watch::channel(false);
        let (committed, _) = watch::channel(0);
        Self {
            inner: StdMutex::new(Inner {
                role: RaftRole::Follower,
                term: 0,
                log: Vec::new(),
                commit_index: 0,
                state: Arc::new(state),
                config,
                pending: Vec::new(),
                auto_commit: true,
            }),
            change_lock: Mutex::new(()),
            ready,
            committed,
        }
    }

    /// Rebuild a follower from `initial` plus an exported log.
    pub fn replay(initial: TableRaftState, config: RaftConfig, log: &[u8]) -> Result<Self> {
        let member = Self::new(initial, config);
        {
            let mut inner = member.lock_inner();
            let mut reader = log;
            while let Some(entry) = wire::read_record::<LogEntry, _>(&mut reader)? {
                inner.term = inner.term.max(entry.term);
                inner.log.push(wire::encode(&entry)?);
                apply_payload(&mut inner, &entry.payload);
                inner.commit_index = entry.index;
            }
            member.committed.send_replace(inner.commit_index);
        }
        Ok(member)
    }

    fn lock_inner(&self) -> StdMutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_leader(&self) -> bool {
        self.lock_inner().role == RaftRole::Leader
    }

    pub fn get_role(&self) -> RaftRole {
        self.lock_inner().role
    }

    pub fn get_term(&self) -> u64 {
        self.lock_inner().term
    }

    pub fn commit_index(&self) -> u64 {
        self.lock_inner().commit_index
    }

    /// Index of the last appended entry, committed or not
    pub fn last_log_index(&self) -> u64 {
        self.lock_inner().log.len() as u64
    }

    /// Start a new term as leader.
    pub fn become_leader(&self) {
        let mut inner = self.lock_inner();
        inner.role = RaftRole::Leader;
        inner.term += 1;
        tracing::info!(term = inner.term, "became leader");
        self.ready.send_replace(true);
    }

    /// Step down to follower, discarding every uncommitted entry.
    pub fn step_down(&self) {
        let mut inner = self.lock_inner();
        inner.role = RaftRole::Follower;
        let commit_index = inner.commit_index as usize;
        inner.log.truncate(commit_index);
        let lost = std::mem::take(&mut inner.pending);
        if !lost.is_empty() {
            tracing::warn!(
                term = inner.term,
                lost = lost.len(),
                "stepped down with uncommitted entries"
            );
        }
        for pending in lost {
            let _ = pending.committed.send(false);
        }
        self.ready.send_replace(false);
    }

    /// With auto-commit off, entries wait for `commit_pending`.
    pub fn set_auto_commit(&self, auto_commit: bool) {
        self.lock_inner().auto_commit = auto_commit;
    }

    /// Commit every appended entry.
    pub fn commit_pending(&self) {
        let mut inner = self.lock_inner();
        self.commit_all(&mut inner);
    }

    fn commit_all(&self, inner: &mut Inner) {
        let pending = std::mem::take(&mut inner.pending);
        if pending.is_empty() {
            return;
        }
        for entry in pending {
            apply_payload(inner, &entry.payload);
            inner.commit_index += 1;
            let _ = entry.committed.send(true);
        }
        tracing::debug!(commit_index = inner.commit_index, "committed");
        self.committed.send_replace(inner.commit_index);
    }

    fn append(&self, payload: LogPayload) -> Option<ChangeToken> {
        let mut inner = self.lock_inner();
        if inner.role != RaftRole::Leader {
            return None;
        }
        let index = inner.log.len() as u64 + 1;
        let entry = LogEntry {
            term: inner.term,
            index,
            payload,
        };
        let bytes = match wire::encode(&entry) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode log entry");
                return None;
            }
        };
        inner.log.push(bytes);
        let (tx, rx) = oneshot::channel();
        inner.pending.push(Pending {
            payload: entry.payload,
            committed: tx,
        });
        if inner.auto_commit {
            self.commit_all(&mut inner);
        }
        Some(ChangeToken::new(index, rx))
    }

    /// The committed part of the log, as concatenated wire records
    pub fn export_log(&self) -> Vec<u8> {
        let inner = self.lock_inner();
        inner.log[..inner.commit_index as usize].concat()
    }
}

fn apply_payload(inner: &mut Inner, payload: &LogPayload) {
    match payload {
        LogPayload::Change(change) => Arc::make_mut(&mut inner.state).apply_change(change),
        LogPayload::Config(config) => inner.config = config.clone(),
    }
}

impl RaftMember for LocalRaftMember {
    fn latest_state(&self) -> RaftSnapshot {
        let inner = self.lock_inner();
        RaftSnapshot {
            log_index: inner.commit_index,
            state: inner.state.clone(),
            config: inner.config.clone(),
        }
    }

    fn readiness_for_change(&self) -> watch::Receiver<bool> {
        self.ready.subscribe()
    }

    fn readiness_for_config_change(&self) -> watch::Receiver<bool> {
        self.ready.subscribe()
    }

    fn change_lock(&self) -> &Mutex<()> {
        &self.change_lock
    }

    fn propose_change(&self, _lock: &MutexGuard<'_, ()>, change: Change) -> Option<ChangeToken> {
        self.append(LogPayload::Change(change))
    }

    fn propose_config_change(
        &self,
        _lock: &MutexGuard<'_, ()>,
        config: RaftConfig,
    ) -> Option<ChangeToken> {
        self.append(LogPayload::Config(config))
    }

    fn state_changes(&self) -> watch::Receiver<u64> {
        self.committed.subscribe()
    }
}
