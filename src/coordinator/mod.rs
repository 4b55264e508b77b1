//! Coordinator runtime: the Raft seam, watchable inputs and the pump loops
//!
//! The coordinator reads acks and connectivity from watchable maps written by
//! remote executors, and writes only through Raft proposals.

pub mod raft_member;
pub mod raft_node;
pub mod server;
pub mod watchable;

pub use raft_member::{ChangeToken, RaftMember, RaftSnapshot};
pub use raft_node::{LocalRaftMember, RaftRole};
pub use server::{
    all_replicas_ready, AckMap, ConnectionMap, ContractCoordinator, PumpHandles, PumpStatsSnapshot,
};
pub use watchable::WatchableMap;
