//! # tablecoord
//!
//! Contract coordination for a sharded, replicated table:
//! - Per-region contracts naming replicas, voters and the primary
//! - Voter changes staged through temporary voter sets
//! - Primary election from branch ancestry, and two-phase hand-over
//! - Branch history bookkeeping with garbage collection
//! - Debounced pump loops proposing changes through Raft
//!
//! ## Architecture
//!
//! ```text
//!   executors ──acks──▶ ┌──────────────────────────────┐
//!   (one per replica)   │      ContractCoordinator     │
//!   connectivity ─────▶ │  contract pump │ config pump │
//!                       └───────┬──────────────┬───────┘
//!                               │ propose      │ propose
//!                       ┌───────▼──────────────▼───────┐
//!                       │      RaftMember (table)      │
//!                       │  committed TableRaftState    │
//!                       └───────────────┬──────────────┘
//!                                       │ contracts
//!                                       ▼
//!                                   executors
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use tablecoord::contract::{make_new_table_raft_state, RaftConfig, ServerNames, TableConfig};
//! use tablecoord::coordinator::{AckMap, ConnectionMap, ContractCoordinator, LocalRaftMember};
//! use tablecoord::CoordinatorSettings;
//!
//! # async fn run(config: TableConfig) -> tablecoord::Result<()> {
//! let raft = Arc::new(LocalRaftMember::new(
//!     make_new_table_raft_state(config, ServerNames::new())?,
//!     RaftConfig::default(),
//! ));
//! raft.become_leader();
//!
//! let acks = Arc::new(AckMap::new());
//! let connections = Arc::new(ConnectionMap::new());
//! let settings = CoordinatorSettings::load(None)?;
//! let coordinator = Arc::new(ContractCoordinator::new(raft, acks, connections, settings));
//!
//! let (stop, shutdown) = tokio::sync::watch::channel(false);
//! let pumps = coordinator.spawn(shutdown);
//! // ... executors write acks, admin calls change_config ...
//! stop.send_replace(true);
//! pumps.join().await
//! # }
//! ```

pub mod common;
pub mod contract;
pub mod coordinator;
pub mod region;

// Re-export commonly used types
pub use common::{CoordinatorSettings, Error, Result};
pub use coordinator::ContractCoordinator;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
