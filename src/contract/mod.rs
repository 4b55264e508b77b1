//! Contract data model and the calculations over it
//!
//! Everything here is pure: given a committed `TableRaftState`, the replicas'
//! acks and a connectivity snapshot, compute the next change to propose.

pub mod all_contracts;
pub mod branch;
pub mod branch_gc;
pub mod calculate;
pub mod connectivity;
pub mod fragments;
pub mod ids;
pub mod member_ids;
pub mod raft_state;
pub mod types;
pub mod wire;

pub use all_contracts::{
    calculate_all_contracts, group_acks_by_contract, AcksByContract, CalculatedContracts,
};
pub use branch::{
    version_find_branch_common, BranchBirthCertificate, BranchHistory, BranchHistoryCombiner,
    BranchHistoryReader,
};
pub use calculate::calculate_contract;
pub use connectivity::ConnectivityMap;
pub use fragments::{break_ack_into_fragments, break_ack_into_fragments_recovering};
pub use ids::{BranchId, ContractId, RaftMemberId, ServerId, StateTimestamp, Version};
pub use member_ids::{calculate_member_ids_and_raft_config, MemberIdsAndConfig, RaftConfig};
pub use raft_state::{
    make_new_table_raft_state, Change, NewContracts, ServerNames, ShardConfig, ShardScheme,
    TableConfig, TableRaftState,
};
pub use types::{AckState, Contract, ContractAck, ContractAckFrag, ContractRole, Primary};
