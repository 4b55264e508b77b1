//! Error types for tablecoord

use crate::contract::BranchId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // === Branch history / invariant errors ===
    #[error("Incomplete branch history: branch {0} is not known")]
    IncompleteBranchHistory(BranchId),

    #[error("Branch {branch} does not cover the requested region {region}")]
    BranchRegionMismatch { branch: BranchId, region: String },

    #[error("Branch history contains a cycle through {0}")]
    BranchCycle(BranchId),

    #[error("Invariant violated: {0}")]
    Invariant(String),

    // === Raft errors ===
    #[error("Not leader: the change was not applied, retry")]
    NotLeader,

    #[error("Raft error: {0}")]
    Raft(String),

    // === Config errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Wire errors ===
    #[error("Corrupted record: {0}")]
    Corrupted(String),

    #[error("Checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("Unsupported record version {0}")]
    UnsupportedVersion(u8),

    // === Cancellation ===
    #[error("Interrupted")]
    Interrupted,

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::NotLeader | Error::Raft(_))
    }

    /// Errors that mean an executor or an earlier pass broke a protocol invariant.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            Error::IncompleteBranchHistory(_)
                | Error::BranchRegionMismatch { .. }
                | Error::BranchCycle(_)
                | Error::Invariant(_)
        )
    }
}

// Implement From for common error types
impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Corrupted(e.to_string())
    }
}
