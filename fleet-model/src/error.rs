// SPDX-License-Identifier: MIT

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a failure, by kind rather than by source type.
/// Transport failures and worker-reported failures both map into this
/// so the retry policy has a single vocabulary.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Network,
    Timeout,
    Server,
    Client(u16),
    RateLimited,
    Auth,
    Validation,
    Unknown,
}

impl ErrorClass {
    /// Whether a failure of this class may be retried at all.
    /// 408 (request timeout) and 429 (too many requests) are the only
    /// retriable client statuses.
    pub fn is_retriable(&self) -> bool {
        match self {
            ErrorClass::Network | ErrorClass::Timeout | ErrorClass::Server => true,
            ErrorClass::RateLimited => true,
            ErrorClass::Client(status) => matches!(status, 408 | 429),
            ErrorClass::Auth | ErrorClass::Validation => false,
            ErrorClass::Unknown => true,
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Client(status) => write!(f, "Client({})", status),
            other => write!(f, "{:?}", other),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FleetError {
    #[error("not leader (hint: {hint:?})")]
    NotLeader { hint: Option<String> },

    #[error("state machine rejected: {reason}")]
    StateMachineRejected { reason: String },

    #[error("no feasible assignment")]
    NoFeasibleAssignment,

    #[error("peer {0} unreachable")]
    PeerUnreachable(String),

    #[error("peer {0} timed out")]
    PeerTimeout(String),

    #[error("log conflict at index {index}")]
    LogConflict { index: u64 },

    #[error("version conflict on {id}: local v{local}, remote v{remote}")]
    VersionConflict { id: String, local: u64, remote: u64 },

    #[error("worker lost while busy on mission {mission}")]
    WorkerLost { mission: String },

    #[error("worker {worker} outbound queue full")]
    Backlogged { worker: String },

    #[error("shutting down")]
    ShuttingDown,

    #[error("fatal: {reason}")]
    Fatal { reason: String },
}

impl FleetError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        FleetError::StateMachineRejected { reason: reason.into() }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        FleetError::Fatal { reason: reason.into() }
    }
}
