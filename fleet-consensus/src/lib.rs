// SPDX-License-Identifier: MIT

mod raft;
mod snapshot;
mod wal;

pub use raft::{RaftConfig, RaftMessage, RaftNode, RaftStatus, Role, StateMachine};
pub use snapshot::{Snapshot, SnapshotStore};
pub use wal::{HardState, LogEntry, Wal};
