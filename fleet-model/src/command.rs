// SPDX-License-Identifier: MIT

use crate::error::ErrorClass;
use crate::mission::Mission;
use crate::worker::WorkerStatus;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A replicated state mutation. Every variant carries the timestamps it
/// needs so that apply is deterministic on every replica: the state
/// machine never reads a clock.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Command {
    CreateMission {
        mission: Mission,
    },
    /// Priority / payload edits on a live mission.
    UpdateMission {
        id: String,
        priority: Option<i32>,
        params: Option<HashMap<String, String>>,
        at_ms: u64,
    },
    AssignMission {
        id: String,
        workers: Vec<String>,
        at_ms: u64,
    },
    DispatchMission {
        id: String,
        at_ms: u64,
    },
    PauseMission {
        id: String,
        at_ms: u64,
    },
    ResumeMission {
        id: String,
        at_ms: u64,
    },
    CancelMission {
        id: String,
        at_ms: u64,
    },
    DeleteMission {
        id: String,
    },
    ReleaseWorkers {
        mission: String,
        at_ms: u64,
    },
    /// Failure disposition decided by the scheduler's retry policy before
    /// submission: either back to Pending with bookkeeping, or terminal.
    /// Failures that never retry (validation, auth) do not consume the
    /// attempt budget.
    FailMission {
        id: String,
        failure: ErrorClass,
        requeue: bool,
        count_attempt: bool,
        next_attempt_ms: u64,
        at_ms: u64,
    },
    RegisterWorker {
        id: String,
        capabilities: HashMap<String, f64>,
        at_ms: u64,
    },
    /// Logged heartbeat. Only used when liveness state actually changes
    /// (an Offline worker coming back); steady-state heartbeats stay soft.
    UpdateHeartbeat {
        id: String,
        at_ms: u64,
    },
    SetWorkerStatus {
        id: String,
        status: WorkerStatus,
        at_ms: u64,
    },
    UpdateMissionProgress {
        id: String,
        progress: f64,
        at_ms: u64,
    },
}

impl Command {
    /// The mission this command touches, if any. Used for log inspection
    /// and tests, not by apply itself.
    pub fn mission_id(&self) -> Option<&str> {
        match self {
            Command::CreateMission { mission } => Some(&mission.id),
            Command::UpdateMission { id, .. }
            | Command::AssignMission { id, .. }
            | Command::DispatchMission { id, .. }
            | Command::PauseMission { id, .. }
            | Command::ResumeMission { id, .. }
            | Command::CancelMission { id, .. }
            | Command::DeleteMission { id }
            | Command::FailMission { id, .. }
            | Command::UpdateMissionProgress { id, .. } => Some(id),
            Command::ReleaseWorkers { mission, .. } => Some(mission),
            _ => None,
        }
    }
}
