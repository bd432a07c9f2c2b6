// SPDX-License-Identifier: MIT

use crate::error::ErrorClass;
use crate::geo::GeoPoint;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissionKind {
    SingleWorker,
    MultiWorker,
    Cluster,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MissionState {
    Pending,
    Assigned,
    Running,
    Paused,
    Succeeded,
    Failed,
    Cancelled,
}

impl MissionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MissionState::Succeeded | MissionState::Failed | MissionState::Cancelled
        )
    }

    /// The mission lifecycle graph. Cancel edges are handled separately
    /// because they are accepted from every non-terminal state.
    pub fn can_transition(&self, to: MissionState) -> bool {
        use MissionState::*;
        if to == Cancelled {
            return !self.is_terminal();
        }
        matches!(
            (self, to),
            (Pending, Assigned)
                | (Assigned, Running)
                | (Assigned, Pending)
                | (Running, Succeeded)
                | (Running, Paused)
                | (Running, Pending)
                | (Running, Failed)
                | (Paused, Running)
                | (Paused, Pending)
                | (Paused, Failed)
                | (Pending, Failed)
        )
    }
}

/// The opaque work description carried by a mission. `params` is owned by
/// the worker-side interpretation; the control plane only routes it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct MissionPayload {
    pub task: String,
    pub params: HashMap<String, String>,
    pub area: Vec<GeoPoint>,
    pub waypoints: Vec<GeoPoint>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Mission {
    pub id: String,
    pub kind: MissionKind,
    pub assigned: Vec<String>,
    pub payload: MissionPayload,
    pub state: MissionState,
    pub priority: i32,
    pub progress: f64,
    pub created_ms: u64,
    pub updated_ms: u64,
    pub started_ms: Option<u64>,
    pub completed_ms: Option<u64>,
    pub attempts: u32,
    pub next_attempt_ms: u64,
    pub last_failure: Option<ErrorClass>,
    /// Bumped on every committed mutation. Conflict guard for
    /// cross-region sync.
    pub version: u64,
    pub origin_node: u64,
}

impl Mission {
    pub fn new(
        id: String,
        kind: MissionKind,
        payload: MissionPayload,
        priority: i32,
        origin_node: u64,
        now_ms: u64,
    ) -> Self {
        Self {
            id,
            kind,
            assigned: Vec::new(),
            payload,
            state: MissionState::Pending,
            priority,
            progress: 0.0,
            created_ms: now_ms,
            updated_ms: now_ms,
            started_ms: None,
            completed_ms: None,
            attempts: 0,
            next_attempt_ms: 0,
            last_failure: None,
            version: 1,
            origin_node,
        }
    }

    /// How many workers this mission wants. Multi-worker count rides in
    /// `params["worker_count"]`; cluster missions take every candidate
    /// the assigner can bind.
    pub fn requested_workers(&self) -> usize {
        match self.kind {
            MissionKind::SingleWorker => 1,
            MissionKind::MultiWorker | MissionKind::Cluster => self
                .payload
                .params
                .get("worker_count")
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(2)
                .max(1),
        }
    }

    pub fn touch(&mut self, now_ms: u64) {
        self.updated_ms = now_ms;
        self.version += 1;
    }
}
