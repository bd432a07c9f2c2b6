// SPDX-License-Identifier: MIT

use crate::geo::GeoPoint;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Online,
    Offline,
    Idle,
    Busy,
    Error,
}

impl WorkerStatus {
    /// Idle and Busy are refinements of Online.
    pub fn is_online(&self) -> bool {
        matches!(self, WorkerStatus::Online | WorkerStatus::Idle | WorkerStatus::Busy)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Worker {
    pub id: String,
    pub status: WorkerStatus,
    pub last_heartbeat_ms: u64,
    pub current_mission: Option<String>,
    /// Capability name -> value. Numeric capabilities (max_alt, battery)
    /// carry their value; tag capabilities (payload kinds) carry 1.0.
    pub capabilities: HashMap<String, f64>,
    pub position: Option<GeoPoint>,
    pub battery_pct: f64,
}

impl Worker {
    pub fn register(id: String, capabilities: HashMap<String, f64>, now_ms: u64) -> Self {
        let battery_pct = capabilities.get("battery").copied().unwrap_or(100.0);
        Self {
            id,
            status: WorkerStatus::Idle,
            last_heartbeat_ms: now_ms,
            current_mission: None,
            capabilities,
            position: None,
            battery_pct,
        }
    }

    pub fn capability(&self, name: &str) -> Option<f64> {
        self.capabilities.get(name).copied()
    }

    pub fn has_tag(&self, name: &str) -> bool {
        self.capabilities.get(name).copied().unwrap_or(0.0) > 0.0
    }

    pub fn is_available(&self) -> bool {
        self.status == WorkerStatus::Idle
    }
}
