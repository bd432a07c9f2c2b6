// SPDX-License-Identifier: MIT

use fleet_model::{FleetError, GeoPoint, Worker, WorkerStatus};
use std::collections::HashMap;

/// Capability predicates applied before assignment scoring.
#[derive(Debug, Clone, Default)]
pub struct WorkerFilter {
    pub min_battery: Option<f64>,
    pub required_tags: Vec<String>,
    /// Capability name -> minimum value, e.g. max_alt >= 120.
    pub min_capabilities: HashMap<String, f64>,
}

impl WorkerFilter {
    pub fn matches(&self, worker: &Worker) -> bool {
        if let Some(floor) = self.min_battery {
            if worker.battery_pct < floor {
                return false;
            }
        }
        for tag in &self.required_tags {
            if !worker.has_tag(tag) {
                return false;
            }
        }
        for (name, min) in &self.min_capabilities {
            match worker.capability(name) {
                Some(value) if value >= *min => {}
                _ => return false,
            }
        }
        true
    }
}

/// Worker registry and capacity accounting. Status transitions happen
/// on the apply path; heartbeat timestamps and telemetry-derived fields
/// are soft state refreshed locally.
#[derive(Default)]
pub struct ResourceManager {
    workers: HashMap<String, Worker>,
    /// worker id -> mission id holding it, from assignment until
    /// release. Keeps a window between Assigned and Running from
    /// double-booking a worker.
    reservations: HashMap<String, String>,
}

impl ResourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: String, capabilities: HashMap<String, f64>, now_ms: u64) {
        match self.workers.get_mut(&id) {
            Some(existing) => {
                existing.capabilities = capabilities;
                existing.last_heartbeat_ms = now_ms;
                if !existing.status.is_online() {
                    existing.status = WorkerStatus::Idle;
                    existing.current_mission = None;
                }
            }
            None => {
                self.workers.insert(id.clone(), Worker::register(id, capabilities, now_ms));
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&Worker> {
        self.workers.get(id)
    }

    pub fn list(&self) -> Vec<Worker> {
        let mut out: Vec<Worker> = self.workers.values().cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Logged heartbeat: refreshes liveness and resurrects an Offline
    /// worker.
    pub fn heartbeat(&mut self, id: &str, now_ms: u64) -> Result<(), FleetError> {
        let worker = self
            .workers
            .get_mut(id)
            .ok_or_else(|| FleetError::rejected(format!("worker {} not registered", id)))?;
        if now_ms > worker.last_heartbeat_ms {
            worker.last_heartbeat_ms = now_ms;
        }
        if !worker.status.is_online() {
            worker.status = WorkerStatus::Idle;
            worker.current_mission = None;
        }
        Ok(())
    }

    /// Soft-state heartbeat from the uplink: refreshes the timestamp and
    /// telemetry-derived fields without the log. Returns false when the
    /// worker is unknown or Offline, in which case the caller must go
    /// through a logged command instead.
    pub fn soft_heartbeat(
        &mut self,
        id: &str,
        now_ms: u64,
        battery_pct: Option<f64>,
        position: Option<GeoPoint>,
    ) -> bool {
        let Some(worker) = self.workers.get_mut(id) else {
            return false;
        };
        if !worker.status.is_online() {
            return false;
        }
        if now_ms > worker.last_heartbeat_ms {
            worker.last_heartbeat_ms = now_ms;
        }
        if let Some(b) = battery_pct {
            worker.battery_pct = b;
            worker.capabilities.insert("battery".into(), b);
        }
        if let Some(p) = position {
            worker.position = Some(p);
        }
        true
    }

    /// Status transition from the log. Returns the mission the worker
    /// was busy on when it dropped Offline, so the caller can raise a
    /// WorkerLost event.
    pub fn set_status(
        &mut self,
        id: &str,
        status: WorkerStatus,
        now_ms: u64,
    ) -> Result<Option<String>, FleetError> {
        let worker = self
            .workers
            .get_mut(id)
            .ok_or_else(|| FleetError::rejected(format!("worker {} not registered", id)))?;

        let lost_mission = if status == WorkerStatus::Offline || status == WorkerStatus::Error {
            worker.current_mission.take()
        } else {
            None
        };
        worker.status = status;
        if status.is_online() && now_ms > worker.last_heartbeat_ms {
            worker.last_heartbeat_ms = now_ms;
        }
        if status == WorkerStatus::Offline || status == WorkerStatus::Error {
            self.reservations.remove(id);
        }
        Ok(lost_mission)
    }

    /// Hold workers for a mission between assignment and dispatch.
    pub fn reserve(&mut self, mission: &str, worker_ids: &[String]) -> Result<(), FleetError> {
        for id in worker_ids {
            let worker = self
                .workers
                .get(id)
                .ok_or_else(|| FleetError::rejected(format!("worker {} not registered", id)))?;
            if !worker.is_available() {
                return Err(FleetError::rejected(format!("worker {} not available", id)));
            }
            if let Some(holder) = self.reservations.get(id) {
                if holder != mission {
                    return Err(FleetError::rejected(format!(
                        "worker {} already reserved by {}",
                        id, holder
                    )));
                }
            }
        }
        for id in worker_ids {
            self.reservations.insert(id.clone(), mission.to_string());
        }
        Ok(())
    }

    /// Mark reserved workers Busy on dispatch.
    pub fn occupy(&mut self, mission: &str, worker_ids: &[String]) -> Result<(), FleetError> {
        for id in worker_ids {
            let worker = self
                .workers
                .get_mut(id)
                .ok_or_else(|| FleetError::rejected(format!("worker {} not registered", id)))?;
            worker.status = WorkerStatus::Busy;
            worker.current_mission = Some(mission.to_string());
        }
        Ok(())
    }

    /// Release every worker held by `mission`, Busy back to Idle.
    pub fn release_mission(&mut self, mission: &str) {
        self.reservations.retain(|_, holder| holder != mission);
        for worker in self.workers.values_mut() {
            if worker.current_mission.as_deref() == Some(mission) {
                worker.current_mission = None;
                if worker.status == WorkerStatus::Busy {
                    worker.status = WorkerStatus::Idle;
                }
            }
        }
    }

    /// Idle, unreserved workers passing the filter, id-ordered.
    pub fn available(&self, filter: &WorkerFilter) -> Vec<Worker> {
        let mut out: Vec<Worker> = self
            .workers
            .values()
            .filter(|w| w.is_available())
            .filter(|w| !self.reservations.contains_key(&w.id))
            .filter(|w| filter.matches(w))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Online workers whose heartbeat is older than the threshold.
    pub fn stale(&self, now_ms: u64, offline_threshold_ms: u64) -> Vec<String> {
        let mut out: Vec<String> = self
            .workers
            .values()
            .filter(|w| w.status.is_online())
            .filter(|w| now_ms.saturating_sub(w.last_heartbeat_ms) > offline_threshold_ms)
            .map(|w| w.id.clone())
            .collect();
        out.sort();
        out
    }

    pub fn all(&self) -> (Vec<Worker>, Vec<(String, String)>) {
        let mut workers = self.list();
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        let mut reservations: Vec<(String, String)> = self
            .reservations
            .iter()
            .map(|(w, m)| (w.clone(), m.clone()))
            .collect();
        reservations.sort();
        (workers, reservations)
    }

    pub fn replace_all(&mut self, workers: Vec<Worker>, reservations: Vec<(String, String)>) {
        self.workers = workers.into_iter().map(|w| (w.id.clone(), w)).collect();
        self.reservations = reservations.into_iter().collect();
    }
}
