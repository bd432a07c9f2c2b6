// SPDX-License-Identifier: MIT

use crate::resource::{ResourceManager, WorkerFilter};
use crate::store::MissionStore;
use fleet_consensus::StateMachine;
use fleet_model::{
    Command, FleetError, GeoPoint, Mission, MissionState, Worker, WorkerStatus,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// State-change notifications for edge subscribers and the scheduler.
/// The channel is lossy for slow consumers; authoritative state is
/// always re-readable from the stores.
#[derive(Debug, Clone, PartialEq)]
pub enum FleetEvent {
    MissionCreated { id: String },
    MissionAssigned { id: String, workers: Vec<String> },
    MissionStateChanged { id: String, state: MissionState },
    MissionProgress { id: String, progress: f64 },
    MissionDeleted { id: String },
    WorkerRegistered { id: String },
    WorkerOffline { id: String },
    WorkerLost { worker: String, mission: String },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FleetSnapshot {
    pub missions: Vec<Mission>,
    pub workers: Vec<Worker>,
    pub reservations: Vec<(String, String)>,
}

/// The single writer of MissionStore and ResourceManager. Commands come
/// off the apply channel in strict index order; two replicas applying
/// the same prefix land in the same state. Reads from other tasks take
/// a brief shared lock and clone out.
pub struct DataSynchronizer {
    node_id: u64,
    missions: RwLock<MissionStore>,
    resources: RwLock<ResourceManager>,
    events: broadcast::Sender<FleetEvent>,
    last_applied: AtomicU64,
}

impl DataSynchronizer {
    pub fn new(node_id: u64) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            node_id,
            missions: RwLock::new(MissionStore::new()),
            resources: RwLock::new(ResourceManager::new()),
            events,
            last_applied: AtomicU64::new(0),
        }
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.events.subscribe()
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied.load(Ordering::Acquire)
    }

    fn emit(&self, event: FleetEvent) {
        // No receivers is fine; the send only fails then.
        let _ = self.events.send(event);
    }

    // --- READS ---

    pub fn mission(&self, id: &str) -> Option<Mission> {
        self.missions.read().expect("missions lock").get(id).cloned()
    }

    pub fn missions_in(&self, state: Option<MissionState>) -> Vec<Mission> {
        self.missions
            .read()
            .expect("missions lock")
            .list(state)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn admissible_missions(&self, now_ms: u64) -> Vec<Mission> {
        self.missions.read().expect("missions lock").admissible(now_ms)
    }

    pub fn worker(&self, id: &str) -> Option<Worker> {
        self.resources.read().expect("resources lock").get(id).cloned()
    }

    pub fn workers(&self) -> Vec<Worker> {
        self.resources.read().expect("resources lock").list()
    }

    pub fn available_workers(&self, filter: &WorkerFilter) -> Vec<Worker> {
        self.resources.read().expect("resources lock").available(filter)
    }

    pub fn stale_workers(&self, now_ms: u64, offline_threshold_ms: u64) -> Vec<String> {
        self.resources
            .read()
            .expect("resources lock")
            .stale(now_ms, offline_threshold_ms)
    }

    /// Soft-state telemetry heartbeat; see ResourceManager::soft_heartbeat.
    pub fn soft_heartbeat(
        &self,
        worker: &str,
        now_ms: u64,
        battery_pct: Option<f64>,
        position: Option<GeoPoint>,
    ) -> bool {
        self.resources
            .write()
            .expect("resources lock")
            .soft_heartbeat(worker, now_ms, battery_pct, position)
    }

    pub(crate) fn upsert_replica(&self, mission: Mission) {
        self.missions.write().expect("missions lock").put(mission);
    }

    // --- APPLY ---

    pub fn apply_command(&self, command: Command) -> Result<(), FleetError> {
        match command {
            Command::CreateMission { mission } => {
                let id = mission.id.clone();
                self.missions.write().expect("missions lock").insert(mission)?;
                self.emit(FleetEvent::MissionCreated { id });
                Ok(())
            }

            Command::UpdateMission { id, priority, params, at_ms } => {
                self.missions.write().expect("missions lock").update(&id, |m| {
                    if m.state.is_terminal() {
                        return Err(FleetError::rejected(format!(
                            "mission {} is terminal",
                            m.id
                        )));
                    }
                    if let Some(p) = priority {
                        m.priority = p;
                    }
                    if let Some(p) = params {
                        m.payload.params = p;
                    }
                    m.touch(at_ms);
                    Ok(())
                })?;
                Ok(())
            }

            Command::AssignMission { id, workers, at_ms } => {
                {
                    let missions = self.missions.read().expect("missions lock");
                    let mission = missions
                        .get(&id)
                        .ok_or_else(|| FleetError::rejected(format!("mission {} not found", id)))?;
                    if mission.state != MissionState::Pending {
                        return Err(FleetError::rejected(format!(
                            "mission {} is {:?}, expected Pending",
                            id, mission.state
                        )));
                    }
                }
                self.resources.write().expect("resources lock").reserve(&id, &workers)?;
                let mut missions = self.missions.write().expect("missions lock");
                missions.transition(&id, MissionState::Assigned, at_ms)?;
                missions.update(&id, |m| {
                    m.assigned = workers.clone();
                    Ok(())
                })?;
                drop(missions);
                self.emit(FleetEvent::MissionAssigned { id, workers });
                Ok(())
            }

            Command::DispatchMission { id, at_ms } => {
                let workers = {
                    let missions = self.missions.read().expect("missions lock");
                    let mission = missions
                        .get(&id)
                        .ok_or_else(|| FleetError::rejected(format!("mission {} not found", id)))?;
                    if mission.state != MissionState::Assigned {
                        return Err(FleetError::rejected(format!(
                            "mission {} is {:?}, expected Assigned",
                            id, mission.state
                        )));
                    }
                    mission.assigned.clone()
                };
                self.missions
                    .write()
                    .expect("missions lock")
                    .transition(&id, MissionState::Running, at_ms)?;
                self.resources.write().expect("resources lock").occupy(&id, &workers)?;
                self.emit(FleetEvent::MissionStateChanged {
                    id,
                    state: MissionState::Running,
                });
                Ok(())
            }

            Command::PauseMission { id, at_ms } => {
                self.missions
                    .write()
                    .expect("missions lock")
                    .transition(&id, MissionState::Paused, at_ms)?;
                self.emit(FleetEvent::MissionStateChanged { id, state: MissionState::Paused });
                Ok(())
            }

            Command::ResumeMission { id, at_ms } => {
                self.missions
                    .write()
                    .expect("missions lock")
                    .transition(&id, MissionState::Running, at_ms)?;
                self.emit(FleetEvent::MissionStateChanged { id, state: MissionState::Running });
                Ok(())
            }

            Command::CancelMission { id, at_ms } => {
                self.missions
                    .write()
                    .expect("missions lock")
                    .transition(&id, MissionState::Cancelled, at_ms)?;
                self.resources.write().expect("resources lock").release_mission(&id);
                self.missions.write().expect("missions lock").update(&id, |m| {
                    m.assigned.clear();
                    Ok(())
                })?;
                self.emit(FleetEvent::MissionStateChanged { id, state: MissionState::Cancelled });
                Ok(())
            }

            Command::DeleteMission { id } => {
                self.missions.write().expect("missions lock").remove(&id)?;
                self.emit(FleetEvent::MissionDeleted { id });
                Ok(())
            }

            Command::ReleaseWorkers { mission, at_ms } => {
                self.resources.write().expect("resources lock").release_mission(&mission);
                let mut missions = self.missions.write().expect("missions lock");
                if missions.get(&mission).is_some() {
                    missions.update(&mission, |m| {
                        m.assigned.clear();
                        m.touch(at_ms);
                        Ok(())
                    })?;
                }
                Ok(())
            }

            Command::FailMission { id, failure, requeue, count_attempt, next_attempt_ms, at_ms } => {
                self.resources.write().expect("resources lock").release_mission(&id);
                let mut missions = self.missions.write().expect("missions lock");
                let target = if requeue { MissionState::Pending } else { MissionState::Failed };
                missions.transition(&id, target, at_ms)?;
                missions.update(&id, |m| {
                    m.assigned.clear();
                    if count_attempt {
                        m.attempts += 1;
                    }
                    m.last_failure = Some(failure);
                    m.next_attempt_ms = next_attempt_ms;
                    if requeue {
                        m.progress = 0.0;
                        m.started_ms = None;
                        m.completed_ms = None;
                    }
                    Ok(())
                })?;
                drop(missions);
                self.emit(FleetEvent::MissionStateChanged { id, state: target });
                Ok(())
            }

            Command::RegisterWorker { id, capabilities, at_ms } => {
                self.resources
                    .write()
                    .expect("resources lock")
                    .register(id.clone(), capabilities, at_ms);
                self.emit(FleetEvent::WorkerRegistered { id });
                Ok(())
            }

            Command::UpdateHeartbeat { id, at_ms } => {
                self.resources.write().expect("resources lock").heartbeat(&id, at_ms)
            }

            Command::SetWorkerStatus { id, status, at_ms } => {
                let lost = self
                    .resources
                    .write()
                    .expect("resources lock")
                    .set_status(&id, status, at_ms)?;
                if status == WorkerStatus::Offline {
                    self.emit(FleetEvent::WorkerOffline { id: id.clone() });
                }
                if let Some(mission) = lost {
                    warn!("[State] Worker {} lost while busy on {}", id, mission);
                    self.emit(FleetEvent::WorkerLost { worker: id, mission });
                }
                Ok(())
            }

            Command::UpdateMissionProgress { id, progress, at_ms } => {
                let progress = progress.clamp(0.0, 1.0);
                let mut missions = self.missions.write().expect("missions lock");
                let current = missions
                    .get(&id)
                    .ok_or_else(|| FleetError::rejected(format!("mission {} not found", id)))?;
                if current.state != MissionState::Running {
                    return Err(FleetError::rejected(format!(
                        "mission {} is {:?}, progress requires Running",
                        id, current.state
                    )));
                }
                // Progress is monotone while running.
                if progress <= current.progress && progress < 1.0 {
                    return Ok(());
                }
                missions.update(&id, |m| {
                    m.progress = progress;
                    m.touch(at_ms);
                    Ok(())
                })?;
                let done = progress >= 1.0;
                if done {
                    missions.transition(&id, MissionState::Succeeded, at_ms)?;
                }
                drop(missions);
                self.emit(FleetEvent::MissionProgress { id: id.clone(), progress });
                if done {
                    // Workers go back to the pool; the assignment list
                    // stays on the mission as history.
                    self.resources.write().expect("resources lock").release_mission(&id);
                    self.emit(FleetEvent::MissionStateChanged {
                        id,
                        state: MissionState::Succeeded,
                    });
                }
                Ok(())
            }
        }
    }
}

impl StateMachine for DataSynchronizer {
    fn apply(&self, index: u64, command: &[u8]) -> Result<(), FleetError> {
        let command: Command = bincode::deserialize(command)
            .map_err(|e| FleetError::fatal(format!("undecodable log entry {}: {}", index, e)))?;
        let result = self.apply_command(command);
        if let Err(ref e) = result {
            debug!("[State] Entry {} rejected: {}", index, e);
        }
        self.last_applied.store(index, Ordering::Release);
        result
    }

    fn snapshot(&self) -> Vec<u8> {
        let missions = self.missions.read().expect("missions lock").all();
        let (workers, reservations) = self.resources.read().expect("resources lock").all();
        bincode::serialize(&FleetSnapshot { missions, workers, reservations })
            .expect("snapshot encode")
    }

    fn restore(&self, data: &[u8]) {
        let snapshot: FleetSnapshot = match bincode::deserialize(data) {
            Ok(s) => s,
            Err(e) => {
                // Corrupt snapshots are caught by the checksum layer
                // before this point; reaching here is a logic error.
                warn!("[State] Snapshot restore failed: {}", e);
                return;
            }
        };
        self.missions.write().expect("missions lock").replace_all(snapshot.missions);
        self.resources
            .write()
            .expect("resources lock")
            .replace_all(snapshot.workers, snapshot.reservations);
    }
}
