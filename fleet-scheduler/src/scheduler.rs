// SPDX-License-Identifier: MIT

use crate::advisor::LoadPredictor;
use crate::assigner::{assign, hard_filter};
use crate::retry::RetryPolicy;
use fleet_consensus::RaftNode;
use fleet_model::{
    Command, ErrorClass, FleetConfig, FleetError, Mission, MissionKind, MissionPayload,
    MissionState, MissionStatus, MissionStatusKind, Worker,
};
use fleet_state::{DataSynchronizer, FleetEvent};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

/// What an edge caller provides to create a mission.
#[derive(Debug, Clone)]
pub struct MissionSpec {
    pub id: String,
    pub kind: MissionKind,
    pub priority: i32,
    pub payload: MissionPayload,
}

/// Fan-out seam to the worker link. The bridge implements this; tests
/// plug in a recorder.
pub trait MissionDownlink: Send + Sync {
    fn dispatch<'a>(
        &'a self,
        mission: &'a Mission,
    ) -> Pin<Box<dyn Future<Output = Result<(), FleetError>> + Send + 'a>>;
}

/// Downlink that goes nowhere. Useful before a bridge is wired up and
/// in scheduling tests.
pub struct NoopDownlink;

impl MissionDownlink for NoopDownlink {
    fn dispatch<'a>(
        &'a self,
        _mission: &'a Mission,
    ) -> Pin<Box<dyn Future<Output = Result<(), FleetError>> + Send + 'a>> {
        Box::pin(async { Ok(()) })
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn classify(error: &FleetError) -> ErrorClass {
    match error {
        FleetError::PeerTimeout(_) => ErrorClass::Timeout,
        FleetError::PeerUnreachable(_) | FleetError::Backlogged { .. } => ErrorClass::Network,
        FleetError::StateMachineRejected { .. } => ErrorClass::Validation,
        _ => ErrorClass::Unknown,
    }
}

/// The orchestrator: one logical tick admits, assigns and dispatches;
/// side loops sweep worker liveness and absorb WorkerLost events. All
/// mutations travel through the log; this type never touches the stores
/// directly.
pub struct Scheduler {
    raft: Arc<RaftNode>,
    sync: Arc<DataSynchronizer>,
    downlink: Arc<dyn MissionDownlink>,
    advisor: Arc<dyn LoadPredictor>,
    retry: RetryPolicy,
    config: FleetConfig,
}

impl Scheduler {
    pub fn new(
        raft: Arc<RaftNode>,
        sync: Arc<DataSynchronizer>,
        downlink: Arc<dyn MissionDownlink>,
        advisor: Arc<dyn LoadPredictor>,
        config: FleetConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            raft,
            sync,
            downlink,
            advisor,
            retry: RetryPolicy::new(config.retry_defaults.clone()),
            config,
        })
    }

    /// Spawns the tick, sweeper and event loops.
    pub fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) {
        let tick = self.clone();
        let mut tick_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_millis(tick.config.scheduler_tick_ms));
            loop {
                tokio::select! {
                    _ = ticker.tick() => tick.tick().await,
                    _ = tick_shutdown.changed() => {
                        info!("[Scheduler] Tick loop stopping");
                        return;
                    }
                }
            }
        });

        let sweeper = self.clone();
        let mut sweep_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_millis(sweeper.config.worker_sweep_interval_ms));
            loop {
                tokio::select! {
                    _ = ticker.tick() => sweeper.sweep().await,
                    _ = sweep_shutdown.changed() => return,
                }
            }
        });

        let events = self.clone();
        let mut event_shutdown = shutdown;
        tokio::spawn(async move {
            let mut rx = events.sync.subscribe();
            loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        Ok(FleetEvent::WorkerLost { worker, mission }) => {
                            events.handle_worker_lost(&worker, &mission).await;
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("[Scheduler] Event stream lagged by {}", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                    _ = event_shutdown.changed() => return,
                }
            }
        });
    }

    // --- LOG SUBMISSION ---

    async fn submit(&self, command: Command) -> Result<u64, FleetError> {
        let bytes = bincode::serialize(&command)
            .map_err(|e| FleetError::fatal(format!("command encode: {}", e)))?;
        match self.raft.submit(bytes).await {
            Err(FleetError::NotLeader { hint }) => Err(FleetError::NotLeader {
                hint: hint.map(|h| self.endpoint_of(&h)),
            }),
            other => other,
        }
    }

    /// Redirect hints carry the peer's endpoint, not its node id.
    fn endpoint_of(&self, node_id: &str) -> String {
        node_id
            .parse::<u64>()
            .ok()
            .and_then(|id| {
                self.config.peers.iter().find(|p| p.node_id == id).map(|p| p.address.clone())
            })
            .unwrap_or_else(|| node_id.to_string())
    }

    // --- TICK ---

    /// One scheduling pass: walk Pending missions in admission order and
    /// take each as far as it will go.
    pub async fn tick(&self) {
        if !self.raft.is_leader().await {
            return;
        }
        let now = now_ms();
        for mission in self.sync.admissible_missions(now) {
            if let Err(e) = self.place(&mission, now).await {
                match e {
                    FleetError::NoFeasibleAssignment => {
                        debug!("[Scheduler] No feasible assignment for {}", mission.id);
                    }
                    FleetError::NotLeader { .. } => return,
                    other => warn!("[Scheduler] Placing {} failed: {}", mission.id, other),
                }
            }
        }
    }

    async fn place(&self, mission: &Mission, now: u64) -> Result<(), FleetError> {
        let filter = hard_filter(mission);
        let candidates = self.sync.available_workers(&filter);
        let assignment = assign(mission, &candidates, self.advisor.as_ref())?;

        info!(
            "[Scheduler] Assigning {} to {:?} (attempt {})",
            mission.id,
            assignment.workers,
            mission.attempts + 1
        );
        self.submit(Command::AssignMission {
            id: mission.id.clone(),
            workers: assignment.workers,
            at_ms: now,
        })
        .await?;
        self.submit(Command::DispatchMission { id: mission.id.clone(), at_ms: now }).await?;

        // Fan out to the workers only after the dispatch is committed.
        let dispatched = self
            .sync
            .mission(&mission.id)
            .ok_or_else(|| FleetError::rejected(format!("mission {} vanished", mission.id)))?;
        if let Err(e) = self.downlink.dispatch(&dispatched).await {
            warn!("[Scheduler] Downlink for {} failed: {}", mission.id, e);
            self.fail_mission(&mission.id, classify(&e)).await?;
        }
        Ok(())
    }

    // --- LIVENESS ---

    async fn sweep(&self) {
        if !self.raft.is_leader().await {
            return;
        }
        let now = now_ms();
        for worker in self.sync.stale_workers(now, self.config.worker_offline_threshold_ms) {
            info!("[Scheduler] Worker {} missed heartbeats, marking offline", worker);
            let result = self
                .submit(Command::SetWorkerStatus {
                    id: worker.clone(),
                    status: fleet_model::WorkerStatus::Offline,
                    at_ms: now,
                })
                .await;
            if let Err(e) = result {
                warn!("[Scheduler] Offline transition for {} failed: {}", worker, e);
            }
        }
    }

    async fn handle_worker_lost(&self, worker: &str, mission: &str) {
        if !self.raft.is_leader().await {
            return;
        }
        info!("[Scheduler] Worker {} lost while on {}", worker, mission);
        if let Err(e) = self.fail_mission(mission, ErrorClass::Network).await {
            warn!("[Scheduler] Requeue of {} failed: {}", mission, e);
        }
    }

    /// Route a mission failure through the retry policy and commit the
    /// disposition.
    async fn fail_mission(&self, id: &str, class: ErrorClass) -> Result<(), FleetError> {
        let Some(mission) = self.sync.mission(id) else {
            return Err(FleetError::rejected(format!("mission {} not found", id)));
        };
        if mission.state.is_terminal() {
            return Ok(());
        }
        let now = now_ms();
        let decision = self.retry.decide(class, mission.attempts, now);
        if !decision.requeue {
            info!("[Scheduler] Mission {} failed terminally ({})", id, class);
        }
        self.submit(Command::FailMission {
            id: id.to_string(),
            failure: class,
            requeue: decision.requeue,
            count_attempt: decision.count_attempt,
            next_attempt_ms: decision.next_attempt_ms,
            at_ms: now,
        })
        .await?;
        Ok(())
    }

    // --- UPLINK INGEST ---

    /// Progress reports go through the log; 1.0 completes the mission.
    pub async fn report_progress(&self, mission: &str, progress: f64) -> Result<(), FleetError> {
        self.submit(Command::UpdateMissionProgress {
            id: mission.to_string(),
            progress,
            at_ms: now_ms(),
        })
        .await
        .map(|_| ())
    }

    pub async fn report_mission_status(&self, status: MissionStatus) -> Result<(), FleetError> {
        match status.kind {
            MissionStatusKind::InProgress => {
                self.report_progress(&status.mission_id, status.progress).await
            }
            MissionStatusKind::Completed => self.report_progress(&status.mission_id, 1.0).await,
            MissionStatusKind::Failed => {
                let class = match status.reason.as_deref() {
                    Some("timeout") => ErrorClass::Timeout,
                    Some("link") | Some("network") => ErrorClass::Network,
                    Some("invalid") => ErrorClass::Validation,
                    _ => ErrorClass::Unknown,
                };
                self.fail_mission(&status.mission_id, class).await
            }
        }
    }

    // --- EDGE SURFACE ---

    pub async fn create_mission(&self, spec: MissionSpec) -> Result<String, FleetError> {
        if spec.id.is_empty() {
            return Err(FleetError::rejected("mission id must not be empty"));
        }
        let mission = Mission::new(
            spec.id.clone(),
            spec.kind,
            spec.payload,
            spec.priority,
            self.config.node_id,
            now_ms(),
        );
        self.submit(Command::CreateMission { mission }).await?;
        Ok(spec.id)
    }

    pub fn list_missions(&self, state: Option<MissionState>) -> Vec<Mission> {
        self.sync.missions_in(state)
    }

    pub fn get_mission(&self, id: &str) -> Option<Mission> {
        self.sync.mission(id)
    }

    /// Explicit dispatch for an edge caller: place a Pending mission
    /// now rather than on the next tick.
    pub async fn dispatch_mission(&self, id: &str) -> Result<(), FleetError> {
        let mission = self
            .sync
            .mission(id)
            .ok_or_else(|| FleetError::rejected(format!("mission {} not found", id)))?;
        match mission.state {
            MissionState::Pending => self.place(&mission, now_ms()).await,
            MissionState::Assigned => {
                self.submit(Command::DispatchMission { id: id.to_string(), at_ms: now_ms() })
                    .await?;
                let dispatched = self
                    .sync
                    .mission(id)
                    .ok_or_else(|| FleetError::rejected(format!("mission {} vanished", id)))?;
                if let Err(e) = self.downlink.dispatch(&dispatched).await {
                    warn!("[Scheduler] Downlink for {} failed: {}", id, e);
                    self.fail_mission(id, classify(&e)).await?;
                }
                Ok(())
            }
            other => Err(FleetError::rejected(format!("mission {} is {:?}", id, other))),
        }
    }

    pub async fn pause_mission(&self, id: &str) -> Result<(), FleetError> {
        self.submit(Command::PauseMission { id: id.to_string(), at_ms: now_ms() }).await.map(|_| ())
    }

    pub async fn resume_mission(&self, id: &str) -> Result<(), FleetError> {
        self.submit(Command::ResumeMission { id: id.to_string(), at_ms: now_ms() })
            .await
            .map(|_| ())
    }

    pub async fn cancel_mission(&self, id: &str) -> Result<(), FleetError> {
        self.submit(Command::CancelMission { id: id.to_string(), at_ms: now_ms() })
            .await
            .map(|_| ())
    }

    pub async fn delete_mission(&self, id: &str) -> Result<(), FleetError> {
        self.submit(Command::DeleteMission { id: id.to_string() }).await.map(|_| ())
    }

    pub fn list_workers(&self) -> Vec<Worker> {
        self.sync.workers()
    }

    pub fn get_worker(&self, id: &str) -> Option<Worker> {
        self.sync.worker(id)
    }

    pub async fn register_worker(
        &self,
        id: &str,
        capabilities: std::collections::HashMap<String, f64>,
    ) -> Result<(), FleetError> {
        self.submit(Command::RegisterWorker {
            id: id.to_string(),
            capabilities,
            at_ms: now_ms(),
        })
        .await
        .map(|_| ())
    }

    /// Heartbeats stay soft while the worker is online; a resurrecting
    /// heartbeat is a logged status transition.
    pub async fn heartbeat_worker(&self, id: &str) -> Result<(), FleetError> {
        let now = now_ms();
        if self.sync.soft_heartbeat(id, now, None, None) {
            return Ok(());
        }
        if self.sync.worker(id).is_none() {
            return Err(FleetError::rejected(format!("worker {} not registered", id)));
        }
        self.submit(Command::UpdateHeartbeat { id: id.to_string(), at_ms: now }).await.map(|_| ())
    }

    /// State-change events for edge subscribers.
    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.sync.subscribe()
    }

    pub async fn is_leader(&self) -> bool {
        self.raft.is_leader().await
    }

    pub async fn leader_hint(&self) -> Option<String> {
        self.raft.leader_hint().await.map(|id| self.endpoint_of(&id.to_string()))
    }
}
