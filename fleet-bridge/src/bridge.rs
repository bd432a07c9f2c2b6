// SPDX-License-Identifier: MIT

use fleet_model::{
    CommandKind, DownlinkMessage, FleetConfig, FleetError, Mission, MissionStatus, Telemetry,
    UplinkMessage, WorkerCommand,
};
use fleet_scheduler::MissionDownlink;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// What the bridge surfaces to the rest of the control plane. Telemetry
/// arriving out of order has already been filtered to the newest sample
/// per worker.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    Telemetry(Telemetry),
    MissionStatus(MissionStatus),
    WorkerEvent { worker_id: String, name: String, detail: String },
    WorkerConnected { worker_id: String },
    AckTimeout { worker_id: String, request_id: String },
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub ack_timeout: Duration,
    pub max_retries: u32,
    pub queue_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(5),
            max_retries: 3,
            queue_capacity: 32,
        }
    }
}

impl BridgeConfig {
    pub fn from_fleet(cfg: &FleetConfig) -> Self {
        Self {
            ack_timeout: Duration::from_millis(cfg.downlink_ack_timeout_ms),
            max_retries: cfg.downlink_max_retries,
            ..Default::default()
        }
    }
}

struct PendingSend {
    worker_id: String,
    line: String,
    attempts: u32,
    deadline: Instant,
}

/// Carries commands and mission payloads to workers over a newline-
/// framed duplex stream and ingests telemetry, status and acks on the
/// way back. A worker announces itself with `HELLO:{id}` on connect;
/// per-worker ordering is preserved by a single bounded outbound queue
/// per link.
pub struct DownlinkBridge {
    node_id: u64,
    config: BridgeConfig,
    links: RwLock<HashMap<String, mpsc::Sender<String>>>,
    pending: Mutex<HashMap<String, PendingSend>>,
    last_seen_ns: Mutex<HashMap<String, u64>>,
    events: mpsc::Sender<BridgeEvent>,
    request_counter: AtomicU64,
}

impl DownlinkBridge {
    pub fn new(node_id: u64, config: BridgeConfig) -> (Arc<Self>, mpsc::Receiver<BridgeEvent>) {
        let (events, events_rx) = mpsc::channel(256);
        let bridge = Arc::new(Self {
            node_id,
            config,
            links: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            last_seen_ns: Mutex::new(HashMap::new()),
            events,
            request_counter: AtomicU64::new(0),
        });
        (bridge, events_rx)
    }

    /// Accept loop for worker connections plus the ack-retry loop.
    pub fn start(self: &Arc<Self>, listener: TcpListener, shutdown: watch::Receiver<bool>) {
        let acceptor = self.clone();
        let mut accept_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, addr)) => {
                                debug!("[Bridge] Worker connection from {}", addr);
                                let handler = acceptor.clone();
                                let conn_shutdown = accept_shutdown.clone();
                                tokio::spawn(async move {
                                    handler.run_connection(stream, conn_shutdown).await;
                                });
                            }
                            Err(e) => warn!("[Bridge] Accept failed: {}", e),
                        }
                    }
                    _ = accept_shutdown.changed() => {
                        info!("[Bridge] Listener stopping");
                        return;
                    }
                }
            }
        });

        let retrier = self.clone();
        let mut retry_shutdown = shutdown;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(500));
            loop {
                tokio::select! {
                    _ = ticker.tick() => retrier.retry_expired().await,
                    _ = retry_shutdown.changed() => return,
                }
            }
        });
    }

    async fn run_connection(self: Arc<Self>, stream: TcpStream, mut shutdown: watch::Receiver<bool>) {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        // First line must identify the worker.
        let worker_id = match lines.next_line().await {
            Ok(Some(line)) if line.starts_with("HELLO:") => {
                line.trim_start_matches("HELLO:").trim().to_string()
            }
            _ => {
                debug!("[Bridge] Connection closed before hello");
                return;
            }
        };
        info!("[Bridge] Worker {} connected", worker_id);

        let (queue_tx, mut queue_rx) = mpsc::channel::<String>(self.config.queue_capacity);
        self.links.write().await.insert(worker_id.clone(), queue_tx);
        let _ = self.events.send(BridgeEvent::WorkerConnected { worker_id: worker_id.clone() }).await;

        // Writer: drains the per-worker queue in order.
        let writer_worker = worker_id.clone();
        let writer = tokio::spawn(async move {
            while let Some(line) = queue_rx.recv().await {
                if write_half.write_all(line.as_bytes()).await.is_err()
                    || write_half.write_all(b"\n").await.is_err()
                {
                    debug!("[Bridge] Write to {} failed", writer_worker);
                    return;
                }
            }
        });

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => self.handle_uplink(&worker_id, &line).await,
                        _ => break,
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        info!("[Bridge] Worker {} disconnected", worker_id);
        self.links.write().await.remove(&worker_id);
        writer.abort();
    }

    async fn handle_uplink(&self, worker_id: &str, line: &str) {
        if let Some(request_id) = line.strip_prefix("ACK:") {
            let removed = self.pending.lock().await.remove(request_id.trim());
            if removed.is_none() {
                debug!("[Bridge] Unmatched ack {} from {}", request_id, worker_id);
            }
            return;
        }

        match serde_json::from_str::<UplinkMessage>(line) {
            Ok(UplinkMessage::Telemetry(telemetry)) => {
                if telemetry.worker_id != worker_id {
                    warn!(
                        "[Bridge] Telemetry for {} arrived on {}'s link",
                        telemetry.worker_id, worker_id
                    );
                    return;
                }
                // Samples may reorder on the wire; strictly older ones
                // are discarded.
                let mut last_seen = self.last_seen_ns.lock().await;
                let last = last_seen.get(worker_id).copied().unwrap_or(0);
                if telemetry.timestamp_ns <= last {
                    debug!("[Bridge] Stale telemetry from {}", worker_id);
                    return;
                }
                last_seen.insert(worker_id.to_string(), telemetry.timestamp_ns);
                drop(last_seen);
                let _ = self.events.send(BridgeEvent::Telemetry(telemetry)).await;
            }
            Ok(UplinkMessage::MissionStatus(status)) => {
                let _ = self.events.send(BridgeEvent::MissionStatus(status)).await;
            }
            Ok(UplinkMessage::Event { worker_id, name, detail }) => {
                let _ = self
                    .events
                    .send(BridgeEvent::WorkerEvent { worker_id, name, detail })
                    .await;
            }
            Err(e) => debug!("[Bridge] Undecodable uplink from {}: {}", worker_id, e),
        }
    }

    fn next_request_id(&self) -> String {
        let n = self.request_counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.node_id, n)
    }

    /// Queue one downlink message, tracking it until acked.
    async fn enqueue(&self, message: DownlinkMessage) -> Result<String, FleetError> {
        let worker_id = message.worker_id().to_string();
        let request_id = message.request_id().to_string();
        let line = serde_json::to_string(&message)
            .map_err(|e| FleetError::fatal(format!("downlink encode: {}", e)))?;

        let links = self.links.read().await;
        let queue = links
            .get(&worker_id)
            .ok_or_else(|| FleetError::PeerUnreachable(worker_id.clone()))?;
        match queue.try_send(line.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                return Err(FleetError::Backlogged { worker: worker_id });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                return Err(FleetError::PeerUnreachable(worker_id));
            }
        }
        drop(links);

        self.pending.lock().await.insert(
            request_id.clone(),
            PendingSend {
                worker_id,
                line,
                attempts: 1,
                deadline: Instant::now() + self.config.ack_timeout,
            },
        );
        Ok(request_id)
    }

    pub async fn send_command(
        &self,
        worker_id: &str,
        kind: CommandKind,
        target_alt: Option<f64>,
    ) -> Result<String, FleetError> {
        self.enqueue(DownlinkMessage::Command(WorkerCommand {
            kind,
            target_alt,
            request_id: self.next_request_id(),
            worker_id: worker_id.to_string(),
        }))
        .await
    }

    pub async fn send_mission(
        &self,
        worker_id: &str,
        mission: &Mission,
        assigned_index: usize,
    ) -> Result<String, FleetError> {
        let mut params = mission.payload.params.clone();
        params.insert("task".into(), mission.payload.task.clone());
        // The worker re-derives its sweep slab from its slot in the
        // assignment.
        params.insert("assigned_index".into(), assigned_index.to_string());
        params.insert("assigned_count".into(), mission.assigned.len().to_string());
        self.enqueue(DownlinkMessage::Mission {
            id: mission.id.clone(),
            task: mission.payload.task.clone(),
            params,
            request_id: self.next_request_id(),
            worker_id: worker_id.to_string(),
        })
        .await
    }

    async fn retry_expired(&self) {
        let now = Instant::now();
        let mut expired: Vec<(String, PendingSend)> = Vec::new();
        {
            let mut pending = self.pending.lock().await;
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, p)| p.deadline <= now)
                .map(|(id, _)| id.clone())
                .collect();
            for id in ids {
                if let Some(p) = pending.remove(&id) {
                    expired.push((id, p));
                }
            }
        }

        for (request_id, mut send) in expired {
            if send.attempts >= self.config.max_retries {
                warn!(
                    "[Bridge] Giving up on {} to {} after {} attempts",
                    request_id, send.worker_id, send.attempts
                );
                let _ = self
                    .events
                    .send(BridgeEvent::AckTimeout {
                        worker_id: send.worker_id,
                        request_id,
                    })
                    .await;
                continue;
            }

            let delivered = {
                let links = self.links.read().await;
                links
                    .get(&send.worker_id)
                    .map(|queue| queue.try_send(send.line.clone()).is_ok())
                    .unwrap_or(false)
            };
            debug!(
                "[Bridge] Resending {} to {} (attempt {})",
                request_id,
                send.worker_id,
                send.attempts + 1
            );
            send.attempts += 1;
            send.deadline = now + self.config.ack_timeout;
            if !delivered {
                // Link is gone or saturated; keep the entry so a later
                // pass can try again within the attempt budget.
                send.deadline = now + Duration::from_millis(500);
            }
            self.pending.lock().await.insert(request_id, send);
        }
    }

    /// Pending unacked sends, for observability.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn connected_workers(&self) -> Vec<String> {
        let mut out: Vec<String> = self.links.read().await.keys().cloned().collect();
        out.sort();
        out
    }
}

impl MissionDownlink for DownlinkBridge {
    fn dispatch<'a>(
        &'a self,
        mission: &'a Mission,
    ) -> Pin<Box<dyn Future<Output = Result<(), FleetError>> + Send + 'a>> {
        Box::pin(async move {
            for (index, worker_id) in mission.assigned.iter().enumerate() {
                self.send_mission(worker_id, mission, index).await?;
            }
            Ok(())
        })
    }
}
