// SPDX-License-Identifier: MIT

use anyhow::{Context, Result};
use clap::Parser;
use fleet_bridge::{BridgeConfig, BridgeEvent, DownlinkBridge};
use fleet_consensus::{RaftConfig, RaftMessage, RaftNode};
use fleet_discovery::{BackendRegistry, HealthChecker, Probe};
use fleet_model::{FleetConfig, FleetError};
use fleet_scheduler::{NoLoadPrediction, Scheduler};
use fleet_state::DataSynchronizer;
use fleet_transport::{serve_frames, CallPolicy, PeerTransport, TcpTransport, TransportStats};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "fleetd", about = "Fleet control-plane replica")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "fleetd.yaml")]
    config: PathBuf,

    /// Override the configured node id.
    #[arg(long)]
    node_id: Option<u64>,

    /// Override the configured replica bind endpoint.
    #[arg(long)]
    bind: Option<String>,

    /// Override the configured data directory.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

/// Replica-to-replica wire envelope: every message names its sender.
#[derive(Serialize, Deserialize)]
struct Envelope {
    from: u64,
    message: RaftMessage,
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_level(true),
        )
        .init();
}

fn load_config(cli: &Cli) -> Result<FleetConfig> {
    let mut config = if cli.config.exists() {
        let raw = std::fs::read_to_string(&cli.config)
            .with_context(|| format!("reading {}", cli.config.display()))?;
        serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", cli.config.display()))?
    } else {
        info!("[Fleetd] No config file at {}, using defaults", cli.config.display());
        FleetConfig::default()
    };
    if let Some(id) = cli.node_id {
        config.node_id = id;
    }
    if let Some(bind) = &cli.bind {
        config.bind_endpoint = bind.clone();
    }
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    Ok(config)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Probe a peer with a plain TCP connect, the cheapest liveness signal
/// the transport offers.
struct ConnectProbe;

impl Probe for ConnectProbe {
    fn probe<'a>(
        &'a self,
        peer: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + 'a>> {
        Box::pin(async move {
            tokio::net::TcpStream::connect(peer)
                .await
                .map(|_| ())
                .map_err(|e| e.to_string())
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    info!("╔══════════════════════════════════════════╗");
    info!("║ FLEET CONTROL PLANE | node {:<13} ║", config.node_id);
    info!("║ rpc {:<22} v{:<10} ║", config.bind_endpoint, env!("CARGO_PKG_VERSION"));
    info!("╚══════════════════════════════════════════╝");
    info!(
        "[Fleetd] {} peers, discovery={}, data={}",
        config.peers.len(),
        config.discovery_backend,
        config.data_dir.display()
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("[Fleetd] Shutdown requested");
                let _ = shutdown_tx.send(true);
            }
        });
    }

    // Membership + health.
    let registry = BackendRegistry::with_builtins();
    let discovery = registry
        .build(&config)
        .map_err(|e| anyhow::anyhow!("discovery backend: {}", e))?;
    let peer_addresses: HashMap<u64, String> = config.peer_addresses().into_iter().collect();

    let health = HealthChecker::new(
        Arc::new(ConnectProbe),
        Duration::from_millis(config.health_check_interval_ms),
        config.health_failure_threshold,
        config.health_success_threshold,
    );
    health
        .clone()
        .start(peer_addresses.values().cloned().collect());

    {
        let mut membership = discovery.watch();
        tokio::spawn(async move {
            while let Ok(event) = membership.recv().await {
                info!("[Fleetd] Membership change: {:?}", event);
            }
        });
    }

    // Authoritative state and consensus.
    let sync = Arc::new(DataSynchronizer::new(config.node_id));
    let (outbox_tx, outbox_rx) = mpsc::channel::<(u64, RaftMessage)>(256);
    let raft = RaftNode::start(
        RaftConfig::from_fleet(&config),
        sync.clone(),
        outbox_tx,
        shutdown_rx.clone(),
    )
    .await
    .map_err(|e| anyhow::anyhow!("raft start: {}", e))?;

    spawn_outbox_pump(
        config.node_id,
        outbox_rx,
        peer_addresses.clone(),
        raft.clone(),
        CallPolicy::from_config(&config),
        shutdown_rx.clone(),
    );

    spawn_rpc_server(&config, raft.clone(), shutdown_rx.clone()).await?;

    // Worker link.
    let (bridge, bridge_events) = DownlinkBridge::new(config.node_id, BridgeConfig::from_fleet(&config));
    let uplink_listener = TcpListener::bind(&config.uplink_bind)
        .await
        .with_context(|| format!("binding uplink {}", config.uplink_bind))?;
    info!("[Fleetd] Worker uplink on {}", config.uplink_bind);
    bridge.start(uplink_listener, shutdown_rx.clone());

    // Orchestration.
    let scheduler = Scheduler::new(
        raft.clone(),
        sync.clone(),
        bridge.clone(),
        Arc::new(NoLoadPrediction),
        config.clone(),
    );
    scheduler.start(shutdown_rx.clone());

    spawn_uplink_pump(bridge_events, scheduler.clone(), sync.clone(), shutdown_rx.clone());

    // Run until the shutdown flag flips, then drain within the grace
    // window.
    let mut wait_shutdown = shutdown_rx;
    let _ = wait_shutdown.changed().await;
    info!(
        "[Fleetd] Draining tasks ({} ms grace)",
        config.shutdown_grace_ms
    );
    tokio::time::sleep(Duration::from_millis(config.shutdown_grace_ms)).await;
    let status = raft.status().await;
    info!(
        "[Fleetd] Stopped at term {}, applied {}",
        status.term, status.last_applied
    );
    Ok(())
}

/// Drives the Raft outbox: serialize, call the peer with the shaped
/// policy, feed the response back into the node.
fn spawn_outbox_pump(
    node_id: u64,
    mut outbox_rx: mpsc::Receiver<(u64, RaftMessage)>,
    peers: HashMap<u64, String>,
    raft: Arc<RaftNode>,
    policy: CallPolicy,
    mut shutdown: watch::Receiver<bool>,
) {
    let transport: Arc<dyn PeerTransport> = Arc::new(TcpTransport::new());
    let stats = TransportStats::new();
    tokio::spawn(async move {
        loop {
            let (peer_id, message) = tokio::select! {
                received = outbox_rx.recv() => match received {
                    Some(pair) => pair,
                    None => return,
                },
                _ = shutdown.changed() => return,
            };
            let Some(address) = peers.get(&peer_id).cloned() else {
                warn!("[Fleetd] No address for peer {}", peer_id);
                continue;
            };
            let envelope = match bincode::serialize(&Envelope { from: node_id, message }) {
                Ok(bytes) => bytes,
                Err(e) => {
                    error!("[Fleetd] Envelope encode failed: {}", e);
                    continue;
                }
            };
            let transport = transport.clone();
            let stats = stats.clone();
            let policy = policy.clone();
            let raft = raft.clone();
            tokio::spawn(async move {
                match policy.call(transport.as_ref(), &stats, &address, &envelope).await {
                    Ok(response) if !response.is_empty() => {
                        match bincode::deserialize::<RaftMessage>(&response) {
                            Ok(reply) => {
                                let _ = raft.handle_message(peer_id, reply).await;
                            }
                            Err(e) => warn!("[Fleetd] Bad reply from {}: {}", peer_id, e),
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!("[Fleetd] Call to {} failed: {}", peer_id, e);
                    }
                }
            });
        }
    });
}

/// Inbound replica RPC endpoint.
async fn spawn_rpc_server(
    config: &FleetConfig,
    raft: Arc<RaftNode>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = TcpListener::bind(&config.bind_endpoint)
        .await
        .with_context(|| format!("binding rpc {}", config.bind_endpoint))?;
    info!("[Fleetd] Replica RPC on {}", config.bind_endpoint);
    tokio::spawn(serve_frames(
        listener,
        move |request: Vec<u8>| {
            let raft = raft.clone();
            async move {
                let envelope: Envelope = match bincode::deserialize(&request) {
                    Ok(e) => e,
                    Err(e) => {
                        warn!("[Fleetd] Undecodable rpc frame: {}", e);
                        return Vec::new();
                    }
                };
                match raft.handle_message(envelope.from, envelope.message).await {
                    Some(response) => bincode::serialize(&response).unwrap_or_default(),
                    None => Vec::new(),
                }
            }
        },
        shutdown,
    ));
    Ok(())
}

/// Routes bridge events into the scheduler and the soft-state stores.
fn spawn_uplink_pump(
    mut events: mpsc::Receiver<BridgeEvent>,
    scheduler: Arc<Scheduler>,
    sync: Arc<DataSynchronizer>,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                received = events.recv() => match received {
                    Some(e) => e,
                    None => return,
                },
                _ = shutdown.changed() => return,
            };
            match event {
                BridgeEvent::Telemetry(telemetry) => {
                    let fresh = sync.soft_heartbeat(
                        &telemetry.worker_id,
                        now_ms(),
                        Some(telemetry.battery.percent),
                        Some(telemetry.position),
                    );
                    if !fresh {
                        // Unknown or Offline worker: the resurrecting
                        // transition must go through the log.
                        match scheduler.heartbeat_worker(&telemetry.worker_id).await {
                            Ok(()) => {}
                            Err(FleetError::NotLeader { .. })
                            | Err(FleetError::StateMachineRejected { .. }) => {}
                            Err(e) => warn!(
                                "[Fleetd] Heartbeat for {} failed: {}",
                                telemetry.worker_id, e
                            ),
                        }
                    }
                }
                BridgeEvent::MissionStatus(status) => {
                    match scheduler.report_mission_status(status).await {
                        Ok(()) | Err(FleetError::NotLeader { .. }) => {}
                        Err(e) => warn!("[Fleetd] Mission status ingest failed: {}", e),
                    }
                }
                BridgeEvent::WorkerEvent { worker_id, name, detail } => {
                    info!("[Fleetd] Worker {} event {}: {}", worker_id, name, detail);
                }
                BridgeEvent::WorkerConnected { worker_id } => {
                    info!("[Fleetd] Worker {} linked", worker_id);
                }
                BridgeEvent::AckTimeout { worker_id, request_id } => {
                    warn!(
                        "[Fleetd] Worker {} never acked {}",
                        worker_id, request_id
                    );
                }
            }
        }
    });
}
