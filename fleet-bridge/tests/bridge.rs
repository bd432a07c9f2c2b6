// SPDX-License-Identifier: MIT

use fleet_bridge::{BridgeConfig, BridgeEvent, DownlinkBridge};
use fleet_model::{
    Attitude, Battery, CommandKind, DownlinkMessage, FleetError, GeoPoint, GpsFix, Telemetry,
    UplinkMessage, Velocity,
};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

// --- TEST INFRASTRUCTURE ---

struct FakeWorker {
    reader: tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl FakeWorker {
    async fn connect(addr: &str, id: &str) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, writer) = stream.into_split();
        let reader = BufReader::new(read_half).lines();
        let mut worker = Self { reader, writer };
        worker.send_line(&format!("HELLO:{}", id)).await;
        worker
    }

    async fn send_line(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    async fn recv(&mut self) -> DownlinkMessage {
        let line = tokio::time::timeout(Duration::from_secs(2), self.reader.next_line())
            .await
            .expect("downlink line within deadline")
            .unwrap()
            .expect("open stream");
        serde_json::from_str(&line).unwrap()
    }

    async fn ack(&mut self, request_id: &str) {
        self.send_line(&format!("ACK:{}", request_id)).await;
    }
}

async fn bridge_with(
    config: BridgeConfig,
) -> (
    std::sync::Arc<DownlinkBridge>,
    tokio::sync::mpsc::Receiver<BridgeEvent>,
    String,
    watch::Sender<bool>,
) {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (bridge, events) = DownlinkBridge::new(1, config);
    let (stop_tx, stop_rx) = watch::channel(false);
    bridge.start(listener, stop_rx);
    (bridge, events, addr, stop_tx)
}

fn telemetry(worker_id: &str, timestamp_ns: u64) -> Telemetry {
    Telemetry {
        worker_id: worker_id.to_string(),
        timestamp_ns,
        position: GeoPoint::new(0.1, 0.2, 30.0),
        attitude: Attitude { roll: 0.0, pitch: 0.0, yaw: 1.0 },
        velocity: Velocity { vx: 1.0, vy: 0.0, vz: 0.0 },
        battery: Battery { percent: 80.0, voltage_mv: 11_500 },
        gps: GpsFix { fix_type: 3, num_sat: 10 },
        link_quality: 0.9,
        flight_mode: "AUTO".into(),
    }
}

async fn wait_for_link(bridge: &DownlinkBridge, worker: &str) {
    for _ in 0..50 {
        if bridge.connected_workers().await.iter().any(|w| w == worker) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("worker {} never linked", worker);
}

// --- TESTS ---

#[tokio::test]
async fn command_roundtrip_with_ack() {
    let (bridge, _events, addr, _stop) = bridge_with(BridgeConfig::default()).await;
    let mut worker = FakeWorker::connect(&addr, "w1").await;
    wait_for_link(&bridge, "w1").await;

    let request_id = bridge.send_command("w1", CommandKind::Takeoff, Some(25.0)).await.unwrap();
    assert_eq!(bridge.pending_count().await, 1);

    match worker.recv().await {
        DownlinkMessage::Command(cmd) => {
            assert_eq!(cmd.kind, CommandKind::Takeoff);
            assert_eq!(cmd.target_alt, Some(25.0));
            assert_eq!(cmd.request_id, request_id);
            worker.ack(&cmd.request_id).await;
        }
        other => panic!("expected command, got {:?}", other),
    }

    for _ in 0..50 {
        if bridge.pending_count().await == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("ack never cleared the pending send");
}

#[tokio::test]
async fn downlink_preserves_per_worker_order() {
    let (bridge, _events, addr, _stop) = bridge_with(BridgeConfig::default()).await;
    let mut worker = FakeWorker::connect(&addr, "w1").await;
    wait_for_link(&bridge, "w1").await;

    let kinds = [CommandKind::Arm, CommandKind::Takeoff, CommandKind::Land, CommandKind::Disarm];
    for kind in kinds {
        bridge.send_command("w1", kind, None).await.unwrap();
    }
    for expected in kinds {
        match worker.recv().await {
            DownlinkMessage::Command(cmd) => assert_eq!(cmd.kind, expected),
            other => panic!("expected command, got {:?}", other),
        }
    }
}

#[tokio::test]
async fn unacked_send_retries_then_times_out() {
    let config = BridgeConfig {
        ack_timeout: Duration::from_millis(200),
        max_retries: 2,
        queue_capacity: 8,
    };
    let (bridge, mut events, addr, _stop) = bridge_with(config).await;
    let mut worker = FakeWorker::connect(&addr, "w1").await;
    wait_for_link(&bridge, "w1").await;

    let request_id = bridge.send_command("w1", CommandKind::Rtl, None).await.unwrap();

    // The worker hears the original send plus one retry, acking none.
    let first = worker.recv().await;
    let second = worker.recv().await;
    assert_eq!(first.request_id(), request_id);
    assert_eq!(second.request_id(), request_id);

    let event = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match events.recv().await {
                Some(BridgeEvent::AckTimeout { worker_id, request_id }) => {
                    return (worker_id, request_id)
                }
                Some(_) => continue,
                None => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timeout event");
    assert_eq!(event.0, "w1");
    assert_eq!(event.1, request_id);
    assert_eq!(bridge.pending_count().await, 0);
}

#[tokio::test]
async fn stale_telemetry_is_discarded() {
    let (bridge, mut events, addr, _stop) = bridge_with(BridgeConfig::default()).await;
    let mut worker = FakeWorker::connect(&addr, "w1").await;
    wait_for_link(&bridge, "w1").await;

    for ts in [100u64, 50, 200] {
        let line = serde_json::to_string(&UplinkMessage::Telemetry(telemetry("w1", ts))).unwrap();
        worker.send_line(&line).await;
    }

    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while seen.len() < 2 {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Some(BridgeEvent::Telemetry(t))) => seen.push(t.timestamp_ns),
            Ok(Some(_)) => continue,
            _ => break,
        }
    }
    // 50 arrived after 100 and was dropped.
    assert_eq!(seen, vec![100, 200]);
}

#[tokio::test]
async fn send_to_unknown_worker_is_unreachable() {
    let (bridge, _events, _addr, _stop) = bridge_with(BridgeConfig::default()).await;
    match bridge.send_command("ghost", CommandKind::Arm, None).await {
        Err(FleetError::PeerUnreachable(worker)) => assert_eq!(worker, "ghost"),
        other => panic!("expected PeerUnreachable, got {:?}", other),
    }
}

#[tokio::test]
async fn saturated_queue_reports_backlogged() {
    let config = BridgeConfig {
        ack_timeout: Duration::from_secs(5),
        max_retries: 3,
        queue_capacity: 2,
    };
    let (bridge, _events, addr, _stop) = bridge_with(config).await;
    // Connect but never read: once the socket buffer is full the writer
    // task stalls and the bounded queue overflows.
    let _worker = FakeWorker::connect(&addr, "w1").await;
    wait_for_link(&bridge, "w1").await;

    let mut mission = fleet_model::Mission::new(
        "big".into(),
        fleet_model::MissionKind::SingleWorker,
        fleet_model::MissionPayload::default(),
        5,
        1,
        0,
    );
    mission.assigned = vec!["w1".into()];
    mission.payload.params.insert("blob".into(), "x".repeat(256 * 1024));

    let mut backlogged = false;
    for index in 0..64 {
        match bridge.send_mission("w1", &mission, index).await {
            Ok(_) => continue,
            Err(FleetError::Backlogged { worker }) => {
                assert_eq!(worker, "w1");
                backlogged = true;
                break;
            }
            Err(other) => panic!("unexpected error {:?}", other),
        }
    }
    assert!(backlogged, "queue should overflow into Backlogged");
}
