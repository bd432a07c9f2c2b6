// SPDX-License-Identifier: MIT

use fleet_consensus::{RaftConfig, RaftMessage, RaftNode, StateMachine};
use fleet_model::FleetError;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{mpsc, watch, RwLock};

// --- TEST INFRASTRUCTURE ---

struct RecordingSm {
    applied: StdMutex<Vec<(u64, Vec<u8>)>>,
}

impl RecordingSm {
    fn new() -> Arc<Self> {
        Arc::new(Self { applied: StdMutex::new(Vec::new()) })
    }

    fn applied(&self) -> Vec<(u64, Vec<u8>)> {
        self.applied.lock().unwrap().clone()
    }

    fn commands(&self) -> Vec<Vec<u8>> {
        self.applied().into_iter().map(|(_, c)| c).collect()
    }
}

impl StateMachine for RecordingSm {
    fn apply(&self, index: u64, command: &[u8]) -> Result<(), FleetError> {
        self.applied.lock().unwrap().push((index, command.to_vec()));
        Ok(())
    }

    fn snapshot(&self) -> Vec<u8> {
        bincode::serialize(&*self.applied.lock().unwrap()).unwrap()
    }

    fn restore(&self, data: &[u8]) {
        *self.applied.lock().unwrap() = bincode::deserialize(data).unwrap();
    }
}

/// In-process ensemble: every node's outbox is pumped through a router
/// that can drop links to simulate partitions.
struct Cluster {
    nodes: HashMap<u64, Arc<RaftNode>>,
    sms: HashMap<u64, Arc<RecordingSm>>,
    drops: Arc<RwLock<HashSet<(u64, u64)>>>,
    _dirs: Vec<TempDir>,
    _shutdown_tx: watch::Sender<bool>,
}

impl Cluster {
    async fn start(ids: &[u64]) -> Self {
        Self::start_with(ids, 1024).await
    }

    async fn start_with(ids: &[u64], snapshot_threshold: u64) -> Self {
        let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let drops: Arc<RwLock<HashSet<(u64, u64)>>> = Arc::new(RwLock::new(HashSet::new()));
        let registry: Arc<RwLock<HashMap<u64, Arc<RaftNode>>>> =
            Arc::new(RwLock::new(HashMap::new()));

        let mut nodes = HashMap::new();
        let mut sms = HashMap::new();
        let mut dirs = Vec::new();

        for &id in ids {
            let dir = TempDir::new().unwrap();
            let config = RaftConfig {
                id,
                peers: ids.iter().copied().filter(|p| *p != id).collect(),
                data_dir: dir.path().to_path_buf(),
                election_timeout_min_ms: 150,
                election_timeout_max_ms: 300,
                heartbeat_interval_ms: 50,
                snapshot_threshold,
            };
            let sm = RecordingSm::new();
            let (tx, rx) = mpsc::channel::<(u64, RaftMessage)>(256);
            let node = RaftNode::start(config, sm.clone(), tx, shutdown_rx.clone())
                .await
                .expect("node start");

            registry.write().await.insert(id, node.clone());
            Self::spawn_pump(id, rx, registry.clone(), drops.clone());

            nodes.insert(id, node);
            sms.insert(id, sm);
            dirs.push(dir);
        }

        Self { nodes, sms, drops, _dirs: dirs, _shutdown_tx: shutdown_tx }
    }

    fn spawn_pump(
        from: u64,
        mut rx: mpsc::Receiver<(u64, RaftMessage)>,
        registry: Arc<RwLock<HashMap<u64, Arc<RaftNode>>>>,
        drops: Arc<RwLock<HashSet<(u64, u64)>>>,
    ) {
        tokio::spawn(async move {
            while let Some((to, msg)) = rx.recv().await {
                if drops.read().await.contains(&(from, to)) {
                    continue;
                }
                let target = registry.read().await.get(&to).cloned();
                let Some(target) = target else { continue };
                if let Some(response) = target.handle_message(from, msg).await {
                    if drops.read().await.contains(&(to, from)) {
                        continue;
                    }
                    let sender = registry.read().await.get(&from).cloned();
                    if let Some(sender) = sender {
                        let _ = sender.handle_message(to, response).await;
                    }
                }
            }
        });
    }

    async fn partition(&self, group_a: &[u64], group_b: &[u64]) {
        let mut drops = self.drops.write().await;
        for &a in group_a {
            for &b in group_b {
                drops.insert((a, b));
                drops.insert((b, a));
            }
        }
    }

    async fn heal(&self) {
        self.drops.write().await.clear();
    }

    async fn wait_for_leader(&self) -> u64 {
        for _ in 0..100 {
            for (id, node) in &self.nodes {
                if node.is_leader().await {
                    return *id;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("no leader elected");
    }

    async fn wait_for_leader_among(&self, ids: &[u64]) -> u64 {
        for _ in 0..100 {
            for id in ids {
                if self.nodes[id].is_leader().await {
                    return *id;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("no leader among {:?}", ids);
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(500)).await;
}

// --- TESTS ---

#[tokio::test]
async fn elects_single_leader_and_replicates() {
    let cluster = Cluster::start(&[1, 2, 3]).await;
    let leader = cluster.wait_for_leader().await;
    settle().await;

    // Exactly one leader.
    let mut count = 0;
    for node in cluster.nodes.values() {
        if node.is_leader().await {
            count += 1;
        }
    }
    assert_eq!(count, 1);

    let index = cluster.nodes[&leader].submit(b"alpha".to_vec()).await.unwrap();
    assert!(index >= 1);
    cluster.nodes[&leader].submit(b"beta".to_vec()).await.unwrap();
    settle().await;

    for (id, sm) in &cluster.sms {
        assert_eq!(sm.commands(), vec![b"alpha".to_vec(), b"beta".to_vec()], "node {}", id);
    }
}

#[tokio::test]
async fn applies_in_identical_order_on_all_replicas() {
    let cluster = Cluster::start(&[1, 2, 3]).await;
    let leader = cluster.wait_for_leader().await;

    for i in 0..20u8 {
        cluster.nodes[&leader].submit(vec![i]).await.unwrap();
    }
    settle().await;

    let reference = cluster.sms[&1].applied();
    assert_eq!(reference.len(), 20);
    for (id, sm) in &cluster.sms {
        assert_eq!(sm.applied(), reference, "node {} diverged", id);
    }
    // Indices are strictly increasing.
    for window in reference.windows(2) {
        assert!(window[0].0 < window[1].0);
    }
}

#[tokio::test]
async fn follower_rejects_submit_with_leader_hint() {
    let cluster = Cluster::start(&[1, 2, 3]).await;
    let leader = cluster.wait_for_leader().await;
    settle().await;

    let follower = cluster.nodes.keys().find(|id| **id != leader).copied().unwrap();
    match cluster.nodes[&follower].submit(b"nope".to_vec()).await {
        Err(FleetError::NotLeader { hint }) => {
            assert_eq!(hint, Some(leader.to_string()));
        }
        other => panic!("expected NotLeader, got {:?}", other),
    }
}

#[tokio::test]
async fn minority_leader_cannot_commit_majority_elects_new() {
    let cluster = Cluster::start(&[1, 2, 3, 4, 5]).await;
    let old_leader = cluster.wait_for_leader().await;

    cluster.nodes[&old_leader].submit(b"before".to_vec()).await.unwrap();
    settle().await;

    // Isolate the leader with one follower.
    let mut others: Vec<u64> = cluster.nodes.keys().copied().filter(|id| *id != old_leader).collect();
    others.sort_unstable();
    let minority_peer = others[0];
    let majority: Vec<u64> = others[1..].to_vec();
    cluster.partition(&[old_leader, minority_peer], &majority).await;

    // A write on the minority leader must not commit.
    let stranded = cluster.nodes[&old_leader].clone();
    let stranded_submit =
        tokio::spawn(async move { stranded.submit(b"stranded".to_vec()).await });

    let new_leader = cluster.wait_for_leader_among(&majority).await;
    let index = cluster.nodes[&new_leader].submit(b"after".to_vec()).await.unwrap();
    assert!(index >= 2);
    settle().await;

    for id in &majority {
        assert!(
            cluster.sms[id].commands().contains(&b"after".to_vec()),
            "node {} missing committed write",
            id
        );
        assert!(!cluster.sms[id].commands().contains(&b"stranded".to_vec()));
    }

    cluster.heal().await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    // The stranded submit resolved with an error, never a false commit.
    match stranded_submit.await.unwrap() {
        Ok(_) => panic!("minority write must not report commit"),
        Err(FleetError::NotLeader { .. }) | Err(FleetError::ShuttingDown) => {}
        Err(other) => panic!("unexpected error {:?}", other),
    }

    // After healing, every replica converged on the majority history.
    for (id, sm) in &cluster.sms {
        let commands = sm.commands();
        assert!(commands.contains(&b"after".to_vec()), "node {}", id);
        assert!(!commands.contains(&b"stranded".to_vec()), "node {}", id);
    }
}

#[tokio::test]
async fn log_prefixes_agree_at_every_index() {
    let cluster = Cluster::start(&[1, 2, 3]).await;
    let leader = cluster.wait_for_leader().await;
    for i in 0..10u8 {
        cluster.nodes[&leader].submit(vec![i, i]).await.unwrap();
    }
    settle().await;

    let by_index: Vec<HashMap<u64, Vec<u8>>> = cluster
        .sms
        .values()
        .map(|sm| sm.applied().into_iter().collect())
        .collect();
    for pair in by_index.windows(2) {
        for (index, command) in &pair[0] {
            if let Some(other) = pair[1].get(index) {
                assert_eq!(command, other, "divergent command at index {}", index);
            }
        }
    }
}

#[tokio::test]
async fn lagging_follower_catches_up_via_snapshot() {
    let cluster = Cluster::start_with(&[1, 2, 3], 8).await;
    let leader = cluster.wait_for_leader().await;
    settle().await;

    let laggard = cluster.nodes.keys().copied().find(|id| *id != leader).unwrap();
    let rest: Vec<u64> = cluster.nodes.keys().copied().filter(|id| *id != laggard).collect();
    cluster.partition(&[laggard], &rest).await;

    // Enough traffic to pass the snapshot threshold and compact.
    for i in 0..30u8 {
        cluster.nodes[&leader].submit(vec![i]).await.unwrap();
    }
    settle().await;

    let leader_status = cluster.nodes[&leader].status().await;
    assert!(leader_status.commit_index >= 30);

    cluster.heal().await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    let caught_up = cluster.sms[&laggard].applied();
    let reference = cluster.sms[&leader].applied();
    assert_eq!(
        caught_up.last(),
        reference.last(),
        "laggard should converge to the leader's state"
    );
    let status = cluster.nodes[&laggard].status().await;
    assert!(status.last_applied >= 30);
}

#[tokio::test]
async fn single_node_ensemble_commits_immediately() {
    let cluster = Cluster::start(&[7]).await;
    let leader = cluster.wait_for_leader().await;
    assert_eq!(leader, 7);
    let index = cluster.nodes[&7].submit(b"solo".to_vec()).await.unwrap();
    assert_eq!(index, 1);
    settle().await;
    assert_eq!(cluster.sms[&7].commands(), vec![b"solo".to_vec()]);
}
