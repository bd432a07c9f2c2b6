// SPDX-License-Identifier: MIT

use crate::snapshot::{Snapshot, SnapshotStore};
use crate::wal::{LogEntry, Wal};
use fleet_model::{FleetConfig, FleetError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, Mutex, Notify, RwLock};
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

// --- RPC MESSAGES ---

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum RaftMessage {
    RequestVote {
        term: u64,
        candidate_id: u64,
        last_log_index: u64,
        last_log_term: u64,
    },
    RequestVoteResponse {
        term: u64,
        vote_granted: bool,
    },
    AppendEntries {
        term: u64,
        leader_id: u64,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    },
    AppendEntriesResponse {
        term: u64,
        success: bool,
        match_index: u64,
        conflict_index: u64,
    },
    InstallSnapshot {
        term: u64,
        leader_id: u64,
        last_included_index: u64,
        last_included_term: u64,
        data: Vec<u8>,
    },
    InstallSnapshotResponse {
        term: u64,
        match_index: u64,
    },
}

impl RaftMessage {
    pub fn term(&self) -> u64 {
        match self {
            RaftMessage::RequestVote { term, .. }
            | RaftMessage::RequestVoteResponse { term, .. }
            | RaftMessage::AppendEntries { term, .. }
            | RaftMessage::AppendEntriesResponse { term, .. }
            | RaftMessage::InstallSnapshot { term, .. }
            | RaftMessage::InstallSnapshotResponse { term, .. } => *term,
        }
    }
}

// --- CONFIG & STATE MACHINE ---

#[derive(Clone, Debug)]
pub struct RaftConfig {
    pub id: u64,
    /// Peer node ids, self excluded.
    pub peers: Vec<u64>,
    pub data_dir: PathBuf,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub snapshot_threshold: u64,
}

impl RaftConfig {
    pub fn from_fleet(cfg: &FleetConfig) -> Self {
        Self {
            id: cfg.node_id,
            peers: cfg.peers.iter().map(|p| p.node_id).filter(|id| *id != cfg.node_id).collect(),
            data_dir: cfg.data_dir.clone(),
            election_timeout_min_ms: cfg.election_timeout_min_ms,
            election_timeout_max_ms: cfg.election_timeout_max_ms,
            heartbeat_interval_ms: cfg.heartbeat_interval_ms,
            snapshot_threshold: cfg.snapshot_threshold,
        }
    }

    fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    fn majority(&self) -> usize {
        self.cluster_size() / 2 + 1
    }
}

/// The replicated state machine sink. `apply` is invoked in strict log
/// order on every replica and must be deterministic and CPU-only; it is
/// the only place authoritative state mutates. A rejection is itself a
/// deterministic outcome: the entry stays committed, the state does not
/// change, and the submitting caller receives the error.
pub trait StateMachine: Send + Sync + 'static {
    fn apply(&self, index: u64, command: &[u8]) -> Result<(), FleetError>;
    fn snapshot(&self) -> Vec<u8>;
    fn restore(&self, data: &[u8]);
}

// --- CORE ---

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

struct Volatile {
    role: Role,
    commit_index: u64,
    last_applied: u64,
    leader_id: Option<u64>,
    election_deadline: Instant,
    votes_received: HashSet<u64>,
}

struct LeaderState {
    next_index: HashMap<u64, u64>,
    match_index: HashMap<u64, u64>,
}

#[derive(Debug, Clone)]
pub struct RaftStatus {
    pub id: u64,
    pub role: Role,
    pub term: u64,
    pub leader_id: Option<u64>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
}

pub struct RaftNode {
    config: RaftConfig,
    wal: Mutex<Wal>,
    snapshots: SnapshotStore,
    sm: Arc<dyn StateMachine>,
    volatile: RwLock<Volatile>,
    leader_state: Mutex<Option<LeaderState>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<u64, FleetError>>>>,
    outbox: mpsc::Sender<(u64, RaftMessage)>,
    apply_notify: Notify,
    shutdown: watch::Receiver<bool>,
}

impl RaftNode {
    /// Opens the WAL, restores the newest snapshot into the state
    /// machine and spawns the tick and apply loops.
    pub async fn start(
        config: RaftConfig,
        sm: Arc<dyn StateMachine>,
        outbox: mpsc::Sender<(u64, RaftMessage)>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Arc<Self>, FleetError> {
        let mut wal = Wal::open(&config.data_dir)?;
        let snapshots = SnapshotStore::open(&config.data_dir.join("snapshots"))?;

        let mut floor = 0;
        if let Some(snapshot) = snapshots.latest()? {
            sm.restore(&snapshot.data);
            floor = snapshot.last_included_index;
            let (wal_floor, _) = wal.last_included();
            if wal_floor < snapshot.last_included_index {
                wal.reset_to_snapshot(snapshot.last_included_index, snapshot.last_included_term)?;
            }
            info!(
                "[Raft] Node {} restored snapshot at index {}",
                config.id, snapshot.last_included_index
            );
        }

        let hs = wal.hard_state();
        info!(
            "[Raft] Node {} recovered: term {}, last index {}",
            config.id,
            hs.current_term,
            wal.last_index()
        );

        let node = Arc::new(Self {
            volatile: RwLock::new(Volatile {
                role: Role::Follower,
                commit_index: floor,
                last_applied: floor,
                leader_id: None,
                election_deadline: Instant::now() + config.election_window(),
                votes_received: HashSet::new(),
            }),
            wal: Mutex::new(wal),
            snapshots,
            sm,
            leader_state: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            outbox,
            apply_notify: Notify::new(),
            shutdown,
            config,
        });

        let ticker = node.clone();
        tokio::spawn(async move { ticker.run_tick_loop().await });
        let applier = node.clone();
        tokio::spawn(async move { applier.run_apply_loop().await });

        Ok(node)
    }

    // --- PUBLIC CONTRACT ---

    /// Replicate `command` and resolve with its log index once committed.
    /// Fails fast with `NotLeader` on a follower and fails in flight if
    /// leadership is lost before commit.
    pub async fn submit(&self, command: Vec<u8>) -> Result<u64, FleetError> {
        if *self.shutdown.borrow() {
            return Err(FleetError::ShuttingDown);
        }

        let rx = {
            let v = self.volatile.read().await;
            if v.role != Role::Leader {
                return Err(FleetError::NotLeader {
                    hint: v.leader_id.map(|id| id.to_string()),
                });
            }
            drop(v);

            // The pending slot is registered before the wal lock is
            // released so a concurrent heartbeat cannot commit the entry
            // ahead of the registration.
            let mut wal = self.wal.lock().await;
            let term = wal.hard_state().current_term;
            let index = wal.append(LogEntry { term, command })?;
            let (tx, rx) = oneshot::channel();
            self.pending.lock().await.insert(index, tx);
            drop(wal);
            rx
        };

        self.broadcast_entries().await;
        // A singleton ensemble commits on its own append.
        self.maybe_advance_commit().await;

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(FleetError::ShuttingDown),
        }
    }

    pub async fn is_leader(&self) -> bool {
        self.volatile.read().await.role == Role::Leader
    }

    /// Last known leader, for NotLeader redirects.
    pub async fn leader_hint(&self) -> Option<u64> {
        self.volatile.read().await.leader_id
    }

    pub async fn status(&self) -> RaftStatus {
        let v = self.volatile.read().await;
        let wal = self.wal.lock().await;
        RaftStatus {
            id: self.config.id,
            role: v.role,
            term: wal.hard_state().current_term,
            leader_id: v.leader_id,
            commit_index: v.commit_index,
            last_applied: v.last_applied,
            last_log_index: wal.last_index(),
        }
    }

    // --- EVENT LOOPS ---

    async fn run_tick_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        let mut last_heartbeat = Instant::now();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(10)) => {}
                _ = shutdown.changed() => {
                    self.fail_pending(FleetError::ShuttingDown).await;
                    return;
                }
            }

            let role = {
                let v = self.volatile.read().await;
                v.role
            };

            match role {
                Role::Follower | Role::Candidate => {
                    let deadline = self.volatile.read().await.election_deadline;
                    if Instant::now() >= deadline {
                        self.start_election().await;
                    }
                }
                Role::Leader => {
                    if last_heartbeat.elapsed()
                        >= Duration::from_millis(self.config.heartbeat_interval_ms)
                    {
                        last_heartbeat = Instant::now();
                        self.broadcast_entries().await;
                    }
                }
            }
        }
    }

    async fn run_apply_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = self.apply_notify.notified() => {}
                _ = shutdown.changed() => return,
            }

            loop {
                // The write lock is held across the apply so a snapshot
                // install cannot swap the state out from under a
                // half-applied entry.
                let mut v = self.volatile.write().await;
                if v.last_applied >= v.commit_index {
                    break;
                }
                let next = v.last_applied + 1;
                let fetched = self.wal.lock().await.get(next).cloned();
                match fetched {
                    Some(entry) => {
                        let outcome = self.sm.apply(next, &entry.command);
                        v.last_applied = next;
                        drop(v);
                        self.resolve_pending(next, outcome).await;
                    }
                    // Compacted past the apply cursor; snapshot restore
                    // already covered it.
                    None => {
                        v.last_applied = next;
                    }
                }
            }

            if let Err(e) = self.maybe_snapshot().await {
                error!("[Raft] Snapshot failed: {}", e);
            }
        }
    }

    async fn maybe_snapshot(&self) -> Result<(), FleetError> {
        // Held across the state capture so an incoming InstallSnapshot
        // cannot relabel what is being serialized.
        let v = self.volatile.read().await;
        let last_applied = v.last_applied;
        let mut wal = self.wal.lock().await;
        if (wal.len() as u64) < self.config.snapshot_threshold {
            return Ok(());
        }
        let Some(term) = wal.term_at(last_applied) else {
            return Ok(());
        };
        if last_applied < wal.first_index() {
            return Ok(());
        }
        let data = self.sm.snapshot();
        self.snapshots.save(&Snapshot {
            last_included_index: last_applied,
            last_included_term: term,
            data,
        })?;
        wal.compact_through(last_applied, term)?;
        info!(
            "[Raft] Node {} compacted log through {}",
            self.config.id, last_applied
        );
        Ok(())
    }

    // --- ELECTION ---

    async fn start_election(&self) {
        let (term, last_log_index, last_log_term) = {
            let mut v = self.volatile.write().await;
            let mut wal = self.wal.lock().await;
            let term = wal.hard_state().current_term + 1;
            if let Err(e) = wal.save_hard_state(term, Some(self.config.id)) {
                error!("[Raft] Persist failed, halting elections: {}", e);
                return;
            }
            v.role = Role::Candidate;
            v.leader_id = None;
            v.votes_received.clear();
            v.votes_received.insert(self.config.id);
            v.election_deadline = Instant::now() + self.config.election_window();
            let (idx, t) = wal.last_log_info();
            (term, idx, t)
        };

        info!("[Raft] Node {} starting election for term {}", self.config.id, term);

        if self.config.peers.is_empty() {
            self.try_become_leader(term).await;
            return;
        }

        for peer in &self.config.peers {
            self.send(
                *peer,
                RaftMessage::RequestVote {
                    term,
                    candidate_id: self.config.id,
                    last_log_index,
                    last_log_term,
                },
            )
            .await;
        }
    }

    async fn try_become_leader(&self, term: u64) {
        {
            let mut v = self.volatile.write().await;
            if v.role != Role::Candidate && !self.config.peers.is_empty() {
                return;
            }
            if v.votes_received.len() < self.config.majority() {
                return;
            }
            info!("[Raft] Node {} elected leader for term {}", self.config.id, term);
            v.role = Role::Leader;
            v.leader_id = Some(self.config.id);
        }

        let last_index = self.wal.lock().await.last_index();
        let mut next_index = HashMap::new();
        let mut match_index = HashMap::new();
        for peer in &self.config.peers {
            next_index.insert(*peer, last_index + 1);
            match_index.insert(*peer, 0);
        }
        *self.leader_state.lock().await = Some(LeaderState { next_index, match_index });

        // Empty append establishes authority and resets peer timers.
        self.broadcast_entries().await;
        self.maybe_advance_commit().await;
    }

    // --- REPLICATION ---

    async fn broadcast_entries(&self) {
        let is_leader = {
            let v = self.volatile.read().await;
            v.role == Role::Leader
        };
        if !is_leader {
            return;
        }

        for peer in self.config.peers.clone() {
            let message = self.build_replication_message(peer).await;
            if let Some(msg) = message {
                self.send(peer, msg).await;
            }
        }
    }

    async fn build_replication_message(&self, peer: u64) -> Option<RaftMessage> {
        let commit_index = self.volatile.read().await.commit_index;
        let wal = self.wal.lock().await;
        let hs = wal.hard_state();
        let next = {
            let ls = self.leader_state.lock().await;
            let ls = ls.as_ref()?;
            *ls.next_index.get(&peer).unwrap_or(&(wal.last_index() + 1))
        };

        if next < wal.first_index() {
            // The peer is behind our compaction floor: ship state.
            drop(wal);
            let snapshot = match self.snapshots.latest() {
                Ok(Some(s)) => s,
                Ok(None) => {
                    warn!("[Raft] Peer {} lags but no snapshot exists", peer);
                    return None;
                }
                Err(e) => {
                    error!("[Raft] Snapshot load failed: {}", e);
                    return None;
                }
            };
            return Some(RaftMessage::InstallSnapshot {
                term: hs.current_term,
                leader_id: self.config.id,
                last_included_index: snapshot.last_included_index,
                last_included_term: snapshot.last_included_term,
                data: snapshot.data,
            });
        }

        let prev_log_index = next - 1;
        let prev_log_term = wal.term_at(prev_log_index).unwrap_or(0);
        Some(RaftMessage::AppendEntries {
            term: hs.current_term,
            leader_id: self.config.id,
            prev_log_index,
            prev_log_term,
            entries: wal.entries_from(next),
            leader_commit: commit_index,
        })
    }

    async fn maybe_advance_commit(&self) {
        // Lock order everywhere: volatile, then wal, then leader_state.
        let new_commit = {
            let v = self.volatile.read().await;
            if v.role != Role::Leader {
                return;
            }
            let wal = self.wal.lock().await;
            let current_term = wal.hard_state().current_term;
            let ls = self.leader_state.lock().await;

            let mut indices: Vec<u64> = ls
                .as_ref()
                .map(|l| l.match_index.values().copied().collect())
                .unwrap_or_default();
            indices.push(wal.last_index());
            indices.sort_unstable_by(|a, b| b.cmp(a));

            let candidate = indices.get(self.config.majority() - 1).copied().unwrap_or(0);
            // Entries from earlier terms are never counted directly.
            if candidate > v.commit_index && wal.term_at(candidate) == Some(current_term) {
                Some(candidate)
            } else {
                None
            }
        };

        if let Some(commit) = new_commit {
            {
                let mut v = self.volatile.write().await;
                if commit <= v.commit_index {
                    return;
                }
                v.commit_index = commit;
            }
            debug!("[Raft] Node {} commit index -> {}", self.config.id, commit);
            self.apply_notify.notify_one();
        }
    }

    /// Completes the Submit future for `index` with the apply outcome.
    /// Runs after commit, so a resolved submission is always durable.
    async fn resolve_pending(&self, index: u64, outcome: Result<(), FleetError>) {
        let tx = self.pending.lock().await.remove(&index);
        if let Some(tx) = tx {
            let _ = tx.send(outcome.map(|_| index));
        }
    }

    async fn fail_pending(&self, error: FleetError) {
        let mut pending = self.pending.lock().await;
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(error.clone()));
        }
    }

    // --- MESSAGE HANDLING ---

    /// Processes one inbound message. Requests produce `Some(response)`;
    /// responses are absorbed and produce `None`.
    pub async fn handle_message(&self, from: u64, msg: RaftMessage) -> Option<RaftMessage> {
        let msg_term = msg.term();
        {
            let current = self.wal.lock().await.hard_state().current_term;
            if msg_term > current {
                self.step_down(msg_term).await;
            }
        }

        match msg {
            RaftMessage::RequestVote { term, candidate_id, last_log_index, last_log_term } => {
                Some(self.handle_request_vote(term, candidate_id, last_log_index, last_log_term).await)
            }
            RaftMessage::RequestVoteResponse { term, vote_granted } => {
                self.handle_vote_response(from, term, vote_granted).await;
                None
            }
            RaftMessage::AppendEntries {
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => Some(
                self.handle_append_entries(
                    term,
                    leader_id,
                    prev_log_index,
                    prev_log_term,
                    entries,
                    leader_commit,
                )
                .await,
            ),
            RaftMessage::AppendEntriesResponse { term, success, match_index, conflict_index } => {
                self.handle_append_response(from, term, success, match_index, conflict_index).await;
                None
            }
            RaftMessage::InstallSnapshot {
                term,
                leader_id,
                last_included_index,
                last_included_term,
                data,
            } => Some(
                self.handle_install_snapshot(
                    term,
                    leader_id,
                    last_included_index,
                    last_included_term,
                    data,
                )
                .await,
            ),
            RaftMessage::InstallSnapshotResponse { term, match_index } => {
                self.handle_append_response(from, term, true, match_index, 0).await;
                None
            }
        }
    }

    async fn step_down(&self, term: u64) {
        info!("[Raft] Node {} saw term {}, stepping down", self.config.id, term);
        {
            let mut v = self.volatile.write().await;
            let mut wal = self.wal.lock().await;
            if let Err(e) = wal.save_hard_state(term, None) {
                error!("[Raft] Persist failed during step-down: {}", e);
            }
            let was_leader = v.role == Role::Leader;
            v.role = Role::Follower;
            v.leader_id = None;
            v.votes_received.clear();
            v.election_deadline = Instant::now() + self.config.election_window();
            if was_leader {
                *self.leader_state.lock().await = None;
            }
        }
        self.fail_pending(FleetError::NotLeader { hint: None }).await;
    }

    async fn handle_request_vote(
        &self,
        term: u64,
        candidate_id: u64,
        last_log_index: u64,
        last_log_term: u64,
    ) -> RaftMessage {
        let mut v = self.volatile.write().await;
        let mut wal = self.wal.lock().await;
        let hs = wal.hard_state();

        let (my_last_index, my_last_term) = wal.last_log_info();
        let log_ok = last_log_term > my_last_term
            || (last_log_term == my_last_term && last_log_index >= my_last_index);

        let grant = term >= hs.current_term
            && (hs.voted_for.is_none() || hs.voted_for == Some(candidate_id))
            && log_ok;

        if grant {
            // The grant is durable before the response leaves this node.
            if let Err(e) = wal.save_hard_state(hs.current_term, Some(candidate_id)) {
                error!("[Raft] Persist failed, refusing vote: {}", e);
                return RaftMessage::RequestVoteResponse {
                    term: hs.current_term,
                    vote_granted: false,
                };
            }
            v.election_deadline = Instant::now() + self.config.election_window();
        }

        debug!(
            "[Raft] Node {} vote request from {} (term {}): granted={}",
            self.config.id, candidate_id, term, grant
        );
        RaftMessage::RequestVoteResponse { term: hs.current_term, vote_granted: grant }
    }

    async fn handle_vote_response(&self, from: u64, term: u64, vote_granted: bool) {
        let ready = {
            let mut v = self.volatile.write().await;
            let wal = self.wal.lock().await;
            let current = wal.hard_state().current_term;
            if v.role != Role::Candidate || term != current || !vote_granted {
                return;
            }
            v.votes_received.insert(from);
            v.votes_received.len() >= self.config.majority()
        };
        if ready {
            let term = self.wal.lock().await.hard_state().current_term;
            self.try_become_leader(term).await;
        }
    }

    async fn handle_append_entries(
        &self,
        term: u64,
        leader_id: u64,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    ) -> RaftMessage {
        let mut v = self.volatile.write().await;
        let mut wal = self.wal.lock().await;
        let hs = wal.hard_state();

        if term < hs.current_term {
            return RaftMessage::AppendEntriesResponse {
                term: hs.current_term,
                success: false,
                match_index: 0,
                conflict_index: 0,
            };
        }

        v.role = Role::Follower;
        v.leader_id = Some(leader_id);
        v.election_deadline = Instant::now() + self.config.election_window();

        let floor = wal.last_included().0;

        // Consistency check against the previous entry.
        if prev_log_index > floor {
            match wal.term_at(prev_log_index) {
                Some(t) if t == prev_log_term => {}
                Some(_) => {
                    // Walk back to the start of the conflicting term so
                    // the leader can skip it in one round trip.
                    let conflict_term = wal.term_at(prev_log_index).unwrap_or(0);
                    let mut conflict_index = prev_log_index;
                    while conflict_index > wal.first_index()
                        && wal.term_at(conflict_index - 1) == Some(conflict_term)
                    {
                        conflict_index -= 1;
                    }
                    return RaftMessage::AppendEntriesResponse {
                        term: hs.current_term,
                        success: false,
                        match_index: 0,
                        conflict_index,
                    };
                }
                None => {
                    return RaftMessage::AppendEntriesResponse {
                        term: hs.current_term,
                        success: false,
                        match_index: 0,
                        conflict_index: wal.last_index() + 1,
                    };
                }
            }
        }

        let mut append_failed = false;
        for (offset, entry) in entries.iter().enumerate() {
            let index = prev_log_index + 1 + offset as u64;
            if index <= floor {
                continue;
            }
            match wal.term_at(index) {
                Some(existing) if existing == entry.term => {}
                Some(_) => {
                    if wal.truncate_from(index).is_err() || wal.append(entry.clone()).is_err() {
                        append_failed = true;
                        break;
                    }
                }
                None => {
                    if wal.append(entry.clone()).is_err() {
                        append_failed = true;
                        break;
                    }
                }
            }
        }
        if append_failed {
            error!("[Raft] Node {} failed to persist entries", self.config.id);
            return RaftMessage::AppendEntriesResponse {
                term: hs.current_term,
                success: false,
                match_index: 0,
                conflict_index: 0,
            };
        }

        // Only entries this exchange verified may be considered
        // committed; a retained suffix beyond them is still unproven.
        let last_new_index = prev_log_index + entries.len() as u64;
        let verified_commit = std::cmp::min(leader_commit, last_new_index);
        if verified_commit > v.commit_index {
            v.commit_index = verified_commit;
            self.apply_notify.notify_one();
        }

        RaftMessage::AppendEntriesResponse {
            term: hs.current_term,
            success: true,
            match_index: last_new_index.max(wal.last_included().0),
            conflict_index: 0,
        }
    }

    async fn handle_append_response(
        &self,
        from: u64,
        term: u64,
        success: bool,
        match_index: u64,
        conflict_index: u64,
    ) {
        let advance = {
            let v = self.volatile.read().await;
            let wal = self.wal.lock().await;
            if v.role != Role::Leader || term != wal.hard_state().current_term {
                return;
            }
            drop(wal);
            drop(v);

            let mut ls_guard = self.leader_state.lock().await;
            let Some(ls) = ls_guard.as_mut() else { return };
            if success {
                let entry = ls.match_index.entry(from).or_insert(0);
                *entry = (*entry).max(match_index);
                ls.next_index.insert(from, match_index + 1);
                true
            } else {
                let next = ls.next_index.entry(from).or_insert(1);
                *next = if conflict_index > 0 {
                    conflict_index
                } else {
                    next.saturating_sub(1).max(1)
                };
                false
            }
        };

        if advance {
            self.maybe_advance_commit().await;
        }
    }

    async fn handle_install_snapshot(
        &self,
        term: u64,
        leader_id: u64,
        last_included_index: u64,
        last_included_term: u64,
        data: Vec<u8>,
    ) -> RaftMessage {
        let mut v = self.volatile.write().await;
        let mut wal = self.wal.lock().await;
        let hs = wal.hard_state();

        if term < hs.current_term {
            return RaftMessage::InstallSnapshotResponse { term: hs.current_term, match_index: 0 };
        }

        v.role = Role::Follower;
        v.leader_id = Some(leader_id);
        v.election_deadline = Instant::now() + self.config.election_window();

        if last_included_index <= v.last_applied {
            // Stale snapshot; our state already covers it.
            return RaftMessage::InstallSnapshotResponse {
                term: hs.current_term,
                match_index: v.last_applied,
            };
        }

        info!(
            "[Raft] Node {} installing snapshot at index {}",
            self.config.id, last_included_index
        );

        let snapshot = Snapshot { last_included_index, last_included_term, data };
        if let Err(e) = self.snapshots.save(&snapshot) {
            error!("[Raft] Snapshot persist failed: {}", e);
            return RaftMessage::InstallSnapshotResponse { term: hs.current_term, match_index: 0 };
        }
        self.sm.restore(&snapshot.data);
        if let Err(e) = wal.reset_to_snapshot(last_included_index, last_included_term) {
            error!("[Raft] Log reset failed: {}", e);
            return RaftMessage::InstallSnapshotResponse { term: hs.current_term, match_index: 0 };
        }
        v.commit_index = last_included_index;
        v.last_applied = last_included_index;

        RaftMessage::InstallSnapshotResponse {
            term: hs.current_term,
            match_index: last_included_index,
        }
    }

    async fn send(&self, peer: u64, msg: RaftMessage) {
        // Raft tolerates dropped messages; never block a handler on a
        // saturated outbox.
        if let Err(e) = self.outbox.try_send((peer, msg)) {
            debug!("[Raft] Outbox full, dropping message to {}: {}", peer, e);
        }
    }
}

impl RaftConfig {
    fn election_window(&self) -> Duration {
        let ms = rand::thread_rng()
            .gen_range(self.election_timeout_min_ms..=self.election_timeout_max_ms);
        Duration::from_millis(ms)
    }
}
