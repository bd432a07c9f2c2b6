// SPDX-License-Identifier: MIT

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone)]
pub struct PeerHealth {
    pub state: HealthState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_check: Instant,
    pub latency: Duration,
}

/// Probe one peer. Ok means the peer answered; the checker owns the
/// thresholds.
pub trait Probe: Send + Sync {
    fn probe<'a>(
        &'a self,
        peer: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + 'a>>;
}

type TransitionCallback = Arc<dyn Fn(&str, HealthState, HealthState) + Send + Sync>;

/// Sliding health state per peer: `failure_threshold` consecutive
/// failures mark Unhealthy, `success_threshold` consecutive successes
/// mark Healthy again, anything in between is Degraded. Unhealthy peers
/// remain probed so they can recover.
pub struct HealthChecker {
    probe: Arc<dyn Probe>,
    statuses: Arc<RwLock<HashMap<String, PeerHealth>>>,
    check_interval: Duration,
    failure_threshold: u32,
    success_threshold: u32,
    on_transition: RwLock<Vec<TransitionCallback>>,
}

impl HealthChecker {
    pub fn new(
        probe: Arc<dyn Probe>,
        check_interval: Duration,
        failure_threshold: u32,
        success_threshold: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            probe,
            statuses: Arc::new(RwLock::new(HashMap::new())),
            check_interval,
            failure_threshold,
            success_threshold,
            on_transition: RwLock::new(Vec::new()),
        })
    }

    pub async fn on_transition<F>(&self, callback: F)
    where
        F: Fn(&str, HealthState, HealthState) + Send + Sync + 'static,
    {
        self.on_transition.write().await.push(Arc::new(callback));
    }

    /// Spawns the probe loop over `peers`.
    pub fn start(self: Arc<Self>, peers: Vec<String>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.check_interval);
            loop {
                ticker.tick().await;
                for peer in &peers {
                    self.check_peer(peer).await;
                }
            }
        });
    }

    pub async fn check_peer(&self, peer: &str) {
        let start = Instant::now();
        let result = self.probe.probe(peer).await;
        let latency = start.elapsed();

        let mut statuses = self.statuses.write().await;
        let entry = statuses.entry(peer.to_string()).or_insert(PeerHealth {
            state: HealthState::Healthy,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_check: start,
            latency,
        });
        let before = entry.state;

        match result {
            Ok(()) => {
                entry.consecutive_failures = 0;
                entry.consecutive_successes += 1;
                if entry.state != HealthState::Healthy
                    && entry.consecutive_successes >= self.success_threshold
                {
                    entry.state = HealthState::Healthy;
                }
            }
            Err(reason) => {
                entry.consecutive_successes = 0;
                entry.consecutive_failures += 1;
                debug!("[Health] Probe {} failed: {}", peer, reason);
                entry.state = if entry.consecutive_failures >= self.failure_threshold {
                    HealthState::Unhealthy
                } else {
                    HealthState::Degraded
                };
            }
        }
        entry.last_check = start;
        entry.latency = latency;
        let after = entry.state;
        drop(statuses);

        if before != after {
            info!("[Health] {} {:?} -> {:?}", peer, before, after);
            for callback in self.on_transition.read().await.iter() {
                callback(peer, before, after);
            }
        }
    }

    pub async fn state_of(&self, peer: &str) -> Option<HealthState> {
        self.statuses.read().await.get(peer).map(|h| h.state)
    }

    pub async fn snapshot(&self) -> HashMap<String, PeerHealth> {
        self.statuses.read().await.clone()
    }

    /// Peers ordered healthy-first. Unhealthy peers stay in the list so
    /// callers can still retry them toward recovery.
    pub async fn prioritized(&self, peers: &[String]) -> Vec<String> {
        let statuses = self.statuses.read().await;
        let mut ordered: Vec<(u8, String)> = peers
            .iter()
            .map(|p| {
                let rank = match statuses.get(p).map(|h| h.state) {
                    Some(HealthState::Healthy) | None => 0,
                    Some(HealthState::Degraded) => 1,
                    Some(HealthState::Unhealthy) => 2,
                };
                (rank, p.clone())
            })
            .collect();
        ordered.sort();
        ordered.into_iter().map(|(_, p)| p).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FlagProbe {
        up: AtomicBool,
    }

    impl Probe for FlagProbe {
        fn probe<'a>(
            &'a self,
            _peer: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + 'a>> {
            Box::pin(async move {
                if self.up.load(Ordering::SeqCst) {
                    Ok(())
                } else {
                    Err("down".into())
                }
            })
        }
    }

    fn checker(probe: Arc<FlagProbe>) -> Arc<HealthChecker> {
        HealthChecker::new(probe, Duration::from_millis(10), 3, 2)
    }

    #[tokio::test]
    async fn three_failures_mark_unhealthy_two_successes_recover() {
        let probe = Arc::new(FlagProbe { up: AtomicBool::new(false) });
        let hc = checker(probe.clone());

        hc.check_peer("n2").await;
        assert_eq!(hc.state_of("n2").await, Some(HealthState::Degraded));
        hc.check_peer("n2").await;
        hc.check_peer("n2").await;
        assert_eq!(hc.state_of("n2").await, Some(HealthState::Unhealthy));

        probe.up.store(true, Ordering::SeqCst);
        hc.check_peer("n2").await;
        assert_eq!(hc.state_of("n2").await, Some(HealthState::Unhealthy));
        hc.check_peer("n2").await;
        assert_eq!(hc.state_of("n2").await, Some(HealthState::Healthy));
    }

    #[tokio::test]
    async fn transition_callbacks_fire() {
        let probe = Arc::new(FlagProbe { up: AtomicBool::new(false) });
        let hc = checker(probe);
        let seen = Arc::new(RwLock::new(Vec::new()));
        let sink = seen.clone();
        hc.on_transition(move |peer, from, to| {
            let sink = sink.clone();
            let peer = peer.to_string();
            tokio::spawn(async move {
                sink.write().await.push((peer, from, to));
            });
        })
        .await;

        for _ in 0..3 {
            hc.check_peer("n3").await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        let seen = seen.read().await;
        assert!(seen
            .iter()
            .any(|(p, _, to)| p == "n3" && *to == HealthState::Unhealthy));
    }

    #[tokio::test]
    async fn unhealthy_peers_are_deprioritized_not_dropped() {
        let probe = Arc::new(FlagProbe { up: AtomicBool::new(false) });
        let hc = checker(probe);
        for _ in 0..3 {
            hc.check_peer("bad").await;
        }
        let ordered = hc.prioritized(&["bad".into(), "good".into()]).await;
        assert_eq!(ordered, vec!["good".to_string(), "bad".to_string()]);
    }
}
