// SPDX-License-Identifier: MIT

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Default)]
pub struct PeerStats {
    pub success: u64,
    pub failure: u64,
    pub total_latency: Duration,
    pub last_error: Option<String>,
}

impl PeerStats {
    pub fn mean_latency(&self) -> Option<Duration> {
        if self.success == 0 {
            return None;
        }
        Some(self.total_latency / self.success as u32)
    }
}

/// Per-peer call accounting, shared by every sender task.
#[derive(Clone, Default)]
pub struct TransportStats {
    inner: Arc<RwLock<HashMap<String, PeerStats>>>,
}

impl TransportStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_success(&self, peer: &str, latency: Duration) {
        let mut map = self.inner.write().await;
        let entry = map.entry(peer.to_string()).or_default();
        entry.success += 1;
        entry.total_latency += latency;
    }

    pub async fn record_failure(&self, peer: &str, error: &str) {
        let mut map = self.inner.write().await;
        let entry = map.entry(peer.to_string()).or_default();
        entry.failure += 1;
        entry.last_error = Some(error.to_string());
    }

    pub async fn peer(&self, peer: &str) -> Option<PeerStats> {
        self.inner.read().await.get(peer).cloned()
    }

    pub async fn all(&self) -> HashMap<String, PeerStats> {
        self.inner.read().await.clone()
    }

    /// Peer with the best observed success ratio. Feeds the leader-hint
    /// fallback when no authoritative hint is known.
    pub async fn healthiest_peer(&self) -> Option<String> {
        let map = self.inner.read().await;
        map.iter()
            .filter(|(_, s)| s.success > 0)
            .max_by(|(_, a), (_, b)| {
                let ra = a.success as f64 / (a.success + a.failure) as f64;
                let rb = b.success as f64 / (b.success + b.failure) as f64;
                ra.total_cmp(&rb)
            })
            .map(|(peer, _)| peer.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_and_ranks() {
        let stats = TransportStats::new();
        stats.record_success("a", Duration::from_millis(10)).await;
        stats.record_success("a", Duration::from_millis(20)).await;
        stats.record_failure("a", "reset").await;
        stats.record_success("b", Duration::from_millis(5)).await;

        let a = stats.peer("a").await.unwrap();
        assert_eq!(a.success, 2);
        assert_eq!(a.failure, 1);
        assert_eq!(a.mean_latency(), Some(Duration::from_millis(15)));

        // b is 1/1, a is 2/3
        assert_eq!(stats.healthiest_peer().await.as_deref(), Some("b"));
    }
}
