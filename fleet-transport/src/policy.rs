// SPDX-License-Identifier: MIT

use crate::{PeerTransport, RpcError, TransportStats};
use fleet_model::FleetConfig;
use rand::Rng;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::debug;

/// Shapes every outbound call: deadline, bounded attempts, multiplicative
/// backoff with jitter. Non-retriable classes fail the call on the first
/// attempt.
#[derive(Clone, Debug)]
pub struct CallPolicy {
    pub timeout: Duration,
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_factor: f64,
    /// Fractional jitter applied to each delay, e.g. 0.1 for +/-10%.
    pub jitter: f64,
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            max_attempts: 3,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_factor: 2.0,
            jitter: 0.1,
        }
    }
}

impl CallPolicy {
    pub fn from_config(cfg: &FleetConfig) -> Self {
        Self {
            timeout: Duration::from_millis(cfg.rpc_timeout_ms),
            max_attempts: cfg.rpc_max_retries.max(1),
            base_backoff: Duration::from_millis(cfg.rpc_backoff_base_ms),
            backoff_factor: cfg.rpc_backoff_factor,
            ..Default::default()
        }
    }

    pub async fn call(
        &self,
        transport: &dyn PeerTransport,
        stats: &TransportStats,
        peer: &str,
        request: &[u8],
    ) -> Result<Vec<u8>, RpcError> {
        let mut delay = self.base_backoff;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let start = Instant::now();

            let outcome = match timeout(self.timeout, transport.call(peer, request)).await {
                Ok(result) => result,
                Err(_) => Err(RpcError::timeout(format!(
                    "no response from {} within {:?}",
                    peer, self.timeout
                ))),
            };

            match outcome {
                Ok(response) => {
                    stats.record_success(peer, start.elapsed()).await;
                    return Ok(response);
                }
                Err(e) => {
                    stats.record_failure(peer, &e.to_string()).await;
                    if !e.is_retriable() || attempt >= self.max_attempts {
                        return Err(e);
                    }
                    debug!(
                        "[Transport] Call to {} failed (attempt {}/{}): {}",
                        peer, attempt, self.max_attempts, e
                    );
                    sleep(self.jittered(delay)).await;
                    delay = std::cmp::min(
                        Duration::from_secs_f64(delay.as_secs_f64() * self.backoff_factor),
                        self.max_backoff,
                    );
                }
            }
        }
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        Duration::from_secs_f64((delay.as_secs_f64() * (1.0 + spread)).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyTransport {
        calls: AtomicU32,
        fail_first: u32,
        class_retriable: bool,
    }

    impl PeerTransport for FlakyTransport {
        fn call<'a>(
            &'a self,
            _peer: &'a str,
            _request: &'a [u8],
        ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, RpcError>> + Send + 'a>> {
            Box::pin(async move {
                let n = self.calls.fetch_add(1, Ordering::SeqCst);
                if n < self.fail_first {
                    if self.class_retriable {
                        Err(RpcError::network("flaky"))
                    } else {
                        Err(RpcError::validation("bad request"))
                    }
                } else {
                    Ok(b"ok".to_vec())
                }
            })
        }
    }

    fn fast_policy() -> CallPolicy {
        CallPolicy {
            timeout: Duration::from_millis(200),
            max_attempts: 3,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            backoff_factor: 2.0,
            jitter: 0.0,
        }
    }

    #[tokio::test]
    async fn retries_until_success() {
        let t = FlakyTransport { calls: AtomicU32::new(0), fail_first: 2, class_retriable: true };
        let stats = TransportStats::new();
        let out = fast_policy().call(&t, &stats, "p1", b"hi").await.unwrap();
        assert_eq!(out, b"ok");
        assert_eq!(t.calls.load(Ordering::SeqCst), 3);
        let s = stats.peer("p1").await.unwrap();
        assert_eq!(s.success, 1);
        assert_eq!(s.failure, 2);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let t = FlakyTransport { calls: AtomicU32::new(0), fail_first: 10, class_retriable: true };
        let stats = TransportStats::new();
        let err = fast_policy().call(&t, &stats, "p1", b"hi").await.unwrap_err();
        assert!(err.is_retriable());
        assert_eq!(t.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_class_fails_immediately() {
        let t = FlakyTransport { calls: AtomicU32::new(0), fail_first: 10, class_retriable: false };
        let stats = TransportStats::new();
        let err = fast_policy().call(&t, &stats, "p1", b"hi").await.unwrap_err();
        assert!(!err.is_retriable());
        assert_eq!(t.calls.load(Ordering::SeqCst), 1);
    }
}
