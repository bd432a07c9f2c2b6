// SPDX-License-Identifier: MIT

use crate::{PeerTransport, RpcError};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

type Handler = Arc<dyn Fn(Vec<u8>) -> Vec<u8> + Send + Sync>;

#[derive(Default)]
struct Faults {
    /// Peers whose inbound calls are dropped entirely.
    partitioned: HashSet<String>,
    /// Fixed delay injected before each delivery.
    delay: Option<Duration>,
    /// Deliver each request twice before responding. Exercises
    /// idempotence of the receiving state machine.
    duplicate: bool,
}

/// In-memory transport for tests: peers are registered handler closures,
/// and the harness can drop, delay or duplicate traffic to exercise the
/// safety properties of the consensus layer without sockets.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    handlers: Arc<RwLock<HashMap<String, Handler>>>,
    faults: Arc<RwLock<Faults>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register<F>(&self, peer: &str, handler: F)
    where
        F: Fn(Vec<u8>) -> Vec<u8> + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .await
            .insert(peer.to_string(), Arc::new(handler));
    }

    pub async fn partition(&self, peers: &[&str]) {
        let mut faults = self.faults.write().await;
        for p in peers {
            faults.partitioned.insert(p.to_string());
        }
    }

    pub async fn heal(&self) {
        let mut faults = self.faults.write().await;
        faults.partitioned.clear();
        faults.delay = None;
        faults.duplicate = false;
    }

    pub async fn set_delay(&self, delay: Option<Duration>) {
        self.faults.write().await.delay = delay;
    }

    pub async fn set_duplicate(&self, duplicate: bool) {
        self.faults.write().await.duplicate = duplicate;
    }
}

impl PeerTransport for MemoryTransport {
    fn call<'a>(
        &'a self,
        peer: &'a str,
        request: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, RpcError>> + Send + 'a>> {
        Box::pin(async move {
            let (delay, dropped, duplicate) = {
                let faults = self.faults.read().await;
                (
                    faults.delay,
                    faults.partitioned.contains(peer),
                    faults.duplicate,
                )
            };
            if dropped {
                return Err(RpcError::network(format!("{} partitioned", peer)));
            }
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }
            let handler = self
                .handlers
                .read()
                .await
                .get(peer)
                .cloned()
                .ok_or_else(|| RpcError::network(format!("{} not registered", peer)))?;
            if duplicate {
                let _ = handler(request.to_vec());
            }
            Ok(handler(request.to_vec()))
        })
    }
}
