// SPDX-License-Identifier: MIT

use crate::{Discovery, MembershipEvent, Replica};
use fleet_model::{FleetConfig, FleetError};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};

/// The narrow surface a Consul- or etcd-style backend has to provide:
/// list registrations under a prefix, and register self under a lease
/// that expires unless refreshed. The concrete client is injected; this
/// crate ships only the in-memory one.
pub trait KvStore: Send + Sync {
    fn list(&self) -> Pin<Box<dyn Future<Output = Result<Vec<Replica>, FleetError>> + Send + '_>>;
    fn register<'a>(
        &'a self,
        replica: &'a Replica,
        ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<(), FleetError>> + Send + 'a>>;
    fn deregister<'a>(
        &'a self,
        node_id: u64,
    ) -> Pin<Box<dyn Future<Output = Result<(), FleetError>> + Send + 'a>>;
}

/// Membership driven by a KV store with leases. A poll loop diffs the
/// listing against the cached view and emits Added/Removed events; a
/// refresh loop keeps our own lease alive.
pub struct KvDiscovery {
    store: Arc<dyn KvStore>,
    cache: Arc<RwLock<HashMap<u64, Replica>>>,
    events: broadcast::Sender<MembershipEvent>,
    poll_interval: Duration,
    lease_ttl: Duration,
    identity: Replica,
}

impl KvDiscovery {
    pub fn new(store: Arc<dyn KvStore>, cfg: &FleetConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            store,
            cache: Arc::new(RwLock::new(HashMap::new())),
            events,
            poll_interval: Duration::from_millis(cfg.health_check_interval_ms),
            lease_ttl: Duration::from_millis(cfg.health_check_interval_ms * 3),
            identity: Replica { node_id: cfg.node_id, address: cfg.bind_endpoint.clone() },
        }
    }

    /// Spawns the lease-refresh and poll loops.
    pub fn start(self: &Arc<Self>) {
        let me = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(me.poll_interval);
            loop {
                ticker.tick().await;
                if let Err(e) = me.store.register(&me.identity, me.lease_ttl).await {
                    warn!("[Discovery] Lease refresh failed: {}", e);
                }
                me.poll_once().await;
            }
        });
    }

    async fn poll_once(&self) {
        let listed = match self.store.list().await {
            Ok(list) => list,
            Err(e) => {
                warn!("[Discovery] List failed: {}", e);
                return;
            }
        };
        let mut cache = self.cache.write().await;
        let fresh: HashMap<u64, Replica> =
            listed.into_iter().map(|r| (r.node_id, r)).collect();

        for (id, replica) in &fresh {
            if !cache.contains_key(id) {
                debug!("[Discovery] Member joined: {} @ {}", id, replica.address);
                let _ = self.events.send(MembershipEvent::Added(replica.clone()));
            }
        }
        for id in cache.keys() {
            if !fresh.contains_key(id) {
                debug!("[Discovery] Member departed: {}", id);
                let _ = self.events.send(MembershipEvent::Removed(*id));
            }
        }
        *cache = fresh;
    }
}

impl Discovery for KvDiscovery {
    fn members(&self) -> Pin<Box<dyn Future<Output = Vec<Replica>> + Send + '_>> {
        Box::pin(async move { self.cache.read().await.values().cloned().collect() })
    }

    fn watch(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }
}

/// Lease-expiring in-memory KV. Stands in for consul/etcd in tests and
/// single-process clusters.
pub struct MemoryKv {
    entries: RwLock<HashMap<u64, (Replica, tokio::time::Instant)>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self { entries: RwLock::new(HashMap::new()) }
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore for MemoryKv {
    fn list(&self) -> Pin<Box<dyn Future<Output = Result<Vec<Replica>, FleetError>> + Send + '_>> {
        Box::pin(async move {
            let now = tokio::time::Instant::now();
            Ok(self
                .entries
                .read()
                .await
                .values()
                .filter(|(_, expires)| *expires > now)
                .map(|(r, _)| r.clone())
                .collect())
        })
    }

    fn register<'a>(
        &'a self,
        replica: &'a Replica,
        ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<(), FleetError>> + Send + 'a>> {
        Box::pin(async move {
            let expires = tokio::time::Instant::now() + ttl;
            self.entries
                .write()
                .await
                .insert(replica.node_id, (replica.clone(), expires));
            Ok(())
        })
    }

    fn deregister<'a>(
        &'a self,
        node_id: u64,
    ) -> Pin<Box<dyn Future<Output = Result<(), FleetError>> + Send + 'a>> {
        Box::pin(async move {
            self.entries.write().await.remove(&node_id);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> FleetConfig {
        FleetConfig {
            node_id: 1,
            bind_endpoint: "127.0.0.1:7401".into(),
            health_check_interval_ms: 20,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn diffs_emit_membership_events() {
        let kv = Arc::new(MemoryKv::new());
        let discovery = KvDiscovery::new(kv.clone(), &cfg());
        let mut watch = discovery.watch();

        let peer = Replica { node_id: 2, address: "b:2".into() };
        kv.register(&peer, Duration::from_secs(5)).await.unwrap();
        discovery.poll_once().await;
        assert_eq!(watch.recv().await.unwrap(), MembershipEvent::Added(peer.clone()));
        assert_eq!(discovery.members().await, vec![peer]);

        kv.deregister(2).await.unwrap();
        discovery.poll_once().await;
        assert_eq!(watch.recv().await.unwrap(), MembershipEvent::Removed(2));
        assert!(discovery.members().await.is_empty());
    }

    #[tokio::test]
    async fn expired_leases_drop_out() {
        let kv = Arc::new(MemoryKv::new());
        let peer = Replica { node_id: 3, address: "c:3".into() };
        kv.register(&peer, Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(kv.list().await.unwrap().is_empty());
    }
}
