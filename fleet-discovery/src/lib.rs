// SPDX-License-Identifier: MIT

mod health;
mod kv;
mod static_backend;

pub use health::{HealthChecker, HealthState, PeerHealth, Probe};
pub use kv::{KvDiscovery, KvStore, MemoryKv};
pub use static_backend::StaticDiscovery;

use fleet_model::{FleetConfig, FleetError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::broadcast;

/// One member of the control-plane ensemble as discovery sees it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Replica {
    pub node_id: u64,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    Added(Replica),
    Removed(u64),
}

/// Membership oracle for the replica ensemble. Backends differ in where
/// the list comes from; consumers only see members and change events.
pub trait Discovery: Send + Sync {
    fn members(&self) -> Pin<Box<dyn Future<Output = Vec<Replica>> + Send + '_>>;
    fn watch(&self) -> broadcast::Receiver<MembershipEvent>;
}

type BackendFactory =
    Arc<dyn Fn(&FleetConfig) -> Result<Arc<dyn Discovery>, FleetError> + Send + Sync>;

/// String-tag to factory mapping. The daemon asks for
/// `config.discovery_backend`; tests register their own backends.
pub struct BackendRegistry {
    factories: HashMap<String, BackendFactory>,
}

impl BackendRegistry {
    /// Registry with the built-in backends. `consul` and `etcd` share the
    /// KV shape and need a concrete client injected; out of the box they
    /// are registered against the in-memory store so a single-process
    /// cluster still resolves.
    pub fn with_builtins() -> Self {
        let mut registry = Self { factories: HashMap::new() };
        registry.register("static", |cfg| {
            Ok(Arc::new(StaticDiscovery::from_config(cfg)) as Arc<dyn Discovery>)
        });
        registry.register("consul", |cfg| {
            let kv = Arc::new(KvDiscovery::new(Arc::new(MemoryKv::new()), cfg));
            kv.start();
            Ok(kv as Arc<dyn Discovery>)
        });
        registry.register("etcd", |cfg| {
            let kv = Arc::new(KvDiscovery::new(Arc::new(MemoryKv::new()), cfg));
            kv.start();
            Ok(kv as Arc<dyn Discovery>)
        });
        registry
    }

    pub fn register<F>(&mut self, tag: &str, factory: F)
    where
        F: Fn(&FleetConfig) -> Result<Arc<dyn Discovery>, FleetError> + Send + Sync + 'static,
    {
        self.factories.insert(tag.to_string(), Arc::new(factory));
    }

    pub fn build(&self, cfg: &FleetConfig) -> Result<Arc<dyn Discovery>, FleetError> {
        let factory = self.factories.get(&cfg.discovery_backend).ok_or_else(|| {
            FleetError::rejected(format!("unknown discovery backend '{}'", cfg.discovery_backend))
        })?;
        factory(cfg)
    }
}
