// SPDX-License-Identifier: MIT

use crate::{Discovery, MembershipEvent, Replica};
use fleet_model::FleetConfig;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::broadcast;

/// Fixed membership from configuration. Never emits watch events after
/// the initial set.
pub struct StaticDiscovery {
    members: Vec<Replica>,
    events: broadcast::Sender<MembershipEvent>,
}

impl StaticDiscovery {
    pub fn new(members: Vec<Replica>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self { members, events }
    }

    pub fn from_config(cfg: &FleetConfig) -> Self {
        Self::new(
            cfg.peers
                .iter()
                .map(|p| Replica { node_id: p.node_id, address: p.address.clone() })
                .collect(),
        )
    }
}

impl Discovery for StaticDiscovery {
    fn members(&self) -> Pin<Box<dyn Future<Output = Vec<Replica>> + Send + '_>> {
        let members = self.members.clone();
        Box::pin(async move { members })
    }

    fn watch(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }
}
