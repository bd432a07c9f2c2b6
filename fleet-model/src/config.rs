// SPDX-License-Identifier: MIT

use crate::error::ErrorClass;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// The strictly typed configuration a replica boots with. Loaded from a
/// YAML file and overridable by CLI flags; every field has a serde
/// default so a minimal file only names identity and peers.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct FleetConfig {
    /// Unique identity of this replica in the ensemble.
    pub node_id: u64,

    /// host:port this replica binds for replica-to-replica RPC.
    pub bind_endpoint: String,

    /// Static topology known at startup.
    pub peers: Vec<PeerConfig>,

    /// Membership backend tag: "static", "consul" or "etcd".
    pub discovery_backend: String,

    /// host:port of the KV endpoint for consul/etcd backends.
    pub discovery_endpoint: String,

    /// host:port the downlink bridge listens on for worker connections.
    pub uplink_bind: String,

    /// Where the WAL and snapshots live.
    pub data_dir: PathBuf,

    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Log length that triggers a snapshot + compaction.
    pub snapshot_threshold: u64,

    pub worker_offline_threshold_ms: u64,
    pub worker_sweep_interval_ms: u64,

    pub rpc_timeout_ms: u64,
    pub rpc_max_retries: u32,
    pub rpc_backoff_base_ms: u64,
    pub rpc_backoff_factor: f64,

    pub health_check_interval_ms: u64,
    pub health_failure_threshold: u32,
    pub health_success_threshold: u32,

    pub retry_defaults: RetryConfig,

    pub scheduler_tick_ms: u64,
    pub downlink_ack_timeout_ms: u64,
    pub downlink_max_retries: u32,

    /// Grace window for task drain on shutdown.
    pub shutdown_grace_ms: u64,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            bind_endpoint: "127.0.0.1:7401".into(),
            peers: Vec::new(),
            discovery_backend: "static".into(),
            discovery_endpoint: String::new(),
            uplink_bind: "127.0.0.1:7501".into(),
            data_dir: PathBuf::from("./fleet-data"),
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 100,
            snapshot_threshold: 1024,
            worker_offline_threshold_ms: 30_000,
            worker_sweep_interval_ms: 5_000,
            rpc_timeout_ms: 2_000,
            rpc_max_retries: 3,
            rpc_backoff_base_ms: 100,
            rpc_backoff_factor: 2.0,
            health_check_interval_ms: 2_000,
            health_failure_threshold: 3,
            health_success_threshold: 2,
            retry_defaults: RetryConfig::default(),
            scheduler_tick_ms: 2_000,
            downlink_ack_timeout_ms: 5_000,
            downlink_max_retries: 3,
            shutdown_grace_ms: 5_000,
        }
    }
}

impl FleetConfig {
    /// Addresses of every peer, self excluded.
    pub fn peer_addresses(&self) -> Vec<(u64, String)> {
        self.peers
            .iter()
            .filter(|p| p.node_id != self.node_id)
            .map(|p| (p.node_id, p.address.clone()))
            .collect()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PeerConfig {
    pub node_id: u64,
    pub address: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    Immediate,
    Fixed { delay_ms: u64 },
    Exponential { base_ms: u64, cap_ms: u64 },
}

/// How one failure class is retried.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct RetryRule {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

/// Per-class retry table for mission failures.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub network: RetryRule,
    pub timeout: RetryRule,
    pub server: RetryRule,
    pub rate_limited: RetryRule,
    pub client: RetryRule,
    pub unknown: RetryRule,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            network: RetryRule {
                max_attempts: 5,
                backoff: Backoff::Exponential { base_ms: 500, cap_ms: 30_000 },
            },
            timeout: RetryRule {
                max_attempts: 3,
                backoff: Backoff::Exponential { base_ms: 500, cap_ms: 10_000 },
            },
            server: RetryRule {
                max_attempts: 3,
                backoff: Backoff::Exponential { base_ms: 500, cap_ms: 10_000 },
            },
            rate_limited: RetryRule {
                max_attempts: 5,
                backoff: Backoff::Exponential { base_ms: 2_000, cap_ms: 60_000 },
            },
            // 408/429 only; everything else in the class is fatal for
            // the attempt.
            client: RetryRule {
                max_attempts: 2,
                backoff: Backoff::Fixed { delay_ms: 1_000 },
            },
            unknown: RetryRule {
                max_attempts: 2,
                backoff: Backoff::Fixed { delay_ms: 1_000 },
            },
        }
    }
}

impl RetryConfig {
    /// Rule for a class, or None when the class never retries.
    pub fn rule(&self, class: ErrorClass) -> Option<RetryRule> {
        match class {
            ErrorClass::Network => Some(self.network),
            ErrorClass::Timeout => Some(self.timeout),
            ErrorClass::Server => Some(self.server),
            ErrorClass::RateLimited => Some(self.rate_limited),
            ErrorClass::Client(status) if matches!(status, 408 | 429) => Some(self.client),
            ErrorClass::Client(_) => None,
            ErrorClass::Auth | ErrorClass::Validation => None,
            ErrorClass::Unknown => Some(self.unknown),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = FleetConfig::default();
        assert!(cfg.election_timeout_min_ms < cfg.election_timeout_max_ms);
        assert!(cfg.heartbeat_interval_ms < cfg.election_timeout_min_ms);
        assert!(cfg.worker_sweep_interval_ms < cfg.worker_offline_threshold_ms);
    }

    #[test]
    fn retry_table_matches_policy() {
        let retry = RetryConfig::default();
        assert_eq!(retry.rule(ErrorClass::Network).unwrap().max_attempts, 5);
        assert!(retry.rule(ErrorClass::Auth).is_none());
        assert!(retry.rule(ErrorClass::Validation).is_none());
        assert!(retry.rule(ErrorClass::Client(400)).is_none());
        assert!(retry.rule(ErrorClass::Client(429)).is_some());
    }

    #[test]
    fn minimal_yaml_loads_with_defaults() {
        let yaml = "node_id: 3\nbind_endpoint: \"10.0.0.3:7401\"\n";
        let cfg: FleetConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.node_id, 3);
        assert_eq!(cfg.rpc_timeout_ms, 2_000);
    }
}
