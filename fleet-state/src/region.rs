// SPDX-License-Identifier: MIT

use crate::sync::DataSynchronizer;
use fleet_model::{FleetError, Mission};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// A remote region's export surface: everything that changed since a
/// checkpoint, or the whole mission set for the periodic full resync.
pub trait RegionPeer: Send + Sync {
    fn changes_since(
        &self,
        checkpoint_ms: u64,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Mission>, FleetError>> + Send + '_>>;
    fn export_all(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Mission>, FleetError>> + Send + '_>>;
}

impl DataSynchronizer {
    /// Version-guarded last-writer-wins merge of a remote mutation.
    /// This is the eventually-consistent sidecar path; it deliberately
    /// bypasses the log and never overrides a newer local version.
    pub fn merge_remote_mission(&self, remote: Mission) -> Result<(), FleetError> {
        let local = self.mission(&remote.id);
        match local {
            None => {
                self.upsert_replica(remote);
                Ok(())
            }
            Some(local) => {
                let newer = remote.version > local.version
                    || (remote.version == local.version && remote.updated_ms > local.updated_ms);
                if newer {
                    debug!(
                        "[Region] Accepting {} v{} from node {}",
                        remote.id, remote.version, remote.origin_node
                    );
                    self.upsert_replica(remote);
                    Ok(())
                } else {
                    Err(FleetError::VersionConflict {
                        id: remote.id,
                        local: local.version,
                        remote: remote.version,
                    })
                }
            }
        }
    }

    /// Missions mutated after `checkpoint_ms`, for incremental resync.
    pub fn missions_changed_since(&self, checkpoint_ms: u64) -> Vec<Mission> {
        self.missions_in(None)
            .into_iter()
            .filter(|m| m.updated_ms > checkpoint_ms)
            .collect()
    }
}

/// Pull loop against one remote region: incremental sync each interval,
/// full resync as a safety net every `full_resync_every` rounds.
pub struct RegionSyncer {
    local: Arc<DataSynchronizer>,
    peer: Arc<dyn RegionPeer>,
    interval: Duration,
    full_resync_every: u32,
}

impl RegionSyncer {
    pub fn new(
        local: Arc<DataSynchronizer>,
        peer: Arc<dyn RegionPeer>,
        interval: Duration,
        full_resync_every: u32,
    ) -> Self {
        Self { local, peer, interval, full_resync_every: full_resync_every.max(1) }
    }

    pub fn start(self, mut shutdown: watch::Receiver<bool>) {
        tokio::spawn(async move {
            let mut checkpoint_ms = 0u64;
            let mut round = 0u32;
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => {
                        info!("[Region] Sync loop stopping");
                        return;
                    }
                }
                round += 1;
                let full = round % self.full_resync_every == 0;
                let fetched = if full {
                    self.peer.export_all().await
                } else {
                    self.peer.changes_since(checkpoint_ms).await
                };
                let missions = match fetched {
                    Ok(m) => m,
                    Err(e) => {
                        warn!("[Region] Fetch failed: {}", e);
                        continue;
                    }
                };
                let mut merged = 0usize;
                let mut rejected = 0usize;
                for mission in missions {
                    checkpoint_ms = checkpoint_ms.max(mission.updated_ms);
                    match self.local.merge_remote_mission(mission) {
                        Ok(()) => merged += 1,
                        Err(FleetError::VersionConflict { .. }) => rejected += 1,
                        Err(e) => warn!("[Region] Merge failed: {}", e),
                    }
                }
                if merged > 0 || rejected > 0 {
                    debug!(
                        "[Region] Round {}: merged {}, stale {}{}",
                        round,
                        merged,
                        rejected,
                        if full { " (full resync)" } else { "" }
                    );
                }
            }
        });
    }
}
