// SPDX-License-Identifier: MIT

use fleet_model::FleetError;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub data: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct SnapshotFile {
    snapshot: Snapshot,
    checksum: [u8; 32],
}

/// On-disk snapshots, one file per snapshot named
/// `snapshot-{index}-{term}`. Only the newest is kept.
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn open(dir: &Path) -> Result<Self, FleetError> {
        fs::create_dir_all(dir)
            .map_err(|e| FleetError::fatal(format!("snapshot dir: {}", e)))?;
        Ok(Self { dir: dir.to_path_buf() })
    }

    fn path_for(&self, index: u64, term: u64) -> PathBuf {
        self.dir.join(format!("snapshot-{}-{}", index, term))
    }

    pub fn save(&self, snapshot: &Snapshot) -> Result<(), FleetError> {
        let checksum = *blake3::hash(&snapshot.data).as_bytes();
        let path = self.path_for(snapshot.last_included_index, snapshot.last_included_term);
        let tmp = path.with_extension("tmp");
        {
            let file = File::create(&tmp)
                .map_err(|e| FleetError::fatal(format!("snapshot create: {}", e)))?;
            let mut writer = BufWriter::new(file);
            bincode::serialize_into(
                &mut writer,
                &SnapshotFile { snapshot: snapshot.clone(), checksum },
            )
            .map_err(|e| FleetError::fatal(format!("snapshot write: {}", e)))?;
            writer
                .flush()
                .map_err(|e| FleetError::fatal(format!("snapshot flush: {}", e)))?;
        }
        fs::rename(&tmp, &path)
            .map_err(|e| FleetError::fatal(format!("snapshot rename: {}", e)))?;
        info!(
            "[Snapshot] Saved snapshot-{}-{} ({} bytes)",
            snapshot.last_included_index,
            snapshot.last_included_term,
            snapshot.data.len()
        );
        self.prune(snapshot.last_included_index);
        Ok(())
    }

    /// Newest snapshot on disk, if any.
    pub fn latest(&self) -> Result<Option<Snapshot>, FleetError> {
        let mut best: Option<(u64, u64)> = None;
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| FleetError::fatal(format!("snapshot dir read: {}", e)))?;
        for entry in entries.flatten() {
            if let Some((index, term)) = parse_name(&entry.file_name().to_string_lossy()) {
                if best.map(|(i, _)| index > i).unwrap_or(true) {
                    best = Some((index, term));
                }
            }
        }
        let Some((index, term)) = best else {
            return Ok(None);
        };
        self.load(index, term).map(Some)
    }

    fn load(&self, index: u64, term: u64) -> Result<Snapshot, FleetError> {
        let file = File::open(self.path_for(index, term))
            .map_err(|e| FleetError::fatal(format!("snapshot open: {}", e)))?;
        let parsed: SnapshotFile = bincode::deserialize_from(BufReader::new(file))
            .map_err(|e| FleetError::fatal(format!("snapshot corrupt: {}", e)))?;
        if *blake3::hash(&parsed.snapshot.data).as_bytes() != parsed.checksum {
            return Err(FleetError::fatal(format!(
                "snapshot-{}-{} checksum mismatch",
                index, term
            )));
        }
        Ok(parsed.snapshot)
    }

    fn prune(&self, keep_index: u64) {
        let Ok(entries) = fs::read_dir(&self.dir) else { return };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some((index, _)) = parse_name(&name) {
                if index < keep_index {
                    if let Err(e) = fs::remove_file(entry.path()) {
                        warn!("[Snapshot] Failed to prune {}: {}", name, e);
                    }
                }
            }
        }
    }
}

fn parse_name(name: &str) -> Option<(u64, u64)> {
    let rest = name.strip_prefix("snapshot-")?;
    let (index, term) = rest.split_once('-')?;
    Some((index.parse().ok()?, term.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        let snap = Snapshot {
            last_included_index: 42,
            last_included_term: 3,
            data: b"state".to_vec(),
        };
        store.save(&snap).unwrap();
        assert_eq!(store.latest().unwrap().unwrap(), snap);
    }

    #[test]
    fn newer_snapshot_prunes_older() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        for index in [10, 20, 30] {
            store
                .save(&Snapshot {
                    last_included_index: index,
                    last_included_term: 1,
                    data: vec![index as u8],
                })
                .unwrap();
        }
        let files: Vec<_> = fs::read_dir(dir.path()).unwrap().flatten().collect();
        assert_eq!(files.len(), 1);
        assert_eq!(store.latest().unwrap().unwrap().last_included_index, 30);
    }

    #[test]
    fn corrupt_data_is_fatal() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        let snap = Snapshot { last_included_index: 5, last_included_term: 1, data: vec![1, 2, 3] };
        store.save(&snap).unwrap();

        // Flip bytes in the stored file.
        let path = dir.path().join("snapshot-5-1");
        let mut bytes = fs::read(&path).unwrap();
        let end = bytes.len() - 1;
        bytes[end] ^= 0xff;
        fs::write(&path, bytes).unwrap();

        assert!(matches!(store.latest(), Err(FleetError::Fatal { .. })));
    }

    #[test]
    fn empty_store_has_no_latest() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        assert!(store.latest().unwrap().is_none());
    }
}
