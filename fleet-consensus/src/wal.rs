// SPDX-License-Identifier: MIT

use fleet_model::FleetError;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub term: u64,
    pub command: Vec<u8>,
}

/// Metadata persisted separately from the log (current term, vote).
#[derive(Serialize, Deserialize, Default, Debug, Clone)]
pub struct HardState {
    pub current_term: u64,
    pub voted_for: Option<u64>,
}

#[derive(Serialize, Deserialize)]
struct LogRecord {
    entry: LogEntry,
    checksum: [u8; 32],
}

fn entry_checksum(entry: &LogEntry) -> Result<[u8; 32], FleetError> {
    let bytes = bincode::serialize(entry)
        .map_err(|e| FleetError::fatal(format!("wal serialize: {}", e)))?;
    Ok(*blake3::hash(&bytes).as_bytes())
}

/// Append-only log with a length-prefixed record per entry, plus the
/// compaction floor left behind by snapshots. Indexing is 1-based and
/// global: entries at or below `last_included_index` live only in the
/// snapshot.
pub struct Wal {
    log_path: PathBuf,
    state_path: PathBuf,
    entries: Vec<LogEntry>,
    hard_state: HardState,
    last_included_index: u64,
    last_included_term: u64,
}

impl Wal {
    pub fn open(dir: &Path) -> Result<Self, FleetError> {
        std::fs::create_dir_all(dir)
            .map_err(|e| FleetError::fatal(format!("wal dir: {}", e)))?;
        let mut wal = Self {
            log_path: dir.join("raft.log"),
            state_path: dir.join("raft.state"),
            entries: Vec::new(),
            hard_state: HardState::default(),
            last_included_index: 0,
            last_included_term: 0,
        };
        wal.recover()?;
        Ok(wal)
    }

    fn recover(&mut self) -> Result<(), FleetError> {
        if self.state_path.exists() {
            let file = File::open(&self.state_path)
                .map_err(|e| FleetError::fatal(format!("wal state open: {}", e)))?;
            let meta: (HardState, u64, u64) = bincode::deserialize_from(BufReader::new(file))
                .map_err(|e| FleetError::fatal(format!("wal state corrupt: {}", e)))?;
            self.hard_state = meta.0;
            self.last_included_index = meta.1;
            self.last_included_term = meta.2;
        }

        if !self.log_path.exists() {
            return Ok(());
        }
        let file = File::open(&self.log_path)
            .map_err(|e| FleetError::fatal(format!("wal open: {}", e)))?;
        let mut reader = BufReader::new(file);
        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                // Clean end of log, or a torn length prefix from a crash.
                Err(_) => break,
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            let mut buf = vec![0u8; len];
            if reader.read_exact(&mut buf).is_err() {
                warn!("[Wal] Torn record at tail, truncating");
                break;
            }
            let record: LogRecord = bincode::deserialize(&buf)
                .map_err(|e| FleetError::fatal(format!("wal record corrupt: {}", e)))?;
            if entry_checksum(&record.entry)? != record.checksum {
                return Err(FleetError::fatal(format!(
                    "wal checksum mismatch at index {}",
                    self.last_included_index + self.entries.len() as u64 + 1
                )));
            }
            self.entries.push(record.entry);
        }
        info!(
            "[Wal] Recovered {} entries (floor {}), term {}",
            self.entries.len(),
            self.last_included_index,
            self.hard_state.current_term
        );
        Ok(())
    }

    fn persist_state(&self) -> Result<(), FleetError> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.state_path)
            .map_err(|e| FleetError::fatal(format!("wal state write: {}", e)))?;
        let mut writer = BufWriter::new(file);
        bincode::serialize_into(
            &mut writer,
            &(&self.hard_state, self.last_included_index, self.last_included_term),
        )
        .map_err(|e| FleetError::fatal(format!("wal state write: {}", e)))?;
        writer
            .flush()
            .map_err(|e| FleetError::fatal(format!("wal state flush: {}", e)))?;
        Ok(())
    }

    fn write_record(writer: &mut impl Write, entry: &LogEntry) -> Result<(), FleetError> {
        let record = LogRecord { entry: entry.clone(), checksum: entry_checksum(entry)? };
        let buf = bincode::serialize(&record)
            .map_err(|e| FleetError::fatal(format!("wal serialize: {}", e)))?;
        writer
            .write_all(&(buf.len() as u32).to_le_bytes())
            .and_then(|_| writer.write_all(&buf))
            .map_err(|e| FleetError::fatal(format!("wal write: {}", e)))?;
        Ok(())
    }

    fn rewrite_log(&self) -> Result<(), FleetError> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.log_path)
            .map_err(|e| FleetError::fatal(format!("wal rewrite: {}", e)))?;
        let mut writer = BufWriter::new(file);
        for entry in &self.entries {
            Self::write_record(&mut writer, entry)?;
        }
        writer
            .flush()
            .map_err(|e| FleetError::fatal(format!("wal flush: {}", e)))?;
        Ok(())
    }

    pub fn hard_state(&self) -> HardState {
        self.hard_state.clone()
    }

    /// Persisted before any vote or append is acknowledged.
    pub fn save_hard_state(&mut self, term: u64, voted_for: Option<u64>) -> Result<(), FleetError> {
        self.hard_state.current_term = term;
        self.hard_state.voted_for = voted_for;
        self.persist_state()
    }

    pub fn append(&mut self, entry: LogEntry) -> Result<u64, FleetError> {
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.log_path)
            .map_err(|e| FleetError::fatal(format!("wal append: {}", e)))?;
        let mut writer = BufWriter::new(file);
        Self::write_record(&mut writer, &entry)?;
        writer
            .flush()
            .map_err(|e| FleetError::fatal(format!("wal flush: {}", e)))?;
        self.entries.push(entry);
        Ok(self.last_index())
    }

    pub fn first_index(&self) -> u64 {
        self.last_included_index + 1
    }

    pub fn last_index(&self) -> u64 {
        self.last_included_index + self.entries.len() as u64
    }

    pub fn last_included(&self) -> (u64, u64) {
        (self.last_included_index, self.last_included_term)
    }

    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        if index <= self.last_included_index || index > self.last_index() {
            return None;
        }
        Some(&self.entries[(index - self.last_included_index - 1) as usize])
    }

    /// Term at `index`, answering from the compaction floor when the
    /// entry itself is gone.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        if index == self.last_included_index {
            return Some(self.last_included_term);
        }
        self.get(index).map(|e| e.term)
    }

    pub fn last_log_info(&self) -> (u64, u64) {
        let idx = self.last_index();
        (idx, self.term_at(idx).unwrap_or(0))
    }

    pub fn entries_from(&self, start: u64) -> Vec<LogEntry> {
        if start > self.last_index() || start < self.first_index() {
            return Vec::new();
        }
        self.entries[(start - self.last_included_index - 1) as usize..].to_vec()
    }

    /// Drop `index` and everything after it. Used on follower conflict.
    pub fn truncate_from(&mut self, index: u64) -> Result<(), FleetError> {
        if index > self.last_index() {
            return Ok(());
        }
        if index < self.first_index() {
            return Err(FleetError::fatal(format!(
                "truncate below compaction floor: {} < {}",
                index,
                self.first_index()
            )));
        }
        self.entries.truncate((index - self.last_included_index - 1) as usize);
        self.rewrite_log()
    }

    /// Drop everything at or below `index` after a snapshot covers it.
    pub fn compact_through(&mut self, index: u64, term: u64) -> Result<(), FleetError> {
        if index <= self.last_included_index {
            return Ok(());
        }
        let keep_from = (index - self.last_included_index) as usize;
        self.entries = if keep_from >= self.entries.len() {
            Vec::new()
        } else {
            self.entries.split_off(keep_from)
        };
        self.last_included_index = index;
        self.last_included_term = term;
        self.persist_state()?;
        self.rewrite_log()
    }

    /// Wholesale replacement after InstallSnapshot: the snapshot is the
    /// new floor and any retained suffix conflicts by definition.
    pub fn reset_to_snapshot(&mut self, index: u64, term: u64) -> Result<(), FleetError> {
        self.entries.clear();
        self.last_included_index = index;
        self.last_included_term = term;
        self.persist_state()?;
        self.rewrite_log()
    }

    /// Entries currently held in the log (excludes the snapshot floor).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
