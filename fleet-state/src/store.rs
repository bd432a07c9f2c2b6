// SPDX-License-Identifier: MIT

use fleet_model::{FleetError, Mission, MissionState};
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet};

/// Admission ordering: highest priority first, FIFO on creation time,
/// mission id as the final deterministic tie-break.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct AdmissionKey {
    priority: Reverse<i32>,
    created_ms: u64,
    id: String,
}

impl AdmissionKey {
    fn of(mission: &Mission) -> Self {
        Self {
            priority: Reverse(mission.priority),
            created_ms: mission.created_ms,
            id: mission.id.clone(),
        }
    }
}

/// In-memory authoritative mission set: by id, by state, plus the
/// priority-ordered admission queue over Pending missions. Mutated only
/// from the apply path.
#[derive(Default)]
pub struct MissionStore {
    missions: HashMap<String, Mission>,
    by_state: HashMap<MissionState, HashSet<String>>,
    admission: BTreeSet<AdmissionKey>,
}

impl MissionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, mission: Mission) -> Result<(), FleetError> {
        if self.missions.contains_key(&mission.id) {
            return Err(FleetError::rejected(format!("mission {} already exists", mission.id)));
        }
        self.index(&mission);
        self.missions.insert(mission.id.clone(), mission);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Mission> {
        self.missions.get(id)
    }

    pub fn list(&self, state: Option<MissionState>) -> Vec<&Mission> {
        let mut out: Vec<&Mission> = match state {
            Some(s) => self
                .by_state
                .get(&s)
                .map(|ids| ids.iter().filter_map(|id| self.missions.get(id)).collect())
                .unwrap_or_default(),
            None => self.missions.values().collect(),
        };
        out.sort_by(|a, b| a.created_ms.cmp(&b.created_ms).then_with(|| a.id.cmp(&b.id)));
        out
    }

    pub fn in_state(&self, state: MissionState) -> Vec<&Mission> {
        self.list(Some(state))
    }

    pub fn remove(&mut self, id: &str) -> Result<Mission, FleetError> {
        let mission = self
            .missions
            .get(id)
            .cloned()
            .ok_or_else(|| FleetError::rejected(format!("mission {} not found", id)))?;
        if !mission.state.is_terminal() {
            return Err(FleetError::rejected(format!(
                "mission {} is {:?}, delete requires a terminal state",
                id, mission.state
            )));
        }
        self.unindex(&mission);
        self.missions.remove(id);
        Ok(mission)
    }

    /// Apply `mutate` to the mission, reindexing around the change.
    pub fn update<F>(&mut self, id: &str, mutate: F) -> Result<&Mission, FleetError>
    where
        F: FnOnce(&mut Mission) -> Result<(), FleetError>,
    {
        let mut mission = self
            .missions
            .get(id)
            .cloned()
            .ok_or_else(|| FleetError::rejected(format!("mission {} not found", id)))?;
        self.unindex(&mission);
        let result = mutate(&mut mission);
        self.index(&mission);
        self.missions.insert(id.to_string(), mission);
        result?;
        Ok(self.missions.get(id).expect("just inserted"))
    }

    /// Validated state transition; bumps version and timestamps.
    pub fn transition(
        &mut self,
        id: &str,
        to: MissionState,
        now_ms: u64,
    ) -> Result<&Mission, FleetError> {
        self.update(id, |m| {
            if !m.state.can_transition(to) {
                return Err(FleetError::rejected(format!(
                    "mission {}: {:?} -> {:?} not allowed",
                    m.id, m.state, to
                )));
            }
            m.state = to;
            m.touch(now_ms);
            match to {
                MissionState::Running if m.started_ms.is_none() => m.started_ms = Some(now_ms),
                MissionState::Succeeded | MissionState::Failed | MissionState::Cancelled => {
                    m.completed_ms = Some(now_ms)
                }
                _ => {}
            }
            Ok(())
        })
    }

    /// Pending missions whose retry hold-off has passed, in admission
    /// order.
    pub fn admissible(&self, now_ms: u64) -> Vec<Mission> {
        self.admission
            .iter()
            .filter_map(|key| self.missions.get(&key.id))
            .filter(|m| m.state == MissionState::Pending && m.next_attempt_ms <= now_ms)
            .cloned()
            .collect()
    }

    /// Pending missions still holding off for retry.
    pub fn deferred(&self, now_ms: u64) -> Vec<Mission> {
        self.admission
            .iter()
            .filter_map(|key| self.missions.get(&key.id))
            .filter(|m| m.state == MissionState::Pending && m.next_attempt_ms > now_ms)
            .cloned()
            .collect()
    }

    /// Unconditional upsert, used by cross-region replication where the
    /// incoming record already won the version guard.
    pub fn put(&mut self, mission: Mission) {
        if let Some(existing) = self.missions.get(&mission.id).cloned() {
            self.unindex(&existing);
        }
        self.index(&mission);
        self.missions.insert(mission.id.clone(), mission);
    }

    pub fn len(&self) -> usize {
        self.missions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.missions.is_empty()
    }

    pub fn all(&self) -> Vec<Mission> {
        let mut out: Vec<Mission> = self.missions.values().cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn replace_all(&mut self, missions: Vec<Mission>) {
        self.missions.clear();
        self.by_state.clear();
        self.admission.clear();
        for mission in missions {
            self.index(&mission);
            self.missions.insert(mission.id.clone(), mission);
        }
    }

    fn index(&mut self, mission: &Mission) {
        self.by_state.entry(mission.state).or_default().insert(mission.id.clone());
        if mission.state == MissionState::Pending {
            self.admission.insert(AdmissionKey::of(mission));
        }
    }

    fn unindex(&mut self, mission: &Mission) {
        if let Some(ids) = self.by_state.get_mut(&mission.state) {
            ids.remove(&mission.id);
        }
        if mission.state == MissionState::Pending {
            self.admission.remove(&AdmissionKey::of(mission));
        }
    }
}
