// SPDX-License-Identifier: MIT

use crate::geo::GeoPoint;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Attitude {
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Velocity {
    pub vx: f64,
    pub vy: f64,
    pub vz: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Battery {
    pub percent: f64,
    pub voltage_mv: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct GpsFix {
    pub fix_type: u8,
    pub num_sat: u8,
}

/// One uplink telemetry sample. `timestamp_ns` is monotonic per worker;
/// consumers discard strictly older samples.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Telemetry {
    pub worker_id: String,
    pub timestamp_ns: u64,
    pub position: GeoPoint,
    pub attitude: Attitude,
    pub velocity: Velocity,
    pub battery: Battery,
    pub gps: GpsFix,
    pub link_quality: f64,
    pub flight_mode: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissionStatusKind {
    InProgress,
    Completed,
    Failed,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MissionStatus {
    pub worker_id: String,
    pub mission_id: String,
    pub kind: MissionStatusKind,
    pub progress: f64,
    pub reason: Option<String>,
    pub timestamp_ns: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum UplinkMessage {
    Telemetry(Telemetry),
    MissionStatus(MissionStatus),
    Event { worker_id: String, name: String, detail: String },
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Arm,
    Disarm,
    Takeoff,
    Land,
    Rtl,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkerCommand {
    pub kind: CommandKind,
    pub target_alt: Option<f64>,
    pub request_id: String,
    pub worker_id: String,
}

/// Messages the bridge pushes to a worker. Both kinds carry a
/// `request_id` the worker echoes back as `ACK:{request_id}`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum DownlinkMessage {
    Command(WorkerCommand),
    Mission {
        id: String,
        task: String,
        params: HashMap<String, String>,
        request_id: String,
        worker_id: String,
    },
}

impl DownlinkMessage {
    pub fn request_id(&self) -> &str {
        match self {
            DownlinkMessage::Command(c) => &c.request_id,
            DownlinkMessage::Mission { request_id, .. } => request_id,
        }
    }

    pub fn worker_id(&self) -> &str {
        match self {
            DownlinkMessage::Command(c) => &c.worker_id,
            DownlinkMessage::Mission { worker_id, .. } => worker_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downlink_accessors() {
        let msg = DownlinkMessage::Command(WorkerCommand {
            kind: CommandKind::Takeoff,
            target_alt: Some(30.0),
            request_id: "r-1".into(),
            worker_id: "w1".into(),
        });
        assert_eq!(msg.request_id(), "r-1");
        assert_eq!(msg.worker_id(), "w1");
    }

    #[test]
    fn telemetry_json_roundtrip() {
        let t = Telemetry {
            worker_id: "w1".into(),
            timestamp_ns: 42,
            position: GeoPoint::new(1.0, 2.0, 30.0),
            attitude: Attitude { roll: 0.0, pitch: 0.1, yaw: 1.5 },
            velocity: Velocity { vx: 1.0, vy: 0.0, vz: -0.2 },
            battery: Battery { percent: 87.5, voltage_mv: 11_800 },
            gps: GpsFix { fix_type: 3, num_sat: 12 },
            link_quality: 0.96,
            flight_mode: "AUTO".into(),
        };
        let line = serde_json::to_string(&UplinkMessage::Telemetry(t.clone())).unwrap();
        match serde_json::from_str::<UplinkMessage>(&line).unwrap() {
            UplinkMessage::Telemetry(back) => assert_eq!(back, t),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
