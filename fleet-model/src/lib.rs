// SPDX-License-Identifier: MIT

pub mod command;
pub mod config;
pub mod error;
pub mod geo;
pub mod mission;
pub mod telemetry;
pub mod worker;

pub use command::Command;
pub use config::{FleetConfig, PeerConfig, RetryConfig, RetryRule};
pub use error::{ErrorClass, FleetError};
pub use geo::GeoPoint;
pub use mission::{Mission, MissionKind, MissionPayload, MissionState};
pub use telemetry::{
    Attitude, Battery, CommandKind, DownlinkMessage, GpsFix, MissionStatus, MissionStatusKind,
    Telemetry, UplinkMessage, Velocity, WorkerCommand,
};
pub use worker::{Worker, WorkerStatus};

pub type WorkerId = String;
pub type MissionId = String;
pub type NodeId = u64;
