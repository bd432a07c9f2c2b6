// SPDX-License-Identifier: MIT

mod region;
mod resource;
mod store;
mod sync;

pub use region::{RegionPeer, RegionSyncer};
pub use resource::{ResourceManager, WorkerFilter};
pub use store::MissionStore;
pub use sync::{DataSynchronizer, FleetEvent, FleetSnapshot};
