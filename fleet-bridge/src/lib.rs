// SPDX-License-Identifier: MIT

mod bridge;

pub use bridge::{BridgeConfig, BridgeEvent, DownlinkBridge};
