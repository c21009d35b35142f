//! Power & Light Common Library
//!
//! Shared vocabulary for all workspace crates:
//!
//! - [`device`] - Device kinds, protocol tags, and device identity
//! - [`memory`] - The four-space memory map model (typed arenas + snapshots)
//! - [`events`] - Observable kernel events and the broadcast bus
//! - [`consts`] - Wire constants, default ports, count limits
//! - [`config`] - Declarative TOML catalogue of devices, networks, and clock

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod consts;
pub mod device;
pub mod events;
pub mod memory;

pub use device::{DeviceInfo, DeviceKind, ProtocolTag};
pub use events::{EventBus, KernelEvent};
pub use memory::{
    AddressKey, AddressSpace, MapDelta, MemoryError, MemoryMap, MemoryMapSnapshot, Value,
};
