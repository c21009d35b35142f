//! # Power & Light Simulator
//!
//! The orchestrator wires the causal layers together — clock, fabric,
//! physics, scan machines, protocol listeners, network gate — boots them
//! in a fixed order, and drives the tick loop.

#![warn(clippy::all)]

pub mod orchestrator;

pub use orchestrator::{BootError, Simulator};
