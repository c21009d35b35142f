//! # Physics Integrators
//!
//! Continuous-state models that advance once per orchestrator tick.
//! An integrator reads control fields from its owning device's memory map,
//! integrates its internal state over the supplied Δt, and writes telemetry
//! fields back. Integrators never consult the clock — Δt always comes from
//! the orchestrator, which is what keeps stepped runs reproducible.
//!
//! Exactly one integrator per physical process; an integrator writes at most
//! one device's memory map (the grid and power-flow solvers additionally
//! *read* peer telemetry through the fabric).

#![warn(clippy::all)]

pub mod grid;
pub mod hvac;
pub mod powerflow;
pub mod reactor;
pub mod turbine;

use thiserror::Error;

use pal_fabric::{Fabric, FabricError};

/// Physics-step error.
#[derive(Debug, Error)]
pub enum PhysicsError {
    /// Fabric access failed (unknown device, unmapped address, ...).
    #[error(transparent)]
    Fabric(#[from] FabricError),
}

/// Result alias for physics operations.
pub type PhysicsResult<T> = Result<T, PhysicsError>;

/// A continuous-process integrator bound to one device.
///
/// # Lifecycle
///
/// 1. `install()` — once at boot, after the device is registered: map the
///    model's addresses, register aliases, seed initial values.
/// 2. `step(dt)` — once per tick, in stable device order. Non-suspending.
pub trait PhysicsModel: Send {
    /// Owning device name.
    fn device(&self) -> &str;

    /// Map addresses and aliases on the owning device and seed initial
    /// telemetry. Called once, before the first tick.
    fn install(&self, fabric: &Fabric) -> PhysicsResult<()>;

    /// Advance internal state by `dt` seconds and publish telemetry.
    fn step(&mut self, dt: f64, fabric: &Fabric) -> PhysicsResult<()>;
}

// ─── Shared numeric helpers ─────────────────────────────────────────

/// One first-order lag step: move `current` toward `target` with time
/// constant `tau` over `dt`.
#[inline]
pub(crate) fn first_order(current: f64, target: f64, tau_s: f64, dt: f64) -> f64 {
    if tau_s <= 0.0 {
        return target;
    }
    let alpha = dt / (tau_s + dt);
    current + alpha * (target - current)
}

/// Move `current` toward `target` at a bounded rate [units/s].
#[inline]
pub(crate) fn rate_limited(current: f64, target: f64, rate_per_s: f64, dt: f64) -> f64 {
    let max_change = rate_per_s * dt;
    let err = target - current;
    current + err.clamp(-max_change, max_change)
}

/// Encode a non-negative quantity into a u16 telemetry register.
#[inline]
pub(crate) fn encode_u16(v: f64) -> u16 {
    v.clamp(0.0, f64::from(u16::MAX)) as u16
}

/// Encode with one decimal place of fixed-point precision (rounded).
#[inline]
pub(crate) fn encode_x10(v: f64) -> u16 {
    encode_u16((v * 10.0).round())
}

/// Encode with two decimal places of fixed-point precision (rounded).
#[inline]
pub(crate) fn encode_x100(v: f64) -> u16 {
    encode_u16((v * 100.0).round())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_order_converges() {
        let mut x = 0.0;
        for _ in 0..2000 {
            x = first_order(x, 10.0, 5.0, 0.1);
        }
        assert!((x - 10.0).abs() < 0.01);
    }

    #[test]
    fn rate_limited_clamps_slew() {
        let x = rate_limited(0.0, 100.0, 10.0, 0.1);
        assert_eq!(x, 1.0);
        let x = rate_limited(100.0, 0.0, 10.0, 0.1);
        assert_eq!(x, 99.0);
        // Close to target: lands exactly.
        let x = rate_limited(9.95, 10.0, 10.0, 0.1);
        assert_eq!(x, 10.0);
    }

    #[test]
    fn encodings_clamp() {
        assert_eq!(encode_u16(-4.0), 0);
        assert_eq!(encode_u16(1e9), u16::MAX);
        assert_eq!(encode_x10(123.45), 1234);
        assert_eq!(encode_x100(49.67), 4967);
    }
}
