//! Grid frequency integrator — the swing equation.
//!
//! `df/dt = (P_gen − P_load) / (2H) − D·(f − f_nom)`
//!
//! Generation is aggregated every step by summing the `power_mw` telemetry
//! of the configured generator devices; load comes from this device's own
//! (externally writable) load register. Crossing a protection limit latches
//! a single `GridTrip` event until [`GridModel::reset_trip`].

use tracing::warn;

use crate::{PhysicsModel, PhysicsResult, encode_x10, encode_x100};
use pal_common::config::GridParams;
use pal_common::events::KernelEvent;
use pal_common::memory::{AddressKey, Value};
use pal_fabric::Fabric;

/// Address layout on the owning device.
pub mod addr {
    use pal_common::memory::AddressKey;

    /// Aggregate system load [MW × 10] (externally writable).
    pub const LOAD_MW: AddressKey = AddressKey::holding(0);

    /// Frequency protection tripped (latched).
    pub const GRID_TRIP: AddressKey = AddressKey::coil(0);
    /// Below the under-frequency limit.
    pub const UNDER_FREQUENCY: AddressKey = AddressKey::coil(1);
    /// Above the over-frequency limit.
    pub const OVER_FREQUENCY: AddressKey = AddressKey::coil(2);

    /// Read-only mirror of [`GRID_TRIP`].
    pub const TRIP_STS: AddressKey = AddressKey::discrete(0);

    /// System frequency [Hz × 100].
    pub const FREQUENCY: AddressKey = AddressKey::input(0);
    /// Aggregated generation [MW × 10].
    pub const TOTAL_GENERATION: AddressKey = AddressKey::input(1);
    /// Load echo [MW × 10].
    pub const LOAD_ECHO: AddressKey = AddressKey::input(2);
}

/// Swing-equation frequency model bound to one grid device.
#[derive(Debug)]
pub struct GridModel {
    device: String,
    params: GridParams,
    frequency_hz: f64,
    tripped: bool,
}

impl GridModel {
    /// Create a grid model bound to `device`.
    pub fn new(device: impl Into<String>, params: GridParams) -> Self {
        Self {
            device: device.into(),
            frequency_hz: params.f_nom_hz,
            tripped: false,
            params,
        }
    }

    /// Current system frequency [Hz].
    pub fn frequency_hz(&self) -> f64 {
        self.frequency_hz
    }

    /// Whether the protection has tripped (latched).
    pub fn tripped(&self) -> bool {
        self.tripped
    }

    /// Clear the trip latch, re-arming the protection.
    pub fn reset_trip(&mut self) {
        self.tripped = false;
    }
}

impl PhysicsModel for GridModel {
    fn device(&self) -> &str {
        &self.device
    }

    fn install(&self, fabric: &Fabric) -> PhysicsResult<()> {
        fabric.install(&self.device, |mem| {
            mem.map_word(addr::LOAD_MW, encode_x10(self.params.initial_load_mw));
            mem.map_bit(addr::GRID_TRIP, false);
            mem.map_bit(addr::UNDER_FREQUENCY, false);
            mem.map_bit(addr::OVER_FREQUENCY, false);
            mem.map_bit(addr::TRIP_STS, false);
            mem.map_word(addr::FREQUENCY, encode_x100(self.params.f_nom_hz));
            mem.map_word(addr::TOTAL_GENERATION, 0);
            mem.map_word(addr::LOAD_ECHO, encode_x10(self.params.initial_load_mw));

            mem.alias("load_mw", addr::LOAD_MW);
            mem.alias("frequency_hz", addr::FREQUENCY);
            mem.alias("grid_trip", addr::GRID_TRIP);
            mem.alias("total_generation_mw", addr::TOTAL_GENERATION);
        })?;
        Ok(())
    }

    fn step(&mut self, dt: f64, fabric: &Fabric) -> PhysicsResult<()> {
        let p = &self.params;

        let p_load = fabric
            .read(&self.device, addr::LOAD_MW)?
            .and_then(Value::as_word)
            .unwrap_or(0) as f64
            / 10.0;

        let mut p_gen = 0.0;
        for source in &p.generator_devices {
            if let Some(Value::Word(w)) = fabric.read_key(source, "power_mw")? {
                p_gen += f64::from(w) / 10.0;
            }
        }

        let df = (p_gen - p_load) / (2.0 * p.inertia_mw_s)
            - p.damping_mw_per_hz * (self.frequency_hz - p.f_nom_hz);
        self.frequency_hz += df * dt;

        let under = self.frequency_hz < p.under_frequency_hz;
        let over = self.frequency_hz > p.over_frequency_hz;
        if (under || over) && !self.tripped {
            self.tripped = true;
            warn!(
                device = %self.device,
                frequency = self.frequency_hz,
                "grid frequency protection tripped"
            );
            fabric.events().emit(KernelEvent::GridTrip {
                device: self.device.clone(),
                frequency_hz: self.frequency_hz,
            });
        }

        let delta = vec![
            (addr::GRID_TRIP, Value::Bit(self.tripped)),
            (addr::UNDER_FREQUENCY, Value::Bit(under)),
            (addr::OVER_FREQUENCY, Value::Bit(over)),
            (addr::TRIP_STS, Value::Bit(self.tripped)),
            (addr::FREQUENCY, Value::Word(encode_x100(self.frequency_hz))),
            (addr::TOTAL_GENERATION, Value::Word(encode_x10(p_gen))),
            (addr::LOAD_ECHO, Value::Word(encode_x10(p_load))),
        ];
        fabric.write_bulk(&self.device, &delta)?;
        Ok(())
    }
}
