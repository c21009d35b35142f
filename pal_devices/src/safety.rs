//! Safety PLC (SIS) scan.
//!
//! Watches one value on a protected peer and asserts an authorized trip
//! coil on that peer when the limit is exceeded. Write authority is
//! deliberately narrow: the machine writes its own memory and the single
//! configured trip coil — never a setpoint. The coil constraint is checked
//! at install time.

use tracing::warn;

use crate::{ScanError, ScanLogic, ScanResult};
use pal_common::config::SafetyRoleConfig;
use pal_common::events::KernelEvent;
use pal_common::memory::{AddressKey, AddressSpace, Value};
use pal_fabric::Fabric;

/// Address layout on the safety device itself.
pub mod addr {
    use pal_common::memory::AddressKey;

    /// Trip output asserted (latched).
    pub const TRIP_OUTPUT: AddressKey = AddressKey::coil(0);
    /// Read-only mirror of [`TRIP_OUTPUT`].
    pub const TRIP_STS: AddressKey = AddressKey::discrete(0);
    /// Last observed process value (raw word).
    pub const OBSERVED: AddressKey = AddressKey::input(0);
}

/// Independent safety controller scan.
pub struct SafetyPlcScan {
    device: String,
    cfg: SafetyRoleConfig,
    /// Resolved at install: canonical watched key on the peer.
    watch: Option<AddressKey>,
    /// Resolved at install: canonical authorized trip coil on the peer.
    trip: Option<AddressKey>,
    latched: bool,
}

impl SafetyPlcScan {
    /// Create a safety scan from its role configuration.
    pub fn new(device: impl Into<String>, cfg: SafetyRoleConfig) -> Self {
        Self {
            device: device.into(),
            cfg,
            watch: None,
            trip: None,
            latched: false,
        }
    }

    /// Whether the trip has been asserted (latched).
    pub fn tripped(&self) -> bool {
        self.latched
    }
}

impl ScanLogic for SafetyPlcScan {
    fn device(&self) -> &str {
        &self.device
    }

    fn install(&mut self, fabric: &Fabric) -> ScanResult<()> {
        fabric.install(&self.device, |mem| {
            mem.map_bit(addr::TRIP_OUTPUT, false);
            mem.map_bit(addr::TRIP_STS, false);
            mem.map_word(addr::OBSERVED, 0);
            mem.alias("trip_output", addr::TRIP_OUTPUT);
        })?;

        let watch = fabric.resolve_key(&self.cfg.watch_device, &self.cfg.watch_key)?;
        let trip = fabric.resolve_key(&self.cfg.watch_device, &self.cfg.trip_key)?;
        if trip.space != AddressSpace::Coils {
            return Err(ScanError::Wiring(format!(
                "safety trip target must be a coil, got {trip}"
            )));
        }
        self.watch = Some(watch);
        self.trip = Some(trip);
        Ok(())
    }

    fn scan(&mut self, _now: f64, fabric: &Fabric) -> ScanResult<()> {
        let (Some(watch), Some(trip)) = (self.watch, self.trip) else {
            return Err(ScanError::Wiring("safety scan not installed".into()));
        };

        let observed = match fabric.read(&self.cfg.watch_device, watch)? {
            Some(Value::Word(w)) => f64::from(w),
            Some(Value::Bit(b)) => u8::from(b) as f64,
            None => 0.0,
        };

        if observed > self.cfg.trip_limit && !self.latched {
            self.latched = true;
            warn!(
                device = %self.device,
                protected = %self.cfg.watch_device,
                observed,
                limit = self.cfg.trip_limit,
                "safety limit exceeded, asserting trip"
            );
            // The single authorized cross-device write.
            fabric.write(&self.cfg.watch_device, trip, Value::Bit(true))?;
            fabric.events().emit(KernelEvent::OverspeedTrip {
                device: self.device.clone(),
                target: self.cfg.watch_device.clone(),
                speed_rpm: observed,
            });
        }

        let delta = vec![
            (addr::TRIP_OUTPUT, Value::Bit(self.latched)),
            (addr::TRIP_STS, Value::Bit(self.latched)),
            (addr::OBSERVED, Value::Word(observed.clamp(0.0, 65535.0) as u16)),
        ];
        fabric.write_bulk(&self.device, &delta)?;
        Ok(())
    }
}
