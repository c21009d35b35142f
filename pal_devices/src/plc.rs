//! PLC/RTU outstation scan.
//!
//! The physics integrator owns the process variables; the PLC scan covers
//! the ladder-logic residue: a scan heartbeat register and local hardwired
//! interlocks (watch a bit, force a control when it asserts).

use crate::{ScanLogic, ScanResult};
use pal_common::memory::{AddressKey, Value};
use pal_fabric::Fabric;

/// Scan heartbeat register (wraps at u16).
pub const SCAN_COUNT: AddressKey = AddressKey::input(199);

/// One hardwired local interlock.
#[derive(Debug, Clone)]
pub struct Interlock {
    /// Bit observed on the own device.
    pub watch: AddressKey,
    /// Control forced while `watch` is asserted.
    pub target: AddressKey,
    /// Value forced onto `target`.
    pub force: Value,
}

/// Outstation scan for PLC and RTU devices.
pub struct PlcScan {
    device: String,
    interlocks: Vec<Interlock>,
    scan_count: u16,
}

impl PlcScan {
    /// Create a scan for `device` with the given local interlocks.
    pub fn new(device: impl Into<String>, interlocks: Vec<Interlock>) -> Self {
        Self {
            device: device.into(),
            interlocks,
            scan_count: 0,
        }
    }
}

impl ScanLogic for PlcScan {
    fn device(&self) -> &str {
        &self.device
    }

    fn install(&mut self, fabric: &Fabric) -> ScanResult<()> {
        fabric.install(&self.device, |mem| {
            mem.map_word(SCAN_COUNT, 0);
        })?;
        Ok(())
    }

    fn scan(&mut self, _now: f64, fabric: &Fabric) -> ScanResult<()> {
        let snap = fabric.read_bulk(&self.device)?;

        let mut delta = Vec::with_capacity(1 + self.interlocks.len());
        for interlock in &self.interlocks {
            if snap.read(interlock.watch).and_then(Value::as_bit) == Some(true)
                && snap.read(interlock.target) != Some(interlock.force)
            {
                delta.push((interlock.target, interlock.force));
            }
        }

        self.scan_count = self.scan_count.wrapping_add(1);
        delta.push((SCAN_COUNT, Value::Word(self.scan_count)));
        fabric.write_bulk(&self.device, &delta)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pal_common::device::{DeviceInfo, DeviceKind};
    use pal_common::events::EventBus;
    use pal_fabric::{ClockMode, SimClock};

    fn rig() -> (Fabric, PlcScan) {
        let fabric = Fabric::new(SimClock::new(ClockMode::Stepped), EventBus::new(16));
        fabric
            .register(DeviceInfo::new("plc_1", DeviceKind::Plc, 1))
            .unwrap();
        fabric
            .install("plc_1", |mem| {
                mem.map_bit(AddressKey::coil(4), false); // severe damage
                mem.map_bit(AddressKey::coil(10), true); // governor
            })
            .unwrap();
        let mut scan = PlcScan::new(
            "plc_1",
            vec![Interlock {
                watch: AddressKey::coil(4),
                target: AddressKey::coil(10),
                force: Value::Bit(false),
            }],
        );
        scan.install(&fabric).unwrap();
        (fabric, scan)
    }

    #[test]
    fn heartbeat_increments() {
        let (fabric, mut scan) = rig();
        scan.scan(0.0, &fabric).unwrap();
        scan.scan(0.1, &fabric).unwrap();
        assert_eq!(
            fabric.read("plc_1", SCAN_COUNT).unwrap(),
            Some(Value::Word(2))
        );
    }

    #[test]
    fn interlock_forces_target_while_watch_asserted() {
        let (fabric, mut scan) = rig();
        scan.scan(0.0, &fabric).unwrap();
        // Watch clear: governor untouched.
        assert_eq!(
            fabric.read("plc_1", AddressKey::coil(10)).unwrap(),
            Some(Value::Bit(true))
        );

        fabric
            .write("plc_1", AddressKey::coil(4), Value::Bit(true))
            .unwrap();
        scan.scan(0.1, &fabric).unwrap();
        assert_eq!(
            fabric.read("plc_1", AddressKey::coil(10)).unwrap(),
            Some(Value::Bit(false))
        );
    }
}
