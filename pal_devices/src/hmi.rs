//! HMI scan: polls a SCADA tag database at screen rate.
//!
//! Screens are logical here — a fixed bank of tag slots mirrored from the
//! SCADA device's memory into the HMI's own, where an operator-station
//! protocol client (or a test) can read them.

use crate::{ScanLogic, ScanResult};
use pal_common::config::HmiRoleConfig;
use pal_common::memory::{AddressKey, Value};
use pal_fabric::Fabric;

/// Operator screen scan.
pub struct HmiScan {
    device: String,
    cfg: HmiRoleConfig,
    /// Last refreshed screen values (tag slot → raw value).
    screens: Vec<u16>,
}

impl HmiScan {
    /// Create an HMI scan from its role configuration.
    pub fn new(device: impl Into<String>, cfg: HmiRoleConfig) -> Self {
        Self {
            device: device.into(),
            screens: vec![0; cfg.screen_slots as usize],
            cfg,
        }
    }

    /// Last refreshed value in screen slot `idx`.
    pub fn screen(&self, idx: usize) -> Option<u16> {
        self.screens.get(idx).copied()
    }
}

impl ScanLogic for HmiScan {
    fn device(&self) -> &str {
        &self.device
    }

    fn install(&mut self, fabric: &Fabric) -> ScanResult<()> {
        let slots = self.cfg.screen_slots;
        fabric.install(&self.device, |mem| {
            for i in 0..slots {
                mem.map_word(AddressKey::input(i), 0);
            }
        })?;
        Ok(())
    }

    fn scan(&mut self, _now: f64, fabric: &Fabric) -> ScanResult<()> {
        let snap = fabric.read_bulk(&self.cfg.scada_device)?;
        let mut delta = Vec::with_capacity(self.screens.len());
        for (i, slot) in self.screens.iter_mut().enumerate() {
            // Unconfigured SCADA slots simply stay dark.
            if let Some(Value::Word(w)) = snap.read(AddressKey::input(i as u16)) {
                *slot = w;
                delta.push((AddressKey::input(i as u16), Value::Word(w)));
            }
        }
        if !delta.is_empty() {
            fabric.write_bulk(&self.device, &delta)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pal_common::device::{DeviceInfo, DeviceKind};
    use pal_common::events::EventBus;
    use pal_fabric::{ClockMode, SimClock};

    #[test]
    fn screens_mirror_the_scada_tag_bank() {
        let fabric = Fabric::new(SimClock::new(ClockMode::Stepped), EventBus::new(16));
        fabric
            .register(DeviceInfo::new("scada_1", DeviceKind::Scada, 10))
            .unwrap();
        fabric
            .install("scada_1", |mem| {
                mem.map_word(AddressKey::input(0), 3600);
                mem.map_word(AddressKey::input(1), 87);
            })
            .unwrap();
        fabric
            .register(DeviceInfo::new("hmi_1", DeviceKind::Hmi, 11))
            .unwrap();

        let mut scan = HmiScan::new(
            "hmi_1",
            HmiRoleConfig {
                scada_device: "scada_1".into(),
                screen_slots: 4,
            },
        );
        scan.install(&fabric).unwrap();
        scan.scan(0.0, &fabric).unwrap();

        assert_eq!(scan.screen(0), Some(3600));
        assert_eq!(scan.screen(1), Some(87));
        assert_eq!(scan.screen(2), Some(0)); // dark slot
        assert_eq!(
            fabric.read("hmi_1", AddressKey::input(0)).unwrap(),
            Some(Value::Word(3600))
        );
    }
}
