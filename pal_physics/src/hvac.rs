//! Zone HVAC integrator.
//!
//! First-order temperature/humidity response toward setpoints, with control
//! authority scaled by fan speed and damper position. Publishes an
//! `lspace_stability` diagnostic in [0, 1] that decays under temperature
//! excursion and rebuilds while the zone holds within band.

use crate::{PhysicsModel, PhysicsResult, encode_u16, encode_x10, first_order};
use pal_common::config::HvacParams;
use pal_common::memory::{AddressKey, Value};
use pal_fabric::Fabric;

/// Address layout on the owning device.
pub mod addr {
    use pal_common::memory::AddressKey;

    /// Zone temperature setpoint [°C × 10] (externally writable).
    pub const TEMP_SETPOINT: AddressKey = AddressKey::holding(0);
    /// Zone humidity setpoint [% × 10] (externally writable).
    pub const HUMIDITY_SETPOINT: AddressKey = AddressKey::holding(1);
    /// Fan drive [%] (externally writable).
    pub const FAN_SPEED: AddressKey = AddressKey::holding(2);
    /// Damper position [%] (externally writable).
    pub const DAMPER: AddressKey = AddressKey::holding(3);

    /// Zone in temperature band.
    pub const IN_BAND: AddressKey = AddressKey::coil(0);

    /// Zone temperature [°C × 10].
    pub const ZONE_TEMP: AddressKey = AddressKey::input(0);
    /// Zone humidity [% × 10].
    pub const ZONE_HUMIDITY: AddressKey = AddressKey::input(1);
    /// Dimensional-stability diagnostic [× 1000].
    pub const LSPACE_STABILITY: AddressKey = AddressKey::input(2);
}

const OUTDOOR_C: f64 = 30.0;
const LEAK_TAU_S: f64 = 3600.0;
/// Stability lost per second per °C of excursion beyond the band.
const STABILITY_DECAY: f64 = 0.01;
/// Stability regained per second while in band.
const STABILITY_REBUILD: f64 = 0.005;

/// Zone HVAC physics bound to one device.
#[derive(Debug)]
pub struct HvacModel {
    device: String,
    params: HvacParams,
    zone_temp_c: f64,
    zone_humidity_pct: f64,
    lspace_stability: f64,
}

impl HvacModel {
    /// Create a zone model bound to `device`.
    pub fn new(device: impl Into<String>, params: HvacParams) -> Self {
        Self {
            device: device.into(),
            zone_temp_c: params.initial_temp_c,
            zone_humidity_pct: params.initial_humidity_pct,
            lspace_stability: 1.0,
            params,
        }
    }

    /// Zone temperature [°C].
    pub fn zone_temp_c(&self) -> f64 {
        self.zone_temp_c
    }

    /// Dimensional-stability diagnostic in [0, 1].
    pub fn lspace_stability(&self) -> f64 {
        self.lspace_stability
    }
}

impl PhysicsModel for HvacModel {
    fn device(&self) -> &str {
        &self.device
    }

    fn install(&self, fabric: &Fabric) -> PhysicsResult<()> {
        fabric.install(&self.device, |mem| {
            mem.map_word(addr::TEMP_SETPOINT, encode_x10(self.params.initial_temp_c));
            mem.map_word(
                addr::HUMIDITY_SETPOINT,
                encode_x10(self.params.initial_humidity_pct),
            );
            mem.map_word(addr::FAN_SPEED, 100);
            mem.map_word(addr::DAMPER, 100);
            mem.map_bit(addr::IN_BAND, true);
            mem.map_word(addr::ZONE_TEMP, encode_x10(self.zone_temp_c));
            mem.map_word(addr::ZONE_HUMIDITY, encode_x10(self.zone_humidity_pct));
            mem.map_word(addr::LSPACE_STABILITY, 1000);

            mem.alias("temp_setpoint_c", addr::TEMP_SETPOINT);
            mem.alias("fan_speed_pct", addr::FAN_SPEED);
            mem.alias("zone_temp_c", addr::ZONE_TEMP);
            mem.alias("lspace_stability", addr::LSPACE_STABILITY);
        })?;
        Ok(())
    }

    fn step(&mut self, dt: f64, fabric: &Fabric) -> PhysicsResult<()> {
        let p = &self.params;
        let snap = fabric.read_bulk(&self.device)?;
        let read_word =
            |key| snap.read(key).and_then(Value::as_word).unwrap_or(0) as f64;

        let temp_sp = read_word(addr::TEMP_SETPOINT) / 10.0;
        let hum_sp = read_word(addr::HUMIDITY_SETPOINT) / 10.0;
        let fan = (read_word(addr::FAN_SPEED) / 100.0).clamp(0.0, 1.0);
        let damper = (read_word(addr::DAMPER) / 100.0).clamp(0.0, 1.0);

        // Control authority: no fan or closed damper means no conditioning,
        // and the zone drifts toward outdoor conditions through leakage.
        let authority = fan * damper;
        let conditioned = first_order(self.zone_temp_c, temp_sp, p.thermal_tau_s, dt);
        self.zone_temp_c = self.zone_temp_c
            + authority * (conditioned - self.zone_temp_c)
            + (dt / LEAK_TAU_S) * (OUTDOOR_C - self.zone_temp_c);

        let conditioned_h = first_order(self.zone_humidity_pct, hum_sp, p.humidity_tau_s, dt);
        self.zone_humidity_pct = (self.zone_humidity_pct
            + authority * (conditioned_h - self.zone_humidity_pct))
            .clamp(0.0, 100.0);

        let excursion = (self.zone_temp_c - temp_sp).abs() - p.stability_band_c;
        let in_band = excursion <= 0.0;
        if in_band {
            self.lspace_stability += dt * STABILITY_REBUILD;
        } else {
            self.lspace_stability -= dt * STABILITY_DECAY * excursion;
        }
        self.lspace_stability = self.lspace_stability.clamp(0.0, 1.0);

        let delta = vec![
            (addr::IN_BAND, Value::Bit(in_band)),
            (addr::ZONE_TEMP, Value::Word(encode_x10(self.zone_temp_c))),
            (
                addr::ZONE_HUMIDITY,
                Value::Word(encode_x10(self.zone_humidity_pct)),
            ),
            (
                addr::LSPACE_STABILITY,
                Value::Word(encode_u16((self.lspace_stability * 1000.0).round())),
            ),
        ];
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

    fn rig() -> (Fabric, HvacModel) {
        let fabric = Fabric::new(SimClock::new(ClockMode::Stepped), EventBus::new(16));
        fabric
            .register(DeviceInfo::new("hvac_plc_1", DeviceKind::Plc, 7))
            .unwrap();
        let model = HvacModel::new("hvac_plc_1", HvacParams::default());
        model.install(&fabric).unwrap();
        (fabric, model)
    }

    fn run(model: &mut HvacModel, fabric: &Fabric, seconds: f64) {
        let steps = (seconds / 0.5).round() as usize;
        for _ in 0..steps {
            model.step(0.5, fabric).unwrap();
        }
    }

    #[test]
    fn zone_tracks_setpoint_at_full_authority() {
        let (fabric, mut model) = rig();
        fabric
            .write("hvac_plc_1", addr::TEMP_SETPOINT, Value::Word(180)) // 18.0 °C
            .unwrap();
        run(&mut model, &fabric, 1200.0);
        assert!((model.zone_temp_c() - 18.0).abs() < 0.5);
        assert!(model.lspace_stability() > 0.9);
    }

    #[test]
    fn dead_fan_drifts_toward_outdoor() {
        let (fabric, mut model) = rig();
        fabric
            .write("hvac_plc_1", addr::FAN_SPEED, Value::Word(0))
            .unwrap();
        run(&mut model, &fabric, 3600.0);
        assert!(
            model.zone_temp_c() > 25.0,
            "zone {} should drift toward outdoor 30",
            model.zone_temp_c()
        );
    }

    #[test]
    fn excursion_decays_stability_and_band_rebuilds_it() {
        let (fabric, mut model) = rig();
        // Kill conditioning: the zone drifts out of band and stability drops.
        fabric
            .write("hvac_plc_1", addr::FAN_SPEED, Value::Word(0))
            .unwrap();
        run(&mut model, &fabric, 3600.0);
        let degraded = model.lspace_stability();
        assert!(degraded < 0.9, "stability {degraded} should decay");

        // Restore the fan: zone returns to band and stability rebuilds.
        fabric
            .write("hvac_plc_1", addr::FAN_SPEED, Value::Word(100))
            .unwrap();
        run(&mut model, &fabric, 3600.0);
        assert!(model.lspace_stability() > degraded);
        assert_eq!(
            fabric.read("hvac_plc_1", addr::IN_BAND).unwrap(),
            Some(Value::Bit(true))
        );
    }
}
