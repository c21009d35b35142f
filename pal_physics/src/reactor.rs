//! Thaumically-assisted reactor integrator.
//!
//! Linear thermal-mass and first-order kinetics approximations. The core
//! temperature chases the reaction rate; coolant flow divides the heat;
//! the thaumic field rides the reaction and is bled off by the dampener.
//!
//! Hard interlock: core temperature at or above the critical limit, or
//! containment below its threshold, forces an auto-SCRAM (rods fully in,
//! pump to maximum). Containment reaching zero is terminal — `running`
//! latches false and the alarms stay up.

use tracing::{error, warn};

use crate::{PhysicsModel, PhysicsResult, encode_u16, encode_x10, first_order};
use pal_common::config::ReactorParams;
use pal_common::events::KernelEvent;
use pal_common::memory::{AddressKey, Value};
use pal_fabric::Fabric;

/// Address layout on the owning device.
pub mod addr {
    use pal_common::memory::AddressKey;

    /// Power setpoint [% of rated] (externally writable).
    pub const POWER_SETPOINT: AddressKey = AddressKey::holding(0);
    /// Coolant pump drive [%] (externally writable).
    pub const COOLANT_PUMP: AddressKey = AddressKey::holding(1);
    /// Control rod insertion [%], 100 = fully in (externally writable).
    pub const CONTROL_ROD: AddressKey = AddressKey::holding(2);

    /// Reactor producing power.
    pub const RUNNING: AddressKey = AddressKey::coil(0);
    /// SCRAM in effect (commanded or automatic).
    pub const SCRAM_ACTIVE: AddressKey = AddressKey::coil(1);
    /// Core temperature above rated.
    pub const HIGH_TEMP_ALARM: AddressKey = AddressKey::coil(2);
    /// Containment integrity degraded.
    pub const CONTAINMENT_ALARM: AddressKey = AddressKey::coil(3);
    /// Operator SCRAM command (externally writable).
    pub const SCRAM_CMD: AddressKey = AddressKey::coil(10);
    /// Thaumic dampener engaged (externally writable).
    pub const THAUMIC_DAMPENER: AddressKey = AddressKey::coil(11);

    /// Core temperature [°C].
    pub const CORE_TEMP: AddressKey = AddressKey::input(0);
    /// Coolant temperature [°C].
    pub const COOLANT_TEMP: AddressKey = AddressKey::input(1);
    /// Vessel pressure [bar × 10].
    pub const PRESSURE: AddressKey = AddressKey::input(2);
    /// Reaction rate [% of rated].
    pub const REACTION_RATE: AddressKey = AddressKey::input(3);
    /// Thaumic field strength [thm × 10].
    pub const THAUMIC_FIELD: AddressKey = AddressKey::input(4);
    /// Containment integrity [% × 10].
    pub const CONTAINMENT: AddressKey = AddressKey::input(5);
    /// Accumulated damage [% × 10].
    pub const DAMAGE: AddressKey = AddressKey::input(6);
}

const AMBIENT_C: f64 = 50.0;
/// Core °C per % of reaction at nominal cooling.
const CORE_GAIN_C_PER_PCT: f64 = 5.5;
/// Thaumic field units per % of reaction.
const THAUMIC_GAIN: f64 = 1.0;
const THAUMIC_TAU_S: f64 = 15.0;
/// Dampener attenuation of the thaumic target.
const DAMPENER_FACTOR: f64 = 0.3;
/// Containment erosion per second per 100 °C above critical.
const CONTAINMENT_EROSION: f64 = 0.5;
/// Containment erosion per second under a saturated thaumic field.
const THAUMIC_EROSION: f64 = 0.2;
const THAUMIC_EROSION_THRESHOLD: f64 = 80.0;
/// Damage per second per 50 °C above rated.
const DAMAGE_RATE: f64 = 0.1;

/// Reactor physics bound to one PLC device.
#[derive(Debug)]
pub struct ReactorModel {
    device: String,
    params: ReactorParams,

    core_temp_c: f64,
    coolant_temp_c: f64,
    vessel_pressure_bar: f64,
    reaction_rate_pct: f64,
    thaumic_field: f64,
    containment_pct: f64,
    damage_pct: f64,
    running: bool,
    scram_latched: bool,
    breach_latched: bool,
}

impl ReactorModel {
    /// Create a reactor bound to `device`.
    pub fn new(device: impl Into<String>, params: ReactorParams) -> Self {
        Self {
            device: device.into(),
            core_temp_c: AMBIENT_C,
            coolant_temp_c: AMBIENT_C,
            vessel_pressure_bar: 10.0,
            reaction_rate_pct: params.initial_reaction_pct,
            thaumic_field: 0.0,
            containment_pct: 100.0,
            damage_pct: 0.0,
            running: true,
            scram_latched: false,
            breach_latched: false,
            params,
        }
    }

    /// Current core temperature [°C].
    pub fn core_temp_c(&self) -> f64 {
        self.core_temp_c
    }

    /// Current containment integrity [%].
    pub fn containment_pct(&self) -> f64 {
        self.containment_pct
    }

    /// Whether the reactor is still operable.
    pub fn running(&self) -> bool {
        self.running
    }

    /// Whether a SCRAM has been latched.
    pub fn scrammed(&self) -> bool {
        self.scram_latched
    }
}

impl PhysicsModel for ReactorModel {
    fn device(&self) -> &str {
        &self.device
    }

    fn install(&self, fabric: &Fabric) -> PhysicsResult<()> {
        fabric.install(&self.device, |mem| {
            mem.map_word(addr::POWER_SETPOINT, encode_u16(self.params.initial_reaction_pct));
            mem.map_word(addr::COOLANT_PUMP, 100);
            mem.map_word(addr::CONTROL_ROD, 0);

            mem.map_bit(addr::RUNNING, true);
            mem.map_bit(addr::SCRAM_ACTIVE, false);
            mem.map_bit(addr::HIGH_TEMP_ALARM, false);
            mem.map_bit(addr::CONTAINMENT_ALARM, false);
            mem.map_bit(addr::SCRAM_CMD, false);
            mem.map_bit(addr::THAUMIC_DAMPENER, false);

            mem.map_word(addr::CORE_TEMP, encode_u16(self.core_temp_c));
            mem.map_word(addr::COOLANT_TEMP, encode_u16(self.coolant_temp_c));
            mem.map_word(addr::PRESSURE, encode_x10(self.vessel_pressure_bar));
            mem.map_word(addr::REACTION_RATE, encode_u16(self.reaction_rate_pct));
            mem.map_word(addr::THAUMIC_FIELD, 0);
            mem.map_word(addr::CONTAINMENT, 1000);
            mem.map_word(addr::DAMAGE, 0);

            mem.alias("power_setpoint_pct", addr::POWER_SETPOINT);
            mem.alias("coolant_pump_pct", addr::COOLANT_PUMP);
            mem.alias("control_rod_pct", addr::CONTROL_ROD);
            mem.alias("scram", addr::SCRAM_CMD);
            mem.alias("core_temp_c", addr::CORE_TEMP);
            mem.alias("containment_pct", addr::CONTAINMENT);
        })?;
        Ok(())
    }

    fn step(&mut self, dt: f64, fabric: &Fabric) -> PhysicsResult<()> {
        let p = &self.params;
        let snap = fabric.read_bulk(&self.device)?;
        let setpoint = snap
            .read(addr::POWER_SETPOINT)
            .and_then(Value::as_word)
            .unwrap_or(0) as f64;
        let mut pump_pct = snap
            .read(addr::COOLANT_PUMP)
            .and_then(Value::as_word)
            .unwrap_or(0)
            .min(100) as f64;
        let mut rod_pct = snap
            .read(addr::CONTROL_ROD)
            .and_then(Value::as_word)
            .unwrap_or(0)
            .min(100) as f64;
        let scram_cmd = snap
            .read(addr::SCRAM_CMD)
            .and_then(Value::as_bit)
            .unwrap_or(false);
        let dampener = snap
            .read(addr::THAUMIC_DAMPENER)
            .and_then(Value::as_bit)
            .unwrap_or(false);

        // ── Protection interlock ──
        let auto_scram = self.core_temp_c >= p.critical_temp_c
            || self.containment_pct < p.containment_scram_pct;
        let scram = scram_cmd || auto_scram || self.scram_latched;
        let mut forced_controls = Vec::new();
        if scram {
            if !self.scram_latched {
                warn!(
                    device = %self.device,
                    core_temp = self.core_temp_c,
                    containment = self.containment_pct,
                    commanded = scram_cmd,
                    "reactor SCRAM"
                );
                fabric.events().emit(KernelEvent::ReactorScram {
                    device: self.device.clone(),
                    core_temp_c: self.core_temp_c,
                });
                self.scram_latched = true;
            }
            rod_pct = 100.0;
            pump_pct = 100.0;
            forced_controls.push((addr::CONTROL_ROD, Value::Word(100)));
            forced_controls.push((addr::COOLANT_PUMP, Value::Word(100)));
            forced_controls.push((addr::SCRAM_CMD, Value::Bit(true)));
        }

        // ── Kinetics & thermal masses ──
        let target_reaction = if scram || !self.running {
            0.0
        } else {
            (setpoint * (1.0 - rod_pct / 100.0)).clamp(0.0, 150.0)
        };
        self.reaction_rate_pct =
            first_order(self.reaction_rate_pct, target_reaction, p.kinetics_tau_s, dt);

        let cooling_eff = 0.5 + 0.5 * pump_pct / 100.0;
        let core_target = AMBIENT_C + CORE_GAIN_C_PER_PCT * self.reaction_rate_pct / cooling_eff;
        self.core_temp_c = first_order(self.core_temp_c, core_target, p.thermal_tau_s, dt);

        self.coolant_temp_c = first_order(
            self.coolant_temp_c,
            AMBIENT_C + (self.core_temp_c - AMBIENT_C) * 0.6,
            p.thermal_tau_s * 0.5,
            dt,
        );
        self.vessel_pressure_bar = 10.0 + self.coolant_temp_c * 0.15;

        let thaumic_target = if dampener {
            THAUMIC_GAIN * self.reaction_rate_pct * DAMPENER_FACTOR
        } else {
            THAUMIC_GAIN * self.reaction_rate_pct
        };
        self.thaumic_field = first_order(self.thaumic_field, thaumic_target, THAUMIC_TAU_S, dt);

        // ── Containment & damage ──
        if self.core_temp_c > p.critical_temp_c {
            self.containment_pct -=
                dt * CONTAINMENT_EROSION * (self.core_temp_c - p.critical_temp_c) / 100.0;
        }
        if self.thaumic_field > THAUMIC_EROSION_THRESHOLD {
            self.containment_pct -= dt * THAUMIC_EROSION;
        }
        self.containment_pct = self.containment_pct.clamp(0.0, 100.0);

        if self.core_temp_c > p.rated_temp_c {
            self.damage_pct = (self.damage_pct
                + dt * DAMAGE_RATE * (self.core_temp_c - p.rated_temp_c) / 50.0)
                .min(100.0);
        }

        if self.containment_pct <= 0.0 && !self.breach_latched {
            error!(device = %self.device, "containment breach");
            fabric.events().emit(KernelEvent::ContainmentBreach {
                device: self.device.clone(),
            });
            self.breach_latched = true;
            self.running = false;
        }

        // ── Telemetry ──
        let high_temp = self.core_temp_c > p.rated_temp_c || self.breach_latched;
        let containment_alarm = self.containment_pct < p.containment_scram_pct || self.breach_latched;
        let mut delta = forced_controls;
        delta.extend([
            (addr::RUNNING, Value::Bit(self.running)),
            (addr::SCRAM_ACTIVE, Value::Bit(self.scram_latched)),
            (addr::HIGH_TEMP_ALARM, Value::Bit(high_temp)),
            (addr::CONTAINMENT_ALARM, Value::Bit(containment_alarm)),
            (addr::CORE_TEMP, Value::Word(encode_u16(self.core_temp_c))),
            (addr::COOLANT_TEMP, Value::Word(encode_u16(self.coolant_temp_c))),
            (addr::PRESSURE, Value::Word(encode_x10(self.vessel_pressure_bar))),
            (addr::REACTION_RATE, Value::Word(encode_u16(self.reaction_rate_pct))),
            (addr::THAUMIC_FIELD, Value::Word(encode_x10(self.thaumic_field))),
            (addr::CONTAINMENT, Value::Word(encode_x10(self.containment_pct))),
            (addr::DAMAGE, Value::Word(encode_x10(self.damage_pct))),
        ]);
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

    fn rig(params: ReactorParams) -> (Fabric, ReactorModel) {
        let fabric = Fabric::new(SimClock::new(ClockMode::Stepped), EventBus::new(32));
        fabric
            .register(DeviceInfo::new("reactor_plc_1", DeviceKind::Plc, 5))
            .unwrap();
        let model = ReactorModel::new("reactor_plc_1", params);
        model.install(&fabric).unwrap();
        (fabric, model)
    }

    fn run(model: &mut ReactorModel, fabric: &Fabric, seconds: f64) {
        let steps = (seconds / 0.1).round() as usize;
        for _ in 0..steps {
            model.step(0.1, fabric).unwrap();
        }
    }

    #[test]
    fn reaction_follows_setpoint_with_rods_out() {
        let (fabric, mut model) = rig(ReactorParams::default());
        fabric
            .write("reactor_plc_1", addr::POWER_SETPOINT, Value::Word(80))
            .unwrap();
        run(&mut model, &fabric, 120.0);
        assert!((model.reaction_rate_pct - 80.0).abs() < 1.0);
        assert!(model.core_temp_c() > 400.0);
        assert!(!model.scrammed());
    }

    #[test]
    fn rods_suppress_reaction() {
        let (fabric, mut model) = rig(ReactorParams::default());
        fabric
            .write("reactor_plc_1", addr::POWER_SETPOINT, Value::Word(100))
            .unwrap();
        fabric
            .write("reactor_plc_1", addr::CONTROL_ROD, Value::Word(75))
            .unwrap();
        run(&mut model, &fabric, 120.0);
        assert!((model.reaction_rate_pct - 25.0).abs() < 1.0);
    }

    #[test]
    fn commanded_scram_shuts_down_and_forces_controls() {
        let (fabric, mut model) = rig(ReactorParams::default());
        fabric
            .write("reactor_plc_1", addr::POWER_SETPOINT, Value::Word(80))
            .unwrap();
        run(&mut model, &fabric, 60.0);

        let mut rx = fabric.events().subscribe();
        fabric
            .write("reactor_plc_1", addr::SCRAM_CMD, Value::Bit(true))
            .unwrap();
        run(&mut model, &fabric, 60.0);

        assert!(model.scrammed());
        assert!(model.reaction_rate_pct < 1.0);
        assert!(matches!(
            rx.try_recv().unwrap(),
            KernelEvent::ReactorScram { .. }
        ));
        // Rods forced fully in, pump forced to max.
        assert_eq!(
            fabric.read("reactor_plc_1", addr::CONTROL_ROD).unwrap(),
            Some(Value::Word(100))
        );
        assert_eq!(
            fabric.read("reactor_plc_1", addr::COOLANT_PUMP).unwrap(),
            Some(Value::Word(100))
        );
    }

    #[test]
    fn overtemperature_auto_scrams() {
        // Low critical limit so the interlock fires quickly.
        let params = ReactorParams {
            critical_temp_c: 300.0,
            ..ReactorParams::default()
        };
        let (fabric, mut model) = rig(params);
        fabric
            .write("reactor_plc_1", addr::POWER_SETPOINT, Value::Word(150))
            .unwrap();
        // Starve the coolant pump to heat up faster.
        fabric
            .write("reactor_plc_1", addr::COOLANT_PUMP, Value::Word(0))
            .unwrap();

        run(&mut model, &fabric, 300.0);
        assert!(model.scrammed());
        // Post-SCRAM the core cools back below critical.
        assert!(model.core_temp_c() < 300.0);
    }

    #[test]
    fn containment_breach_is_terminal() {
        // Both interlocks defeated (a sabotage scenario): the thaumic field
        // saturates and erodes containment to zero.
        let params = ReactorParams {
            critical_temp_c: 2000.0,
            containment_scram_pct: 0.0,
            thermal_tau_s: 5.0,
            ..ReactorParams::default()
        };
        let (fabric, mut model) = rig(params);
        fabric
            .write("reactor_plc_1", addr::POWER_SETPOINT, Value::Word(150))
            .unwrap();

        let mut rx = fabric.events().subscribe();
        let mut breached = false;
        for _ in 0..20_000 {
            model.step(0.1, &fabric).unwrap();
            if !model.running() {
                breached = true;
                break;
            }
        }
        assert!(breached, "containment should eventually fail");
        let mut saw_breach = false;
        while let Ok(ev) = rx.try_recv() {
            if matches!(ev, KernelEvent::ContainmentBreach { .. }) {
                saw_breach = true;
            }
        }
        assert!(saw_breach);
        assert_eq!(
            fabric.read("reactor_plc_1", addr::RUNNING).unwrap(),
            Some(Value::Bit(false))
        );
    }
}
