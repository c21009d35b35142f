//! Steam turbine integrator.
//!
//! Shaft speed tracks the governor target under acceleration/deceleration
//! limits. Above the overspeed boundary, blade damage accumulates — fast
//! from instantaneous overshoot, and cumulatively from fatigue as overspeed
//! seconds pile up. Past 50% damage the machine fails catastrophically:
//! `running` drops and the shaft spins down at twice the coast rate.

use bitflags::bitflags;
use tracing::warn;

use crate::{PhysicsModel, PhysicsResult, encode_u16, encode_x10, first_order};
use pal_common::config::TurbineParams;
use pal_common::memory::{AddressKey, Value};
use pal_fabric::Fabric;

/// Address layout on the owning device.
pub mod addr {
    use pal_common::memory::AddressKey;

    /// Governor speed target [rpm] (externally writable).
    pub const SPEED_SETPOINT: AddressKey = AddressKey::holding(0);

    /// Machine producing torque.
    pub const RUNNING: AddressKey = AddressKey::coil(0);
    /// Shaft above the overspeed boundary.
    pub const OVERSPEED_ALARM: AddressKey = AddressKey::coil(1);
    /// Vibration above the ISO alert level.
    pub const HIGH_VIBRATION_ALARM: AddressKey = AddressKey::coil(2);
    /// Bearing temperature above limit.
    pub const HIGH_BEARING_TEMP_ALARM: AddressKey = AddressKey::coil(3);
    /// Damage past the catastrophic threshold.
    pub const SEVERE_DAMAGE_ALARM: AddressKey = AddressKey::coil(4);
    /// Governor closed-loop control enabled.
    pub const GOVERNOR_ENABLED: AddressKey = AddressKey::coil(10);
    /// Emergency trip (steam cut + brake). Asserted by clients or a peer SIS.
    pub const EMERGENCY_TRIP: AddressKey = AddressKey::coil(11);

    /// Read-only mirror of [`RUNNING`].
    pub const RUNNING_STS: AddressKey = AddressKey::discrete(0);
    /// Read-only mirror of [`OVERSPEED_ALARM`].
    pub const OVERSPEED_STS: AddressKey = AddressKey::discrete(1);
    /// Read-only mirror of [`EMERGENCY_TRIP`].
    pub const TRIPPED_STS: AddressKey = AddressKey::discrete(2);

    /// Shaft speed [rpm], truncated.
    pub const SHAFT_SPEED: AddressKey = AddressKey::input(0);
    /// Steam pressure [bar × 10].
    pub const STEAM_PRESSURE: AddressKey = AddressKey::input(1);
    /// Steam temperature [°C].
    pub const STEAM_TEMP: AddressKey = AddressKey::input(2);
    /// Bearing temperature [°C].
    pub const BEARING_TEMP: AddressKey = AddressKey::input(3);
    /// Shaft vibration [mm/s × 10].
    pub const VIBRATION: AddressKey = AddressKey::input(4);
    /// Electrical output [MW × 10].
    pub const POWER: AddressKey = AddressKey::input(5);
    /// Accumulated overspeed time [s].
    pub const OVERSPEED_SECONDS: AddressKey = AddressKey::input(6);
    /// Blade damage [% × 10].
    pub const DAMAGE: AddressKey = AddressKey::input(7);
}

bitflags! {
    /// Latched-for-the-tick alarm word (mirrored into alarm coils).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TurbineAlarms: u8 {
        /// Above the overspeed boundary.
        const OVERSPEED = 1 << 0;
        /// Vibration alert.
        const HIGH_VIBRATION = 1 << 1;
        /// Bearing temperature alert.
        const HIGH_BEARING_TEMP = 1 << 2;
        /// Catastrophic damage.
        const SEVERE_DAMAGE = 1 << 3;
    }
}

// Fixed plant characteristics (not worth a config knob).
const AMBIENT_BEARING_C: f64 = 40.0;
const BEARING_RISE_C: f64 = 45.0;
const BEARING_LIMIT_C: f64 = 90.0;
const VIBRATION_ALERT_MM_S: f64 = 7.5;
/// Extra vibration per unit of speed ratio above the overspeed boundary.
const OVERSPEED_VIBRATION_GAIN: f64 = 30.0;
/// Instantaneous damage slope: 1 %/s at 120% rated, linear above 110%.
const OVERSPEED_DAMAGE_SLOPE: f64 = 10.0;
/// Fatigue damage per second, per accumulated overspeed second.
const OVERSPEED_FATIGUE_RATE: f64 = 0.3;
/// Damage fraction past which the machine destroys itself.
const SEVERE_DAMAGE_PCT: f64 = 50.0;
const STEAM_TAU_S: f64 = 5.0;

/// Steam turbine physics bound to one PLC device.
#[derive(Debug)]
pub struct TurbineModel {
    device: String,
    params: TurbineParams,

    shaft_speed_rpm: f64,
    bearing_temp_c: f64,
    steam_pressure_bar: f64,
    steam_temp_c: f64,
    vibration_mm_s: f64,
    power_mw: f64,
    overspeed_accumulated_s: f64,
    damage_pct: f64,
    running: bool,
    alarms: TurbineAlarms,
}

impl TurbineModel {
    /// Create a turbine bound to `device`.
    pub fn new(device: impl Into<String>, params: TurbineParams) -> Self {
        let initial_speed = params.initial_speed_rpm;
        Self {
            device: device.into(),
            shaft_speed_rpm: initial_speed,
            bearing_temp_c: AMBIENT_BEARING_C,
            steam_pressure_bar: 5.0,
            steam_temp_c: 180.0,
            vibration_mm_s: params.vibration_baseline,
            power_mw: 0.0,
            overspeed_accumulated_s: 0.0,
            damage_pct: 0.0,
            running: true,
            alarms: TurbineAlarms::default(),
            params,
        }
    }

    /// Current shaft speed [rpm].
    pub fn shaft_speed_rpm(&self) -> f64 {
        self.shaft_speed_rpm
    }

    /// Accumulated blade damage [%].
    pub fn damage_pct(&self) -> f64 {
        self.damage_pct
    }

    /// Current alarm word.
    pub fn alarms(&self) -> TurbineAlarms {
        self.alarms
    }

    /// Whether the machine is still producing torque.
    pub fn running(&self) -> bool {
        self.running
    }
}

impl PhysicsModel for TurbineModel {
    fn device(&self) -> &str {
        &self.device
    }

    fn install(&self, fabric: &Fabric) -> PhysicsResult<()> {
        fabric.install(&self.device, |mem| {
            mem.map_word(addr::SPEED_SETPOINT, encode_u16(self.params.initial_speed_rpm));

            for coil in [
                addr::OVERSPEED_ALARM,
                addr::HIGH_VIBRATION_ALARM,
                addr::HIGH_BEARING_TEMP_ALARM,
                addr::SEVERE_DAMAGE_ALARM,
                addr::GOVERNOR_ENABLED,
                addr::EMERGENCY_TRIP,
            ] {
                mem.map_bit(coil, false);
            }
            mem.map_bit(addr::RUNNING, true);

            mem.map_bit(addr::RUNNING_STS, true);
            mem.map_bit(addr::OVERSPEED_STS, false);
            mem.map_bit(addr::TRIPPED_STS, false);

            mem.map_word(addr::SHAFT_SPEED, encode_u16(self.shaft_speed_rpm));
            mem.map_word(addr::STEAM_PRESSURE, encode_x10(self.steam_pressure_bar));
            mem.map_word(addr::STEAM_TEMP, encode_u16(self.steam_temp_c));
            mem.map_word(addr::BEARING_TEMP, encode_u16(self.bearing_temp_c));
            mem.map_word(addr::VIBRATION, encode_x10(self.vibration_mm_s));
            mem.map_word(addr::POWER, 0);
            mem.map_word(addr::OVERSPEED_SECONDS, 0);
            mem.map_word(addr::DAMAGE, 0);

            mem.alias("speed_setpoint_rpm", addr::SPEED_SETPOINT);
            mem.alias("governor_enabled", addr::GOVERNOR_ENABLED);
            mem.alias("emergency_trip", addr::EMERGENCY_TRIP);
            mem.alias("running", addr::RUNNING);
            mem.alias("overspeed_alarm", addr::OVERSPEED_ALARM);
            mem.alias("shaft_speed_rpm", addr::SHAFT_SPEED);
            mem.alias("bearing_temp_c", addr::BEARING_TEMP);
            mem.alias("vibration_mm_s", addr::VIBRATION);
            mem.alias("power_mw", addr::POWER);
            mem.alias("damage_pct", addr::DAMAGE);
        })?;
        Ok(())
    }

    fn step(&mut self, dt: f64, fabric: &Fabric) -> PhysicsResult<()> {
        // ═══ READ CONTROLS ═══
        let snap = fabric.read_bulk(&self.device)?;
        let setpoint = snap
            .read(addr::SPEED_SETPOINT)
            .and_then(Value::as_word)
            .unwrap_or(0) as f64;
        let governor = snap
            .read(addr::GOVERNOR_ENABLED)
            .and_then(Value::as_bit)
            .unwrap_or(false);
        let tripped = snap
            .read(addr::EMERGENCY_TRIP)
            .and_then(Value::as_bit)
            .unwrap_or(false);

        // ═══ INTEGRATE ═══
        let p = &self.params;
        let severe = self.damage_pct >= SEVERE_DAMAGE_PCT;
        if severe && self.running {
            warn!(device = %self.device, damage = self.damage_pct, "turbine destroyed by overspeed damage");
            self.running = false;
        }

        // Target selection: trip dominates, then governor, else coast.
        let (target, rate) = if severe {
            (0.0, p.decel_rpm_per_s * 2.0)
        } else if tripped {
            (0.0, p.trip_decel_rpm_per_s)
        } else if governor {
            (setpoint.max(0.0), 0.0) // rate chosen below by error sign
        } else {
            (0.0, p.decel_rpm_per_s)
        };

        let rate = if rate > 0.0 {
            rate
        } else if target > self.shaft_speed_rpm {
            p.accel_rpm_per_s
        } else {
            p.decel_rpm_per_s
        };
        self.shaft_speed_rpm =
            crate::rate_limited(self.shaft_speed_rpm, target, rate, dt).max(0.0);

        let ratio = self.shaft_speed_rpm / p.rated_speed_rpm;
        let overspeed = self.shaft_speed_rpm > p.max_safe_speed_rpm;
        let boundary_ratio = p.max_safe_speed_rpm / p.rated_speed_rpm;

        if overspeed {
            self.overspeed_accumulated_s += dt;
            let instantaneous = OVERSPEED_DAMAGE_SLOPE * (ratio - boundary_ratio).max(0.0);
            let fatigue = OVERSPEED_FATIGUE_RATE * self.overspeed_accumulated_s;
            self.damage_pct = (self.damage_pct + dt * (instantaneous + fatigue)).min(100.0);
        }

        // Steam conditions follow governor demand.
        let steam_demand = if governor && !tripped && self.running {
            (target / p.rated_speed_rpm).clamp(0.0, 1.2)
        } else {
            0.0
        };
        self.steam_pressure_bar =
            first_order(self.steam_pressure_bar, 5.0 + 95.0 * steam_demand, STEAM_TAU_S, dt);
        self.steam_temp_c =
            first_order(self.steam_temp_c, 180.0 + 320.0 * steam_demand, STEAM_TAU_S, dt);

        // Bearing heats with the square of speed.
        self.bearing_temp_c = first_order(
            self.bearing_temp_c,
            AMBIENT_BEARING_C + BEARING_RISE_C * ratio * ratio,
            p.bearing_tau_s,
            dt,
        );

        // Vibration: floor + speed-squared term + overspeed excess + damage roughness.
        self.vibration_mm_s = p.vibration_baseline
            + p.vibration_gain * ratio * ratio
            + OVERSPEED_VIBRATION_GAIN * (ratio - boundary_ratio).max(0.0)
            + 0.05 * self.damage_pct;

        self.power_mw = if self.running && governor && !tripped {
            p.rated_power_mw * ratio.clamp(0.0, 1.2)
        } else {
            0.0
        };

        // ═══ ALARMS ═══
        self.alarms.set(TurbineAlarms::OVERSPEED, overspeed);
        self.alarms.set(
            TurbineAlarms::HIGH_VIBRATION,
            self.vibration_mm_s > VIBRATION_ALERT_MM_S,
        );
        self.alarms.set(
            TurbineAlarms::HIGH_BEARING_TEMP,
            self.bearing_temp_c > BEARING_LIMIT_C,
        );
        self.alarms
            .set(TurbineAlarms::SEVERE_DAMAGE, self.damage_pct >= SEVERE_DAMAGE_PCT);

        // ═══ WRITE TELEMETRY ═══
        let delta = vec![
            (addr::RUNNING, Value::Bit(self.running)),
            (
                addr::OVERSPEED_ALARM,
                Value::Bit(self.alarms.contains(TurbineAlarms::OVERSPEED)),
            ),
            (
                addr::HIGH_VIBRATION_ALARM,
                Value::Bit(self.alarms.contains(TurbineAlarms::HIGH_VIBRATION)),
            ),
            (
                addr::HIGH_BEARING_TEMP_ALARM,
                Value::Bit(self.alarms.contains(TurbineAlarms::HIGH_BEARING_TEMP)),
            ),
            (
                addr::SEVERE_DAMAGE_ALARM,
                Value::Bit(self.alarms.contains(TurbineAlarms::SEVERE_DAMAGE)),
            ),
            (addr::RUNNING_STS, Value::Bit(self.running)),
            (
                addr::OVERSPEED_STS,
                Value::Bit(self.alarms.contains(TurbineAlarms::OVERSPEED)),
            ),
            (addr::TRIPPED_STS, Value::Bit(tripped)),
            (addr::SHAFT_SPEED, Value::Word(encode_u16(self.shaft_speed_rpm))),
            (
                addr::STEAM_PRESSURE,
                Value::Word(encode_x10(self.steam_pressure_bar)),
            ),
            (addr::STEAM_TEMP, Value::Word(encode_u16(self.steam_temp_c))),
            (addr::BEARING_TEMP, Value::Word(encode_u16(self.bearing_temp_c))),
            (addr::VIBRATION, Value::Word(encode_x10(self.vibration_mm_s))),
            (addr::POWER, Value::Word(encode_x10(self.power_mw))),
            (
                addr::OVERSPEED_SECONDS,
                Value::Word(encode_u16(self.overspeed_accumulated_s)),
            ),
            (addr::DAMAGE, Value::Word(encode_x10(self.damage_pct))),
        ];
        fabric.write_bulk(&self.device, &delta)?;
        Ok(())
    }
}
