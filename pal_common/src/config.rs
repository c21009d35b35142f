//! Declarative TOML catalogue: clock, devices (with physics and roles),
//! networks, memberships, and allow rules.
//!
//! Loading is two-phase: parse, then validate. Every violation is
//! boot-fatal — the simulator refuses to start on an inconsistent catalogue.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consts::{DEFAULT_SCAN_INTERVAL_MS, DEFAULT_UPDATE_INTERVAL_MS};
use crate::device::{DeviceKind, ProtocolTag};

// ─── Error Type ─────────────────────────────────────────────────────

/// Configuration loading/validation error. Fatal at boot.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// Offending path.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// TOML parse error.
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Catalogue is internally inconsistent.
    #[error("config validation: {0}")]
    Invalid(String),
}

/// Result alias for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

// ─── Clock ──────────────────────────────────────────────────────────

/// Clock execution mode, as declared in the catalogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockModeConfig {
    /// Wall-clock pacing.
    #[default]
    RealTime,
    /// `speed ×` wall-clock pacing.
    Accelerated,
    /// Advance only via explicit `step(dt)`.
    Stepped,
    /// Frozen until resumed.
    Paused,
}

/// Clock section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClockConfig {
    /// Execution mode.
    #[serde(default)]
    pub mode: ClockModeConfig,
    /// Acceleration factor (only meaningful in `accelerated` mode).
    #[serde(default = "default_speed")]
    pub speed: f64,
    /// Wall pacing interval [ms].
    #[serde(default = "default_update_interval_ms")]
    pub update_interval_ms: u64,
}

fn default_speed() -> f64 {
    1.0
}

fn default_update_interval_ms() -> u64 {
    DEFAULT_UPDATE_INTERVAL_MS
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            mode: ClockModeConfig::default(),
            speed: 1.0,
            update_interval_ms: DEFAULT_UPDATE_INTERVAL_MS,
        }
    }
}

// ─── Physics ────────────────────────────────────────────────────────

/// Physics process bound to a device, with per-model parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PhysicsConfig {
    /// Steam turbine.
    Turbine(TurbineParams),
    /// Thaumically-assisted reactor.
    Reactor(ReactorParams),
    /// Zone HVAC.
    Hvac(HvacParams),
    /// Grid frequency (swing equation).
    Grid(GridParams),
    /// DC power-flow solver.
    PowerFlow(PowerFlowParams),
}

/// Turbine parameters. Defaults follow the plant data book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TurbineParams {
    /// Rated shaft speed [rpm].
    pub rated_speed_rpm: f64,
    /// Rated electrical output [MW].
    pub rated_power_mw: f64,
    /// Overspeed boundary [rpm] (110% of rated by default).
    pub max_safe_speed_rpm: f64,
    /// Governor acceleration limit [rpm/s].
    pub accel_rpm_per_s: f64,
    /// Coast-down deceleration [rpm/s].
    pub decel_rpm_per_s: f64,
    /// Emergency-trip deceleration [rpm/s] (steam cut + brake).
    pub trip_decel_rpm_per_s: f64,
    /// Bearing thermal time constant [s].
    pub bearing_tau_s: f64,
    /// Vibration floor [mm/s].
    pub vibration_baseline: f64,
    /// Vibration gain vs (speed/rated)².
    pub vibration_gain: f64,
    /// Initial shaft speed [rpm].
    pub initial_speed_rpm: f64,
}

impl Default for TurbineParams {
    fn default() -> Self {
        Self {
            rated_speed_rpm: 3600.0,
            rated_power_mw: 50.0,
            max_safe_speed_rpm: 3960.0,
            accel_rpm_per_s: 100.0,
            decel_rpm_per_s: 50.0,
            trip_decel_rpm_per_s: 240.0,
            bearing_tau_s: 10.0,
            vibration_baseline: 1.2,
            vibration_gain: 2.0,
            initial_speed_rpm: 0.0,
        }
    }
}

/// Reactor parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReactorParams {
    /// Rated core temperature [°C].
    pub rated_temp_c: f64,
    /// Auto-SCRAM threshold [°C].
    pub critical_temp_c: f64,
    /// Containment integrity auto-SCRAM threshold [%].
    pub containment_scram_pct: f64,
    /// Core thermal time constant [s].
    pub thermal_tau_s: f64,
    /// Reaction kinetics time constant [s].
    pub kinetics_tau_s: f64,
    /// Initial reaction rate [% of rated].
    pub initial_reaction_pct: f64,
}

impl Default for ReactorParams {
    fn default() -> Self {
        Self {
            rated_temp_c: 550.0,
            critical_temp_c: 700.0,
            containment_scram_pct: 50.0,
            thermal_tau_s: 30.0,
            kinetics_tau_s: 8.0,
            initial_reaction_pct: 0.0,
        }
    }
}

/// HVAC parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HvacParams {
    /// Zone thermal time constant at full fan [s].
    pub thermal_tau_s: f64,
    /// Humidity time constant [s].
    pub humidity_tau_s: f64,
    /// Allowed temperature band around setpoint [°C].
    pub stability_band_c: f64,
    /// Initial zone temperature [°C].
    pub initial_temp_c: f64,
    /// Initial zone humidity [%].
    pub initial_humidity_pct: f64,
}

impl Default for HvacParams {
    fn default() -> Self {
        Self {
            thermal_tau_s: 120.0,
            humidity_tau_s: 300.0,
            stability_band_c: 2.0,
            initial_temp_c: 21.0,
            initial_humidity_pct: 45.0,
        }
    }
}

/// Grid-frequency parameters (swing equation).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridParams {
    /// Nominal frequency [Hz].
    #[serde(default = "default_f_nom")]
    pub f_nom_hz: f64,
    /// System inertia [MW·s].
    #[serde(default = "default_inertia")]
    pub inertia_mw_s: f64,
    /// Linear damping [MW/Hz].
    #[serde(default = "default_damping")]
    pub damping_mw_per_hz: f64,
    /// Under-frequency protection limit [Hz].
    #[serde(default = "default_under_f")]
    pub under_frequency_hz: f64,
    /// Over-frequency protection limit [Hz].
    #[serde(default = "default_over_f")]
    pub over_frequency_hz: f64,
    /// Aggregate load at boot [MW].
    #[serde(default)]
    pub initial_load_mw: f64,
    /// Devices whose generated power feeds the swing equation.
    pub generator_devices: Vec<String>,
}

fn default_f_nom() -> f64 {
    50.0
}
fn default_inertia() -> f64 {
    5000.0
}
fn default_damping() -> f64 {
    0.0
}
fn default_under_f() -> f64 {
    49.0
}
fn default_over_f() -> f64 {
    51.0
}

/// One transmission line in the DC power-flow model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LineConfig {
    /// Sending bus index.
    pub from: usize,
    /// Receiving bus index.
    pub to: usize,
    /// Line susceptance [p.u.].
    pub susceptance: f64,
    /// Thermal rating [MW].
    pub rating_mw: f64,
}

/// One bus in the DC power-flow model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BusConfig {
    /// Bus name (diagnostic only).
    pub name: String,
    /// Generator devices injecting at this bus.
    #[serde(default)]
    pub generators: Vec<String>,
    /// Static load withdrawn at this bus [MW].
    #[serde(default)]
    pub load_mw: f64,
}

/// DC power-flow parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerFlowParams {
    /// Buses, index 0 is the slack bus.
    pub buses: Vec<BusConfig>,
    /// Lines between buses.
    pub lines: Vec<LineConfig>,
}

// ─── Roles ──────────────────────────────────────────────────────────

/// Scan-cycle role for devices that are not plain physics-owning PLCs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RoleConfig {
    /// Safety controller watching one peer value and asserting a trip coil.
    Safety(SafetyRoleConfig),
    /// Supervisory tag database polled from field devices.
    Scada(ScadaRoleConfig),
    /// Operator screen polling one SCADA device.
    Hmi(HmiRoleConfig),
    /// Tag recorder.
    Historian(HistorianRoleConfig),
}

/// Safety PLC wiring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyRoleConfig {
    /// Peer device under protection.
    pub watch_device: String,
    /// Key (alias or canonical) observed on the peer.
    pub watch_key: String,
    /// Trip when the observed value exceeds this limit.
    pub trip_limit: f64,
    /// Authorized trip coil on the peer (alias or canonical key).
    pub trip_key: String,
}

/// One SCADA tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TagConfig {
    /// Logical tag name.
    pub name: String,
    /// Peer device holding the value.
    pub device: String,
    /// Key (alias or canonical) on the peer.
    pub key: String,
    /// Poll interval [ms sim].
    #[serde(default = "default_tag_poll_ms")]
    pub poll_interval_ms: u64,
    /// High alarm limit.
    #[serde(default)]
    pub alarm_high: Option<f64>,
    /// Low alarm limit.
    #[serde(default)]
    pub alarm_low: Option<f64>,
    /// Hysteresis deadband for alarm clearing.
    #[serde(default = "default_deadband")]
    pub deadband: f64,
}

fn default_tag_poll_ms() -> u64 {
    1000
}
fn default_deadband() -> f64 {
    0.0
}

/// SCADA role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScadaRoleConfig {
    /// Tag database.
    pub tags: Vec<TagConfig>,
}

/// HMI role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HmiRoleConfig {
    /// SCADA device polled by this screen.
    pub scada_device: String,
    /// Number of tag slots shown.
    #[serde(default = "default_screen_slots")]
    pub screen_slots: u16,
}

fn default_screen_slots() -> u16 {
    8
}

/// Historian role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistorianRoleConfig {
    /// Recorded tags as `(device, key)` pairs.
    pub tags: Vec<HistorianTagConfig>,
    /// Sample interval [ms sim].
    #[serde(default = "default_tag_poll_ms")]
    pub sample_interval_ms: u64,
}

/// One recorded historian tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HistorianTagConfig {
    /// Source device.
    pub device: String,
    /// Key (alias or canonical) on the source.
    pub key: String,
}

// ─── Devices / endpoints ────────────────────────────────────────────

/// One protocol listener endpoint on a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointConfig {
    /// Protocol served.
    pub protocol: ProtocolTag,
    /// Bind host.
    #[serde(default = "default_host")]
    pub host: String,
    /// Bind port (0 lets the OS pick — used by tests).
    pub port: u16,
    /// Modbus unit id (ignored by other protocols).
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_unit_id() -> u8 {
    1
}

/// One device in the catalogue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    /// Unique name.
    pub name: String,
    /// Device kind.
    pub kind: DeviceKind,
    /// Small integer id.
    pub device_id: u8,
    /// Scan interval [ms sim].
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
    /// Physics process owned by this device, if any.
    #[serde(default)]
    pub physics: Option<PhysicsConfig>,
    /// Scan role, if not a plain physics PLC.
    #[serde(default)]
    pub role: Option<RoleConfig>,
    /// Protocol endpoints.
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
    /// Initial memory values keyed by alias or canonical key.
    #[serde(default)]
    pub initial: HashMap<String, toml::Value>,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

fn default_scan_interval_ms() -> u64 {
    DEFAULT_SCAN_INTERVAL_MS
}

// ─── Topology ───────────────────────────────────────────────────────

/// One named network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkConfig {
    /// Network name.
    pub name: String,
    /// IPv4 subnet in CIDR form, e.g. `192.168.1.0/24`.
    pub subnet: String,
    /// VLAN tag.
    pub vlan: u16,
}

/// Devices attached to a network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MembershipConfig {
    /// Network name.
    pub network: String,
    /// Member devices.
    pub devices: Vec<String>,
}

/// Explicit cross-network allow rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AllowRuleConfig {
    /// Source network.
    pub src_network: String,
    /// Destination device.
    pub device: String,
    /// Protocol.
    pub protocol: ProtocolTag,
    /// Destination port.
    pub port: u16,
}

// ─── Root ───────────────────────────────────────────────────────────

/// The full simulation catalogue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimConfig {
    /// Clock section.
    #[serde(default)]
    pub clock: ClockConfig,
    /// Added to every configured listener port (unprivileged remapping).
    #[serde(default)]
    pub port_offset: u16,
    /// Network that unclassifiable peers fall back to.
    #[serde(default = "default_fallback_network")]
    pub fallback_network: String,
    /// Device catalogue.
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
    /// Networks.
    #[serde(default)]
    pub networks: Vec<NetworkConfig>,
    /// Memberships.
    #[serde(default)]
    pub memberships: Vec<MembershipConfig>,
    /// Cross-network allow rules.
    #[serde(default)]
    pub allow_rules: Vec<AllowRuleConfig>,
}

fn default_fallback_network() -> String {
    "corporate_network".to_string()
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            clock: ClockConfig::default(),
            port_offset: 0,
            fallback_network: default_fallback_network(),
            devices: Vec::new(),
            networks: Vec::new(),
            memberships: Vec::new(),
            allow_rules: Vec::new(),
        }
    }
}

impl SimConfig {
    /// Load and validate a catalogue from a TOML file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Parse and validate a catalogue from TOML text.
    pub fn from_toml(text: &str) -> ConfigResult<Self> {
        let cfg: Self = toml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Run the full validation pass.
    ///
    /// Rules: positive clock speed, unique device names, unique network
    /// names, memberships referencing declared networks and devices,
    /// safety/SCADA/HMI/grid wiring referencing declared devices, and
    /// syntactically valid subnets.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.clock.speed <= 0.0 || !self.clock.speed.is_finite() {
            return Err(ConfigError::Invalid(format!(
                "clock speed must be positive and finite, got {}",
                self.clock.speed
            )));
        }
        if self.clock.update_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "clock update_interval_ms must be non-zero".into(),
            ));
        }

        let mut names = HashSet::new();
        for dev in &self.devices {
            if !names.insert(dev.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate device name: {}",
                    dev.name
                )));
            }
            if dev.scan_interval_ms == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{}: scan_interval_ms must be non-zero",
                    dev.name
                )));
            }
        }

        let mut nets = HashSet::new();
        for net in &self.networks {
            if !nets.insert(net.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate network name: {}",
                    net.name
                )));
            }
            parse_cidr(&net.subnet).ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "network {}: bad subnet {:?}",
                    net.name, net.subnet
                ))
            })?;
        }

        for mem in &self.memberships {
            if !nets.contains(mem.network.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "membership references unknown network: {}",
                    mem.network
                )));
            }
            for dev in &mem.devices {
                if !names.contains(dev.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "membership in {} references unknown device: {dev}",
                        mem.network
                    )));
                }
            }
        }

        for rule in &self.allow_rules {
            if !nets.contains(rule.src_network.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "allow rule references unknown network: {}",
                    rule.src_network
                )));
            }
            if !names.contains(rule.device.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "allow rule references unknown device: {}",
                    rule.device
                )));
            }
        }

        // Cross-device wiring.
        for dev in &self.devices {
            match &dev.role {
                Some(RoleConfig::Safety(s)) => {
                    if !names.contains(s.watch_device.as_str()) {
                        return Err(ConfigError::Invalid(format!(
                            "{}: safety role watches unknown device {}",
                            dev.name, s.watch_device
                        )));
                    }
                }
                Some(RoleConfig::Scada(s)) => {
                    for tag in &s.tags {
                        if !names.contains(tag.device.as_str()) {
                            return Err(ConfigError::Invalid(format!(
                                "{}: tag {} polls unknown device {}",
                                dev.name, tag.name, tag.device
                            )));
                        }
                    }
                }
                Some(RoleConfig::Hmi(h)) => {
                    if !names.contains(h.scada_device.as_str()) {
                        return Err(ConfigError::Invalid(format!(
                            "{}: HMI polls unknown SCADA {}",
                            dev.name, h.scada_device
                        )));
                    }
                }
                Some(RoleConfig::Historian(h)) => {
                    for tag in &h.tags {
                        if !names.contains(tag.device.as_str()) {
                            return Err(ConfigError::Invalid(format!(
                                "{}: historian records unknown device {}",
                                dev.name, tag.device
                            )));
                        }
                    }
                }
                None => {}
            }
            if let Some(PhysicsConfig::Grid(g)) = &dev.physics {
                for source in &g.generator_devices {
                    if !names.contains(source.as_str()) {
                        return Err(ConfigError::Invalid(format!(
                            "{}: grid aggregates unknown generator {source}",
                            dev.name
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

/// Parse `a.b.c.d/len` into `(network_u32, prefix_len)`.
///
/// Shared between validation here and peer classification in the gate.
pub fn parse_cidr(s: &str) -> Option<(u32, u8)> {
    let (addr, len) = s.split_once('/')?;
    let len: u8 = len.parse().ok()?;
    if len > 32 {
        return None;
    }
    let ip: std::net::Ipv4Addr = addr.parse().ok()?;
    let mask = if len == 0 { 0 } else { u32::MAX << (32 - len) };
    Some((u32::from(ip) & mask, len))
}
