//! Boot sequence, tick loop, protocol sync cycle, shutdown.
//!
//! Boot order is strict and any failure aborts cleanly: clock → fabric →
//! device registration → physics → scan machines → topology/gate →
//! listeners → tick loop. The only boot error treated as survivable is a
//! listener bind failure — the simulator stays usable for the listeners
//! that bound.
//!
//! Per tick: physics (stable device order) → due scans → protocol sync
//! (pull client writes, apply, push fresh snapshot) → cycle count. In
//! `Stepped` mode with no external connections the whole state sequence is
//! a pure function of the catalogue and the `step(dt)` calls.

use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info, warn};

use pal_common::config::{
    ConfigError, DeviceConfig, PhysicsConfig, RoleConfig, SimConfig,
};
use pal_common::consts::DEFAULT_SCAN_FAULT_THRESHOLD;
use pal_common::device::{DeviceInfo, ProtocolTag};
use pal_common::events::{EventBus, KernelEvent};
use pal_common::memory::Value;
use pal_devices::historian::HistorianScan;
use pal_devices::hmi::HmiScan;
use pal_devices::plc::{Interlock, PlcScan};
use pal_devices::safety::SafetyPlcScan;
use pal_devices::scada::ScadaScan;
use pal_devices::{ScanError, ScanLogic, ScanRunner};
use pal_fabric::clock::{ClockHandle, SimClock};
use pal_fabric::error::ClockError;
use pal_fabric::{Fabric, FabricError, FabricSummary};
use pal_net::{ReachabilityGate, ServiceEntry, Topology, TopologyError};
use pal_physics::grid::GridModel;
use pal_physics::hvac::HvacModel;
use pal_physics::powerflow::PowerFlowModel;
use pal_physics::reactor::ReactorModel;
use pal_physics::turbine::{self, TurbineModel};
use pal_physics::{PhysicsError, PhysicsModel};
use pal_protocols::minimal::MinimalServer;
use pal_protocols::modbus::{ModbusServer, ModbusServerConfig};
use pal_protocols::{ProtocolServer, SharedMirror};

/// Boot failure. Every variant aborts initialization with a diagnostic.
#[derive(Debug, Error)]
pub enum BootError {
    /// Clock section invalid.
    #[error(transparent)]
    Clock(#[from] ClockError),

    /// Catalogue invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Device registration failed.
    #[error(transparent)]
    Fabric(#[from] FabricError),

    /// Topology references unregistered devices.
    #[error(transparent)]
    Topology(#[from] TopologyError),

    /// Physics install failed.
    #[error(transparent)]
    Physics(#[from] PhysicsError),

    /// Scan machine install failed.
    #[error(transparent)]
    Scan(#[from] ScanError),
}

/// One physics integrator plus its fault latch.
struct IntegratorSlot {
    model: Box<dyn PhysicsModel>,
    dead: bool,
}

/// The assembled simulator.
pub struct Simulator {
    clock: ClockHandle,
    fabric: Arc<Fabric>,
    events: EventBus,
    gate: Arc<ReachabilityGate>,
    integrators: Vec<IntegratorSlot>,
    scans: Vec<ScanRunner>,
    listeners: Vec<Box<dyn ProtocolServer>>,
    update_interval: Duration,
}

impl Simulator {
    /// Boot from a validated catalogue. Listener bind failures are logged
    /// and skipped; everything else is fatal.
    pub async fn boot(cfg: SimConfig) -> Result<Self, BootError> {
        cfg.validate()?;

        // 1–2. Clock, fabric.
        let clock = SimClock::from_config(&cfg.clock)?;
        let events = EventBus::default();
        let fabric = Arc::new(Fabric::new(clock.clone(), events.clone()));

        // 3. Register devices.
        for dev in &cfg.devices {
            let mut info = DeviceInfo::new(&dev.name, dev.kind, dev.device_id);
            info.metadata = dev.metadata.clone();
            for ep in &dev.endpoints {
                info = info.with_protocol(ep.protocol);
            }
            fabric.register(info)?;
        }

        // 4. Physics integrators, stable order by device name.
        let mut integrators: Vec<IntegratorSlot> = Vec::new();
        for dev in &cfg.devices {
            if let Some(model) = build_physics(dev) {
                model.install(&fabric)?;
                integrators.push(IntegratorSlot { model, dead: false });
            }
        }
        integrators.sort_by(|a, b| a.model.device().cmp(b.model.device()));

        // 5. Scan machines, stable order by device name.
        let mut scans: Vec<ScanRunner> = Vec::new();
        for dev in &cfg.devices {
            let logic = build_scan(dev);
            // Historians sample at their own configured rate.
            let interval_ms = match &dev.role {
                Some(RoleConfig::Historian(h)) => h.sample_interval_ms,
                _ => dev.scan_interval_ms,
            };
            let mut runner = ScanRunner::new(
                logic,
                interval_ms as f64 / 1000.0,
                DEFAULT_SCAN_FAULT_THRESHOLD,
            );
            runner.install(&fabric)?;
            scans.push(runner);
        }
        scans.sort_by(|a, b| a.device().cmp(b.device()));

        // Initial memory overrides from the catalogue.
        for dev in &cfg.devices {
            for (key, raw) in &dev.initial {
                let canon = fabric.resolve_key(&dev.name, key)?;
                let value = toml_value(raw).ok_or_else(|| {
                    ConfigError::Invalid(format!(
                        "{}: initial value for {key} must be a bool or 0..=65535",
                        dev.name
                    ))
                })?;
                fabric.write(&dev.name, canon, value)?;
            }
        }

        // 6. Topology into the gate; memberships must reference registered
        // devices.
        let registered: BTreeSet<String> = fabric.device_names().into_iter().collect();
        let topology = Topology::from_config(&cfg, &registered)?;
        let gate = Arc::new(ReachabilityGate::new(topology, events.clone()));

        // 7–8. Listeners: construct, start, register services. A failed
        // bind loses that listener only.
        let mut listeners: Vec<Box<dyn ProtocolServer>> = Vec::new();
        for dev in &cfg.devices {
            for ep in &dev.endpoints {
                let port = if ep.port == 0 {
                    0
                } else {
                    ep.port + cfg.port_offset
                };
                let mirror = SharedMirror::new(fabric.read_bulk(&dev.name)?);
                let mut listener: Box<dyn ProtocolServer> = match ep.protocol {
                    ProtocolTag::ModbusTcp => Box::new(ModbusServer::new(
                        &dev.name,
                        ModbusServerConfig::new(&ep.host, port, ep.unit_id),
                        mirror,
                        gate.clone(),
                        clock.clone(),
                    )),
                    tag => Box::new(MinimalServer::new(
                        &dev.name,
                        tag,
                        &ep.host,
                        port,
                        mirror,
                        gate.clone(),
                        clock.clone(),
                    )),
                };
                match listener.start().await {
                    Ok(()) => {
                        gate.register_service(ServiceEntry {
                            device: dev.name.clone(),
                            protocol: ep.protocol,
                            port: listener.port(),
                        });
                        listeners.push(listener);
                    }
                    Err(e) => {
                        warn!(
                            device = %dev.name,
                            protocol = %ep.protocol,
                            error = %e,
                            "listener failed to bind, continuing without it"
                        );
                    }
                }
            }
        }

        info!(
            devices = cfg.devices.len(),
            integrators = integrators.len(),
            listeners = listeners.len(),
            "simulator booted"
        );

        Ok(Self {
            clock,
            fabric,
            events,
            gate,
            integrators,
            scans,
            listeners,
            update_interval: Duration::from_millis(cfg.clock.update_interval_ms),
        })
    }

    /// The shared clock handle.
    pub fn clock(&self) -> &ClockHandle {
        &self.clock
    }

    /// The state fabric.
    pub fn fabric(&self) -> &Arc<Fabric> {
        &self.fabric
    }

    /// The event bus.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// The reachability gate.
    pub fn gate(&self) -> &Arc<ReachabilityGate> {
        &self.gate
    }

    /// Bound port of the listener for `(device, protocol)`, if any.
    pub fn service_port(&self, device: &str, protocol: ProtocolTag) -> Option<u16> {
        self.gate
            .services()
            .into_iter()
            .find(|s| s.device == device && s.protocol == protocol)
            .map(|s| s.port)
    }

    /// Aggregate status snapshot.
    pub fn summary(&self) -> FabricSummary {
        self.fabric.summary()
    }

    /// Advance one stepped-mode tick: move the clock by exactly `dt`, then
    /// run the full tick body.
    pub fn step(&mut self, dt: f64) -> Result<(), ClockError> {
        self.clock.step(dt)?;
        self.tick(dt);
        Ok(())
    }

    /// One tick: physics → scans → protocol sync → cycle count.
    fn tick(&mut self, dt: f64) {
        let now = self.clock.now();

        // Physics, in stable order. A panicking or erroring integrator
        // faults its device and is retired; the simulator continues.
        for slot in &mut self.integrators {
            if slot.dead {
                continue;
            }
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                slot.model.step(dt, &self.fabric)
            }));
            let failed = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some("panic in integrator".to_string()),
            };
            if let Some(reason) = failed {
                let device = slot.model.device().to_string();
                error!(device = %device, reason, "physics integrator faulted");
                slot.dead = true;
                let _ = self.fabric.set_online(&device, false);
                self.events.emit(KernelEvent::DeviceFaulted {
                    name: device,
                    failures: 1,
                });
            }
        }

        // Scan cycles for every due machine.
        for runner in &mut self.scans {
            runner.poll(now, &self.fabric);
        }

        // Protocol sync: harvest client writes first, then republish the
        // post-write snapshot so internal coil changes become visible.
        for listener in &self.listeners {
            let writes = listener.mirror_pull();
            if !writes.is_empty() {
                if let Err(e) = self.fabric.write_bulk(listener.device(), &writes) {
                    warn!(
                        device = %listener.device(),
                        error = %e,
                        "client write batch rejected"
                    );
                }
            }
            match self.fabric.read_bulk(listener.device()) {
                Ok(snapshot) => listener.mirror_push(snapshot),
                Err(e) => warn!(device = %listener.device(), error = %e, "mirror push failed"),
            }
        }

        self.clock.bump_cycle();
    }

    /// Drive the tick loop in `RealTime`/`Accelerated` mode until the
    /// returned future is cancelled or [`Simulator::shutdown`] is called
    /// from another handle.
    pub async fn run(&mut self) {
        let mut interval = tokio::time::interval(self.update_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last = self.clock.now();
        loop {
            interval.tick().await;
            let now = self.clock.now();
            let dt = now - last;
            last = now;
            if dt > 0.0 {
                self.tick(dt);
            }
        }
    }

    /// Graceful shutdown: listeners first (refuse new connections, drain
    /// sessions), then the tick loop stops with the owner, then state.
    pub async fn shutdown(&mut self) {
        info!("simulator shutting down");
        for listener in &mut self.listeners {
            listener.stop().await;
        }
        self.listeners.clear();
        self.integrators.clear();
        info!("simulator stopped");
    }
}

/// Construct the physics model declared on a device, if any.
fn build_physics(dev: &DeviceConfig) -> Option<Box<dyn PhysicsModel>> {
    let model: Box<dyn PhysicsModel> = match dev.physics.clone()? {
        PhysicsConfig::Turbine(params) => Box::new(TurbineModel::new(&dev.name, params)),
        PhysicsConfig::Reactor(params) => Box::new(ReactorModel::new(&dev.name, params)),
        PhysicsConfig::Hvac(params) => Box::new(HvacModel::new(&dev.name, params)),
        PhysicsConfig::Grid(params) => Box::new(GridModel::new(&dev.name, params)),
        PhysicsConfig::PowerFlow(params) => Box::new(PowerFlowModel::new(&dev.name, params)),
    };
    Some(model)
}

/// Construct the scan machine for a device from its role (or the plain
/// outstation scan when it has none).
fn build_scan(dev: &DeviceConfig) -> Box<dyn ScanLogic> {
    match dev.role.clone() {
        Some(RoleConfig::Safety(cfg)) => Box::new(SafetyPlcScan::new(&dev.name, cfg)),
        Some(RoleConfig::Scada(cfg)) => Box::new(ScadaScan::new(&dev.name, cfg)),
        Some(RoleConfig::Hmi(cfg)) => Box::new(HmiScan::new(&dev.name, cfg)),
        Some(RoleConfig::Historian(cfg)) => Box::new(HistorianScan::new(&dev.name, cfg)),
        None => {
            // Turbine PLCs carry the hardwired destruction cutout: severe
            // damage forces the governor off.
            let interlocks = match &dev.physics {
                Some(PhysicsConfig::Turbine(_)) => vec![Interlock {
                    watch: turbine::addr::SEVERE_DAMAGE_ALARM,
                    target: turbine::addr::GOVERNOR_ENABLED,
                    force: Value::Bit(false),
                }],
                _ => Vec::new(),
            };
            Box::new(PlcScan::new(&dev.name, interlocks))
        }
    }
}

/// Convert a TOML initial value into a typed memory value.
fn toml_value(raw: &toml::Value) -> Option<Value> {
    match raw {
        toml::Value::Boolean(b) => Some(Value::Bit(*b)),
        toml::Value::Integer(i) => u16::try_from(*i).ok().map(Value::Word),
        _ => None,
    }
}
