//! The state fabric: device registry + per-device memory maps.
//!
//! The registry map is behind an `RwLock` taken briefly to find a device
//! slot; all state mutation then serializes on that device's own lock.
//! Readers and writers of different devices never contend.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::info;

use crate::clock::ClockHandle;
use crate::error::{FabricError, FabricResult};
use pal_common::device::{DeviceInfo, DeviceKind, ProtocolTag};
use pal_common::events::{EventBus, KernelEvent};
use pal_common::memory::{AddressKey, MapDelta, MemoryMap, MemoryMapSnapshot, Value};

/// Mutable per-device runtime state, behind the device lock.
#[derive(Debug)]
struct DeviceState {
    online: bool,
    last_update: f64,
    memory: MemoryMap,
}

/// One registered device: immutable info + locked state.
#[derive(Debug)]
struct DeviceSlot {
    info: DeviceInfo,
    state: Mutex<DeviceState>,
}

/// Aggregate status snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct FabricSummary {
    /// Registered devices.
    pub devices_total: usize,
    /// Devices currently online.
    pub devices_online: usize,
    /// Device count per kind.
    pub by_kind: BTreeMap<DeviceKind, usize>,
    /// Device count per declared protocol.
    pub by_protocol: BTreeMap<ProtocolTag, usize>,
    /// Simulated time at the snapshot [s].
    pub sim_time: f64,
    /// Completed orchestrator cycles.
    pub cycles: u64,
}

/// The shared state fabric.
#[derive(Debug)]
pub struct Fabric {
    clock: ClockHandle,
    devices: RwLock<HashMap<String, Arc<DeviceSlot>>>,
    events: EventBus,
}

impl Fabric {
    /// Create an empty fabric bound to the clock and event bus.
    pub fn new(clock: ClockHandle, events: EventBus) -> Self {
        Self {
            clock,
            devices: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Register a device. Fails with [`FabricError::DuplicateDevice`] when
    /// the name is taken. The device starts online with an empty memory map.
    pub fn register(&self, info: DeviceInfo) -> FabricResult<()> {
        let mut devices = self.devices.write();
        if devices.contains_key(&info.name) {
            return Err(FabricError::DuplicateDevice { name: info.name });
        }
        let name = info.name.clone();
        info!(device = %name, kind = %info.kind, "device registered");
        devices.insert(
            name.clone(),
            Arc::new(DeviceSlot {
                info,
                state: Mutex::new(DeviceState {
                    online: true,
                    last_update: self.clock.now(),
                    memory: MemoryMap::new(),
                }),
            }),
        );
        drop(devices);
        self.events.emit(KernelEvent::DeviceRegistered { name });
        Ok(())
    }

    fn slot(&self, name: &str) -> FabricResult<Arc<DeviceSlot>> {
        self.devices
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| FabricError::UnknownDevice {
                name: name.to_string(),
            })
    }

    /// Run a closure against a device's memory map under its lock.
    ///
    /// Used at boot by physics models and scan roles to map addresses and
    /// register aliases. Does not bump `last_update`.
    pub fn install<R>(&self, name: &str, f: impl FnOnce(&mut MemoryMap) -> R) -> FabricResult<R> {
        let slot = self.slot(name)?;
        let mut state = slot.state.lock();
        Ok(f(&mut state.memory))
    }

    /// Read one address. `Ok(None)` means the address is unmapped.
    pub fn read(&self, name: &str, key: AddressKey) -> FabricResult<Option<Value>> {
        let slot = self.slot(name)?;
        let state = slot.state.lock();
        Ok(state.memory.read(key))
    }

    /// Read by alias or canonical string key.
    pub fn read_key(&self, name: &str, key: &str) -> FabricResult<Option<Value>> {
        let slot = self.slot(name)?;
        let state = slot.state.lock();
        let canon = state.memory.resolve(key)?;
        Ok(state.memory.read(canon))
    }

    /// Write one address with type checking; bumps `last_update`.
    pub fn write(&self, name: &str, key: AddressKey, value: Value) -> FabricResult<()> {
        let slot = self.slot(name)?;
        let mut state = slot.state.lock();
        state.memory.write(key, value)?;
        state.last_update = self.clock.now();
        Ok(())
    }

    /// Write by alias or canonical string key.
    pub fn write_key(&self, name: &str, key: &str, value: Value) -> FabricResult<()> {
        let slot = self.slot(name)?;
        let mut state = slot.state.lock();
        let canon = state.memory.resolve(key)?;
        state.memory.write(canon, value)?;
        state.last_update = self.clock.now();
        Ok(())
    }

    /// Resolve an alias or canonical string key on a device.
    pub fn resolve_key(&self, name: &str, key: &str) -> FabricResult<AddressKey> {
        let slot = self.slot(name)?;
        let state = slot.state.lock();
        Ok(state.memory.resolve(key)?)
    }

    /// Apply a delta atomically with respect to all other writes on the
    /// same device. Not a cross-device transaction.
    pub fn write_bulk(&self, name: &str, delta: &MapDelta) -> FabricResult<()> {
        let slot = self.slot(name)?;
        let mut state = slot.state.lock();
        state.memory.apply(delta)?;
        state.last_update = self.clock.now();
        Ok(())
    }

    /// Snapshot a device's full memory map.
    pub fn read_bulk(&self, name: &str) -> FabricResult<MemoryMapSnapshot> {
        let slot = self.slot(name)?;
        let state = slot.state.lock();
        Ok(state.memory.snapshot())
    }

    /// Mark a device online/offline.
    pub fn set_online(&self, name: &str, online: bool) -> FabricResult<()> {
        let slot = self.slot(name)?;
        let mut state = slot.state.lock();
        state.online = online;
        state.last_update = self.clock.now();
        Ok(())
    }

    /// Whether a device is online.
    pub fn online(&self, name: &str) -> FabricResult<bool> {
        Ok(self.slot(name)?.state.lock().online)
    }

    /// Simulated time of the device's last successful mutation.
    pub fn last_update(&self, name: &str) -> FabricResult<f64> {
        Ok(self.slot(name)?.state.lock().last_update)
    }

    /// Static info for a device.
    pub fn device_info(&self, name: &str) -> FabricResult<DeviceInfo> {
        Ok(self.slot(name)?.info.clone())
    }

    /// All device names, sorted (the stable iteration order used by the
    /// orchestrator for reproducible runs).
    pub fn device_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.devices.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Names of devices of the given kind, sorted.
    pub fn list_by_kind(&self, kind: DeviceKind) -> Vec<String> {
        let mut names: Vec<String> = self
            .devices
            .read()
            .values()
            .filter(|slot| slot.info.kind == kind)
            .map(|slot| slot.info.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Names of devices declaring the given protocol, sorted.
    pub fn list_by_protocol(&self, tag: ProtocolTag) -> Vec<String> {
        let mut names: Vec<String> = self
            .devices
            .read()
            .values()
            .filter(|slot| slot.info.speaks(tag))
            .map(|slot| slot.info.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Aggregate status snapshot.
    pub fn summary(&self) -> FabricSummary {
        let devices = self.devices.read();
        let mut by_kind = BTreeMap::new();
        let mut by_protocol = BTreeMap::new();
        let mut online = 0;
        for slot in devices.values() {
            *by_kind.entry(slot.info.kind).or_insert(0) += 1;
            for tag in &slot.info.protocols {
                *by_protocol.entry(*tag).or_insert(0) += 1;
            }
            if slot.state.lock().online {
                online += 1;
            }
        }
        FabricSummary {
            devices_total: devices.len(),
            devices_online: online,
            by_kind,
            by_protocol,
            sim_time: self.clock.now(),
            cycles: self.clock.cycles(),
        }
    }

    /// The event bus shared with the rest of the kernel.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// The clock handle shared with the rest of the kernel.
    pub fn clock(&self) -> &ClockHandle {
        &self.clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ClockMode, SimClock};
    use pal_common::memory::MemoryError;

    fn fabric() -> Fabric {
        Fabric::new(SimClock::new(ClockMode::Stepped), EventBus::new(16))
    }

    fn register_plc(fabric: &Fabric, name: &str) {
        fabric
            .register(
                DeviceInfo::new(name, DeviceKind::Plc, 1).with_protocol(ProtocolTag::ModbusTcp),
            )
            .unwrap();
        fabric
            .install(name, |mem| {
                mem.map_word(AddressKey::holding(0), 0);
                mem.map_word(AddressKey::input(0), 0);
                mem.map_bit(AddressKey::coil(10), false);
                mem.alias("speed_setpoint_rpm", AddressKey::holding(0));
            })
            .unwrap();
    }

    #[test]
    fn duplicate_registration_rejected() {
        let fabric = fabric();
        register_plc(&fabric, "plc_1");
        let err = fabric
            .register(DeviceInfo::new("plc_1", DeviceKind::Plc, 2))
            .unwrap_err();
        assert_eq!(
            err,
            FabricError::DuplicateDevice {
                name: "plc_1".into()
            }
        );
    }

    #[test]
    fn unknown_device_errors() {
        let fabric = fabric();
        assert!(matches!(
            fabric.read("ghost", AddressKey::holding(0)),
            Err(FabricError::UnknownDevice { .. })
        ));
        assert!(matches!(
            fabric.write("ghost", AddressKey::holding(0), Value::Word(1)),
            Err(FabricError::UnknownDevice { .. })
        ));
    }

    #[test]
    fn typed_write_and_alias_read() {
        let fabric = fabric();
        register_plc(&fabric, "plc_1");

        fabric
            .write_key("plc_1", "speed_setpoint_rpm", Value::Word(3600))
            .unwrap();
        assert_eq!(
            fabric.read("plc_1", AddressKey::holding(0)).unwrap(),
            Some(Value::Word(3600))
        );

        let err = fabric
            .write("plc_1", AddressKey::coil(10), Value::Word(1))
            .unwrap_err();
        assert!(matches!(
            err,
            FabricError::Memory(MemoryError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn last_update_tracks_clock() {
        let fabric = fabric();
        register_plc(&fabric, "plc_1");
        fabric.clock().step(5.0).unwrap();
        fabric
            .write("plc_1", AddressKey::holding(0), Value::Word(1))
            .unwrap();
        assert_eq!(fabric.last_update("plc_1").unwrap(), 5.0);
    }

    #[test]
    fn listing_is_sorted() {
        let fabric = fabric();
        register_plc(&fabric, "zeta");
        register_plc(&fabric, "alpha");
        fabric
            .register(DeviceInfo::new("scada_1", DeviceKind::Scada, 9))
            .unwrap();

        assert_eq!(fabric.device_names(), vec!["alpha", "scada_1", "zeta"]);
        assert_eq!(fabric.list_by_kind(DeviceKind::Plc), vec!["alpha", "zeta"]);
        assert_eq!(
            fabric.list_by_protocol(ProtocolTag::ModbusTcp),
            vec!["alpha", "zeta"]
        );
    }

    #[test]
    fn summary_counts() {
        let fabric = fabric();
        register_plc(&fabric, "plc_1");
        register_plc(&fabric, "plc_2");
        fabric.set_online("plc_2", false).unwrap();

        let summary = fabric.summary();
        assert_eq!(summary.devices_total, 2);
        assert_eq!(summary.devices_online, 1);
        assert_eq!(summary.by_kind[&DeviceKind::Plc], 2);
        assert_eq!(summary.by_protocol[&ProtocolTag::ModbusTcp], 2);
    }

    #[test]
    fn bulk_write_is_atomic_per_device() {
        let fabric = fabric();
        register_plc(&fabric, "plc_1");
        let bad = vec![
            (AddressKey::holding(0), Value::Word(7)),
            (AddressKey::holding(500), Value::Word(1)),
        ];
        assert!(fabric.write_bulk("plc_1", &bad).is_err());
        assert_eq!(
            fabric.read("plc_1", AddressKey::holding(0)).unwrap(),
            Some(Value::Word(0))
        );
    }
}
