//! Historian scan: periodic tag snapshots into a bounded ring buffer.
//!
//! The buffer is fixed-capacity (`HISTORIAN_DEPTH` samples); when full, the
//! oldest sample is evicted. Timestamps are monotonic because samples are
//! appended with the scan's sim time. Nothing persists across restarts.

use heapless::Deque;

use crate::{ScanLogic, ScanResult};
use pal_common::config::HistorianRoleConfig;
use pal_common::consts::HISTORIAN_DEPTH;
use pal_common::memory::{AddressKey, Value};
use pal_fabric::Fabric;

/// Sample-count telemetry register (wraps at u16).
pub const SAMPLE_COUNT: AddressKey = AddressKey::input(0);

/// One recorded sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Sim time of the snapshot [s].
    pub t: f64,
    /// Index of the tag in the configured tag list.
    pub tag: u16,
    /// Raw recorded value.
    pub value: u16,
}

/// Tag recorder scan.
pub struct HistorianScan {
    device: String,
    cfg: HistorianRoleConfig,
    /// Resolved canonical keys, one per configured tag.
    keys: Vec<Option<AddressKey>>,
    buffer: Deque<Sample, HISTORIAN_DEPTH>,
    total_samples: u64,
}

impl HistorianScan {
    /// Create a historian scan from its role configuration.
    pub fn new(device: impl Into<String>, cfg: HistorianRoleConfig) -> Self {
        Self {
            device: device.into(),
            keys: vec![None; cfg.tags.len()],
            cfg,
            buffer: Deque::new(),
            total_samples: 0,
        }
    }

    /// Samples currently held, oldest first.
    pub fn samples(&self) -> impl Iterator<Item = &Sample> {
        self.buffer.iter()
    }

    /// Samples recorded over the whole run (including evicted ones).
    pub fn total_samples(&self) -> u64 {
        self.total_samples
    }
}

impl ScanLogic for HistorianScan {
    fn device(&self) -> &str {
        &self.device
    }

    fn install(&mut self, fabric: &Fabric) -> ScanResult<()> {
        fabric.install(&self.device, |mem| {
            mem.map_word(SAMPLE_COUNT, 0);
        })?;
        for (i, tag) in self.cfg.tags.iter().enumerate() {
            self.keys[i] = Some(fabric.resolve_key(&tag.device, &tag.key)?);
        }
        Ok(())
    }

    fn scan(&mut self, now: f64, fabric: &Fabric) -> ScanResult<()> {
        for (i, tag) in self.cfg.tags.iter().enumerate() {
            let Some(key) = self.keys[i] else { continue };
            let value = match fabric.read(&tag.device, key)? {
                Some(Value::Word(w)) => w,
                Some(Value::Bit(b)) => u16::from(b),
                None => continue,
            };
            let sample = Sample {
                t: now,
                tag: i as u16,
                value,
            };
            if self.buffer.is_full() {
                self.buffer.pop_front();
            }
            // Capacity was just ensured.
            let _ = self.buffer.push_back(sample);
            self.total_samples += 1;
        }
        fabric.write(
            &self.device,
            SAMPLE_COUNT,
            Value::Word((self.total_samples % u64::from(u16::MAX)) as u16),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pal_common::config::HistorianTagConfig;
    use pal_common::device::{DeviceInfo, DeviceKind};
    use pal_common::events::EventBus;
    use pal_fabric::{ClockMode, SimClock};

    fn rig() -> (Fabric, HistorianScan) {
        let fabric = Fabric::new(SimClock::new(ClockMode::Stepped), EventBus::new(16));
        fabric
            .register(DeviceInfo::new("turbine_plc_1", DeviceKind::Plc, 1))
            .unwrap();
        fabric
            .install("turbine_plc_1", |mem| {
                mem.map_word(AddressKey::input(0), 1234);
                mem.alias("shaft_speed_rpm", AddressKey::input(0));
            })
            .unwrap();
        fabric
            .register(DeviceInfo::new("historian_1", DeviceKind::Historian, 15))
            .unwrap();
        let mut scan = HistorianScan::new(
            "historian_1",
            HistorianRoleConfig {
                tags: vec![HistorianTagConfig {
                    device: "turbine_plc_1".into(),
                    key: "shaft_speed_rpm".into(),
                }],
                sample_interval_ms: 1000,
            },
        );
        scan.install(&fabric).unwrap();
        (fabric, scan)
    }

    #[test]
    fn samples_accumulate_with_monotonic_timestamps() {
        let (fabric, mut scan) = rig();
        for i in 0..10 {
            scan.scan(i as f64, &fabric).unwrap();
        }
        let times: Vec<f64> = scan.samples().map(|s| s.t).collect();
        assert_eq!(times.len(), 10);
        assert!(times.windows(2).all(|w| w[0] <= w[1]));
        assert!(scan.samples().all(|s| s.value == 1234));
    }

    #[test]
    fn buffer_is_bounded_and_evicts_oldest() {
        let (fabric, mut scan) = rig();
        for i in 0..(HISTORIAN_DEPTH + 100) {
            scan.scan(i as f64, &fabric).unwrap();
        }
        assert_eq!(scan.samples().count(), HISTORIAN_DEPTH);
        assert_eq!(scan.total_samples(), (HISTORIAN_DEPTH + 100) as u64);
        // Oldest retained sample is the 101st recorded.
        assert_eq!(scan.samples().next().unwrap().t, 100.0);
    }
}
