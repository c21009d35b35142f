//! # Device Scan Machines
//!
//! Periodic control logic for every simulated device. Each machine runs a
//! three-phase scan — snapshot, logic, bulk write — at its configured sim
//! interval, scheduled by the orchestrator through [`ScanRunner`].
//!
//! Scan failures are isolated: an `Err` from one scan is logged and
//! counted, and the device keeps scanning. A device that fails its
//! configured number of consecutive scans is marked offline, emits
//! `DeviceFaulted`, and is not restarted.

#![warn(clippy::all)]

pub mod historian;
pub mod hmi;
pub mod plc;
pub mod safety;
pub mod scada;

use thiserror::Error;
use tracing::{error, warn};

use pal_common::events::KernelEvent;
use pal_common::memory::MemoryError;
use pal_fabric::{Fabric, FabricError};

/// Scan-cycle error. Isolated to the failing device.
#[derive(Debug, Error)]
pub enum ScanError {
    /// Fabric access failed.
    #[error(transparent)]
    Fabric(#[from] FabricError),

    /// Memory-map misuse inside the scan.
    #[error(transparent)]
    Memory(#[from] MemoryError),

    /// Wiring error detected at install time.
    #[error("scan wiring: {0}")]
    Wiring(String),
}

/// Result alias for scan operations.
pub type ScanResult<T> = Result<T, ScanError>;

/// Periodic device logic.
///
/// `install` runs once at boot (after physics install) to map the
/// machine's own addresses; `scan` runs at every due interval.
pub trait ScanLogic: Send {
    /// Owning device name.
    fn device(&self) -> &str;

    /// Map addresses owned by the scan machine. Called once at boot.
    fn install(&mut self, _fabric: &Fabric) -> ScanResult<()> {
        Ok(())
    }

    /// Execute one scan cycle at sim time `now`.
    fn scan(&mut self, now: f64, fabric: &Fabric) -> ScanResult<()>;
}

/// Per-device scan counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    /// Completed scans.
    pub runs: u64,
    /// Failed scans (cumulative).
    pub failures: u64,
}

/// Schedules one scan machine: due times, failure counting, fault latch.
pub struct ScanRunner {
    logic: Box<dyn ScanLogic>,
    interval_s: f64,
    next_due: f64,
    fault_threshold: u32,
    consecutive_failures: u32,
    faulted: bool,
    stats: ScanStats,
}

impl ScanRunner {
    /// Wrap a scan machine with the given sim-time interval.
    pub fn new(logic: Box<dyn ScanLogic>, interval_s: f64, fault_threshold: u32) -> Self {
        Self {
            logic,
            interval_s,
            next_due: 0.0,
            fault_threshold,
            consecutive_failures: 0,
            faulted: false,
            stats: ScanStats::default(),
        }
    }

    /// Owning device name.
    pub fn device(&self) -> &str {
        self.logic.device()
    }

    /// Forward install to the wrapped machine.
    pub fn install(&mut self, fabric: &Fabric) -> ScanResult<()> {
        self.logic.install(fabric)
    }

    /// Whether the device has been taken offline by repeated failures.
    pub fn faulted(&self) -> bool {
        self.faulted
    }

    /// Scan counters.
    pub fn stats(&self) -> ScanStats {
        self.stats
    }

    /// Run one scan if due. Failures are counted here; crossing the
    /// threshold marks the device offline and emits `DeviceFaulted`.
    pub fn poll(&mut self, now: f64, fabric: &Fabric) {
        if self.faulted || now < self.next_due {
            return;
        }
        self.next_due = now + self.interval_s;

        match self.logic.scan(now, fabric) {
            Ok(()) => {
                self.stats.runs += 1;
                self.consecutive_failures = 0;
            }
            Err(e) => {
                self.stats.failures += 1;
                self.consecutive_failures += 1;
                warn!(
                    device = %self.logic.device(),
                    consecutive = self.consecutive_failures,
                    error = %e,
                    "scan failed"
                );
                if self.consecutive_failures >= self.fault_threshold {
                    self.faulted = true;
                    error!(device = %self.logic.device(), "device faulted offline");
                    let name = self.logic.device().to_string();
                    if let Err(e) = fabric.set_online(&name, false) {
                        error!(device = %name, error = %e, "failed to mark device offline");
                    }
                    fabric.events().emit(KernelEvent::DeviceFaulted {
                        name,
                        failures: self.consecutive_failures,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pal_common::device::{DeviceInfo, DeviceKind};
    use pal_common::events::EventBus;
    use pal_fabric::{ClockMode, SimClock};

    struct FlakyScan {
        device: String,
        /// Number of leading scans that fail before the machine recovers.
        fail_first: u32,
        scans: u32,
    }

    impl ScanLogic for FlakyScan {
        fn device(&self) -> &str {
            &self.device
        }

        fn scan(&mut self, _now: f64, _fabric: &Fabric) -> ScanResult<()> {
            self.scans += 1;
            if self.scans <= self.fail_first {
                Err(ScanError::Wiring("injected".into()))
            } else {
                Ok(())
            }
        }
    }

    fn fabric_with(name: &str) -> Fabric {
        let fabric = Fabric::new(SimClock::new(ClockMode::Stepped), EventBus::new(16));
        fabric
            .register(DeviceInfo::new(name, DeviceKind::Plc, 1))
            .unwrap();
        fabric
    }

    fn runner(device: &str, fail_first: u32, interval_s: f64) -> ScanRunner {
        ScanRunner::new(
            Box::new(FlakyScan {
                device: device.into(),
                fail_first,
                scans: 0,
            }),
            interval_s,
            5,
        )
    }

    #[test]
    fn scans_run_at_interval() {
        let fabric = fabric_with("plc_1");
        let mut r = runner("plc_1", 0, 1.0);
        // Due immediately, then once per second.
        for tick in 0..=20 {
            r.poll(tick as f64 * 0.25, &fabric);
        }
        assert_eq!(r.stats().runs, 6); // t = 0, 1, 2, 3, 4, 5
    }

    #[test]
    fn five_consecutive_failures_fault_the_device() {
        let fabric = fabric_with("plc_1");
        let mut rx = fabric.events().subscribe();
        let mut r = runner("plc_1", u32::MAX, 0.1);
        let mut now = 0.0;
        for _ in 0..10 {
            r.poll(now, &fabric);
            now += 0.1;
        }
        assert!(r.faulted());
        assert!(!fabric.online("plc_1").unwrap());
        // Faulted devices stop scanning: only 5 attempts despite 10 polls.
        assert_eq!(r.stats().failures, 5);
        assert!(matches!(
            rx.try_recv().unwrap(),
            KernelEvent::DeviceFaulted { failures: 5, .. }
        ));
    }

    #[test]
    fn success_resets_the_failure_counter() {
        let fabric = fabric_with("plc_1");
        // Fails 4 times, recovers on the 5th: never reaches the threshold.
        let mut r = runner("plc_1", 4, 0.1);
        let mut now = 0.0;
        for _ in 0..20 {
            r.poll(now, &fabric);
            now += 0.1;
        }
        assert!(!r.faulted());
        assert_eq!(r.stats().failures, 4);
        assert_eq!(r.stats().runs, 16);
    }
}
