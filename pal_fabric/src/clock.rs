//! The simulation clock: single authoritative time source.
//!
//! Four modes: `RealTime` tracks the wall clock, `Accelerated` scales it,
//! `Stepped` advances only on explicit `step(dt)`, `Paused` freezes.
//! `now()` is monotonic nondecreasing in every mode. Resuming from pause
//! resets the wall base so no retroactive jump occurs.
//!
//! The clock is a handle (`Arc<SimClock>`) constructed by the orchestrator
//! and passed to every component that needs time. Nothing looks it up
//! globally.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::ClockError;
use pal_common::config::{ClockConfig, ClockModeConfig};

/// Clock execution mode.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClockMode {
    /// Simulated seconds advance 1:1 with wall seconds.
    RealTime,
    /// Simulated seconds advance `k ×` wall seconds, `k > 0`.
    Accelerated(f64),
    /// Time advances only via explicit [`SimClock::step`].
    Stepped,
    /// Time frozen.
    Paused,
}

impl ClockMode {
    /// Short name for diagnostics.
    pub const fn name(self) -> &'static str {
        match self {
            Self::RealTime => "RealTime",
            Self::Accelerated(_) => "Accelerated",
            Self::Stepped => "Stepped",
            Self::Paused => "Paused",
        }
    }

    /// Wall-to-sim multiplier; zero when time does not self-advance.
    const fn factor(self) -> f64 {
        match self {
            Self::RealTime => 1.0,
            Self::Accelerated(k) => k,
            Self::Stepped | Self::Paused => 0.0,
        }
    }
}

#[derive(Debug)]
struct ClockInner {
    mode: ClockMode,
    /// Simulated seconds since start.
    sim_now: f64,
    /// Wall instant of the last advance (or of the last mode change).
    wall_base: Instant,
    /// Wall instant of construction/reset.
    wall_start: Instant,
    /// Completed orchestrator cycles.
    cycles: u64,
}

impl ClockInner {
    /// Fold wall time elapsed since `wall_base` into `sim_now` at the
    /// current mode's factor, and rebase. Returns the sim delta.
    fn absorb_wall(&mut self) -> f64 {
        let now = Instant::now();
        let wall_dt = now.duration_since(self.wall_base).as_secs_f64();
        self.wall_base = now;
        let sim_dt = wall_dt * self.mode.factor();
        self.sim_now += sim_dt;
        sim_dt
    }
}

/// Shared clock handle.
pub type ClockHandle = Arc<SimClock>;

/// The simulation clock. See the module docs.
#[derive(Debug)]
pub struct SimClock {
    inner: Mutex<ClockInner>,
}

impl SimClock {
    /// Create a clock in the given mode.
    pub fn new(mode: ClockMode) -> ClockHandle {
        let now = Instant::now();
        Arc::new(Self {
            inner: Mutex::new(ClockInner {
                mode,
                sim_now: 0.0,
                wall_base: now,
                wall_start: now,
                cycles: 0,
            }),
        })
    }

    /// Build from the configuration section.
    pub fn from_config(cfg: &ClockConfig) -> Result<ClockHandle, ClockError> {
        let mode = match cfg.mode {
            ClockModeConfig::RealTime => ClockMode::RealTime,
            ClockModeConfig::Accelerated => {
                check_speed(cfg.speed)?;
                ClockMode::Accelerated(cfg.speed)
            }
            ClockModeConfig::Stepped => ClockMode::Stepped,
            ClockModeConfig::Paused => ClockMode::Paused,
        };
        Ok(Self::new(mode))
    }

    /// Current simulated time [s since start]. Non-blocking, monotonic.
    pub fn now(&self) -> f64 {
        let mut inner = self.inner.lock();
        inner.absorb_wall();
        inner.sim_now
    }

    /// Simulated seconds since construction (alias of [`Self::now`], kept
    /// for call sites that read better with "elapsed").
    pub fn elapsed(&self) -> f64 {
        self.now()
    }

    /// Wall seconds since construction.
    pub fn wall_elapsed(&self) -> f64 {
        self.inner.lock().wall_start.elapsed().as_secs_f64()
    }

    /// Current mode.
    pub fn mode(&self) -> ClockMode {
        self.inner.lock().mode
    }

    /// Switch mode. Wall time accrued so far is absorbed at the old factor
    /// first, so the transition never jumps.
    pub fn set_mode(&self, mode: ClockMode) -> Result<(), ClockError> {
        if let ClockMode::Accelerated(k) = mode {
            check_speed(k)?;
        }
        let mut inner = self.inner.lock();
        inner.absorb_wall();
        inner.mode = mode;
        Ok(())
    }

    /// Change the acceleration factor. In non-accelerated modes this
    /// switches to `Accelerated(k)`.
    pub fn set_speed(&self, k: f64) -> Result<(), ClockError> {
        check_speed(k)?;
        self.set_mode(ClockMode::Accelerated(k))
    }

    /// Freeze time.
    pub fn pause(&self) {
        let mut inner = self.inner.lock();
        inner.absorb_wall();
        inner.mode = ClockMode::Paused;
    }

    /// Resume at the given mode (commonly the mode held before pausing).
    /// The wall base is reset — paused wall time is never back-filled.
    pub fn resume(&self, mode: ClockMode) -> Result<(), ClockError> {
        if let ClockMode::Accelerated(k) = mode {
            check_speed(k)?;
        }
        let mut inner = self.inner.lock();
        inner.wall_base = Instant::now();
        inner.mode = mode;
        Ok(())
    }

    /// Advance simulated time by exactly `dt`. Only valid in `Stepped`.
    pub fn step(&self, dt: f64) -> Result<(), ClockError> {
        if !dt.is_finite() || dt < 0.0 {
            return Err(ClockError::InvalidStep { dt });
        }
        let mut inner = self.inner.lock();
        if inner.mode != ClockMode::Stepped {
            return Err(ClockError::InvalidMode {
                mode: inner.mode.name(),
            });
        }
        inner.sim_now += dt;
        Ok(())
    }

    /// Reset simulated time and cycle count to zero, keeping the mode.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.sim_now = 0.0;
        inner.cycles = 0;
        inner.wall_base = now;
        inner.wall_start = now;
    }

    /// Completed orchestrator cycles.
    pub fn cycles(&self) -> u64 {
        self.inner.lock().cycles
    }

    /// Record one completed orchestrator cycle.
    pub fn bump_cycle(&self) {
        self.inner.lock().cycles += 1;
    }

    /// Cooperative wait until simulated time has advanced by at least `dt`
    /// past the moment of the call. In `Stepped` mode this completes only
    /// once enough `step` calls have accumulated.
    pub async fn sleep_sim(&self, dt: f64) {
        let deadline = self.now() + dt;
        while self.now() < deadline {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

fn check_speed(k: f64) -> Result<(), ClockError> {
    if !k.is_finite() || k <= 0.0 {
        return Err(ClockError::InvalidSpeed {
            detail: format!("factor must be finite and > 0, got {k}"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_monotonic() {
        let clock = SimClock::new(ClockMode::RealTime);
        let mut prev = clock.now();
        for _ in 0..1000 {
            let t = clock.now();
            assert!(t >= prev);
            prev = t;
        }
    }

    #[test]
    fn stepped_only_advances_on_step() {
        let clock = SimClock::new(ClockMode::Stepped);
        assert_eq!(clock.now(), 0.0);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(clock.now(), 0.0);

        clock.step(0.1).unwrap();
        clock.step(0.1).unwrap();
        assert!((clock.now() - 0.2).abs() < 1e-12);
    }

    #[test]
    fn step_rejected_outside_stepped_mode() {
        let clock = SimClock::new(ClockMode::RealTime);
        let err = clock.step(0.1).unwrap_err();
        assert_eq!(err, ClockError::InvalidMode { mode: "RealTime" });
    }

    #[test]
    fn negative_step_rejected() {
        let clock = SimClock::new(ClockMode::Stepped);
        assert!(clock.step(-0.1).is_err());
        assert!(clock.step(f64::NAN).is_err());
    }

    #[test]
    fn invalid_speed_rejected() {
        let clock = SimClock::new(ClockMode::RealTime);
        assert!(clock.set_speed(0.0).is_err());
        assert!(clock.set_speed(-2.0).is_err());
        assert!(clock.set_speed(f64::INFINITY).is_err());
        clock.set_speed(10.0).unwrap();
        assert!(matches!(clock.mode(), ClockMode::Accelerated(k) if k == 10.0));
    }

    #[test]
    fn paused_time_is_frozen_and_resume_does_not_jump() {
        let clock = SimClock::new(ClockMode::RealTime);
        std::thread::sleep(Duration::from_millis(10));
        clock.pause();
        let frozen = clock.now();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(clock.now(), frozen);

        clock.resume(ClockMode::RealTime).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let resumed = clock.now();
        // The 20ms paused gap must not be back-filled.
        assert!(resumed - frozen < 0.015, "resumed={resumed} frozen={frozen}");
    }

    #[test]
    fn acceleration_ratio_converges() {
        let clock = SimClock::new(ClockMode::Accelerated(50.0));
        std::thread::sleep(Duration::from_millis(40));
        let sim = clock.now();
        let wall = clock.wall_elapsed();
        let ratio = sim / wall;
        // 5% tolerance per the kernel contract, with slack for CI jitter.
        assert!(
            (ratio - 50.0).abs() < 5.0,
            "ratio {ratio} should be near 50"
        );
    }

    #[tokio::test]
    async fn sleep_sim_wakes_after_steps() {
        let clock = SimClock::new(ClockMode::Stepped);
        let waiter = {
            let clock = clock.clone();
            tokio::spawn(async move {
                clock.sleep_sim(1.0).await;
                clock.now()
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        for _ in 0..10 {
            clock.step(0.125).unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        let woke_at = waiter.await.unwrap();
        assert!(woke_at >= 1.0);
    }
}
