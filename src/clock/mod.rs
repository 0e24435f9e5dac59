pub mod normalize;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::driver::{DeviceId, DriverAccess};

pub use normalize::{normalize, Anchor, NormalizedTimes};

/// Source of host timestamps in nanoseconds on one monotonic timeline.
pub trait HostClock: Send + Sync {
    fn now_ns(&self) -> u64;
}

/// Host clock backed by `CLOCK_MONOTONIC`.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl HostClock for MonotonicClock {
    fn now_ns(&self) -> u64 {
        monotonic_ns()
    }
}

/// Returns current monotonic clock value in nanoseconds.
#[cfg(unix)]
fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `clock_gettime(CLOCK_MONOTONIC, ...)` is thread-safe and only
    // needs a valid pointer.
    if unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) } == 0 {
        (ts.tv_sec as u64)
            .saturating_mul(1_000_000_000)
            .saturating_add(ts.tv_nsec as u64)
    } else {
        0
    }
}

#[cfg(not(unix))]
fn monotonic_ns() -> u64 {
    use std::sync::OnceLock;
    use std::time::Instant;

    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    let elapsed = ORIGIN.get_or_init(Instant::now).elapsed();
    u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX)
}

/// Manually driven host clock.
///
/// Every read returns the current value and then advances it by `step_ns`,
/// which lets tests observe the two reads bracketing a calibration query.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
    step: AtomicU64,
}

impl ManualClock {
    /// Create a clock frozen at `start_ns`.
    pub fn new(start_ns: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ns),
            step: AtomicU64::new(0),
        }
    }

    /// Set the current time.
    pub fn set(&self, now_ns: u64) {
        self.now.store(now_ns, Ordering::SeqCst);
    }

    /// Move the clock forward.
    pub fn advance(&self, delta_ns: u64) {
        self.now.fetch_add(delta_ns, Ordering::SeqCst);
    }

    /// Advance by `step_ns` after every read.
    pub fn set_step(&self, step_ns: u64) {
        self.step.store(step_ns, Ordering::SeqCst);
    }

    /// Current value without advancing.
    pub fn peek(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

impl HostClock for ManualClock {
    fn now_ns(&self) -> u64 {
        let step = self.step.load(Ordering::SeqCst);
        self.now.fetch_add(step, Ordering::SeqCst)
    }
}

/// Per-device clock relationship, established once on first use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceClockState {
    /// The device answered a paired device/host timer query.
    pub correlated: bool,
    /// Device clock minus driver host clock at first observation (ns).
    /// Zero when the device is uncorrelated.
    pub baseline_ns: i64,
}

impl DeviceClockState {
    const UNCORRELATED: Self = Self {
        correlated: false,
        baseline_ns: 0,
    };
}

/// Establishes and applies a host/device clock offset per device.
///
/// Baselines are written at most once per device. `ensure_baseline` checks
/// for an existing state under the shared read lock, then takes the write
/// lock and checks again before querying the driver, so racing first uses
/// of a device still produce a single baseline.
#[derive(Debug, Default)]
pub struct ClockCorrelator {
    states: RwLock<HashMap<DeviceId, DeviceClockState>>,
}

impl ClockCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the clock state for `device`, computing it on first use.
    pub fn ensure_baseline(&self, driver: &dyn DriverAccess, device: DeviceId) -> DeviceClockState {
        // Check absence without exclusion.
        if let Some(state) = self.states.read().get(&device) {
            return *state;
        }

        // Acquire exclusion and recheck.
        let mut states = self.states.write();
        if let Some(state) = states.get(&device) {
            return *state;
        }

        let state = establish_baseline(driver, device);
        states.insert(device, state);
        state
    }

    /// Return the clock state for `device` if it has been established.
    pub fn state(&self, device: DeviceId) -> Option<DeviceClockState> {
        self.states.read().get(&device).copied()
    }

    /// Number of devices observed so far.
    pub fn device_count(&self) -> usize {
        self.states.read().len()
    }

    /// Estimate the offset that maps this device's clock onto the host
    /// timeline right now.
    ///
    /// Brackets one dual-timer query between two host reads and treats the
    /// midpoint as the host time the driver observed. Returns `None` for
    /// uncorrelated devices or when the query fails.
    pub fn compute_offset(
        &self,
        driver: &dyn DriverAccess,
        host: &dyn HostClock,
        device: DeviceId,
        state: DeviceClockState,
    ) -> Option<i64> {
        if !state.correlated {
            return None;
        }

        let t0 = host.now_ns();
        let reading = driver.query_dual_timer(device);
        let t1 = host.now_ns();

        match reading {
            Ok(reading) => {
                let midpoint = t0 + t1.saturating_sub(t0) / 2;
                let offset = i128::from(midpoint) - i128::from(reading.host_ns)
                    - i128::from(state.baseline_ns);
                Some(clamp_i64(offset))
            }
            Err(e) => {
                debug!(%device, error = %e, "dual timer query failed, using host estimate");
                None
            }
        }
    }
}

fn establish_baseline(driver: &dyn DriverAccess, device: DeviceId) -> DeviceClockState {
    if !driver.capabilities(device).dual_timer {
        info!(%device, "device has no dual timer, timestamps use host estimates");
        return DeviceClockState::UNCORRELATED;
    }

    match driver.query_dual_timer(device) {
        Ok(reading) => {
            let baseline = clamp_i64(i128::from(reading.device_ns) - i128::from(reading.host_ns));
            info!(%device, baseline_ns = baseline, "device clock baseline established");
            DeviceClockState {
                correlated: true,
                baseline_ns: baseline,
            }
        }
        Err(e) => {
            warn!(%device, error = %e, "dual timer advertised but query failed");
            DeviceClockState::UNCORRELATED
        }
    }
}

pub(crate) fn clamp_i64(v: i128) -> i64 {
    v.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::driver::scripted::ScriptedDriver;
    use crate::driver::{DriverError, DualTimerReading};

    fn correlated_driver(device: DeviceId, device_ns: u64, host_ns: u64) -> ScriptedDriver {
        let driver = ScriptedDriver::new();
        driver.add_device(
            device,
            "gpu",
            Some(DualTimerReading { device_ns, host_ns }),
        );
        driver
    }

    #[test]
    fn test_manual_clock_steps_after_read() {
        let clock = ManualClock::new(100);
        clock.set_step(10);
        assert_eq!(clock.now_ns(), 100);
        assert_eq!(clock.now_ns(), 110);
        assert_eq!(clock.peek(), 120);
    }

    #[test]
    fn test_monotonic_clock_does_not_go_backwards() {
        let clock = MonotonicClock;
        let a = clock.now_ns();
        let b = clock.now_ns();
        assert!(b >= a);
    }

    #[test]
    fn test_baseline_from_dual_timer() {
        let device = DeviceId(1);
        let driver = correlated_driver(device, 5_000, 1_000);
        let correlator = ClockCorrelator::new();

        let state = correlator.ensure_baseline(&driver, device);
        assert!(state.correlated);
        assert_eq!(state.baseline_ns, 4_000);
    }

    #[test]
    fn test_baseline_negative_when_device_clock_behind() {
        let device = DeviceId(1);
        let driver = correlated_driver(device, 1_000, 5_000);
        let state = ClockCorrelator::new().ensure_baseline(&driver, device);
        assert_eq!(state.baseline_ns, -4_000);
    }

    #[test]
    fn test_baseline_computed_once() {
        let device = DeviceId(1);
        let driver = correlated_driver(device, 5_000, 1_000);
        let correlator = ClockCorrelator::new();

        correlator.ensure_baseline(&driver, device);
        correlator.ensure_baseline(&driver, device);
        correlator.ensure_baseline(&driver, device);

        assert_eq!(driver.dual_timer_queries(), 1);
        assert_eq!(correlator.device_count(), 1);
    }

    #[test]
    fn test_racing_first_use_writes_one_baseline() {
        let device = DeviceId(3);
        let driver = Arc::new(correlated_driver(device, 9_000, 2_000));
        let correlator = Arc::new(ClockCorrelator::new());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let driver = Arc::clone(&driver);
                let correlator = Arc::clone(&correlator);
                thread::spawn(move || correlator.ensure_baseline(driver.as_ref(), device))
            })
            .collect();

        for h in handles {
            let state = h.join().expect("thread panicked");
            assert_eq!(state.baseline_ns, 7_000);
        }
        assert_eq!(driver.dual_timer_queries(), 1);
    }

    #[test]
    fn test_uncorrelated_device() {
        let driver = ScriptedDriver::new();
        driver.add_device(DeviceId(2), "cpu", None);
        let correlator = ClockCorrelator::new();

        let state = correlator.ensure_baseline(&driver, DeviceId(2));
        assert!(!state.correlated);
        assert_eq!(driver.dual_timer_queries(), 0);

        let clock = ManualClock::new(0);
        assert_eq!(
            correlator.compute_offset(&driver, &clock, DeviceId(2), state),
            None
        );
    }

    fn timer_error() -> DriverError {
        DriverError::Call {
            call: "clGetDeviceAndHostTimer",
            code: -30,
        }
    }

    #[test]
    fn test_failed_baseline_query_marks_uncorrelated() {
        let device = DeviceId(1);
        let driver = ScriptedDriver::new();
        driver.add_device(device, "gpu", None);
        driver.fail_dual_timer(device, timer_error());
        let correlator = ClockCorrelator::new();

        let state = correlator.ensure_baseline(&driver, device);
        assert!(!state.correlated);
        assert_eq!(state.baseline_ns, 0);
        assert_eq!(correlator.state(device), Some(state));

        // The failed attempt is remembered; no second query.
        correlator.ensure_baseline(&driver, device);
        assert_eq!(driver.dual_timer_queries(), 1);

        let clock = ManualClock::new(0);
        assert_eq!(correlator.compute_offset(&driver, &clock, device, state), None);
        assert_eq!(driver.dual_timer_queries(), 1);
    }

    #[test]
    fn test_failed_offset_query_after_good_baseline() {
        let device = DeviceId(1);
        let driver = correlated_driver(device, 5_000, 1_000);
        let correlator = ClockCorrelator::new();
        let state = correlator.ensure_baseline(&driver, device);
        assert!(state.correlated);

        driver.fail_dual_timer(device, timer_error());
        let clock = ManualClock::new(2_000);
        assert_eq!(correlator.compute_offset(&driver, &clock, device, state), None);
        assert_eq!(driver.dual_timer_queries(), 2);
        assert_eq!(correlator.state(device), Some(state));
    }

    #[test]
    fn test_offset_uses_midpoint_of_host_reads() {
        let device = DeviceId(1);
        // Baseline: 5_000 - 1_000 = 4_000.
        let driver = correlated_driver(device, 5_000, 1_000);
        let correlator = ClockCorrelator::new();
        let state = correlator.ensure_baseline(&driver, device);

        // Host reads 2_000 then 2_010, midpoint 2_005.
        let clock = ManualClock::new(2_000);
        clock.set_step(10);
        let offset = correlator
            .compute_offset(&driver, &clock, device, state)
            .expect("correlated");

        // (2_005 - 1_000) - 4_000
        assert_eq!(offset, -2_995);
    }

    #[test]
    fn test_state_absent_until_observed() {
        let correlator = ClockCorrelator::new();
        assert!(correlator.state(DeviceId(1)).is_none());
    }
}
