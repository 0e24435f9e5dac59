use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use super::{
    CommandStatus, DeviceCapabilities, DeviceCounters, DeviceId, DriverAccess, DriverError,
    DualTimerReading, OperationHandle,
};

/// In-memory driver whose answers are scripted up front.
///
/// Used by the test suites and benchmarks in place of a real driver.
/// Status scripts are consumed one entry per query; the last entry repeats.
#[derive(Default)]
pub struct ScriptedDriver {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    statuses: HashMap<OperationHandle, VecDeque<CommandStatus>>,
    counters: HashMap<OperationHandle, Result<DeviceCounters, DriverError>>,
    devices: HashMap<DeviceId, DeviceScript>,
    retain_failures: HashMap<OperationHandle, DriverError>,
    retains: HashMap<OperationHandle, u32>,
    releases: HashMap<OperationHandle, u32>,
    status_queries: u64,
    dual_timer_queries: u64,
}

#[derive(Default, Clone)]
struct DeviceScript {
    name: Option<String>,
    dual_timer: Option<DualTimerReading>,
    dual_timer_failure: Option<DriverError>,
}

impl ScriptedDriver {
    /// Create a driver with nothing scripted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device, optionally with a fixed dual-timer reading.
    pub fn add_device(&self, device: DeviceId, name: &str, dual_timer: Option<DualTimerReading>) {
        self.inner.lock().devices.insert(
            device,
            DeviceScript {
                name: Some(name.to_string()),
                dual_timer,
                dual_timer_failure: None,
            },
        );
    }

    /// Script the sequence of statuses reported for a handle.
    pub fn script_status(&self, handle: OperationHandle, statuses: &[CommandStatus]) {
        self.inner
            .lock()
            .statuses
            .insert(handle, statuses.iter().copied().collect());
    }

    /// Script the profiling counters reported for a handle.
    pub fn set_counters(&self, handle: OperationHandle, counters: DeviceCounters) {
        self.inner.lock().counters.insert(handle, Ok(counters));
    }

    /// Make the counter query fail for a handle.
    pub fn fail_counters(&self, handle: OperationHandle, err: DriverError) {
        self.inner.lock().counters.insert(handle, Err(err));
    }

    /// Keep advertising the dual timer for `device` but fail every
    /// following query with `err`.
    pub fn fail_dual_timer(&self, device: DeviceId, err: DriverError) {
        self.inner
            .lock()
            .devices
            .entry(device)
            .or_default()
            .dual_timer_failure = Some(err);
    }

    /// Make `retain` fail for a handle.
    pub fn fail_retain(&self, handle: OperationHandle, err: DriverError) {
        self.inner.lock().retain_failures.insert(handle, err);
    }

    /// Number of successful retains observed for a handle.
    pub fn retain_count(&self, handle: OperationHandle) -> u32 {
        self.inner.lock().retains.get(&handle).copied().unwrap_or(0)
    }

    /// Number of releases observed for a handle.
    pub fn release_count(&self, handle: OperationHandle) -> u32 {
        self.inner.lock().releases.get(&handle).copied().unwrap_or(0)
    }

    /// Total status queries served.
    pub fn status_queries(&self) -> u64 {
        self.inner.lock().status_queries
    }

    /// Total dual-timer queries served.
    pub fn dual_timer_queries(&self) -> u64 {
        self.inner.lock().dual_timer_queries
    }
}

impl DriverAccess for ScriptedDriver {
    fn query_status(&self, handle: OperationHandle) -> CommandStatus {
        let mut inner = self.inner.lock();
        inner.status_queries += 1;

        let Some(script) = inner.statuses.get_mut(&handle) else {
            return CommandStatus::InvalidHandle;
        };
        if script.len() > 1 {
            script.pop_front().unwrap_or(CommandStatus::InvalidHandle)
        } else {
            script.front().copied().unwrap_or(CommandStatus::InvalidHandle)
        }
    }

    fn query_counters(&self, handle: OperationHandle) -> Result<DeviceCounters, DriverError> {
        self.inner
            .lock()
            .counters
            .get(&handle)
            .cloned()
            .unwrap_or(Err(DriverError::ProfilingUnavailable(handle)))
    }

    fn capabilities(&self, device: DeviceId) -> DeviceCapabilities {
        let inner = self.inner.lock();
        DeviceCapabilities {
            dual_timer: inner
                .devices
                .get(&device)
                .is_some_and(|d| d.dual_timer.is_some() || d.dual_timer_failure.is_some()),
        }
    }

    fn query_dual_timer(&self, device: DeviceId) -> Result<DualTimerReading, DriverError> {
        let mut inner = self.inner.lock();
        inner.dual_timer_queries += 1;
        let Some(script) = inner.devices.get(&device) else {
            return Err(DriverError::DualTimerUnsupported(device));
        };
        if let Some(err) = &script.dual_timer_failure {
            return Err(err.clone());
        }
        script
            .dual_timer
            .ok_or(DriverError::DualTimerUnsupported(device))
    }

    fn retain(&self, handle: OperationHandle) -> Result<(), DriverError> {
        let mut inner = self.inner.lock();
        if let Some(err) = inner.retain_failures.get(&handle) {
            return Err(err.clone());
        }
        *inner.retains.entry(handle).or_default() += 1;
        Ok(())
    }

    fn release(&self, handle: OperationHandle) {
        *self.inner.lock().releases.entry(handle).or_default() += 1;
    }

    fn device_name(&self, device: DeviceId) -> Option<String> {
        self.inner
            .lock()
            .devices
            .get(&device)
            .and_then(|d| d.name.clone())
    }
}
