mod pending;

use std::sync::Arc;

use tracing::{debug, warn};

use crate::clock::{ClockCorrelator, HostClock};
use crate::driver::{DeviceId, DriverAccess, DriverError, OperationHandle, QueueId};

pub use pending::Disposition;
use pending::PendingList;

/// One reference on an operation handle, released when dropped.
///
/// Dropping is the only path that releases. Paths that must not release
/// (the driver already destroyed the object, or the process is tearing
/// down) disarm the guard first.
pub struct RetainedHandle {
    handle: OperationHandle,
    driver: Arc<dyn DriverAccess>,
    armed: bool,
}

impl RetainedHandle {
    /// Take a reference on `handle`.
    pub fn acquire(
        driver: Arc<dyn DriverAccess>,
        handle: OperationHandle,
    ) -> Result<Self, DriverError> {
        driver.retain(handle)?;
        Ok(Self {
            handle,
            driver,
            armed: true,
        })
    }

    pub fn handle(&self) -> OperationHandle {
        self.handle
    }

    /// Give up the reference without releasing it.
    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for RetainedHandle {
    fn drop(&mut self) {
        if self.armed {
            self.driver.release(self.handle);
        }
    }
}

impl std::fmt::Debug for RetainedHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetainedHandle")
            .field("handle", &self.handle)
            .field("armed", &self.armed)
            .finish()
    }
}

/// One outstanding asynchronous operation.
#[derive(Debug)]
pub struct PendingEntry {
    pub device: DeviceId,
    pub queue: QueueId,
    pub tag: String,
    pub sequence: u64,
    /// Host clock reading taken when the operation was recorded.
    pub issue_host_ns: u64,
    /// Device-to-host clock offset captured at issue time, if the device
    /// supports correlation.
    pub offset_ns: Option<i64>,
    retained: RetainedHandle,
}

impl PendingEntry {
    pub fn handle(&self) -> OperationHandle {
        self.retained.handle()
    }
}

/// Describes a just-issued asynchronous operation.
#[derive(Debug, Clone, Copy)]
pub struct IssuedOperation<'a> {
    pub device: DeviceId,
    pub handle: OperationHandle,
    pub tag: &'a str,
    pub queue: QueueId,
    pub sequence: u64,
}

/// Why an operation was not tracked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Tracked,
    /// Tracked, replacing and releasing an older entry with the same handle.
    ReplacedStale,
    /// The producer handed over a null handle.
    NullHandle,
    /// The driver refused the extra reference.
    RetainFailed(DriverError),
}

impl RecordOutcome {
    pub fn is_tracked(&self) -> bool {
        matches!(self, Self::Tracked | Self::ReplacedStale)
    }
}

/// Owns the set of not-yet-completed operations.
///
/// Entries leave only through [`EventTracker::poll`]. On drop, anything
/// still pending is abandoned without release: the driver is shutting down
/// as well and calling back into it is unsafe.
pub struct EventTracker {
    driver: Arc<dyn DriverAccess>,
    host: Arc<dyn HostClock>,
    pending: PendingList,
}

impl EventTracker {
    pub fn new(driver: Arc<dyn DriverAccess>, host: Arc<dyn HostClock>) -> Self {
        Self {
            driver,
            host,
            pending: PendingList::default(),
        }
    }

    /// Start tracking an issued operation, retaining its handle and
    /// capturing the issue-time clock relationship.
    pub fn record(&mut self, clocks: &ClockCorrelator, op: IssuedOperation<'_>) -> RecordOutcome {
        if op.handle.is_null() {
            warn!(
                tag = op.tag,
                sequence = op.sequence,
                "asynchronous call produced no completion handle, not timed"
            );
            return RecordOutcome::NullHandle;
        }

        let retained = match RetainedHandle::acquire(Arc::clone(&self.driver), op.handle) {
            Ok(r) => r,
            Err(e) => {
                warn!(handle = %op.handle, tag = op.tag, error = %e, "failed to retain handle");
                return RecordOutcome::RetainFailed(e);
            }
        };

        let state = clocks.ensure_baseline(self.driver.as_ref(), op.device);
        let issue_host_ns = self.host.now_ns();
        let offset_ns =
            clocks.compute_offset(self.driver.as_ref(), self.host.as_ref(), op.device, state);

        debug!(
            handle = %op.handle,
            tag = op.tag,
            sequence = op.sequence,
            issue_host_ns,
            offset_ns,
            "tracking operation"
        );

        let displaced = self.pending.push(PendingEntry {
            device: op.device,
            queue: op.queue,
            tag: op.tag.to_string(),
            sequence: op.sequence,
            issue_host_ns,
            offset_ns,
            retained,
        });

        if displaced {
            RecordOutcome::ReplacedStale
        } else {
            RecordOutcome::Tracked
        }
    }

    /// Visit each pending entry once, in issue order.
    pub fn poll<F>(&mut self, visit: F)
    where
        F: FnMut(&PendingEntry) -> Disposition,
    {
        self.pending.retain_with(visit);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_pending(&self, handle: OperationHandle) -> bool {
        self.pending.contains(handle)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingEntry> {
        self.pending.iter()
    }
}

impl Drop for EventTracker {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            debug!(
                pending = self.pending.len(),
                "abandoning pending operations at teardown"
            );
        }
        self.pending.abandon_all();
    }
}
