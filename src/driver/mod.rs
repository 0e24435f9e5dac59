pub mod scripted;

use std::fmt;

use thiserror::Error;

/// Opaque device identity as handed out by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub u64);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device {:#x}", self.0)
    }
}

/// Opaque command-queue identity, used only for trace grouping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueId(pub u64);

/// Opaque, reference-counted identifier for one asynchronous command.
/// A raw value of zero is the driver's null handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationHandle(pub u64);

impl OperationHandle {
    /// The null handle.
    pub const NULL: Self = Self(0);

    /// Returns true for the driver's null handle.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for OperationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Execution status of an asynchronous command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Queued,
    Submitted,
    Running,
    Complete,
    /// The driver no longer recognizes the handle.
    InvalidHandle,
    /// The command terminated abnormally with a driver error code.
    Failed(i32),
}

impl CommandStatus {
    /// Returns true while the command may still make progress.
    pub const fn is_in_flight(self) -> bool {
        matches!(self, Self::Queued | Self::Submitted | Self::Running)
    }

    /// Returns the canonical log label.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Submitted => "submitted",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::InvalidHandle => "invalid_handle",
            Self::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(code) => write!(f, "failed ({code})"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Raw profiling counters of a completed command, in device-clock nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCounters {
    pub queued: u64,
    pub submitted: u64,
    pub started: u64,
    pub ended: u64,
}

/// A device-clock and host-clock reading captured by one driver call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DualTimerReading {
    pub device_ns: u64,
    pub host_ns: u64,
}

/// Optional driver features, resolved once per device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceCapabilities {
    /// The device supports the paired device/host timer query.
    pub dual_timer: bool,
}

/// Errors reported by the driver-access collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("invalid operation handle {0}")]
    InvalidHandle(OperationHandle),

    #[error("profiling info not available for {0}")]
    ProfilingUnavailable(OperationHandle),

    #[error("dual timer query unsupported on {0}")]
    DualTimerUnsupported(DeviceId),

    #[error("driver call {call} failed with code {code}")]
    Call { call: &'static str, code: i32 },
}

/// Narrow driver surface consumed by the timing pipeline.
///
/// Every method must be non-blocking: status and counter reads return
/// whatever the driver knows right now.
pub trait DriverAccess: Send + Sync {
    /// Query the execution status of a command.
    fn query_status(&self, handle: OperationHandle) -> CommandStatus;

    /// Read the four profiling counters of a completed command.
    fn query_counters(&self, handle: OperationHandle) -> Result<DeviceCounters, DriverError>;

    /// Resolve optional features of a device.
    fn capabilities(&self, device: DeviceId) -> DeviceCapabilities;

    /// Read the device and host clocks together.
    fn query_dual_timer(&self, device: DeviceId) -> Result<DualTimerReading, DriverError>;

    /// Take one reference on a command handle.
    fn retain(&self, handle: OperationHandle) -> Result<(), DriverError>;

    /// Drop one reference on a command handle.
    fn release(&self, handle: OperationHandle);

    /// Human-readable device name for reports.
    fn device_name(&self, _device: DeviceId) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_handle() {
        assert!(OperationHandle::NULL.is_null());
        assert!(!OperationHandle(0x10).is_null());
    }

    #[test]
    fn test_in_flight_statuses() {
        assert!(CommandStatus::Queued.is_in_flight());
        assert!(CommandStatus::Submitted.is_in_flight());
        assert!(CommandStatus::Running.is_in_flight());
        assert!(!CommandStatus::Complete.is_in_flight());
        assert!(!CommandStatus::InvalidHandle.is_in_flight());
        assert!(!CommandStatus::Failed(-5).is_in_flight());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(CommandStatus::Running.to_string(), "running");
        assert_eq!(CommandStatus::Failed(-14).to_string(), "failed (-14)");
    }

    #[test]
    fn test_driver_error_display() {
        let err = DriverError::ProfilingUnavailable(OperationHandle(0xab));
        assert_eq!(err.to_string(), "profiling info not available for 0xab");

        let err = DriverError::Call {
            call: "clGetEventProfilingInfo",
            code: -7,
        };
        assert!(err.to_string().contains("-7"));
    }
}
