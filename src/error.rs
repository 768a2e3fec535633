//! Custom error types for the scan orchestration engine.
//!
//! This module defines the primary error type, `ScanError`, for the entire
//! crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the failure classes that can occur during a run:
//!
//! - **`Config`**: invalid scan parameters. Always surfaces synchronously to
//!   the caller before any hardware is touched.
//! - **`Device`**: a communication failure, timeout, or readback mismatch on
//!   a specific device call. Drives the abort-and-restore path. A safety
//!   suspension that outlives its wait ceiling degrades into a device
//!   timeout and takes the same path.
//! - **`Cancelled`**: a user-requested stop, honored only at checkpoints.
//! - **`DevicesBusy`**: the device set is already checked out by another
//!   sequencer; at most one sequencer may hold the hardware at a time.
//! - **`InvariantViolation`**: an internal sequencing defect such as an
//!   `open_run` without a matching `close_run`. Never user-recoverable.
//!
//! By using `#[from]`, `ScanError` can be seamlessly created from the
//! underlying error types, simplifying error handling throughout the crate
//! with the `?` operator.

use thiserror::Error;

use crate::config::ConfigError;
use crate::devices::DeviceFault;

/// Convenience alias for results using the crate error type.
pub type ScanResult<T> = std::result::Result<T, ScanError>;

/// Consolidated error type for scan orchestration.
#[derive(Error, Debug)]
pub enum ScanError {
    /// Invalid scan configuration, rejected before orchestration starts.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A device call failed or timed out.
    #[error(transparent)]
    Device(#[from] DeviceFault),

    /// User-requested stop, honored at the next checkpoint.
    #[error("scan cancelled by user")]
    Cancelled,

    /// The device set is already held by another sequencer.
    #[error("device set is already checked out by another sequencer")]
    DevicesBusy,

    /// Internal sequencing defect. Fatal, never user-recoverable.
    #[error("sequence invariant violated: {0}")]
    InvariantViolation(String),
}

impl ScanError {
    /// True when this error represents an internal programming defect
    /// rather than an external failure.
    pub fn is_defect(&self) -> bool {
        matches!(self, ScanError::InvariantViolation(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{DeviceFault, FaultKind};
    use std::time::Duration;

    #[test]
    fn test_error_display() {
        let err = ScanError::from(DeviceFault::comm("detector", "plugin offline"));
        assert_eq!(
            err.to_string(),
            "device fault on detector: communication failure: plugin offline"
        );
    }

    #[test]
    fn test_timeout_fault_display() {
        let err: ScanError = DeviceFault::timeout("rot_stage", Duration::from_secs(60)).into();
        assert!(err.to_string().contains("timed out"));
        match err {
            ScanError::Device(DeviceFault { kind: FaultKind::Timeout(d), .. }) => {
                assert_eq!(d, Duration::from_secs(60));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_invariant_is_defect() {
        assert!(ScanError::InvariantViolation("unmatched close_run".into()).is_defect());
        assert!(!ScanError::Cancelled.is_defect());
    }
}
