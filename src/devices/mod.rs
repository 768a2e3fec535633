//! Capability traits for the beamline hardware.
//!
//! Each device exposes a capability set, not a concrete type: the sequencer
//! only ever sees `Arc<dyn Shutter>` and friends, supplied by the host
//! application. The sequencer never constructs or discovers devices itself.
//!
//! Every trait method is a suspension point: the implementation blocks (as
//! an `.await`) until the underlying hardware confirms completion, and any
//! failure is reported as a [`DeviceFault`] naming the offending device.
//!
//! [`DeviceSet`] bundles the four capabilities and enforces exclusive
//! checkout: at most one sequencer may hold a [`DeviceLease`] at a time.

pub mod mock;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::config::OutputFormat;
use crate::error::ScanError;

/// Axes of the sample stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageAxis {
    /// Sample translation perpendicular to the beam.
    SampleX,
    /// Sample translation along the beam.
    SampleZ,
    /// Rotation axis (omega).
    Rotation,
}

impl fmt::Display for StageAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageAxis::SampleX => write!(f, "sample_x"),
            StageAxis::SampleZ => write!(f, "sample_z"),
            StageAxis::Rotation => write!(f, "rotation"),
        }
    }
}

/// Shutter readback state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutterState {
    Open,
    Closed,
    Fault,
}

/// Detector trigger source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerMode {
    /// Free-running internal trigger.
    Internal,
    /// Externally gated by the fly-motion position pulses.
    Overlapped,
}

/// Detector frame accumulation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireMode {
    /// One raw frame per logical image.
    Single,
    /// Average `n_frames` raw frames into each logical image.
    Accumulate { n_frames: u32 },
}

/// Frame-type tag attached to every logical image, matching the four
/// dxchange data slots the detector file layout expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    /// White field collected before the projections, sample out of beam.
    WhitePre,
    /// Sample projection.
    Projection,
    /// White field collected after the projections.
    WhitePost,
    /// Detector background, shutter closed.
    Dark,
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameType::WhitePre => write!(f, "white_pre"),
            FrameType::Projection => write!(f, "projection"),
            FrameType::WhitePost => write!(f, "white_post"),
            FrameType::Dark => write!(f, "dark"),
        }
    }
}

/// Failure of a single device call.
#[derive(Error, Debug, Clone)]
#[error("device fault on {device}: {kind}")]
pub struct DeviceFault {
    /// Device (and optionally axis/plugin) that failed.
    pub device: String,
    /// What went wrong.
    pub kind: FaultKind,
}

/// Classification of a device fault.
#[derive(Error, Debug, Clone)]
pub enum FaultKind {
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("communication failure: {0}")]
    Comm(String),

    #[error("readback mismatch: expected {expected}, got {actual}")]
    ReadbackMismatch { expected: f64, actual: f64 },
}

impl DeviceFault {
    /// A call that exceeded its maximum wait.
    pub fn timeout(device: impl Into<String>, waited: Duration) -> Self {
        Self { device: device.into(), kind: FaultKind::Timeout(waited) }
    }

    /// A communication or command failure.
    pub fn comm(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self { device: device.into(), kind: FaultKind::Comm(message.into()) }
    }

    /// A completed motion whose readback disagrees with the demand.
    pub fn readback(device: impl Into<String>, expected: f64, actual: f64) -> Self {
        Self {
            device: device.into(),
            kind: FaultKind::ReadbackMismatch { expected, actual },
        }
    }
}

/// Result alias for device calls.
pub type DeviceResult<T> = std::result::Result<T, DeviceFault>;

/// Beam shutter.
#[async_trait]
pub trait Shutter: Send + Sync {
    /// Open the shutter, blocking until the open state is confirmed.
    async fn open(&self) -> DeviceResult<()>;
    /// Close the shutter, blocking until the closed state is confirmed.
    async fn close(&self) -> DeviceResult<()>;
    /// Current readback state.
    async fn state(&self) -> ShutterState;
}

/// Motorized sample stage.
#[async_trait]
pub trait MotorStage: Send + Sync {
    /// Move `axis` by `delta`, blocking until motion settles. Returns the
    /// final readback position.
    async fn move_relative(&self, axis: StageAxis, delta: f64) -> DeviceResult<f64>;
    /// Current readback position of `axis`.
    async fn position(&self, axis: StageAxis) -> DeviceResult<f64>;
}

/// Area detector with file-writing plugins.
#[async_trait]
pub trait Detector: Send + Sync {
    /// Configure acquisition for the next arm: accumulation mode, trigger
    /// source, frame-type tag, and the number of logical images to collect.
    async fn configure(
        &self,
        mode: AcquireMode,
        trigger: TriggerMode,
        frame_type: FrameType,
        n_images: u32,
    ) -> DeviceResult<()>;

    /// Set exposure and frame period, seconds.
    async fn set_timing(&self, acquire_time: f64, acquire_period: f64) -> DeviceResult<()>;

    /// Route output to `path`/`prefix` in `format`. Returns the path the
    /// detector will write.
    async fn set_output(
        &self,
        path: &Path,
        prefix: &str,
        format: OutputFormat,
    ) -> DeviceResult<PathBuf>;

    /// Arm the detector and block until acquisition and the file write are
    /// both confirmed. Returns the number of logical images written.
    async fn arm_and_wait(&self) -> DeviceResult<u32>;
}

/// Position-synchronized fly-motion controller for the rotation stage.
#[async_trait]
pub trait FlyMotionController: Send + Sync {
    /// Set the position increment between output trigger pulses, degrees.
    async fn set_scan_delta(&self, delta: f64) -> DeviceResult<()>;
    /// Pre-position the rotation stage at `start`, blocking until done.
    async fn taxi(&self, start: f64) -> DeviceResult<()>;
    /// Start the fly motion toward `end` at `slew_speed`. Non-blocking;
    /// completion is signaled separately via [`Self::wait_complete`].
    async fn fly(&self, end: f64, slew_speed: f64) -> DeviceResult<()>;
    /// Block until the in-flight fly motion completes.
    async fn wait_complete(&self) -> DeviceResult<()>;
    /// Best-effort disarm: stop emitting position pulses. Used on abort.
    async fn disarm(&self) -> DeviceResult<()>;
}

/// The four hardware collaborators of one experiment station.
///
/// Cloning the `Arc`s is cheap; exclusivity is enforced by
/// [`DeviceSet::checkout`], which hands out at most one live
/// [`DeviceLease`].
pub struct DeviceSet {
    shutter: Arc<dyn Shutter>,
    stage: Arc<dyn MotorStage>,
    detector: Arc<dyn Detector>,
    fly: Arc<dyn FlyMotionController>,
    in_use: Arc<AtomicBool>,
}

impl DeviceSet {
    /// Bundle the device collaborators supplied by the host application.
    pub fn new(
        shutter: Arc<dyn Shutter>,
        stage: Arc<dyn MotorStage>,
        detector: Arc<dyn Detector>,
        fly: Arc<dyn FlyMotionController>,
    ) -> Self {
        Self {
            shutter,
            stage,
            detector,
            fly,
            in_use: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Exclusively check out the devices for one sequencer. Fails with
    /// [`ScanError::DevicesBusy`] while another lease is alive.
    pub fn checkout(&self) -> Result<DeviceLease, ScanError> {
        self.in_use
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ScanError::DevicesBusy)?;
        Ok(DeviceLease {
            shutter: Arc::clone(&self.shutter),
            stage: Arc::clone(&self.stage),
            detector: Arc::clone(&self.detector),
            fly: Arc::clone(&self.fly),
            in_use: Arc::clone(&self.in_use),
        })
    }
}

/// Exclusive, non-owning access to a [`DeviceSet`] for the duration of one
/// run. Returned to the pool on drop.
pub struct DeviceLease {
    shutter: Arc<dyn Shutter>,
    stage: Arc<dyn MotorStage>,
    detector: Arc<dyn Detector>,
    fly: Arc<dyn FlyMotionController>,
    in_use: Arc<AtomicBool>,
}

impl DeviceLease {
    pub fn shutter(&self) -> &dyn Shutter {
        self.shutter.as_ref()
    }

    pub fn stage(&self) -> &dyn MotorStage {
        self.stage.as_ref()
    }

    pub fn detector(&self) -> &dyn Detector {
        self.detector.as_ref()
    }

    pub fn fly(&self) -> &dyn FlyMotionController {
        self.fly.as_ref()
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        self.in_use.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockBeamline;

    #[test]
    fn checkout_is_exclusive() {
        let beamline = MockBeamline::new();
        let lease = beamline.devices.checkout().unwrap();
        assert!(beamline.devices.checkout().is_err());
        drop(lease);
        assert!(beamline.devices.checkout().is_ok());
    }
}
