//! Mock hardware implementations.
//!
//! Provides simulated beamline devices for testing and dry runs without
//! physical hardware. All mocks use async-safe operations
//! (`tokio::time::sleep`, not `std::thread::sleep`) and keep a small call
//! journal so tests can assert what the sequencer did to them.
//!
//! # Available Mocks
//!
//! - [`MockShutter`] - shutter with open/close latency
//! - [`MockStage`] - sample stage with proportional motion timing
//! - [`MockDetector`] - detector with configure/arm lifecycle and fault injection
//! - [`MockFlyController`] - taxi/fly controller sharing the stage's rotation axis
//!
//! [`MockBeamline`] bundles all four into a [`DeviceSet`] while keeping the
//! concrete handles accessible.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{sleep, Duration};

use crate::config::OutputFormat;
use crate::devices::{
    AcquireMode, Detector, DeviceFault, DeviceResult, DeviceSet, FlyMotionController, FrameType,
    MotorStage, Shutter, ShutterState, StageAxis, TriggerMode,
};

/// Motion delay cap so large sweeps stay fast in tests.
const MAX_MOTION_DELAY: Duration = Duration::from_millis(5);

// =============================================================================
// MockShutter
// =============================================================================

/// Simulated beam shutter. Starts closed; open/close take a few
/// milliseconds and update the readback state.
pub struct MockShutter {
    state: RwLock<ShutterState>,
    fail_open: AtomicBool,
}

impl MockShutter {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(ShutterState::Closed),
            fail_open: AtomicBool::new(false),
        }
    }

    /// Make the next `open()` call fail with a fault readback.
    pub fn fail_next_open(&self) {
        self.fail_open.store(true, Ordering::SeqCst);
    }
}

impl Default for MockShutter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Shutter for MockShutter {
    async fn open(&self) -> DeviceResult<()> {
        if self.fail_open.swap(false, Ordering::SeqCst) {
            *self.state.write().await = ShutterState::Fault;
            return Err(DeviceFault::comm("shutter", "open command rejected"));
        }
        sleep(Duration::from_millis(2)).await;
        *self.state.write().await = ShutterState::Open;
        Ok(())
    }

    async fn close(&self) -> DeviceResult<()> {
        sleep(Duration::from_millis(2)).await;
        *self.state.write().await = ShutterState::Closed;
        Ok(())
    }

    async fn state(&self) -> ShutterState {
        *self.state.read().await
    }
}

// =============================================================================
// MockStage
// =============================================================================

/// Simulated sample stage. All axes start at 0.0; motion delay is
/// proportional to distance (capped) and every completed move is recorded
/// in a journal of `(axis, final_position)` entries.
pub struct MockStage {
    positions: RwLock<HashMap<StageAxis, f64>>,
    history: RwLock<Vec<(StageAxis, f64)>>,
    speed: f64,
}

impl MockStage {
    /// Create a stage with the default 100 units/sec motion speed.
    pub fn new() -> Self {
        Self::with_speed(100.0)
    }

    /// Create a stage with a custom motion speed (units per second).
    pub fn with_speed(speed: f64) -> Self {
        Self {
            positions: RwLock::new(HashMap::new()),
            history: RwLock::new(Vec::new()),
            speed,
        }
    }

    /// Journal of completed moves: `(axis, final_position)` in order.
    pub async fn history(&self) -> Vec<(StageAxis, f64)> {
        self.history.read().await.clone()
    }

    /// Force an axis readback, bypassing motion. Used by the fly
    /// controller (which moves the rotation axis out-of-band) and by tests.
    pub async fn set_position(&self, axis: StageAxis, position: f64) {
        self.positions.write().await.insert(axis, position);
    }
}

impl Default for MockStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MotorStage for MockStage {
    async fn move_relative(&self, axis: StageAxis, delta: f64) -> DeviceResult<f64> {
        let current = self.positions.read().await.get(&axis).copied().unwrap_or(0.0);
        let target = current + delta;

        let delay = Duration::from_secs_f64(delta.abs() / self.speed).min(MAX_MOTION_DELAY);
        sleep(delay).await;

        self.positions.write().await.insert(axis, target);
        self.history.write().await.push((axis, target));
        Ok(target)
    }

    async fn position(&self, axis: StageAxis) -> DeviceResult<f64> {
        Ok(self.positions.read().await.get(&axis).copied().unwrap_or(0.0))
    }
}

// =============================================================================
// MockDetector
// =============================================================================

/// Acquisition setup captured by the last `configure` call.
#[derive(Debug, Clone, Copy)]
pub struct DetectorSetup {
    pub mode: AcquireMode,
    pub trigger: TriggerMode,
    pub frame_type: FrameType,
    pub n_images: u32,
}

type ArmHook = Box<dyn Fn(u32) + Send + Sync>;

/// Simulated area detector.
///
/// Tracks configuration, timing, and the number of logical images written
/// per frame type. Arming without a prior `configure` is a fault, matching
/// real plugin behavior. Tests can inject a one-shot fault keyed on frame
/// type, or install a hook invoked at the start of every arm.
pub struct MockDetector {
    setup: RwLock<Option<DetectorSetup>>,
    timing: RwLock<Option<(f64, f64)>>,
    output: RwLock<Option<PathBuf>>,
    frames: RwLock<HashMap<FrameType, u32>>,
    arm_count: AtomicU32,
    fail_on: RwLock<Option<FrameType>>,
    arm_hook: Mutex<Option<ArmHook>>,
}

impl MockDetector {
    pub fn new() -> Self {
        Self {
            setup: RwLock::new(None),
            timing: RwLock::new(None),
            output: RwLock::new(None),
            frames: RwLock::new(HashMap::new()),
            arm_count: AtomicU32::new(0),
            fail_on: RwLock::new(None),
            arm_hook: Mutex::new(None),
        }
    }

    /// Logical images written so far for `frame_type`.
    pub async fn frames(&self, frame_type: FrameType) -> u32 {
        self.frames.read().await.get(&frame_type).copied().unwrap_or(0)
    }

    /// Total arm cycles performed.
    pub fn arm_count(&self) -> u32 {
        self.arm_count.load(Ordering::SeqCst)
    }

    /// Last timing programmed via `set_timing`.
    pub async fn timing(&self) -> Option<(f64, f64)> {
        *self.timing.read().await
    }

    /// Setup captured by the most recent `configure`.
    pub async fn setup(&self) -> Option<DetectorSetup> {
        *self.setup.read().await
    }

    /// Fail the next arm whose configured frame type matches. One-shot.
    pub async fn fail_next_arm(&self, frame_type: FrameType) {
        *self.fail_on.write().await = Some(frame_type);
    }

    /// Install a hook called with the arm ordinal at the start of every
    /// `arm_and_wait`. Tests use this to trip signals mid-scan.
    pub async fn set_arm_hook(&self, hook: impl Fn(u32) + Send + Sync + 'static) {
        *self.arm_hook.lock().await = Some(Box::new(hook));
    }
}

impl Default for MockDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Detector for MockDetector {
    async fn configure(
        &self,
        mode: AcquireMode,
        trigger: TriggerMode,
        frame_type: FrameType,
        n_images: u32,
    ) -> DeviceResult<()> {
        if n_images == 0 {
            return Err(DeviceFault::comm("detector", "num_images must be nonzero"));
        }
        *self.setup.write().await = Some(DetectorSetup { mode, trigger, frame_type, n_images });
        Ok(())
    }

    async fn set_timing(&self, acquire_time: f64, acquire_period: f64) -> DeviceResult<()> {
        if acquire_time <= 0.0 || acquire_period < acquire_time {
            return Err(DeviceFault::comm("detector", "invalid acquire timing"));
        }
        *self.timing.write().await = Some((acquire_time, acquire_period));
        Ok(())
    }

    async fn set_output(
        &self,
        path: &Path,
        prefix: &str,
        format: OutputFormat,
    ) -> DeviceResult<PathBuf> {
        let file = path.join(format!("{prefix}_{:06}.{}", 0, format.extension()));
        *self.output.write().await = Some(file.clone());
        Ok(file)
    }

    async fn arm_and_wait(&self) -> DeviceResult<u32> {
        let setup = self
            .setup
            .read()
            .await
            .ok_or_else(|| DeviceFault::comm("detector", "armed without configuration"))?;

        let ordinal = self.arm_count.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(hook) = self.arm_hook.lock().await.as_ref() {
            hook(ordinal);
        }

        let fails = { *self.fail_on.read().await == Some(setup.frame_type) };
        if fails {
            *self.fail_on.write().await = None;
            return Err(DeviceFault::comm(
                "detector",
                format!("acquisition failed during {} frames", setup.frame_type),
            ));
        }

        // Acquisition plus file-write confirmation.
        sleep(Duration::from_millis(3)).await;

        *self.frames.write().await.entry(setup.frame_type).or_insert(0) += setup.n_images;
        Ok(setup.n_images)
    }
}

// =============================================================================
// MockFlyController
// =============================================================================

/// Simulated position-synchronized fly controller.
///
/// Shares the [`MockStage`]'s rotation axis so the stage readback reflects
/// taxi and fly motion, the way the real controller drives the same
/// physical rotary stage.
pub struct MockFlyController {
    stage: Arc<MockStage>,
    scan_delta: RwLock<Option<f64>>,
    taxied_at: RwLock<Option<f64>>,
    in_flight: RwLock<Option<(f64, f64)>>,
    armed: AtomicBool,
    fail_fly: AtomicBool,
}

impl MockFlyController {
    pub fn new(stage: Arc<MockStage>) -> Self {
        Self {
            stage,
            scan_delta: RwLock::new(None),
            taxied_at: RwLock::new(None),
            in_flight: RwLock::new(None),
            armed: AtomicBool::new(false),
            fail_fly: AtomicBool::new(false),
        }
    }

    /// Make the next `fly()` call fail.
    pub fn fail_next_fly(&self) {
        self.fail_fly.store(true, Ordering::SeqCst);
    }

    /// Whether the controller is currently emitting position pulses.
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    /// Scan delta programmed by the sequencer, if any.
    pub async fn scan_delta(&self) -> Option<f64> {
        *self.scan_delta.read().await
    }
}

#[async_trait]
impl FlyMotionController for MockFlyController {
    async fn set_scan_delta(&self, delta: f64) -> DeviceResult<()> {
        if delta <= 0.0 {
            return Err(DeviceFault::comm("psofly", "scan delta must be positive"));
        }
        *self.scan_delta.write().await = Some(delta);
        Ok(())
    }

    async fn taxi(&self, start: f64) -> DeviceResult<()> {
        sleep(Duration::from_millis(2)).await;
        self.stage.set_position(StageAxis::Rotation, start).await;
        *self.taxied_at.write().await = Some(start);
        self.armed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn fly(&self, end: f64, slew_speed: f64) -> DeviceResult<()> {
        if self.fail_fly.swap(false, Ordering::SeqCst) {
            return Err(DeviceFault::comm("psofly", "fly command rejected"));
        }
        if self.taxied_at.read().await.is_none() {
            return Err(DeviceFault::comm("psofly", "fly requested before taxi"));
        }
        if slew_speed <= 0.0 {
            return Err(DeviceFault::comm("psofly", "slew speed must be positive"));
        }
        *self.in_flight.write().await = Some((end, slew_speed));
        Ok(())
    }

    async fn wait_complete(&self) -> DeviceResult<()> {
        let (end, slew_speed) = self
            .in_flight
            .write()
            .await
            .take()
            .ok_or_else(|| DeviceFault::comm("psofly", "no fly motion in flight"))?;

        let start = self.taxied_at.read().await.unwrap_or(0.0);
        let delay =
            Duration::from_secs_f64((end - start).abs() / slew_speed.max(f64::EPSILON) / 1000.0)
                .min(MAX_MOTION_DELAY);
        sleep(delay).await;

        self.stage.set_position(StageAxis::Rotation, end).await;
        Ok(())
    }

    async fn disarm(&self) -> DeviceResult<()> {
        self.armed.store(false, Ordering::SeqCst);
        *self.in_flight.write().await = None;
        Ok(())
    }
}

// =============================================================================
// MockBeamline
// =============================================================================

/// A complete simulated beamline: the four mocks plus the [`DeviceSet`]
/// bundling them, with the concrete handles kept for assertions.
pub struct MockBeamline {
    pub shutter: Arc<MockShutter>,
    pub stage: Arc<MockStage>,
    pub detector: Arc<MockDetector>,
    pub fly: Arc<MockFlyController>,
    pub devices: DeviceSet,
}

impl MockBeamline {
    pub fn new() -> Self {
        let shutter = Arc::new(MockShutter::new());
        let stage = Arc::new(MockStage::new());
        let detector = Arc::new(MockDetector::new());
        let fly = Arc::new(MockFlyController::new(Arc::clone(&stage)));
        let devices = DeviceSet::new(
            Arc::clone(&shutter) as Arc<dyn Shutter>,
            Arc::clone(&stage) as Arc<dyn MotorStage>,
            Arc::clone(&detector) as Arc<dyn Detector>,
            Arc::clone(&fly) as Arc<dyn FlyMotionController>,
        );
        Self { shutter, stage, detector, fly, devices }
    }
}

impl Default for MockBeamline {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_stage_relative_move() {
        let stage = MockStage::new();

        stage.move_relative(StageAxis::SampleX, 5.0).await.unwrap();
        assert_eq!(stage.position(StageAxis::SampleX).await.unwrap(), 5.0);

        stage.move_relative(StageAxis::SampleX, -3.0).await.unwrap();
        assert_eq!(stage.position(StageAxis::SampleX).await.unwrap(), 2.0);

        // Axes are independent.
        assert_eq!(stage.position(StageAxis::Rotation).await.unwrap(), 0.0);
        assert_eq!(stage.history().await.len(), 2);
    }

    #[tokio::test]
    async fn test_mock_shutter_lifecycle() {
        let shutter = MockShutter::new();
        assert_eq!(shutter.state().await, ShutterState::Closed);

        shutter.open().await.unwrap();
        assert_eq!(shutter.state().await, ShutterState::Open);

        shutter.close().await.unwrap();
        assert_eq!(shutter.state().await, ShutterState::Closed);

        shutter.fail_next_open();
        assert!(shutter.open().await.is_err());
        assert_eq!(shutter.state().await, ShutterState::Fault);
    }

    #[tokio::test]
    async fn test_mock_detector_requires_configuration() {
        let det = MockDetector::new();
        assert!(det.arm_and_wait().await.is_err());

        det.configure(AcquireMode::Single, TriggerMode::Internal, FrameType::Dark, 4)
            .await
            .unwrap();
        assert_eq!(det.arm_and_wait().await.unwrap(), 4);
        assert_eq!(det.frames(FrameType::Dark).await, 4);
    }

    #[tokio::test]
    async fn test_mock_detector_fault_injection_is_one_shot() {
        let det = MockDetector::new();
        det.configure(
            AcquireMode::Accumulate { n_frames: 2 },
            TriggerMode::Internal,
            FrameType::Projection,
            1,
        )
        .await
        .unwrap();

        det.fail_next_arm(FrameType::Projection).await;
        assert!(det.arm_and_wait().await.is_err());
        assert!(det.arm_and_wait().await.is_ok());
        assert_eq!(det.frames(FrameType::Projection).await, 1);
    }

    #[tokio::test]
    async fn test_mock_fly_requires_taxi_before_fly() {
        let stage = Arc::new(MockStage::new());
        let fly = MockFlyController::new(Arc::clone(&stage));

        assert!(fly.fly(180.0, 5.0).await.is_err());

        fly.taxi(-1.0).await.unwrap();
        assert_eq!(stage.position(StageAxis::Rotation).await.unwrap(), -1.0);

        fly.fly(181.0, 5.0).await.unwrap();
        fly.wait_complete().await.unwrap();
        assert_eq!(stage.position(StageAxis::Rotation).await.unwrap(), 181.0);
    }
}
