//! Scan sequencer.
//!
//! Drives one tomography scan over a checked-out device lease: white field
//! with the sample translated out of the beam, projections (step-and-shoot
//! or position-synchronized fly), and dark field with the shutter closed.
//! The sequencer is single-threaded and cooperative; beam suspension and
//! user cancellation are observed only at checkpoints between device
//! operations, never by interrupting a call in flight.
//!
//! Whatever happens mid-scan, the sequencer always attempts to restore the
//! beamline before reporting: shutter closed on abort, every moved axis
//! returned to its pre-scan position in reverse move order.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{ScanConfig, ScanType};
use crate::devices::{
    AcquireMode, DeviceFault, DeviceLease, DeviceResult, DeviceSet, FrameType, ShutterState,
    StageAxis, TriggerMode,
};
use crate::error::{ScanError, ScanResult};
use crate::fly::FlyPlan;
use crate::report::{FramesCollected, ScanReport, ScanStatus, SequenceEvent};
use crate::suspender::Suspender;

/// Tolerance between demanded and readback position, degrees or mm.
const READBACK_TOL: f64 = 1e-4;

/// Operational limits for one sequencer.
#[derive(Debug, Clone, Copy)]
pub struct SequencerSettings {
    /// Budget for a single device call; exceeding it is a device fault.
    /// Acquisition waits get this budget on top of the expected duration.
    pub op_timeout: Duration,
    /// Longest the sequencer holds for a beam recovery before giving up.
    pub suspend_ceiling: Duration,
}

impl Default for SequencerSettings {
    fn default() -> Self {
        Self {
            op_timeout: Duration::from_secs(60),
            suspend_ceiling: Duration::from_secs(600),
        }
    }
}

/// Requests cancellation of a running scan. Cloneable; honored at the next
/// checkpoint, after the device call in flight completes.
#[derive(Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SequencerState {
    Idle,
    Preparing,
    Collecting,
    Suspended,
    Aborting,
    Restoring,
    Done,
    Failed,
}

impl SequencerState {
    fn permits(self, next: SequencerState) -> bool {
        use SequencerState::*;
        matches!(
            (self, next),
            (Idle, Preparing)
                | (Preparing, Collecting)
                | (Collecting, Suspended)
                | (Suspended, Collecting)
                | (Collecting, Restoring)
                | (Preparing | Collecting | Suspended, Aborting)
                | (Aborting, Restoring)
                | (Restoring, Done | Failed)
        )
    }
}

/// Mutable bookkeeping for the scan in progress.
struct RunContext {
    run_uid: Uuid,
    /// Frame-type run currently open, if any. At most one at a time.
    open_run: Option<FrameType>,
    /// Images collected in the currently open run.
    run_frames: u32,
    /// Pre-scan position of each axis, pushed on first move, restored LIFO.
    home_positions: Vec<(StageAxis, f64)>,
    frames: FramesCollected,
    output_paths: Vec<std::path::PathBuf>,
    /// Whether the sample-out offsets are currently applied.
    sample_out_applied: bool,
    restored: bool,
}

impl RunContext {
    fn new() -> Self {
        Self {
            run_uid: Uuid::new_v4(),
            open_run: None,
            run_frames: 0,
            home_positions: Vec::new(),
            frames: FramesCollected::default(),
            output_paths: Vec::new(),
            sample_out_applied: false,
            restored: false,
        }
    }
}

/// One-shot executor for a validated scan configuration.
pub struct Sequencer {
    devices: DeviceLease,
    config: ScanConfig,
    settings: SequencerSettings,
    suspender: Option<Suspender>,
    events: Option<mpsc::UnboundedSender<SequenceEvent>>,
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
    state: SequencerState,
    ctx: RunContext,
}

impl Sequencer {
    /// Check out the devices and prepare a sequencer for `config`. Fails
    /// with [`ScanError::DevicesBusy`] while another sequencer holds them.
    pub fn new(devices: &DeviceSet, config: ScanConfig) -> ScanResult<Self> {
        let lease = devices.checkout()?;
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Ok(Self {
            devices: lease,
            config,
            settings: SequencerSettings::default(),
            suspender: None,
            events: None,
            cancel_tx: Arc::new(cancel_tx),
            cancel_rx,
            state: SequencerState::Idle,
            ctx: RunContext::new(),
        })
    }

    pub fn with_settings(mut self, settings: SequencerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Attach a beam-condition suspender, consulted at checkpoints.
    pub fn install_suspender(&mut self, suspender: Suspender) {
        self.suspender = Some(suspender);
    }

    /// Subscribe to progress events. Only the latest subscriber receives
    /// events.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<SequenceEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events = Some(tx);
        rx
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle { tx: Arc::clone(&self.cancel_tx) }
    }

    /// Run the scan to completion. Consumes the sequencer; the device
    /// lease is released when the returned report is produced.
    pub async fn run(mut self) -> ScanReport {
        let started_at = Utc::now();
        let started = Instant::now();
        let run_uid = self.ctx.run_uid;

        info!(%run_uid, scan_type = ?self.config.scan_type, "scan starting");
        self.emit(SequenceEvent::ScanStarted { run_uid, scan_type: self.config.scan_type });

        let outcome = self.execute().await;

        let error = match outcome {
            Ok(()) => {
                let restored = match self.transition(SequencerState::Restoring) {
                    Ok(()) => self.restore().await,
                    Err(err) => Err(err),
                };
                match restored {
                    Ok(()) => None,
                    Err(err) => {
                        error!(error = %err, "restoration failed after a completed scan");
                        Some(err.to_string())
                    }
                }
            }
            Err(err) => {
                self.abort(&err).await;
                if self.transition(SequencerState::Restoring).is_ok() {
                    if let Err(restore_err) = self.restore().await {
                        error!(error = %restore_err, "restoration failed during abort");
                    }
                }
                Some(err.to_string())
            }
        };

        let status = if error.is_none() { ScanStatus::Completed } else { ScanStatus::Failed };
        let terminal = match status {
            ScanStatus::Completed => SequencerState::Done,
            ScanStatus::Failed => SequencerState::Failed,
        };
        if let Err(err) = self.transition(terminal) {
            error!(error = %err, "sequencer ended in an unexpected state");
        }
        self.emit(SequenceEvent::ScanFinished { status });

        match status {
            ScanStatus::Completed => info!(%run_uid, frames = self.ctx.frames.total(), "scan completed"),
            ScanStatus::Failed => warn!(%run_uid, error = error.as_deref().unwrap_or(""), "scan failed"),
        }

        ScanReport {
            run_uid,
            status,
            started_at,
            elapsed: started.elapsed(),
            frames_collected: self.ctx.frames,
            output_paths: std::mem::take(&mut self.ctx.output_paths),
            error,
        }
    }

    // ---------------------------------------------------------------------
    // Scan flow
    // ---------------------------------------------------------------------

    async fn execute(&mut self) -> ScanResult<()> {
        self.transition(SequencerState::Preparing)?;

        let output = self.config.output.clone();
        let written = self
            .device_call(
                "detector",
                self.devices
                    .detector()
                    .set_output(&output.filepath, &output.fileprefix, output.format),
            )
            .await?;
        self.ctx.output_paths.push(written);

        self.device_call(
            "detector",
            self.devices
                .detector()
                .set_timing(self.config.acquire_time, self.config.acquire_period),
        )
        .await?;

        // Plan fly motion up front so infeasible motion fails before the
        // beamline is touched.
        let fly_plan = match self.config.scan_type {
            ScanType::Fly => Some(FlyPlan::compute(&self.config)?),
            ScanType::Step => None,
        };

        self.transition(SequencerState::Collecting)?;

        if self.config.n_white > 0 {
            self.checkpoint().await?;
            self.open_run(FrameType::WhitePre)?;
            let body = self.white_field_body().await;
            self.finish_run(FrameType::WhitePre, body)?;
        }

        self.checkpoint().await?;
        self.open_run(FrameType::Projection)?;
        let body = self.projection_body(fly_plan).await;
        self.finish_run(FrameType::Projection, body)?;

        // Beam off once projections are done; darks are taken shutter-closed.
        self.close_shutter().await?;

        if self.config.n_dark > 0 {
            // Darks need no beam: the suspender is deliberately not
            // consulted, only cancellation.
            self.cancel_point()?;
            self.open_run(FrameType::Dark)?;
            let body = self.dark_field_body().await;
            self.finish_run(FrameType::Dark, body)?;
        }

        Ok(())
    }

    /// White field: sample translated out of the beam, shutter open,
    /// internally triggered acquisition.
    async fn white_field_body(&mut self) -> ScanResult<()> {
        self.move_sample_out().await?;
        self.ensure_shutter_open().await?;
        self.checkpoint().await?;
        self.collect(TriggerMode::Internal, FrameType::WhitePre, self.config.n_white)
            .await
    }

    async fn projection_body(&mut self, fly_plan: Option<FlyPlan>) -> ScanResult<()> {
        self.move_sample_in().await?;
        self.ensure_shutter_open().await?;

        match self.config.scan_type {
            ScanType::Step => self.step_projections().await,
            ScanType::Fly => {
                let plan = fly_plan.ok_or_else(|| {
                    ScanError::InvariantViolation("fly run reached without a motion plan".into())
                })?;
                self.fly_projections(plan).await
            }
        }
    }

    /// Step-and-shoot: move, settle, acquire at each omega position.
    async fn step_projections(&mut self) -> ScanResult<()> {
        for i in 0..self.config.n_projections() {
            let omega = self.config.omega_start + f64::from(i) * self.config.omega_step;
            self.checkpoint().await?;
            self.move_axis_to(StageAxis::Rotation, omega).await?;
            self.collect(TriggerMode::Internal, FrameType::Projection, 1).await?;
        }
        Ok(())
    }

    /// Fly: continuous rotation with position-synchronized triggers.
    async fn fly_projections(&mut self, plan: FlyPlan) -> ScanResult<()> {
        // The fly controller moves the rotation stage out-of-band, so its
        // home must be recorded before taxi.
        let home = self.read_position(StageAxis::Rotation).await?;
        self.record_home(StageAxis::Rotation, home);

        let mode = self.acquire_mode();
        self.device_call(
            "detector",
            self.devices.detector().configure(
                mode,
                TriggerMode::Overlapped,
                FrameType::Projection,
                plan.trigger_count,
            ),
        )
        .await?;
        self.device_call("psofly", self.devices.fly().set_scan_delta(plan.scan_delta))
            .await?;

        self.checkpoint().await?;
        self.device_call("psofly", self.devices.fly().taxi(plan.taxi_position)).await?;
        self.device_call("psofly", self.devices.fly().fly(plan.fly_end, plan.slew_speed))
            .await?;
        self.emit(SequenceEvent::FlyStarted {
            taxi_position: plan.taxi_position,
            fly_end: plan.fly_end,
            slew_speed: plan.slew_speed,
        });

        // A suspender trip during the sweep is deferred until the motion
        // confirms completion; nothing may interrupt an armed fly.
        let budget = self.settings.op_timeout + plan.travel_time();
        self.device_call_with("psofly", budget, self.devices.fly().wait_complete())
            .await?;
        self.emit(SequenceEvent::FlyCompleted);

        let frames = self
            .device_call_with("detector", budget, self.devices.detector().arm_and_wait())
            .await?;
        self.record_frames(FrameType::Projection, frames);
        Ok(())
    }

    /// Dark field: shutter closed, internally triggered acquisition.
    async fn dark_field_body(&mut self) -> ScanResult<()> {
        self.close_shutter().await?;
        self.collect(TriggerMode::Internal, FrameType::Dark, self.config.n_dark).await
    }

    /// Configure the detector and run one blocking acquisition of
    /// `n_images` logical images tagged `frame_type`.
    async fn collect(
        &mut self,
        trigger: TriggerMode,
        frame_type: FrameType,
        n_images: u32,
    ) -> ScanResult<()> {
        let mode = self.acquire_mode();
        self.device_call(
            "detector",
            self.devices.detector().configure(mode, trigger, frame_type, n_images),
        )
        .await?;

        let expected = f64::from(n_images)
            * self.config.acquire_period
            * f64::from(self.config.n_frames.max(1));
        let budget = self.settings.op_timeout + Duration::from_secs_f64(expected);
        let frames = self
            .device_call_with("detector", budget, self.devices.detector().arm_and_wait())
            .await?;
        self.record_frames(frame_type, frames);
        Ok(())
    }

    fn acquire_mode(&self) -> AcquireMode {
        if self.config.n_frames > 1 {
            AcquireMode::Accumulate { n_frames: self.config.n_frames }
        } else {
            AcquireMode::Single
        }
    }

    // ---------------------------------------------------------------------
    // Sample positioning
    // ---------------------------------------------------------------------

    async fn move_sample_out(&mut self) -> ScanResult<()> {
        if self.ctx.sample_out_applied {
            return Ok(());
        }
        let offset = self.config.sample_out;
        if offset.kx != 0.0 {
            self.move_axis_relative(StageAxis::SampleX, offset.kx).await?;
        }
        if offset.kz != 0.0 {
            self.move_axis_relative(StageAxis::SampleZ, offset.kz).await?;
        }
        self.ctx.sample_out_applied = true;
        Ok(())
    }

    async fn move_sample_in(&mut self) -> ScanResult<()> {
        if !self.ctx.sample_out_applied {
            return Ok(());
        }
        let offset = self.config.sample_out;
        if offset.kx != 0.0 {
            self.move_axis_relative(StageAxis::SampleX, -offset.kx).await?;
        }
        if offset.kz != 0.0 {
            self.move_axis_relative(StageAxis::SampleZ, -offset.kz).await?;
        }
        self.ctx.sample_out_applied = false;
        Ok(())
    }

    async fn move_axis_relative(&mut self, axis: StageAxis, delta: f64) -> ScanResult<f64> {
        let current = self.read_position(axis).await?;
        self.record_home(axis, current);
        let target = current + delta;

        let readback = self
            .device_call("stage", self.devices.stage().move_relative(axis, delta))
            .await?;
        if (readback - target).abs() > READBACK_TOL {
            return Err(DeviceFault::readback(axis.to_string(), target, readback).into());
        }
        self.emit(SequenceEvent::AxisMoved { axis, position: readback });
        Ok(readback)
    }

    async fn move_axis_to(&mut self, axis: StageAxis, target: f64) -> ScanResult<f64> {
        let current = self.read_position(axis).await?;
        self.move_axis_relative(axis, target - current).await
    }

    async fn read_position(&self, axis: StageAxis) -> ScanResult<f64> {
        self.device_call("stage", self.devices.stage().position(axis)).await
    }

    /// Record the first observed position of `axis` as its home.
    fn record_home(&mut self, axis: StageAxis, position: f64) {
        if !self.ctx.home_positions.iter().any(|(a, _)| *a == axis) {
            debug!(%axis, position, "recording home position");
            self.ctx.home_positions.push((axis, position));
        }
    }

    // ---------------------------------------------------------------------
    // Shutter
    // ---------------------------------------------------------------------

    async fn ensure_shutter_open(&mut self) -> ScanResult<()> {
        if self.devices.shutter().state().await == ShutterState::Open {
            return Ok(());
        }
        self.device_call("shutter", self.devices.shutter().open()).await?;
        self.emit(SequenceEvent::ShutterOpened);
        Ok(())
    }

    async fn close_shutter(&mut self) -> ScanResult<()> {
        if self.devices.shutter().state().await == ShutterState::Closed {
            return Ok(());
        }
        self.device_call("shutter", self.devices.shutter().close()).await?;
        self.emit(SequenceEvent::ShutterClosed);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Runs, checkpoints, and faults
    // ---------------------------------------------------------------------

    fn open_run(&mut self, frame_type: FrameType) -> ScanResult<()> {
        if let Some(open) = self.ctx.open_run {
            return Err(ScanError::InvariantViolation(format!(
                "{open} run still open when opening {frame_type}"
            )));
        }
        self.ctx.open_run = Some(frame_type);
        self.ctx.run_frames = 0;
        self.emit(SequenceEvent::RunOpened { frame_type });
        Ok(())
    }

    fn close_run(&mut self, frame_type: FrameType) -> ScanResult<()> {
        match self.ctx.open_run.take() {
            Some(open) if open == frame_type => {
                self.emit(SequenceEvent::RunClosed { frame_type, frames: self.ctx.run_frames });
                Ok(())
            }
            Some(open) => Err(ScanError::InvariantViolation(format!(
                "closing {frame_type} run while {open} run is open"
            ))),
            None => Err(ScanError::InvariantViolation(format!(
                "closing {frame_type} run that was never opened"
            ))),
        }
    }

    /// Close the run opened by the caller, preserving the body's error if
    /// it failed. A failed run is still closed so open/close stay paired.
    fn finish_run(&mut self, frame_type: FrameType, body: ScanResult<()>) -> ScanResult<()> {
        let closed = self.close_run(frame_type);
        body.and(closed)
    }

    fn record_frames(&mut self, frame_type: FrameType, n: u32) {
        self.ctx.frames.record(frame_type, n);
        self.ctx.run_frames += n;
    }

    fn cancel_point(&self) -> ScanResult<()> {
        if *self.cancel_rx.borrow() {
            Err(ScanError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Cooperative checkpoint: honor cancellation, then hold while the
    /// beam suspender is tripped (up to the suspend ceiling).
    async fn checkpoint(&mut self) -> ScanResult<()> {
        self.cancel_point()?;
        if !self.suspender.as_ref().is_some_and(Suspender::is_tripped) {
            return Ok(());
        }

        self.transition(SequencerState::Suspended)?;
        let (signal, waited) = {
            let suspender = self.suspender.as_ref().ok_or_else(|| {
                ScanError::InvariantViolation("suspended without a suspender".into())
            })?;
            let signal = suspender.signal_name().to_owned();
            warn!(signal = %signal, "beam tripped, scan holding at checkpoint");
            self.emit(SequenceEvent::Suspended { signal: signal.clone() });
            let waited = suspender.wait_until_clear(self.settings.suspend_ceiling).await?;
            (signal, waited)
        };
        self.transition(SequencerState::Collecting)?;
        info!(signal = %signal, ?waited, "beam recovered, scan resuming");
        self.emit(SequenceEvent::Resumed { signal, waited });

        // Cancellation requested during the hold is honored before any
        // further device work.
        self.cancel_point()
    }

    async fn device_call<T>(
        &self,
        device: &str,
        call: impl Future<Output = DeviceResult<T>>,
    ) -> ScanResult<T> {
        self.device_call_with(device, self.settings.op_timeout, call).await
    }

    async fn device_call_with<T>(
        &self,
        device: &str,
        budget: Duration,
        call: impl Future<Output = DeviceResult<T>>,
    ) -> ScanResult<T> {
        match timeout(budget, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(DeviceFault::timeout(device, budget).into()),
        }
    }

    // ---------------------------------------------------------------------
    // Abort and restore
    // ---------------------------------------------------------------------

    /// Best-effort safety actions after a failure: close any open run so
    /// pairing holds, shut the beam off, stop fly pulses. Failures here are
    /// logged, never raised over the original error.
    async fn abort(&mut self, cause: &ScanError) {
        error!(error = %cause, "scan aborting");
        if let Err(err) = self.transition(SequencerState::Aborting) {
            error!(error = %err, "abort requested from an unexpected state");
        }

        if let Some(frame_type) = self.ctx.open_run {
            if let Err(err) = self.close_run(frame_type) {
                warn!(error = %err, "failed to close open run during abort");
            }
        }
        self.emit(SequenceEvent::Aborted { cause: cause.to_string() });

        if let Err(err) = self.device_call("shutter", self.devices.shutter().close()).await {
            warn!(error = %err, "shutter close failed during abort");
        } else {
            self.emit(SequenceEvent::ShutterClosed);
        }

        if self.config.scan_type == ScanType::Fly {
            if let Err(err) = self.device_call("psofly", self.devices.fly().disarm()).await {
                warn!(error = %err, "fly disarm failed during abort");
            }
        }
    }

    /// Return every moved axis to its pre-scan position, most recently
    /// homed first. Idempotent; a failed axis does not stop the others.
    async fn restore(&mut self) -> ScanResult<()> {
        if self.ctx.restored {
            return Ok(());
        }
        self.ctx.restored = true;

        let homes = std::mem::take(&mut self.ctx.home_positions);
        let mut first_err: Option<ScanError> = None;
        for (axis, home) in homes.into_iter().rev() {
            match self.restore_axis(axis, home).await {
                Ok(position) => {
                    self.emit(SequenceEvent::AxisRestored { axis, position });
                }
                Err(err) => {
                    error!(%axis, home, error = %err, "failed to restore axis");
                    first_err.get_or_insert(err);
                }
            }
        }
        self.ctx.sample_out_applied = false;

        match first_err {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    async fn restore_axis(&self, axis: StageAxis, home: f64) -> ScanResult<f64> {
        let current = self.read_position(axis).await?;
        if (current - home).abs() <= READBACK_TOL {
            return Ok(current);
        }
        let readback = self
            .device_call("stage", self.devices.stage().move_relative(axis, home - current))
            .await?;
        if (readback - home).abs() > READBACK_TOL {
            return Err(DeviceFault::readback(axis.to_string(), home, readback).into());
        }
        Ok(readback)
    }

    // ---------------------------------------------------------------------
    // Plumbing
    // ---------------------------------------------------------------------

    fn transition(&mut self, next: SequencerState) -> ScanResult<()> {
        if !self.state.permits(next) {
            return Err(ScanError::InvariantViolation(format!(
                "illegal sequencer transition {:?} -> {next:?}",
                self.state
            )));
        }
        debug!(from = ?self.state, to = ?next, "sequencer state change");
        self.state = next;
        Ok(())
    }

    fn emit(&self, event: SequenceEvent) {
        debug!(?event, "sequence event");
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

/// Human-readable description of what running `config` would do, used by
/// dry runs. No hardware is touched.
pub fn summarize(config: &ScanConfig) -> Vec<String> {
    let mut lines = Vec::new();

    let kind = match config.scan_type {
        ScanType::Step => "step",
        ScanType::Fly => "fly",
    };
    lines.push(format!(
        "{kind} scan: omega {}° to {}° in {} steps of {}°",
        config.omega_start,
        config.omega_end,
        config.n_projections(),
        config.omega_step,
    ));

    let mut timing = format!(
        "exposure {} s, frame period {} s",
        config.acquire_time, config.acquire_period
    );
    if config.n_frames > 1 {
        timing.push_str(&format!(", {} frames accumulated per image", config.n_frames));
    }
    lines.push(timing);

    if config.n_white > 0 {
        lines.push(format!(
            "{} white field images with sample offset kx {} mm, kz {} mm",
            config.n_white, config.sample_out.kx, config.sample_out.kz
        ));
    }
    if config.n_dark > 0 {
        lines.push(format!("{} dark field images with shutter closed", config.n_dark));
    }

    if config.scan_type == ScanType::Fly {
        if let Ok(plan) = FlyPlan::compute(config) {
            lines.push(format!(
                "taxi to {:.4}°, fly to {:.4}° at {:.4}°/s ({} triggers every {}°)",
                plan.taxi_position,
                plan.fly_end,
                plan.slew_speed,
                plan.trigger_count,
                plan.scan_delta,
            ));
        }
    }

    lines.push(format!(
        "{} images total, written as {} under {}",
        config.total_images(),
        config.output.format.extension(),
        config.output.filepath.display(),
    ));
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OutputSection, RawScanDoc, TomoSection};
    use crate::devices::mock::MockBeamline;
    use crate::devices::MotorStage;
    use std::path::PathBuf;

    fn step_config() -> ScanConfig {
        RawScanDoc {
            tomo: TomoSection {
                scan_type: ScanType::Step,
                n_white: 2,
                n_dark: 2,
                n_frames: 1,
                acquire_time: 0.001,
                acquire_period: 0.002,
                omega_start: 0.0,
                omega_end: 2.0,
                omega_step: 1.0,
                sample_out_position: Default::default(),
                fly: None,
            },
            output: OutputSection {
                filepath: PathBuf::from("/tmp/out"),
                fileprefix: "unit".into(),
                format: "tiff".into(),
            },
        }
        .validate()
        .unwrap()
    }

    #[tokio::test]
    async fn test_restore_is_idempotent() {
        let beamline = MockBeamline::new();
        let mut seq = Sequencer::new(&beamline.devices, step_config()).unwrap();

        seq.move_axis_relative(StageAxis::SampleX, 2.0).await.unwrap();
        seq.restore().await.unwrap();
        assert_eq!(beamline.stage.position(StageAxis::SampleX).await.unwrap(), 0.0);

        let moves = beamline.stage.history().await.len();
        seq.restore().await.unwrap();
        assert_eq!(beamline.stage.history().await.len(), moves);
    }

    #[tokio::test]
    async fn test_home_is_recorded_once_per_axis() {
        let beamline = MockBeamline::new();
        let mut seq = Sequencer::new(&beamline.devices, step_config()).unwrap();

        seq.move_axis_relative(StageAxis::Rotation, 10.0).await.unwrap();
        seq.move_axis_relative(StageAxis::Rotation, 5.0).await.unwrap();
        assert_eq!(seq.ctx.home_positions, vec![(StageAxis::Rotation, 0.0)]);

        seq.restore().await.unwrap();
        assert_eq!(beamline.stage.position(StageAxis::Rotation).await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_nested_or_unmatched_runs_are_rejected() {
        let beamline = MockBeamline::new();
        let mut seq = Sequencer::new(&beamline.devices, step_config()).unwrap();

        seq.open_run(FrameType::Projection).unwrap();
        assert!(matches!(
            seq.open_run(FrameType::Dark),
            Err(ScanError::InvariantViolation(_))
        ));
        seq.close_run(FrameType::Projection).unwrap();
        assert!(matches!(
            seq.close_run(FrameType::Projection),
            Err(ScanError::InvariantViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_checkpoint_honors_cancellation() {
        let beamline = MockBeamline::new();
        let mut seq = Sequencer::new(&beamline.devices, step_config()).unwrap();
        // Checkpoints only fire in the collecting state.
        seq.state = SequencerState::Collecting;

        seq.checkpoint().await.unwrap();
        seq.cancel_handle().cancel();
        assert!(matches!(seq.checkpoint().await, Err(ScanError::Cancelled)));
    }

    #[test]
    fn test_summary_mentions_projection_count() {
        let lines = summarize(&step_config());
        assert!(lines.iter().any(|l| l.contains("2 steps")));
        assert!(lines.iter().any(|l| l.contains("dark field")));
        // 2 white + 2 projections + 2 dark
        assert!(lines.iter().any(|l| l.contains("6 images total")));
    }
}
