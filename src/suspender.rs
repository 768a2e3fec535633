//! Beam-condition suspender.
//!
//! Watches a scalar machine signal (typically ring current in mA) and
//! latches a "tripped" flag with hysteresis: the flag sets when the signal
//! drops below a floor and clears only once the signal recovers past a
//! higher resume threshold, so a value hovering around the floor cannot
//! bounce the scan. The sequencer polls the flag at checkpoints between
//! acquisitions; the monitor itself never interrupts device calls in
//! progress.

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration, Instant};
use tracing::{info, warn};

use crate::devices::DeviceFault;
use crate::error::{ScanError, ScanResult};

/// A subscribable scalar machine signal.
pub trait SignalSource: Send + Sync {
    /// Signal name used in logs and fault reports.
    fn name(&self) -> &str;
    /// Subscribe to value updates. The receiver's current value is the
    /// latest reading.
    fn subscribe(&self) -> watch::Receiver<f64>;
}

/// Trip/resume thresholds. `resume` must be at least `floor`; the gap
/// between them is the hysteresis band.
#[derive(Debug, Clone, Copy)]
pub struct SuspendCondition {
    /// Readings strictly below this trip the suspender.
    pub floor: f64,
    /// Once tripped, readings must reach this to clear.
    pub resume: f64,
}

/// Handle to a running beam monitor. Dropping it stops the monitor task.
pub struct Suspender {
    signal_name: String,
    tripped: watch::Receiver<bool>,
    monitor: JoinHandle<()>,
}

impl Suspender {
    /// Start monitoring `source` against `condition`.
    ///
    /// The initial state is derived from the signal's current value, so a
    /// scan started during a beam dump begins suspended rather than racing
    /// the first update.
    pub fn install(source: &dyn SignalSource, condition: SuspendCondition) -> ScanResult<Self> {
        if condition.resume < condition.floor {
            return Err(ScanError::InvariantViolation(format!(
                "suspend resume threshold {} is below floor {}",
                condition.resume, condition.floor
            )));
        }

        let signal_name = source.name().to_owned();
        let mut updates = source.subscribe();
        let (tx, tripped) = watch::channel(*updates.borrow() < condition.floor);

        let name = signal_name.clone();
        let monitor = tokio::spawn(async move {
            while updates.changed().await.is_ok() {
                let value = *updates.borrow();
                let was_tripped = *tx.borrow();
                if was_tripped && value >= condition.resume {
                    info!(signal = %name, value, "beam condition recovered, resuming");
                    let _ = tx.send(false);
                } else if !was_tripped && value < condition.floor {
                    warn!(signal = %name, value, floor = condition.floor, "beam condition tripped, suspending");
                    let _ = tx.send(true);
                }
            }
            // Source gone; dropping tx lets waiters observe the loss.
        });

        Ok(Self { signal_name, tripped, monitor })
    }

    /// Signal name this suspender watches.
    pub fn signal_name(&self) -> &str {
        &self.signal_name
    }

    /// Whether the monitored signal is currently in the tripped band.
    pub fn is_tripped(&self) -> bool {
        *self.tripped.borrow()
    }

    /// Block until the tripped flag clears, up to `ceiling`. Returns the
    /// time spent waiting. Exceeding the ceiling, or losing the signal
    /// source entirely, is a [`DeviceFault`].
    pub async fn wait_until_clear(&self, ceiling: Duration) -> Result<Duration, DeviceFault> {
        if !self.is_tripped() {
            return Ok(Duration::ZERO);
        }

        let started = Instant::now();
        let mut tripped = self.tripped.clone();
        let cleared = async {
            while *tripped.borrow_and_update() {
                tripped
                    .changed()
                    .await
                    .map_err(|_| DeviceFault::comm(self.signal_name.clone(), "signal source lost"))?;
            }
            Ok(())
        };

        match timeout(ceiling, cleared).await {
            Ok(result) => result.map(|()| started.elapsed()),
            Err(_) => Err(DeviceFault::timeout(self.signal_name.clone(), ceiling)),
        }
    }
}

impl Drop for Suspender {
    fn drop(&mut self) {
        self.monitor.abort();
    }
}

/// A [`SignalSource`] driven by direct calls. Stands in for an EPICS PV
/// subscription in tests and dry runs.
pub struct ManualSignal {
    name: String,
    tx: watch::Sender<f64>,
}

impl ManualSignal {
    pub fn new(name: impl Into<String>, initial: f64) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { name: name.into(), tx }
    }

    /// Publish a new reading.
    pub fn set(&self, value: f64) {
        let _ = self.tx.send(value);
    }
}

impl SignalSource for ManualSignal {
    fn name(&self) -> &str {
        &self.name
    }

    fn subscribe(&self) -> watch::Receiver<f64> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> SuspendCondition {
        SuspendCondition { floor: 2.0, resume: 10.0 }
    }

    #[tokio::test]
    async fn test_trip_and_resume_hysteresis() {
        let signal = ManualSignal::new("ring_current", 102.0);
        let suspender = Suspender::install(&signal, thresholds()).unwrap();
        assert!(!suspender.is_tripped());

        signal.set(1.5);
        tokio::task::yield_now().await;
        assert!(suspender.is_tripped());

        // Inside the hysteresis band: still tripped.
        signal.set(5.0);
        tokio::task::yield_now().await;
        assert!(suspender.is_tripped());

        signal.set(11.0);
        tokio::task::yield_now().await;
        assert!(!suspender.is_tripped());
    }

    #[tokio::test]
    async fn test_initial_value_below_floor_starts_tripped() {
        let signal = ManualSignal::new("ring_current", 0.0);
        let suspender = Suspender::install(&signal, thresholds()).unwrap();
        assert!(suspender.is_tripped());
    }

    #[tokio::test]
    async fn test_wait_until_clear_returns_immediately_when_clear() {
        let signal = ManualSignal::new("ring_current", 102.0);
        let suspender = Suspender::install(&signal, thresholds()).unwrap();
        let waited = suspender.wait_until_clear(Duration::from_secs(1)).await.unwrap();
        assert_eq!(waited, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_wait_until_clear_observes_recovery() {
        let signal = ManualSignal::new("ring_current", 0.0);
        let suspender = Suspender::install(&signal, thresholds()).unwrap();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            signal.set(50.0);
        });

        let waited = suspender.wait_until_clear(Duration::from_secs(5)).await.unwrap();
        assert!(waited >= Duration::from_millis(5));
        assert!(!suspender.is_tripped());
    }

    #[tokio::test]
    async fn test_wait_until_clear_enforces_ceiling() {
        let signal = ManualSignal::new("ring_current", 0.0);
        let suspender = Suspender::install(&signal, thresholds()).unwrap();

        let err = suspender
            .wait_until_clear(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err.kind, crate::devices::FaultKind::Timeout(_)));
    }

    #[tokio::test]
    async fn test_invalid_thresholds_rejected() {
        let signal = ManualSignal::new("ring_current", 100.0);
        let result = Suspender::install(
            &signal,
            SuspendCondition { floor: 10.0, resume: 2.0 },
        );
        assert!(result.is_err());
    }
}
