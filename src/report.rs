//! Scan run documents.
//!
//! The sequencer narrates its progress as a stream of [`SequenceEvent`]s
//! and summarizes each completed (or failed) scan as a [`ScanReport`].
//! Both are serializable so a host application can persist them alongside
//! the detector output.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Duration;
use uuid::Uuid;

use crate::config::ScanType;
use crate::devices::{FrameType, StageAxis};

/// Terminal outcome of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    /// All requested runs completed and devices were restored.
    Completed,
    /// The scan aborted; restoration was attempted regardless.
    Failed,
}

/// Logical images collected per frame type across the whole scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FramesCollected {
    pub white_pre: u32,
    pub projection: u32,
    pub white_post: u32,
    pub dark: u32,
}

impl FramesCollected {
    /// Add `n` images under `frame_type`.
    pub fn record(&mut self, frame_type: FrameType, n: u32) {
        match frame_type {
            FrameType::WhitePre => self.white_pre += n,
            FrameType::Projection => self.projection += n,
            FrameType::WhitePost => self.white_post += n,
            FrameType::Dark => self.dark += n,
        }
    }

    pub fn total(&self) -> u32 {
        self.white_pre + self.projection + self.white_post + self.dark
    }
}

/// One step of scan progress, emitted in execution order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SequenceEvent {
    ScanStarted {
        run_uid: Uuid,
        scan_type: ScanType,
    },
    /// A frame-type run opened; every open is paired with exactly one
    /// `RunClosed` for the same frame type.
    RunOpened {
        frame_type: FrameType,
    },
    RunClosed {
        frame_type: FrameType,
        frames: u32,
    },
    ShutterOpened,
    ShutterClosed,
    AxisMoved {
        axis: StageAxis,
        position: f64,
    },
    /// The beam monitor tripped; the scan is holding at a checkpoint.
    Suspended {
        signal: String,
    },
    Resumed {
        signal: String,
        #[serde(with = "humantime_serde")]
        waited: Duration,
    },
    FlyStarted {
        taxi_position: f64,
        fly_end: f64,
        slew_speed: f64,
    },
    FlyCompleted,
    /// An axis was returned to its pre-scan position during restoration.
    AxisRestored {
        axis: StageAxis,
        position: f64,
    },
    Aborted {
        cause: String,
    },
    ScanFinished {
        status: ScanStatus,
    },
}

/// Summary document for one scan, terminal in either status.
#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    /// Unique id shared by every event and output file of this scan.
    pub run_uid: Uuid,
    pub status: ScanStatus,
    pub started_at: DateTime<Utc>,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
    pub frames_collected: FramesCollected,
    /// Files the detector reported writing, in collection order.
    pub output_paths: Vec<PathBuf>,
    /// Cause of failure, when `status` is `Failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_collected_tallies_by_type() {
        let mut frames = FramesCollected::default();
        frames.record(FrameType::WhitePre, 5);
        frames.record(FrameType::Projection, 40);
        frames.record(FrameType::Projection, 1);
        frames.record(FrameType::Dark, 5);

        assert_eq!(frames.white_pre, 5);
        assert_eq!(frames.projection, 41);
        assert_eq!(frames.white_post, 0);
        assert_eq!(frames.dark, 5);
        assert_eq!(frames.total(), 51);
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = SequenceEvent::RunClosed { frame_type: FrameType::Projection, frames: 40 };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "run_closed");
        assert_eq!(json["frame_type"], "projection");
        assert_eq!(json["frames"], 40);
    }

    #[test]
    fn test_report_omits_error_when_completed() {
        let report = ScanReport {
            run_uid: Uuid::new_v4(),
            status: ScanStatus::Completed,
            started_at: Utc::now(),
            elapsed: Duration::from_secs(12),
            frames_collected: FramesCollected::default(),
            output_paths: vec![],
            error: None,
        };
        let json = serde_json::to_string(&report).unwrap();
        assert!(!json.contains("\"error\""));
        assert!(json.contains("\"completed\""));
    }
}
