//! Core library for the tomo-scan application.
//!
//! This library contains the scan orchestration engine for a tomography /
//! diffraction beamline: a validated scan configuration, capability traits
//! for the beamline hardware, a safety suspender, a fly-motion synchronizer,
//! and the scan sequencer state machine that drives one experiment run from
//! preparation through restoration.

pub mod config;
pub mod devices;
pub mod error;
pub mod fly;
pub mod report;
pub mod sequencer;
pub mod suspender;

pub use config::{ScanConfig, ScanType};
pub use error::{ScanError, ScanResult};
pub use report::{ScanReport, ScanStatus};
pub use sequencer::Sequencer;
