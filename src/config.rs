//! Scan configuration: raw document model and validation.
//!
//! A scan is described by a declarative YAML document with a `tomo:` section
//! (motion and frame counts) and an `output:` section (file destination).
//! The document deserializes into [`RawScanDoc`], which is then validated
//! and normalized into an immutable [`ScanConfig`]. Validation is pure: no
//! hardware is touched, and every rejection is a [`ConfigError`] surfaced to
//! the caller before orchestration starts.
//!
//! Any source producing the same shape works equally well: a file via
//! [`load_scan_file`], an in-memory [`RawScanDoc`], or generated parameters.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fastest slew speed of the rotation stage, degrees per second.
pub const ROT_STAGE_FAST_SPEED: f64 = 10.0;

/// Slowest usable slew speed of the rotation stage, degrees per second.
pub const ROT_STAGE_SLOW_SPEED: f64 = 0.001;

/// Default time for the rotation stage to reach slew speed, seconds.
pub const ROT_STAGE_ACCL: f64 = 1.0;

/// Relative tolerance used when deciding whether an omega range divides
/// into a whole number of steps.
const STEP_INTEGRALITY_TOL: f64 = 1e-9;

/// Errors produced while loading or validating a scan document.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read scan document: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse scan document: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("{field} must be positive, got {value}")]
    NonPositive { field: &'static str, value: f64 },

    #[error("{field} must be finite")]
    NonFinite { field: &'static str },

    #[error("acquire_period ({period} s) must be >= acquire_time ({time} s)")]
    PeriodShorterThanExposure { period: f64, time: f64 },

    #[error("omega_step {step} does not advance omega from {start} toward {end}")]
    StepDirection { start: f64, end: f64, step: f64 },

    #[error("omega range {start}..{end} is not a whole number of {step} steps")]
    NonIntegralSteps { start: f64, end: f64, step: f64 },

    #[error("omega range is shorter than one omega_step; no images would be collected")]
    EmptyOmegaRange,

    #[error("fly parameters are required when type = fly")]
    MissingFlyParams,

    #[error("fly parameters are only valid when type = fly")]
    UnexpectedFlyParams,

    #[error("unsupported output type '{0}' (expected tiff or hdf)")]
    UnknownOutputFormat(String),

    #[error("output fileprefix must not be empty")]
    EmptyFilePrefix,
}

/// Scan motion mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanType {
    /// Step-and-shoot: move, settle, acquire at each omega.
    Step,
    /// Position-synchronized continuous rotation.
    Fly,
}

/// Detector file format for the collected images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Tiff,
    Hdf,
}

impl OutputFormat {
    /// Parse the format names the scan documents have historically used.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s.to_ascii_lowercase().as_str() {
            "tif" | "tiff" => Ok(OutputFormat::Tiff),
            "hdf" | "hdf1" | "hdf5" => Ok(OutputFormat::Hdf),
            other => Err(ConfigError::UnknownOutputFormat(other.to_string())),
        }
    }

    /// File extension written by the detector plugin.
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Tiff => "tiff",
            OutputFormat::Hdf => "hdf",
        }
    }
}

/// Relative sample offsets applied around white-field collection.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SampleOutOffset {
    /// Offset along the sample X axis, millimeters.
    #[serde(default)]
    pub kx: f64,
    /// Offset along the sample Z axis, millimeters.
    #[serde(default)]
    pub kz: f64,
}

/// Normalized fly-scan motion parameters.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct FlyParams {
    /// Requested rotation slew speed, degrees per second.
    pub slew_speed: f64,
    /// Time for the rotation stage to reach slew speed, seconds.
    pub accl: f64,
    /// Extra run-up distance beyond the acceleration margin, degrees.
    pub taxi_margin: f64,
}

/// Fly parameters as written in the document; unset fields fall back to
/// the stage defaults during validation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RawFlyParams {
    pub slew_speed: Option<f64>,
    pub accl: Option<f64>,
    pub taxi_margin: Option<f64>,
}

/// Validated output destination.
#[derive(Debug, Clone, Serialize)]
pub struct OutputConfig {
    pub filepath: PathBuf,
    pub fileprefix: String,
    pub format: OutputFormat,
}

/// `tomo:` section of the raw scan document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TomoSection {
    #[serde(rename = "type")]
    pub scan_type: ScanType,
    #[serde(default)]
    pub n_white: u32,
    #[serde(default)]
    pub n_dark: u32,
    #[serde(default = "default_n_frames")]
    pub n_frames: u32,
    pub acquire_time: f64,
    pub acquire_period: f64,
    pub omega_start: f64,
    pub omega_end: f64,
    pub omega_step: f64,
    #[serde(default)]
    pub sample_out_position: SampleOutOffset,
    #[serde(default)]
    pub fly: Option<RawFlyParams>,
}

fn default_n_frames() -> u32 {
    1
}

/// `output:` section of the raw scan document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSection {
    pub filepath: PathBuf,
    pub fileprefix: String,
    #[serde(rename = "type")]
    pub format: String,
}

/// Raw scan document as deserialized, prior to validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawScanDoc {
    pub tomo: TomoSection,
    pub output: OutputSection,
}

impl RawScanDoc {
    /// Validate and normalize this document into an immutable [`ScanConfig`].
    pub fn validate(self) -> Result<ScanConfig, ConfigError> {
        let t = &self.tomo;

        require_positive("acquire_time", t.acquire_time)?;
        require_positive("acquire_period", t.acquire_period)?;
        if t.acquire_period < t.acquire_time {
            return Err(ConfigError::PeriodShorterThanExposure {
                period: t.acquire_period,
                time: t.acquire_time,
            });
        }
        if t.n_frames == 0 {
            return Err(ConfigError::NonPositive { field: "n_frames", value: 0.0 });
        }

        for (field, value) in [
            ("omega_start", t.omega_start),
            ("omega_end", t.omega_end),
            ("omega_step", t.omega_step),
        ] {
            if !value.is_finite() {
                return Err(ConfigError::NonFinite { field });
            }
        }
        let span = t.omega_end - t.omega_start;
        if t.omega_step == 0.0 || span == 0.0 || span.signum() != t.omega_step.signum() {
            return Err(ConfigError::StepDirection {
                start: t.omega_start,
                end: t.omega_end,
                step: t.omega_step,
            });
        }

        let (n_projections, truncated) = projection_count(t.omega_start, t.omega_end, t.omega_step);
        if n_projections == 0 {
            return Err(ConfigError::EmptyOmegaRange);
        }

        let fly = match (t.scan_type, t.fly) {
            (ScanType::Step, None) => {
                if truncated {
                    return Err(ConfigError::NonIntegralSteps {
                        start: t.omega_start,
                        end: t.omega_end,
                        step: t.omega_step,
                    });
                }
                None
            }
            (ScanType::Step, Some(_)) => return Err(ConfigError::UnexpectedFlyParams),
            (ScanType::Fly, None) => return Err(ConfigError::MissingFlyParams),
            (ScanType::Fly, Some(raw)) => {
                let slew_speed = raw.slew_speed.unwrap_or(ROT_STAGE_FAST_SPEED);
                let accl = raw.accl.unwrap_or(ROT_STAGE_ACCL);
                let taxi_margin = raw.taxi_margin.unwrap_or(0.0);
                require_positive("fly.slew_speed", slew_speed)?;
                require_positive("fly.accl", accl)?;
                if !taxi_margin.is_finite() || taxi_margin < 0.0 {
                    return Err(ConfigError::NonPositive {
                        field: "fly.taxi_margin",
                        value: taxi_margin,
                    });
                }
                Some(FlyParams { slew_speed, accl, taxi_margin })
            }
        };

        if self.output.fileprefix.trim().is_empty() {
            return Err(ConfigError::EmptyFilePrefix);
        }
        let format = OutputFormat::parse(&self.output.format)?;

        Ok(ScanConfig {
            scan_type: t.scan_type,
            n_white: t.n_white,
            n_dark: t.n_dark,
            n_frames: t.n_frames,
            acquire_time: t.acquire_time,
            acquire_period: t.acquire_period,
            omega_start: t.omega_start,
            omega_end: t.omega_end,
            omega_step: t.omega_step,
            sample_out: t.sample_out_position,
            fly,
            n_projections,
            output: OutputConfig {
                filepath: self.output.filepath,
                fileprefix: self.output.fileprefix,
                format,
            },
        })
    }
}

/// Validated, immutable parameter set describing one experiment run.
#[derive(Debug, Clone, Serialize)]
pub struct ScanConfig {
    pub scan_type: ScanType,
    pub n_white: u32,
    pub n_dark: u32,
    pub n_frames: u32,
    pub acquire_time: f64,
    pub acquire_period: f64,
    pub omega_start: f64,
    pub omega_end: f64,
    pub omega_step: f64,
    pub sample_out: SampleOutOffset,
    /// Populated iff `scan_type == Fly`.
    pub fly: Option<FlyParams>,
    n_projections: u32,
    pub output: OutputConfig,
}

impl ScanConfig {
    /// Number of projection images the omega sweep yields.
    pub fn n_projections(&self) -> u32 {
        self.n_projections
    }

    /// Total logical images per run, used to size the detector file capture.
    pub fn total_images(&self) -> u32 {
        self.n_white + self.n_projections + self.n_dark
    }
}

/// Number of detector triggers the omega sweep produces, and whether a
/// trailing partial step was truncated. For an integral range this is the
/// rounded step count (boundary inclusive handled by the caller's sweep);
/// a fractional range truncates the trailing frame.
pub(crate) fn projection_count(start: f64, end: f64, step: f64) -> (u32, bool) {
    let steps = (end - start) / step;
    let rounded = steps.round();
    if (steps - rounded).abs() <= STEP_INTEGRALITY_TOL * rounded.abs().max(1.0) {
        (rounded as u32, false)
    } else {
        (steps.trunc() as u32, true)
    }
}

fn require_positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if !value.is_finite() {
        return Err(ConfigError::NonFinite { field });
    }
    if value <= 0.0 {
        return Err(ConfigError::NonPositive { field, value });
    }
    Ok(())
}

/// Load and validate a scan document from a YAML file.
pub fn load_scan_file(path: &Path) -> Result<ScanConfig, ConfigError> {
    let text = std::fs::read_to_string(path)?;
    let raw: RawScanDoc = serde_yaml::from_str(&text)?;
    raw.validate()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_step() -> RawScanDoc {
        RawScanDoc {
            tomo: TomoSection {
                scan_type: ScanType::Step,
                n_white: 5,
                n_dark: 5,
                n_frames: 1,
                acquire_time: 0.05,
                acquire_period: 0.07,
                omega_start: 0.0,
                omega_end: 20.0,
                omega_step: 0.5,
                sample_out_position: SampleOutOffset { kx: 1.0, kz: 0.0 },
                fly: None,
            },
            output: OutputSection {
                filepath: PathBuf::from("/data"),
                fileprefix: "sample_a".to_string(),
                format: "tiff".to_string(),
            },
        }
    }

    #[test]
    fn step_config_validates_and_counts_projections() {
        let cfg = raw_step().validate().unwrap();
        assert_eq!(cfg.n_projections(), 40);
        assert_eq!(cfg.total_images(), 50);
        assert!(cfg.fly.is_none());
    }

    #[test]
    fn rejects_period_shorter_than_exposure() {
        let mut raw = raw_step();
        raw.tomo.acquire_period = 0.01;
        assert!(matches!(
            raw.validate(),
            Err(ConfigError::PeriodShorterThanExposure { .. })
        ));
    }

    #[test]
    fn rejects_non_integral_step_count() {
        let mut raw = raw_step();
        raw.tomo.omega_step = 0.7;
        assert!(matches!(raw.validate(), Err(ConfigError::NonIntegralSteps { .. })));
    }

    #[test]
    fn rejects_step_sign_mismatch() {
        let mut raw = raw_step();
        raw.tomo.omega_step = -0.5;
        assert!(matches!(raw.validate(), Err(ConfigError::StepDirection { .. })));
    }

    #[test]
    fn rejects_zero_duration_and_frames() {
        let mut raw = raw_step();
        raw.tomo.acquire_time = 0.0;
        assert!(matches!(raw.validate(), Err(ConfigError::NonPositive { .. })));

        let mut raw = raw_step();
        raw.tomo.n_frames = 0;
        assert!(matches!(raw.validate(), Err(ConfigError::NonPositive { .. })));
    }

    #[test]
    fn fly_requires_fly_block_and_resolves_defaults() {
        let mut raw = raw_step();
        raw.tomo.scan_type = ScanType::Fly;
        assert!(matches!(raw.validate(), Err(ConfigError::MissingFlyParams)));

        let mut raw = raw_step();
        raw.tomo.scan_type = ScanType::Fly;
        raw.tomo.fly = Some(RawFlyParams::default());
        let cfg = raw.validate().unwrap();
        let fly = cfg.fly.unwrap();
        assert_eq!(fly.slew_speed, ROT_STAGE_FAST_SPEED);
        assert_eq!(fly.accl, ROT_STAGE_ACCL);
        assert_eq!(fly.taxi_margin, 0.0);
    }

    #[test]
    fn step_rejects_stray_fly_block() {
        let mut raw = raw_step();
        raw.tomo.fly = Some(RawFlyParams::default());
        assert!(matches!(raw.validate(), Err(ConfigError::UnexpectedFlyParams)));
    }

    #[test]
    fn output_format_aliases() {
        assert_eq!(OutputFormat::parse("tif").unwrap(), OutputFormat::Tiff);
        assert_eq!(OutputFormat::parse("HDF5").unwrap(), OutputFormat::Hdf);
        assert!(matches!(
            OutputFormat::parse("png"),
            Err(ConfigError::UnknownOutputFormat(_))
        ));
    }

    #[test]
    fn loads_yaml_document() {
        let doc = r#"
tomo:
  type: fly
  n_white: 10
  n_dark: 10
  n_frames: 1
  acquire_time: 0.05
  acquire_period: 0.07
  omega_start: 0
  omega_end: 180
  omega_step: 0.25
  sample_out_position:
    kx: -2.0
    kz: 0.5
  fly:
    slew_speed: 5.0
output:
  filepath: /data/tomo
  fileprefix: run42
  type: hdf
"#;
        let raw: RawScanDoc = serde_yaml::from_str(doc).unwrap();
        let cfg = raw.validate().unwrap();
        assert_eq!(cfg.scan_type, ScanType::Fly);
        assert_eq!(cfg.n_projections(), 720);
        assert_eq!(cfg.output.format, OutputFormat::Hdf);
        assert_eq!(cfg.fly.unwrap().slew_speed, 5.0);
    }

    #[test]
    fn loads_scan_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.yml");
        std::fs::write(
            &path,
            "tomo:\n  type: step\n  acquire_time: 0.05\n  acquire_period: 0.07\n  omega_start: 0\n  omega_end: 20\n  omega_step: 0.5\noutput:\n  filepath: /data\n  fileprefix: run1\n  type: tiff\n",
        )
        .unwrap();

        let cfg = load_scan_file(&path).unwrap();
        assert_eq!(cfg.n_projections(), 40);

        let missing = load_scan_file(&dir.path().join("absent.yml"));
        assert!(matches!(missing, Err(ConfigError::Io(_))));
    }

    #[test]
    fn partial_coverage_truncates() {
        let (n, truncated) = projection_count(0.0, 10.0, 3.0);
        assert_eq!(n, 3);
        assert!(truncated);

        let (n, truncated) = projection_count(0.0, 20.0, 0.5);
        assert_eq!(n, 40);
        assert!(!truncated);
    }
}
