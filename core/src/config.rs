//! Filter configuration
//!
//! A [`FilterConfig`] captures everything needed to bring a [`PosYawBiasFilter`] into a usable
//! state: the initial belief, the base process noise, per-stream gating, the covariance update
//! form and the fixed world → GPS-world transform. Configurations are read and written as JSON,
//! YAML or TOML, chosen by file extension.
//!
//! Matrices are given either as their diagonal (7 values) or in full row-major order (49 values).
//!
//! ```yaml
//! initial_state: [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]
//! initial_covariance: [1.0, 1.0, 1.0, 0.1, 0.1, 0.1, 0.05]
//! process_noise: [0.01, 0.01, 0.01, 0.1, 0.1, 0.1, 0.0001]
//! rejection:
//!   position: confidence95
//!   velocity: confidence99
//!   scan_match: none
//!   gps: confidence95
//! covariance_update: joseph
//! gps_frame:
//!   translation: [10.0, -4.0, 0.0]
//!   roll: 0.0
//!   pitch: 0.0
//!   yaw: 0.3
//! logging:
//!   level: info
//! ```

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use nalgebra::{Isometry3, Vector3};
use serde::{Deserialize, Serialize};

use crate::chi_square::RejectionThreshold;
use crate::error::{FilterError, Result};
use crate::filter::{PosYawBiasFilter, RejectionSettings};
use crate::kalman::CovarianceUpdate;
use crate::linearize::GpsObservation;
use crate::{STATE_SIZE, StateCovariance, StateVector};

/// Fixed world → GPS-world transform, Euler angles in radians
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpsFrameConfig {
    pub translation: [f64; 3],
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
}

impl GpsFrameConfig {
    pub fn to_isometry(&self) -> Isometry3<f64> {
        GpsObservation::from_translation_euler(
            Vector3::from(self.translation),
            self.roll,
            self.pitch,
            self.yaw,
        )
        .world_to_gps
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Logging section, consumed by the binary
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// One of off, error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Append log output to this file instead of stderr
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            file: None,
        }
    }
}

/// Complete filter configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// `[x, y, z, vx, vy, vz, yaw_bias]`
    pub initial_state: Vec<f64>,
    /// Diagonal (7) or row-major (49)
    pub initial_covariance: Vec<f64>,
    /// Base process noise in the world frame without bias correction, diagonal (7) or row-major (49)
    pub process_noise: Vec<f64>,
    pub covariance_update: CovarianceUpdate,
    pub rejection: RejectionSettings,
    pub gps_frame: GpsFrameConfig,
    pub logging: LoggingConfig,
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            initial_state: vec![0.0; STATE_SIZE],
            initial_covariance: vec![1.0, 1.0, 1.0, 0.1, 0.1, 0.1, 0.05],
            process_noise: vec![0.01, 0.01, 0.01, 0.1, 0.1, 0.1, 1e-4],
            covariance_update: CovarianceUpdate::Standard,
            rejection: RejectionSettings {
                position: RejectionThreshold::Confidence95,
                velocity: RejectionThreshold::Confidence95,
                scan_match: RejectionThreshold::None,
                gps: RejectionThreshold::Confidence95,
            },
            gps_frame: GpsFrameConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Interpret a 7-element diagonal or 49-element row-major list as a state-sized matrix.
fn state_matrix(values: &[f64], name: &'static str) -> Result<StateCovariance> {
    match values.len() {
        STATE_SIZE => Ok(StateCovariance::from_diagonal(
            &StateVector::from_column_slice(values),
        )),
        n if n == STATE_SIZE * STATE_SIZE => Ok(StateCovariance::from_row_slice(values)),
        n => Err(FilterError::DimensionMismatch {
            name,
            expected: format!("{} or {}", STATE_SIZE, STATE_SIZE * STATE_SIZE),
            found: n,
        }),
    }
}

impl FilterConfig {
    pub fn initial_state(&self) -> Result<StateVector> {
        if self.initial_state.len() != STATE_SIZE {
            return Err(FilterError::DimensionMismatch {
                name: "initial_state",
                expected: STATE_SIZE.to_string(),
                found: self.initial_state.len(),
            });
        }
        Ok(StateVector::from_column_slice(&self.initial_state))
    }

    pub fn initial_covariance(&self) -> Result<StateCovariance> {
        state_matrix(&self.initial_covariance, "initial_covariance")
    }

    pub fn process_noise(&self) -> Result<StateCovariance> {
        state_matrix(&self.process_noise, "process_noise")
    }

    /// Build an initialized filter.
    ///
    /// `init` runs first since it resets the scan-match and GPS thresholds and the process noise;
    /// the configured values are applied afterwards.
    pub fn build(&self) -> Result<PosYawBiasFilter> {
        let x0 = self.initial_state()?;
        let p0 = self.initial_covariance()?;
        let q = self.process_noise()?;

        let mut filter = PosYawBiasFilter::new();
        filter.set_covariance_update(self.covariance_update);
        filter.set_world_to_gps(self.gps_frame.to_isometry());
        filter.init(&p0, &x0)?;
        filter.set_rejection_settings(self.rejection);
        filter.process_noise(&q)?;
        Ok(filter)
    }

    /// Write the configuration to a JSON file (pretty-printed).
    pub fn to_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    /// Read the configuration from a JSON file.
    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(file)?)
    }

    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut file = File::create(path)?;
        let s = serde_yaml::to_string(self)?;
        file.write_all(s.as_bytes())?;
        Ok(())
    }

    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        Ok(serde_yaml::from_reader(file)?)
    }

    pub fn to_toml<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut file = File::create(path)?;
        let s = toml::to_string(self)?;
        file.write_all(s.as_bytes())?;
        Ok(())
    }

    pub fn from_toml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut s = String::new();
        File::open(path)?.read_to_string(&mut s)?;
        Ok(toml::from_str(&s)?)
    }

    /// Generic write: choose format by file extension (.json/.yaml/.yml/.toml)
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => self.to_json(p),
            Some("yaml") | Some("yml") => self.to_yaml(p),
            Some("toml") => self.to_toml(p),
            _ => Err(unsupported(p)),
        }
    }

    /// Generic read: choose format by file extension (.json/.yaml/.yml/.toml)
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => Self::from_json(p),
            Some("yaml") | Some("yml") => Self::from_yaml(p),
            Some("toml") => Self::from_toml(p),
            _ => Err(unsupported(p)),
        }
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
}

fn unsupported(path: &Path) -> FilterError {
    FilterError::Config(format!(
        "unsupported file extension: {}",
        path.display()
    ))
}
