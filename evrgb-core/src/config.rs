//! Run-wide configuration.
//!
//! A single [`PipelineConfig`] is loaded once (from YAML, or defaults) and passed
//! by reference to every stage, so sensor geometry and crop offsets are defined
//! in exactly one place.

use crate::container::ContainerFormat;
use crate::error::PipelineError;
use crate::types::{CropWindow, SensorGeometry};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Top-level pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PipelineConfig {
    pub sensor: SensorGeometry,
    pub crop: CropConfig,
    pub segmenter: SegmenterConfig,
    pub homography: HomographyConfig,
    pub calibration: CalibrationConfig,
    pub rgb: RgbConfig,
    pub containers: ContainerConfig,
    pub decoder: CommandConfig,
    pub restoration: RestorationConfig,
}

/// Left edge of the shared crop window; the right edge is the sensor width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CropConfig {
    pub x_min: u32,
}

impl Default for CropConfig {
    fn default() -> Self {
        Self { x_min: 280 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmenterConfig {
    /// Nominal frame period used to close the last, unterminated window (µs).
    pub fallback_interval_us: i64,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            fallback_interval_us: 6000,
        }
    }
}

/// Robust estimator settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HomographyConfig {
    /// Maximum reprojection distance (pixels) for a correspondence to count as an inlier
    pub inlier_threshold: f64,
    /// Upper bound on consensus-sampling iterations
    pub max_iterations: usize,
    /// Probability that at least one sample is outlier-free; drives early termination
    pub confidence: f64,
    /// Sampler seed, fixed so repeated runs produce identical matrices
    pub seed: u64,
}

impl Default for HomographyConfig {
    fn default() -> Self {
        Self {
            inlier_threshold: 1.0,
            max_iterations: 10_000,
            confidence: 0.995,
            seed: 0x5EED,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Points clicked on the event sensor plane (K×2 .npy)
    pub event_points: PathBuf,
    /// Matching points on the RGB plane (K×2 .npy), in reversed order
    pub rgb_points: PathBuf,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            event_points: PathBuf::from("dvs_corners.npy"),
            rgb_points: PathBuf::from("normal_corners.npy"),
        }
    }
}

/// Channel order of the frames stored in the RGB container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOrder {
    #[default]
    Bgr,
    Rgb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RgbConfig {
    pub channel_order: ChannelOrder,
}

/// Format of the decoder and capture-tool containers in a segment directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ContainerConfig {
    pub format: ContainerFormat,
}

/// An external program invocation. `{placeholders}` in `args` are substituted per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    pub program: String,
    pub args: Vec<String>,
    /// Working directory; defaults to the caller's
    pub working_dir: Option<PathBuf>,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            program: "metavision_file_to_hdf5".to_string(),
            args: vec![
                "-i".to_string(),
                "{input}".to_string(),
                "-o".to_string(),
                "{output}".to_string(),
            ],
            working_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestorationConfig {
    pub command: CommandConfig,
    /// YAML run configuration rewritten before every launch
    pub config_template: PathBuf,
    /// Sub-directory of `deblurred/` the restoration process writes into
    pub output_name: String,
    pub save_images: bool,
}

impl Default for RestorationConfig {
    fn default() -> Self {
        Self {
            command: CommandConfig {
                program: "python".to_string(),
                args: vec![
                    "test.py".to_string(),
                    "-opt".to_string(),
                    "{config}".to_string(),
                ],
                working_dir: None,
            },
            config_template: PathBuf::from("real.yml"),
            output_name: "final_output".to_string(),
            save_images: true,
        }
    }
}

impl PipelineConfig {
    /// Loads a configuration from a YAML file; absent keys take their defaults.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| PipelineError::from_io_at(e, path))?;
        Self::from_yaml_str(&text)
    }

    /// Parses and validates a YAML document.
    pub fn from_yaml_str(text: &str) -> Result<Self, PipelineError> {
        let config: Self = serde_yaml::from_str(text)
            .map_err(|e| PipelineError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// The crop window applied to both modalities.
    pub fn crop_window(&self) -> CropWindow {
        CropWindow::new(self.crop.x_min, self.sensor.width)
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.sensor.width == 0 || self.sensor.height == 0 {
            return Err(PipelineError::InvalidConfig(format!(
                "sensor geometry must be non-zero, got {}x{}",
                self.sensor.width, self.sensor.height
            )));
        }
        if self.crop.x_min >= self.sensor.width {
            return Err(PipelineError::InvalidConfig(format!(
                "crop x_min {} must be below sensor width {}",
                self.crop.x_min, self.sensor.width
            )));
        }
        if self.segmenter.fallback_interval_us <= 0 {
            return Err(PipelineError::InvalidConfig(
                "fallback_interval_us must be positive".to_string(),
            ));
        }
        let h = &self.homography;
        if !(h.inlier_threshold > 0.0) {
            return Err(PipelineError::InvalidConfig(
                "inlier_threshold must be positive".to_string(),
            ));
        }
        if h.max_iterations == 0 {
            return Err(PipelineError::InvalidConfig(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        if !(h.confidence > 0.0 && h.confidence < 1.0) {
            return Err(PipelineError::InvalidConfig(
                "confidence must lie in (0, 1)".to_string(),
            ));
        }
        Ok(())
    }
}
