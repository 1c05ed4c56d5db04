//! Per-run path layout.
//!
//! Every stage receives the same [`RunContext`] and derives nothing on its own,
//! so the on-disk layout of a segment is defined here and only here.

use crate::container::ContainerFormat;
use crate::error::PipelineError;
use std::fs;
use std::path::{Path, PathBuf};

/// Sub-directory holding the raw per-segment event slices.
pub const SEGMENT_DIR: &str = "event_rgb_npy";
/// Sub-directory holding the aligned, cropped RGB images.
pub const RGB_CROP_DIR: &str = "rgb_crop";
/// Sub-directory holding the cropped per-segment event archives.
pub const CROPPED_EVENT_DIR: &str = "event_rgb_npz_cropped";
/// Sub-directory the restoration process writes into.
pub const DEBLURRED_DIR: &str = "deblurred";
/// File stem of the RGB container written by the capture tool.
pub const RGB_CONTAINER_STEM: &str = "rgb_data";
/// File name of the rewritten restoration run configuration.
pub const RUN_CONFIG: &str = "temp_run_config.yml";

/// Number of digits used for segment indices in file names.
pub const INDEX_WIDTH: usize = 6;

/// Paths of one recorded segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    root: PathBuf,
    name: String,
    format: ContainerFormat,
}

impl RunContext {
    /// Creates a context for the segment directory `root`.
    ///
    /// The segment name is the directory's final path component. Containers
    /// are expected in the default format until [`RunContext::with_format`].
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self, PipelineError> {
        let root = root.as_ref();
        let root = if root.is_absolute() {
            root.to_path_buf()
        } else {
            std::env::current_dir()?.join(root)
        };
        let name = root
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_owned)
            .ok_or_else(|| {
                PipelineError::MissingInput(format!(
                    "segment path has no usable name: {}",
                    root.display()
                ))
            })?;
        Ok(Self {
            root,
            name,
            format: ContainerFormat::default(),
        })
    }

    /// Expects the decoder and capture containers in `format`.
    pub fn with_format(mut self, format: ContainerFormat) -> Self {
        self.format = format;
        self
    }

    /// Format of the decoder and capture containers.
    pub fn format(&self) -> ContainerFormat {
        self.format
    }

    /// The segment directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The segment name (final component of the root).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Raw sensor dump, input of the external decoder.
    pub fn raw_file(&self) -> PathBuf {
        self.root.join(format!("{}.raw", self.name))
    }

    /// Structured event container produced by the external decoder.
    pub fn event_container(&self) -> PathBuf {
        self.root
            .join(format!("{}_original.{}", self.name, self.format.extension()))
    }

    /// Dense N×4 event matrix written by the extractor.
    pub fn events_matrix(&self) -> PathBuf {
        self.root.join(format!("{}_original.npy", self.name))
    }

    /// Dense trigger matrix written by the extractor.
    pub fn triggers_matrix(&self) -> PathBuf {
        self.root.join(format!("{}_original_trigger.npy", self.name))
    }

    /// Frame stack written by the RGB capture tool.
    pub fn rgb_container(&self) -> PathBuf {
        self.root
            .join(format!("{}.{}", RGB_CONTAINER_STEM, self.format.extension()))
    }

    /// Raw per-segment event slices.
    pub fn segment_dir(&self) -> PathBuf {
        self.root.join(SEGMENT_DIR)
    }

    /// Aligned, cropped RGB images.
    pub fn rgb_crop_dir(&self) -> PathBuf {
        self.root.join(RGB_CROP_DIR)
    }

    /// Cropped per-segment event archives.
    pub fn cropped_event_dir(&self) -> PathBuf {
        self.root.join(CROPPED_EVENT_DIR)
    }

    /// Rewritten restoration run configuration.
    pub fn run_config(&self) -> PathBuf {
        self.root.join(RUN_CONFIG)
    }

    /// Output root of the restoration process.
    pub fn deblurred_dir(&self) -> PathBuf {
        self.root.join(DEBLURRED_DIR)
    }

    /// Deletes `dir` if it exists and recreates it empty.
    pub fn reset_dir(dir: &Path) -> Result<(), PipelineError> {
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        fs::create_dir_all(dir)?;
        Ok(())
    }
}

/// File name of the raw event slice for `index`, e.g. `event_000042.npy`.
pub fn segment_file_name(index: usize) -> String {
    format!("event_{:0width$}.npy", index, width = INDEX_WIDTH)
}

/// File name of the aligned image for `index`, e.g. `000042.png`.
pub fn image_file_name(index: usize) -> String {
    format!("{:0width$}.png", index, width = INDEX_WIDTH)
}
