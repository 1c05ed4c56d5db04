//! Spatial crop of per-segment event slices.
//!
//! Applies the same `[x_min, x_max)` window the aligner cuts out of the warped
//! RGB frames, and shifts x so both modalities share the cropped origin.

use crate::config::PipelineConfig;
use crate::context::RunContext;
use crate::error::PipelineError;
use crate::storage;
use crate::types::{CropWindow, COL_X, EVENT_COLUMNS};
use log::{info, warn};
use ndarray::{Array2, ArrayView2, Axis, Ix2};
use std::fs;
use std::path::{Path, PathBuf};

/// Outcome of cropping a directory of segments.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CropReport {
    /// Archives written, in file-name order
    pub written: Vec<PathBuf>,
    /// Inputs skipped because they were not N×4
    pub skipped: Vec<PathBuf>,
}

/// Crops event slices to the shared crop window.
#[derive(Debug, Clone, Copy)]
pub struct SpatialCropper {
    window: CropWindow,
}

impl SpatialCropper {
    /// Crops to [`PipelineConfig::crop_window`].
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            window: config.crop_window(),
        }
    }

    /// Crops to an explicit window.
    pub fn with_window(window: CropWindow) -> Self {
        Self { window }
    }

    /// The retained column range.
    pub fn window(&self) -> CropWindow {
        self.window
    }

    /// Keeps events with `x_min <= x < x_max` and rewrites x as `x - x_min`.
    pub fn crop(&self, events: ArrayView2<'_, i64>) -> Array2<i64> {
        let rows: Vec<usize> = events
            .column(COL_X)
            .iter()
            .enumerate()
            .filter(|&(_, &x)| self.window.contains(x))
            .map(|(i, _)| i)
            .collect();
        let mut cropped = events.select(Axis(0), &rows);
        let window = self.window;
        cropped
            .column_mut(COL_X)
            .mapv_inplace(|x| window.shift(x));
        cropped
    }

    /// Crops every `.npy` slice in `input_dir` into a compressed `.npz` archive
    /// of the same stem in `output_dir`, which is reset first.
    ///
    /// Slices that are not N×4 are skipped with a warning.
    pub fn crop_dir(&self, input_dir: &Path, output_dir: &Path) -> Result<CropReport, PipelineError> {
        if !input_dir.is_dir() {
            return Err(PipelineError::missing("segment directory", input_dir));
        }
        RunContext::reset_dir(output_dir)?;

        let mut inputs: Vec<PathBuf> = fs::read_dir(input_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "npy"))
            .collect();
        inputs.sort();

        let mut report = CropReport::default();
        for input in inputs {
            let events = storage::read_matrix_dyn(&input)?;
            let shape = events.shape().to_vec();
            let events = match events.into_dimensionality::<Ix2>() {
                Ok(events) if events.ncols() == EVENT_COLUMNS => events,
                _ => {
                    warn!("Skipping {}: expected N×4 events, got {:?}", input.display(), shape);
                    report.skipped.push(input);
                    continue;
                }
            };

            let cropped = self.crop(events.view());
            let stem = input.file_stem().unwrap_or_default().to_string_lossy();
            let output = output_dir.join(format!("{}.npz", stem));
            storage::write_event_archive(&output, &cropped)?;
            report.written.push(output);
        }

        info!(
            "{} event segments cropped to x in [{}, {}) and saved to {}",
            report.written.len(),
            self.window.x_min,
            self.window.x_max,
            output_dir.display()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_crop_filters_and_shifts() {
        let cropper = SpatialCropper::with_window(CropWindow::new(280, 1280));
        let events = array![
            [0, 10, 1, 100],
            [279, 11, 0, 101],
            [280, 12, 1, 102],
            [1279, 13, 0, 103],
            [1280, 14, 1, 104],
        ];

        let cropped = cropper.crop(events.view());

        assert_eq!(cropped, array![[0, 12, 1, 102], [999, 13, 0, 103]]);
    }

    #[test]
    fn test_cropped_x_within_window_width() {
        let cropper = SpatialCropper::new(&PipelineConfig::default());
        let events = Array2::from_shape_fn((1400, 4), |(i, c)| if c == 0 { i as i64 } else { 0 });
        let cropped = cropper.crop(events.view());
        let width = cropper.window().width() as i64;
        assert_eq!(cropped.nrows(), 1000);
        assert!(cropped.column(COL_X).iter().all(|&x| (0..width).contains(&x)));
    }

    #[test]
    fn test_crop_dir_skips_malformed_segments() {
        let tmp = tempfile::tempdir().unwrap();
        let input = tmp.path().join("event_rgb_npy");
        let output = tmp.path().join("event_rgb_npz_cropped");
        fs::create_dir_all(&input).unwrap();
        storage::write_matrix(&input.join("event_000000.npy"), &array![[300, 1, 1, 5]]).unwrap();
        storage::write_matrix(&input.join("event_000001.npy"), &array![[300, 1, 5]]).unwrap();
        storage::write_matrix(&input.join("event_000002.npy"), &Array2::zeros((0, 4))).unwrap();
        fs::write(input.join("notes.txt"), "ignored").unwrap();

        let cropper = SpatialCropper::new(&PipelineConfig::default());
        let report = cropper.crop_dir(&input, &output).unwrap();

        assert_eq!(
            report.written,
            vec![output.join("event_000000.npz"), output.join("event_000002.npz")]
        );
        assert_eq!(report.skipped, vec![input.join("event_000001.npy")]);
        assert_eq!(
            storage::read_event_archive(&report.written[0]).unwrap(),
            array![[20, 1, 1, 5]]
        );
        assert_eq!(
            storage::read_event_archive(&report.written[1]).unwrap().dim(),
            (0, 4)
        );
    }

    #[test]
    fn test_crop_dir_requires_input() {
        let tmp = tempfile::tempdir().unwrap();
        let cropper = SpatialCropper::new(&PipelineConfig::default());
        let result = cropper.crop_dir(&tmp.path().join("missing"), &tmp.path().join("out"));
        assert!(matches!(result, Err(PipelineError::MissingInput(_))));
    }
}
