//! Geometric registration of RGB frames onto the event sensor plane.
//!
//! The homography is estimated once from the static calibration points. The
//! crop translation is folded into it and its inverse is tabulated once for
//! every output pixel, so warping a frame is a single lookup-and-interpolate
//! pass over the cropped canvas.

use crate::config::{ChannelOrder, PipelineConfig};
use crate::container;
use crate::context::{image_file_name, RunContext};
use crate::error::PipelineError;
use crate::homography::{Homography, RansacEstimator};
use crate::storage;
use crate::types::CropWindow;
use log::{debug, info};
use nalgebra::Point2;
use ndarray::{s, Array2, Array3, Array4, ArrayView3, Axis};
use std::path::{Path, PathBuf};

/// Corresponding points on the two image planes, index for index.
#[derive(Debug, Clone, PartialEq)]
pub struct Calibration {
    pub event_points: Vec<Point2<f64>>,
    pub rgb_points: Vec<Point2<f64>>,
}

impl Calibration {
    /// Loads both point files named in the configuration.
    pub fn load(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let event = storage::read_points(&config.calibration.event_points)?;
        let rgb = storage::read_points(&config.calibration.rgb_points)?;
        Self::from_arrays(&event, &rgb)
    }

    /// Builds a calibration from K×2 arrays.
    ///
    /// The RGB points are stored in the opposite order to the event points
    /// (the RGB image was clicked with the other handedness), so their order
    /// is reversed here.
    pub fn from_arrays(event: &Array2<f64>, rgb: &Array2<f64>) -> Result<Self, PipelineError> {
        if event.nrows() != rgb.nrows() {
            return Err(PipelineError::Format(format!(
                "calibration point sets differ in size ({} vs {})",
                event.nrows(),
                rgb.nrows()
            )));
        }
        let to_points = |a: &Array2<f64>| -> Vec<Point2<f64>> {
            a.rows()
                .into_iter()
                .map(|r| Point2::new(r[0], r[1]))
                .collect()
        };
        let event_points = to_points(event);
        let mut rgb_points = to_points(rgb);
        rgb_points.reverse();
        Ok(Self {
            event_points,
            rgb_points,
        })
    }

    /// Robustly estimates the RGB → event-plane homography.
    pub fn estimate(&self, config: &PipelineConfig) -> Result<Homography, PipelineError> {
        let estimate =
            RansacEstimator::new(&config.homography).estimate(&self.rgb_points, &self.event_points)?;
        info!(
            "Homography estimated from {}/{} correspondences",
            estimate.inlier_count(),
            self.rgb_points.len()
        );
        debug!("Homography matrix: {}", estimate.homography.matrix());
        Ok(estimate.homography)
    }
}

/// The frame stack stored by the RGB capture tool.
#[derive(Debug, Clone)]
pub struct RgbContainer {
    frames: Array4<u8>,
}

impl RgbContainer {
    /// Opens the container (`.h5` or `.npz`) and loads its whole frame stack.
    pub fn open(path: &Path) -> Result<Self, PipelineError> {
        Self::load(path, None)
    }

    /// Opens the container and loads only its first `limit` frames.
    pub fn open_first(path: &Path, limit: usize) -> Result<Self, PipelineError> {
        Self::load(path, Some(limit))
    }

    fn load(path: &Path, limit: Option<usize>) -> Result<Self, PipelineError> {
        let frames = container::read_frames(path, limit)?;
        check_channels(path, frames.len_of(Axis(3)))?;
        Ok(Self { frames })
    }

    /// Wraps an in-memory `(N, H, W, C)` stack.
    pub fn from_frames(frames: Array4<u8>) -> Self {
        Self { frames }
    }

    /// Number of frames held.
    pub fn frame_count(&self) -> usize {
        self.frames.len_of(Axis(0))
    }

    /// Frame `index` as an H×W×C view. Panics if `index` is out of range.
    pub fn frame(&self, index: usize) -> ArrayView3<'_, u8> {
        self.frames.index_axis(Axis(0), index)
    }
}

fn check_channels(path: &Path, channels: usize) -> Result<(), PipelineError> {
    if channels == 1 || channels == 3 {
        Ok(())
    } else {
        Err(PipelineError::Format(format!(
            "{}: frames must have 1 or 3 channels, got {}",
            path.display(),
            channels
        )))
    }
}

/// Number of frames in the RGB container at `path`.
///
/// Only the shape of the frame stack is read; no pixels are loaded.
pub fn probe_frame_count(path: &Path) -> Result<usize, PipelineError> {
    let shape = container::frame_stack_shape(path)?;
    match shape.as_slice() {
        [frames, _, _, channels] => {
            check_channels(path, *channels)?;
            Ok(*frames)
        }
        _ => Err(PipelineError::Format(format!(
            "{}: expected an (N, H, W, C) frame stack, got shape {:?}",
            path.display(),
            shape
        ))),
    }
}

/// Inverse mapping from every output pixel to a source position.
#[derive(Debug, Clone)]
pub struct RemapTable {
    width: usize,
    height: usize,
    /// Source `(x, y)` per output pixel, row-major; `None` maps to black
    coords: Vec<Option<(f32, f32)>>,
}

impl RemapTable {
    /// Tabulates `homography` followed by the crop, for a canvas of the crop
    /// width and `height` rows.
    pub fn new(
        homography: &Homography,
        crop: CropWindow,
        height: u32,
    ) -> Result<Self, PipelineError> {
        let shifted = homography.then(&Homography::translation(-(crop.x_min as f64), 0.0));
        let inverse = shifted.inverse()?;
        let width = crop.width() as usize;
        let height = height as usize;
        let mut coords = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                coords.push(
                    inverse
                        .project(x as f64, y as f64)
                        .map(|(sx, sy)| (sx as f32, sy as f32)),
                );
            }
        }
        Ok(Self {
            width,
            height,
            coords,
        })
    }

    /// Output width in pixels (the crop width).
    pub fn width(&self) -> usize {
        self.width
    }

    /// Output height in pixels.
    pub fn height(&self) -> usize {
        self.height
    }

    /// Resamples `frame` (H×W×C) through the table with bilinear
    /// interpolation; samples outside the frame read as zero.
    pub fn apply(&self, frame: ArrayView3<'_, u8>) -> Array3<u8> {
        let (src_h, src_w, channels) = frame.dim();
        let mut out = Array3::<u8>::zeros((self.height, self.width, channels));
        let texel = |x: i64, y: i64, c: usize| -> f32 {
            if x < 0 || y < 0 || x >= src_w as i64 || y >= src_h as i64 {
                0.0
            } else {
                frame[[y as usize, x as usize, c]] as f32
            }
        };
        for (i, coord) in self.coords.iter().enumerate() {
            let Some((sx, sy)) = *coord else { continue };
            if sx <= -1.0 || sy <= -1.0 || sx >= src_w as f32 || sy >= src_h as f32 {
                continue;
            }
            let (x0, y0) = (sx.floor(), sy.floor());
            let (fx, fy) = (sx - x0, sy - y0);
            let (x0, y0) = (x0 as i64, y0 as i64);
            let (row, col) = (i / self.width, i % self.width);
            for c in 0..channels {
                let top = texel(x0, y0, c) * (1.0 - fx) + texel(x0 + 1, y0, c) * fx;
                let bottom = texel(x0, y0 + 1, c) * (1.0 - fx) + texel(x0 + 1, y0 + 1, c) * fx;
                let value = top * (1.0 - fy) + bottom * fy;
                out[[row, col, c]] = value.round().clamp(0.0, 255.0) as u8;
            }
        }
        out
    }
}

/// Warps RGB frames into the cropped event-sensor frame.
#[derive(Debug, Clone)]
pub struct HomographyAligner {
    homography: Homography,
    table: RemapTable,
    channel_order: ChannelOrder,
}

impl HomographyAligner {
    /// Loads the calibration named in `config` and estimates the homography.
    pub fn new(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let calibration = Calibration::load(config)?;
        Self::from_calibration(config, &calibration)
    }

    /// Estimates the homography from already loaded calibration points.
    pub fn from_calibration(
        config: &PipelineConfig,
        calibration: &Calibration,
    ) -> Result<Self, PipelineError> {
        let homography = calibration.estimate(config)?;
        Self::with_homography(config, homography)
    }

    /// Uses a known homography instead of estimating one.
    pub fn with_homography(
        config: &PipelineConfig,
        homography: Homography,
    ) -> Result<Self, PipelineError> {
        let table = RemapTable::new(&homography, config.crop_window(), config.sensor.height)?;
        Ok(Self {
            homography,
            table,
            channel_order: config.rgb.channel_order,
        })
    }

    /// The RGB to event-plane homography, before the crop shift.
    pub fn homography(&self) -> &Homography {
        &self.homography
    }

    /// Warps and crops a single frame.
    pub fn warp(&self, frame: ArrayView3<'_, u8>) -> Array3<u8> {
        self.table.apply(frame)
    }

    /// Aligns the first `min(frame_count, limit)` frames and writes them as
    /// `{i:06}.png` into `out_dir`, which is reset first.
    pub fn align_to_dir(
        &self,
        container: &RgbContainer,
        limit: usize,
        out_dir: &Path,
    ) -> Result<Vec<PathBuf>, PipelineError> {
        RunContext::reset_dir(out_dir)?;
        let count = container.frame_count().min(limit);
        let mut written = Vec::with_capacity(count);
        for index in 0..count {
            let aligned = self.warp(container.frame(index));
            let path = out_dir.join(image_file_name(index));
            save_png(&path, &aligned, self.channel_order)?;
            written.push(path);
        }
        info!(
            "{} RGB frames aligned and saved to {}",
            count,
            out_dir.display()
        );
        Ok(written)
    }
}

/// Encodes an H×W×C frame as PNG, swapping BGR to RGB when needed.
pub fn save_png(path: &Path, frame: &Array3<u8>, order: ChannelOrder) -> Result<(), PipelineError> {
    let (height, width, channels) = frame.dim();
    let (color, buffer): (_, Vec<u8>) = match (channels, order) {
        (1, _) => (image::ColorType::L8, frame.iter().copied().collect()),
        (3, ChannelOrder::Bgr) => (
            image::ColorType::Rgb8,
            frame.slice(s![.., .., ..;-1]).iter().copied().collect(),
        ),
        (3, ChannelOrder::Rgb) => (image::ColorType::Rgb8, frame.iter().copied().collect()),
        (n, _) => {
            return Err(PipelineError::Format(format!(
                "cannot encode a {}-channel frame",
                n
            )))
        }
    };
    image::save_buffer(path, &buffer, width as u32, height as u32, color)
        .map_err(|e| PipelineError::Format(format!("{}: {}", path.display(), e)))
}
