//! Trigger-driven segmentation of the event stream.
//!
//! The RGB camera emits a trigger edge at the start and end of every exposure,
//! so the trigger sequence reads `start, end, start, end, ...`. Window `i`
//! spans from the odd trigger `2i + 1` to the odd trigger `2i + 3`; the last
//! window, which has no closing trigger, is closed after a nominal frame period.

use crate::config::PipelineConfig;
use crate::context::{segment_file_name, RunContext};
use crate::error::PipelineError;
use crate::storage;
use crate::types::{FrameWindow, COL_TIMESTAMP, EVENT_COLUMNS};
use log::{debug, info};
use ndarray::{Array2, ArrayView2, Axis};
use std::path::{Path, PathBuf};

/// Number of segments that can be cut from `num_triggers` trigger edges when
/// at most `frame_capacity` RGB frames are available.
///
/// Equals `floor(min(frame_capacity, (num_triggers - 1) / 2))`; a trailing
/// incomplete trigger pair never yields a segment.
pub fn num_segments(frame_capacity: usize, num_triggers: usize) -> usize {
    if num_triggers == 0 {
        return 0;
    }
    frame_capacity.min((num_triggers - 1) / 2)
}

/// Time bounds `[start, end)` of segment `index`.
///
/// `triggers` must hold at least `2 * index + 2` entries.
pub fn window_bounds(triggers: &[i64], index: usize, fallback_interval: i64) -> (i64, i64) {
    let start = triggers[2 * index + 1];
    let end = triggers
        .get(2 * index + 3)
        .copied()
        .unwrap_or(start + fallback_interval);
    (start, end)
}

/// Cuts the event stream into per-frame windows.
#[derive(Debug, Clone)]
pub struct TriggerSegmenter {
    fallback_interval: i64,
}

impl TriggerSegmenter {
    /// Uses `segmenter.fallback_interval_us` from `config`.
    pub fn new(config: &PipelineConfig) -> Self {
        Self::with_fallback_interval(config.segmenter.fallback_interval_us)
    }

    /// Closes an unterminated last window `fallback_interval` µs after its start.
    pub fn with_fallback_interval(fallback_interval: i64) -> Self {
        Self { fallback_interval }
    }

    /// Returns the `[start, end)` bounds of every segment.
    pub fn bounds(&self, triggers: &[i64], frame_capacity: usize) -> Vec<(i64, i64)> {
        (0..num_segments(frame_capacity, triggers.len()))
            .map(|i| window_bounds(triggers, i, self.fallback_interval))
            .collect()
    }

    /// Splits `events` (N×4) into windows.
    ///
    /// Events keep their original order inside a window. An empty window is
    /// valid output.
    pub fn split(
        &self,
        events: ArrayView2<'_, i64>,
        triggers: &[i64],
        frame_capacity: usize,
    ) -> Result<Vec<FrameWindow>, PipelineError> {
        if events.ncols() != EVENT_COLUMNS {
            return Err(PipelineError::Format(format!(
                "event matrix must have {} columns, got {}",
                EVENT_COLUMNS,
                events.ncols()
            )));
        }
        let timestamps = events.column(COL_TIMESTAMP);
        let sorted = timestamps
            .iter()
            .zip(timestamps.iter().skip(1))
            .all(|(a, b)| a <= b);
        if !sorted {
            debug!("Event timestamps are not monotonic, using full scans");
        }

        let windows = self
            .bounds(triggers, frame_capacity)
            .into_iter()
            .enumerate()
            .map(|(index, (start, end))| {
                let selected = if sorted {
                    select_sorted(events, start, end)
                } else {
                    select_scan(events, start, end)
                };
                FrameWindow {
                    index,
                    start,
                    end,
                    events: selected,
                }
            })
            .collect();
        Ok(windows)
    }

    /// Splits `events` and writes one `event_{i:06}.npy` per window into `out_dir`.
    ///
    /// `out_dir` is reset first. Returns the written paths in index order.
    pub fn split_to_dir(
        &self,
        events: ArrayView2<'_, i64>,
        triggers: &[i64],
        frame_capacity: usize,
        out_dir: &Path,
    ) -> Result<Vec<PathBuf>, PipelineError> {
        RunContext::reset_dir(out_dir)?;
        let windows = self.split(events, triggers, frame_capacity)?;
        info!(
            "Found {} triggers, matching to {} RGB frames",
            triggers.len(),
            windows.len()
        );
        let mut written = Vec::with_capacity(windows.len());
        for window in windows {
            let path = out_dir.join(segment_file_name(window.index));
            storage::write_matrix(&path, &window.events)?;
            debug!(
                "Segment {} [{}, {}): {} events",
                window.index,
                window.start,
                window.end,
                window.len()
            );
            written.push(path);
        }
        Ok(written)
    }
}

/// Window selection by binary search over non-decreasing timestamps.
fn select_sorted(events: ArrayView2<'_, i64>, start: i64, end: i64) -> Array2<i64> {
    let timestamps = events.column(COL_TIMESTAMP);
    let first = partition_point(timestamps.len(), |i| timestamps[i] < start);
    let last = partition_point(timestamps.len(), |i| timestamps[i] < end).max(first);
    events.slice(ndarray::s![first..last, ..]).to_owned()
}

/// Window selection by masking every row.
fn select_scan(events: ArrayView2<'_, i64>, start: i64, end: i64) -> Array2<i64> {
    let rows: Vec<usize> = events
        .column(COL_TIMESTAMP)
        .iter()
        .enumerate()
        .filter(|&(_, &t)| t >= start && t < end)
        .map(|(i, _)| i)
        .collect();
    events.select(Axis(0), &rows)
}

/// First index in `0..len` for which `pred` is false, assuming `pred` is monotone.
fn partition_point(len: usize, pred: impl Fn(usize) -> bool) -> usize {
    let (mut lo, mut hi) = (0, len);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if pred(mid) {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}
