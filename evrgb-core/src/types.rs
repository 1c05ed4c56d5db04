//! Core value types shared by the pipeline stages.
//!
//! Event and trigger records mirror the fields a Prophesee recording carries once
//! decoded. Bulk data moves between stages as dense `i64` matrices (one row per
//! record); the record structs are the typed view of a single row.

use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};

/// Column of the event x coordinate in an N×4 event matrix.
pub const COL_X: usize = 0;
/// Column of the event y coordinate in an N×4 event matrix.
pub const COL_Y: usize = 1;
/// Column of the event polarity in an N×4 event matrix.
pub const COL_POLARITY: usize = 2;
/// Column of the event timestamp in an N×4 event matrix.
pub const COL_TIMESTAMP: usize = 3;
/// Number of columns of an event matrix.
pub const EVENT_COLUMNS: usize = 4;

/// Column of the trigger polarity in an M×3 trigger matrix `(p, t, channel)`.
pub const TRIGGER_COL_POLARITY: usize = 0;
/// Column of the trigger timestamp in an M×3 trigger matrix `(p, t, channel)`.
pub const TRIGGER_COL_TIMESTAMP: usize = 1;
/// Column of the trigger channel in an M×3 trigger matrix `(p, t, channel)`.
pub const TRIGGER_COL_CHANNEL: usize = 2;
/// Number of columns of a trigger matrix.
pub const TRIGGER_COLUMNS: usize = 3;

/// A single motion event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventRecord {
    /// Pixel column
    pub x: u16,
    /// Pixel row
    pub y: u16,
    /// Polarity as stored by the sensor SDK (0/1, or -1/1 on some firmwares)
    pub polarity: i16,
    /// Timestamp in microseconds
    pub timestamp: i64,
}

impl EventRecord {
    /// Creates a new event record.
    #[inline]
    pub fn new(x: u16, y: u16, polarity: i16, timestamp: i64) -> Self {
        Self {
            x,
            y,
            polarity,
            timestamp,
        }
    }

    /// Returns the record as a matrix row `(x, y, p, t)`.
    #[inline]
    pub fn to_row(&self) -> [i64; EVENT_COLUMNS] {
        [
            self.x as i64,
            self.y as i64,
            self.polarity as i64,
            self.timestamp,
        ]
    }

    /// Reads a record from a matrix row, or `None` if a field is out of range.
    pub fn from_row(row: &[i64]) -> Option<Self> {
        if row.len() != EVENT_COLUMNS {
            return None;
        }
        Some(Self {
            x: u16::try_from(row[COL_X]).ok()?,
            y: u16::try_from(row[COL_Y]).ok()?,
            polarity: i16::try_from(row[COL_POLARITY]).ok()?,
            timestamp: row[COL_TIMESTAMP],
        })
    }
}

/// A hardware trigger edge marking an RGB exposure boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerPulse {
    /// Edge polarity: 0 = falling, 1 = rising
    pub polarity: i16,
    /// Trigger channel ID
    pub channel: i16,
    /// Timestamp in microseconds
    pub timestamp: i64,
}

impl TriggerPulse {
    /// Creates a new trigger pulse.
    #[inline]
    pub fn new(polarity: i16, channel: i16, timestamp: i64) -> Self {
        Self {
            polarity,
            channel,
            timestamp,
        }
    }

    /// Returns the pulse as a matrix row `(p, t, channel)`.
    #[inline]
    pub fn to_row(&self) -> [i64; TRIGGER_COLUMNS] {
        [self.polarity as i64, self.timestamp, self.channel as i64]
    }

    /// Reads a pulse from a matrix row, or `None` if a field is out of range.
    pub fn from_row(row: &[i64]) -> Option<Self> {
        if row.len() != TRIGGER_COLUMNS {
            return None;
        }
        Some(Self {
            polarity: i16::try_from(row[TRIGGER_COL_POLARITY]).ok()?,
            channel: i16::try_from(row[TRIGGER_COL_CHANNEL]).ok()?,
            timestamp: row[TRIGGER_COL_TIMESTAMP],
        })
    }
}

/// Builds an N×4 event matrix from typed records.
pub fn events_to_matrix(events: &[EventRecord]) -> Array2<i64> {
    let mut matrix = Array2::zeros((events.len(), EVENT_COLUMNS));
    for (mut row, event) in matrix.rows_mut().into_iter().zip(events) {
        for (cell, value) in row.iter_mut().zip(event.to_row()) {
            *cell = value;
        }
    }
    matrix
}

/// Reads typed records back out of an N×4 event matrix.
///
/// Rows whose fields do not fit the record types are dropped.
pub fn matrix_to_events(matrix: ArrayView2<'_, i64>) -> Vec<EventRecord> {
    matrix
        .rows()
        .into_iter()
        .filter_map(|row| EventRecord::from_row(&row.to_vec()))
        .collect()
}

/// Reads typed pulses back out of an M×3 trigger matrix.
///
/// Rows whose fields do not fit the pulse types are dropped.
pub fn matrix_to_triggers(matrix: ArrayView2<'_, i64>) -> Vec<TriggerPulse> {
    matrix
        .rows()
        .into_iter()
        .filter_map(|row| TriggerPulse::from_row(&row.to_vec()))
        .collect()
}

/// Builds an M×3 trigger matrix from typed pulses.
pub fn triggers_to_matrix(triggers: &[TriggerPulse]) -> Array2<i64> {
    let mut matrix = Array2::zeros((triggers.len(), TRIGGER_COLUMNS));
    for (mut row, pulse) in matrix.rows_mut().into_iter().zip(triggers) {
        for (cell, value) in row.iter_mut().zip(pulse.to_row()) {
            *cell = value;
        }
    }
    matrix
}

/// Event sensor geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorGeometry {
    /// Sensor width in pixels
    pub width: u32,
    /// Sensor height in pixels
    pub height: u32,
}

impl Default for SensorGeometry {
    fn default() -> Self {
        // Gen4 sensor geometry (1280x720)
        Self {
            width: 1280,
            height: 720,
        }
    }
}

impl SensorGeometry {
    /// Mirrors a row index about the horizontal axis: `y' = (H - 1) - y`.
    #[inline]
    pub fn flip_y(&self, y: i64) -> i64 {
        (self.height as i64 - 1) - y
    }
}

/// The horizontal retention range `[x_min, x_max)` shared by both modalities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropWindow {
    /// First retained column
    pub x_min: u32,
    /// First column past the retained range
    pub x_max: u32,
}

impl CropWindow {
    /// Creates a window over columns `[x_min, x_max)`.
    pub fn new(x_min: u32, x_max: u32) -> Self {
        Self { x_min, x_max }
    }

    /// Width of the cropped field of view.
    #[inline]
    pub fn width(&self) -> u32 {
        self.x_max.saturating_sub(self.x_min)
    }

    /// Returns true if column `x` survives the crop.
    #[inline]
    pub fn contains(&self, x: i64) -> bool {
        x >= self.x_min as i64 && x < self.x_max as i64
    }

    /// Moves a retained column to the cropped origin.
    #[inline]
    pub fn shift(&self, x: i64) -> i64 {
        x - self.x_min as i64
    }
}

/// One trigger-bounded slice of the event stream.
#[derive(Debug, Clone)]
pub struct FrameWindow {
    /// Segment index; also the zero-padded file index
    pub index: usize,
    /// Inclusive start time (µs)
    pub start: i64,
    /// Exclusive end time (µs)
    pub end: i64,
    /// Events with `start <= t < end`, N×4
    pub events: Array2<i64>,
}

impl FrameWindow {
    /// Returns true if `timestamp` falls in this window.
    #[inline]
    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.start && timestamp < self.end
    }

    /// Number of events in the window.
    pub fn len(&self) -> usize {
        self.events.nrows()
    }

    /// Returns true if no event fell in the window.
    pub fn is_empty(&self) -> bool {
        self.events.nrows() == 0
    }
}
