//! Readers for the containers written by the acquisition tools.
//!
//! The raw decoder writes `<segment>_original.h5` with compound `CD/events`
//! and `EXT_TRIGGER/events` datasets, and the capture application writes
//! `rgb_data.h5` with an `(N, H, W, C)` `rgb/frames` dataset. The same data can
//! also be supplied as NumPy `.npz` archives (one member per field), which is
//! what builds without the `hdf5` feature read. The format is chosen by file
//! extension.

use crate::error::{require_file, PipelineError};
use crate::storage::{self, NpzArchive};
use ndarray::{s, Array1, Array4, Axis};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Compound motion-event dataset in an HDF5 container.
pub const CD_EVENTS: &str = "CD/events";
/// Compound trigger dataset in an HDF5 container.
pub const TRIGGER_EVENTS: &str = "EXT_TRIGGER/events";

/// Motion-event fields inside an `.npz` container.
pub const CD_X: &str = "CD/x";
pub const CD_Y: &str = "CD/y";
pub const CD_POLARITY: &str = "CD/p";
pub const CD_TIMESTAMP: &str = "CD/t";
/// Trigger fields inside an `.npz` container.
pub const TRIGGER_POLARITY: &str = "EXT_TRIGGER/p";
pub const TRIGGER_CHANNEL: &str = "EXT_TRIGGER/id";
pub const TRIGGER_TIMESTAMP: &str = "EXT_TRIGGER/t";

/// The `(N, H, W, C)` frame stack of an RGB container, in either format.
pub const FRAMES_DATASET: &str = "rgb/frames";

/// On-disk format of the decoder and capture containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContainerFormat {
    /// HDF5, as written by the acquisition tools
    #[default]
    Hdf5,
    /// NumPy `.npz`, one member per dataset or field
    Npz,
}

impl ContainerFormat {
    /// File extension used for containers of this format.
    pub fn extension(self) -> &'static str {
        match self {
            ContainerFormat::Hdf5 => "h5",
            ContainerFormat::Npz => "npz",
        }
    }

    /// Format implied by the extension of `path`; anything but `.npz` is HDF5.
    pub fn of_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("npz") => ContainerFormat::Npz,
            _ => ContainerFormat::Hdf5,
        }
    }
}

/// Event and trigger fields of a decoded container, widened to `i64`.
#[derive(Debug, Clone, PartialEq)]
pub struct EventColumns {
    /// `(x, y, p, t)`, y as stored by the sensor
    pub events: [Array1<i64>; 4],
    /// `(p, t, channel)`
    pub triggers: [Array1<i64>; 3],
}

/// Reads the event and trigger fields of the container at `path`.
///
/// Fails with `MissingInput` if the file does not exist and with `Format` if a
/// required dataset is absent.
pub fn read_event_columns(path: &Path) -> Result<EventColumns, PipelineError> {
    match ContainerFormat::of_path(path) {
        ContainerFormat::Npz => npz_event_columns(path),
        ContainerFormat::Hdf5 => {
            let path = require_file("event container", path)?;
            h5::event_columns(&path)
        }
    }
}

fn npz_event_columns(path: &Path) -> Result<EventColumns, PipelineError> {
    let mut archive = NpzArchive::open(path)?;
    let events = [
        archive.require_int_column(CD_X)?,
        archive.require_int_column(CD_Y)?,
        archive.require_int_column(CD_POLARITY)?,
        archive.require_int_column(CD_TIMESTAMP)?,
    ];

    let t = archive.require_int_column(TRIGGER_TIMESTAMP)?;
    let len = t.len();
    let p = archive
        .int_column(TRIGGER_POLARITY)?
        .unwrap_or_else(|| Array1::zeros(len));
    let id = archive
        .int_column(TRIGGER_CHANNEL)?
        .unwrap_or_else(|| Array1::zeros(len));
    Ok(EventColumns {
        events,
        triggers: [p, t, id],
    })
}

/// Loads at most `limit` frames (all of them for `None`) from an RGB container.
pub fn read_frames(path: &Path, limit: Option<usize>) -> Result<Array4<u8>, PipelineError> {
    match ContainerFormat::of_path(path) {
        ContainerFormat::Npz => {
            let frames = NpzArchive::open(path)?.frames_u8(FRAMES_DATASET)?;
            Ok(match limit {
                Some(n) if n < frames.len_of(Axis(0)) => frames.slice(s![..n, .., .., ..]).to_owned(),
                _ => frames,
            })
        }
        ContainerFormat::Hdf5 => {
            let path = require_file("RGB container", path)?;
            h5::frames(&path, limit)
        }
    }
}

/// Shape of the frame stack without loading any pixels.
pub fn frame_stack_shape(path: &Path) -> Result<Vec<usize>, PipelineError> {
    match ContainerFormat::of_path(path) {
        ContainerFormat::Npz => storage::npz_member_shape(path, FRAMES_DATASET),
        ContainerFormat::Hdf5 => {
            let path = require_file("RGB container", path)?;
            h5::dataset_shape(&path, FRAMES_DATASET)
        }
    }
}

/// HDF5 row types and readers.
#[cfg(feature = "hdf5")]
pub mod h5 {
    use super::{EventColumns, CD_EVENTS, FRAMES_DATASET, TRIGGER_EVENTS};
    use crate::error::PipelineError;
    use hdf5::types::{CompoundField, CompoundType, IntSize, TypeDescriptor};
    use hdf5::{File, H5Type};
    use ndarray::{s, Array1, Array4, Ix4};
    use std::mem::{offset_of, size_of};
    use std::path::Path;

    /// One row of `CD/events`.
    #[repr(C)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CdEvent {
        pub x: u16,
        pub y: u16,
        pub p: i16,
        pub t: i64,
    }

    /// One row of `EXT_TRIGGER/events`.
    #[repr(C)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TriggerEvent {
        pub p: i16,
        pub id: i16,
        pub t: i64,
    }

    fn field(name: &str, ty: TypeDescriptor, offset: usize, index: usize) -> CompoundField {
        CompoundField::new(name, ty, offset, index)
    }

    // Members are matched by name, so the file's field order does not matter.
    unsafe impl H5Type for CdEvent {
        fn type_descriptor() -> TypeDescriptor {
            TypeDescriptor::Compound(CompoundType {
                fields: vec![
                    field("x", TypeDescriptor::Unsigned(IntSize::U2), offset_of!(CdEvent, x), 0),
                    field("y", TypeDescriptor::Unsigned(IntSize::U2), offset_of!(CdEvent, y), 1),
                    field("p", TypeDescriptor::Integer(IntSize::U2), offset_of!(CdEvent, p), 2),
                    field("t", TypeDescriptor::Integer(IntSize::U8), offset_of!(CdEvent, t), 3),
                ],
                size: size_of::<CdEvent>(),
            })
        }
    }

    unsafe impl H5Type for TriggerEvent {
        fn type_descriptor() -> TypeDescriptor {
            TypeDescriptor::Compound(CompoundType {
                fields: vec![
                    field("p", TypeDescriptor::Integer(IntSize::U2), offset_of!(TriggerEvent, p), 0),
                    field("id", TypeDescriptor::Integer(IntSize::U2), offset_of!(TriggerEvent, id), 1),
                    field("t", TypeDescriptor::Integer(IntSize::U8), offset_of!(TriggerEvent, t), 2),
                ],
                size: size_of::<TriggerEvent>(),
            })
        }
    }

    fn h5_error(path: &Path, what: &str, err: hdf5::Error) -> PipelineError {
        PipelineError::Format(format!("{}: '{}': {}", path.display(), what, err))
    }

    fn open(path: &Path) -> Result<File, PipelineError> {
        File::open(path).map_err(|e| PipelineError::Format(format!("{}: {}", path.display(), e)))
    }

    fn read_compound<T: H5Type>(file: &File, path: &Path, name: &str) -> Result<Array1<T>, PipelineError> {
        if !file.link_exists(name) {
            return Err(PipelineError::Format(format!(
                "{}: dataset '{}' not present",
                path.display(),
                name
            )));
        }
        file.dataset(name)
            .and_then(|ds| ds.read_1d::<T>())
            .map_err(|e| h5_error(path, name, e))
    }

    pub(super) fn event_columns(path: &Path) -> Result<EventColumns, PipelineError> {
        let file = open(path)?;
        let cd = read_compound::<CdEvent>(&file, path, CD_EVENTS)?;
        let triggers = read_compound::<TriggerEvent>(&file, path, TRIGGER_EVENTS)?;
        Ok(EventColumns {
            events: [
                cd.mapv(|e| i64::from(e.x)),
                cd.mapv(|e| i64::from(e.y)),
                cd.mapv(|e| i64::from(e.p)),
                cd.mapv(|e| e.t),
            ],
            triggers: [
                triggers.mapv(|e| i64::from(e.p)),
                triggers.mapv(|e| e.t),
                triggers.mapv(|e| i64::from(e.id)),
            ],
        })
    }

    pub(super) fn frames(path: &Path, limit: Option<usize>) -> Result<Array4<u8>, PipelineError> {
        let file = open(path)?;
        let ds = file
            .dataset(FRAMES_DATASET)
            .map_err(|e| h5_error(path, FRAMES_DATASET, e))?;
        let read = match (limit, ds.shape().as_slice()) {
            (Some(0), &[_, h, w, c]) => Ok(Array4::zeros((0, h, w, c))),
            (Some(n), &[frames, ..]) if n < frames => {
                ds.read_slice::<u8, _, Ix4>(s![..n, .., .., ..])
            }
            _ => ds.read::<u8, Ix4>(),
        };
        read.map_err(|e| h5_error(path, FRAMES_DATASET, e))
    }

    pub(super) fn dataset_shape(path: &Path, name: &str) -> Result<Vec<usize>, PipelineError> {
        let file = open(path)?;
        let ds = file.dataset(name).map_err(|e| h5_error(path, name, e))?;
        Ok(ds.shape())
    }
}

#[cfg(not(feature = "hdf5"))]
mod h5 {
    use super::EventColumns;
    use crate::error::PipelineError;
    use ndarray::Array4;
    use std::path::Path;

    fn unsupported(path: &Path) -> PipelineError {
        PipelineError::Format(format!(
            "{}: built without HDF5 support; rebuild with `--features hdf5` \
             or set `containers.format: npz`",
            path.display()
        ))
    }

    pub(super) fn event_columns(path: &Path) -> Result<EventColumns, PipelineError> {
        Err(unsupported(path))
    }

    pub(super) fn frames(path: &Path, _limit: Option<usize>) -> Result<Array4<u8>, PipelineError> {
        Err(unsupported(path))
    }

    pub(super) fn dataset_shape(path: &Path, _name: &str) -> Result<Vec<usize>, PipelineError> {
        Err(unsupported(path))
    }
}
