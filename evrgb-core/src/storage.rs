//! Readers and writers for the on-disk formats exchanged between stages.
//!
//! Intermediate matrices are plain `.npy` files and the per-segment hand-off
//! archives are `.npz` archives, so a NumPy-based consumer can load every
//! artifact without knowing anything about this crate. Containers supplied as
//! `.npz` are read through [`NpzArchive`] as well.

use crate::error::PipelineError;
use ndarray::{Array1, Array2, Array4, ArrayD, Ix1, Ix2, Ix4, OwnedRepr};
use ndarray_npy::{read_npy, write_npy, NpzReader, NpzWriter};
use std::fs::File;
use std::io::{BufWriter, Read, Seek};
use std::path::Path;
use zip::ZipArchive;

/// Member name of the single array stored in a per-segment event archive.
pub const EVENTS_MEMBER: &str = "events";

fn format_error(path: &Path, err: impl std::fmt::Display) -> PipelineError {
    PipelineError::Format(format!("{}: {}", path.display(), err))
}

/// An opened `.npz` archive with member lookup that tolerates the `.npy` suffix.
pub struct NpzArchive<R: Read + Seek> {
    reader: NpzReader<R>,
    names: Vec<String>,
    path: String,
}

impl NpzArchive<File> {
    /// Opens an archive, failing with `MissingInput` if the file does not exist.
    pub fn open(path: &Path) -> Result<Self, PipelineError> {
        let file = File::open(path).map_err(|e| PipelineError::from_io_at(e, path))?;
        Self::from_reader(file, path)
    }
}

impl<R: Read + Seek> NpzArchive<R> {
    /// Reads the member list from `reader`; `path` only labels errors.
    pub fn from_reader(reader: R, path: &Path) -> Result<Self, PipelineError> {
        let mut reader = NpzReader::new(reader).map_err(|e| format_error(path, e))?;
        let names = reader.names().map_err(|e| format_error(path, e))?;
        Ok(Self {
            reader,
            names,
            path: path.display().to_string(),
        })
    }

    /// Resolves a logical member name (with or without `.npy`) to the stored name.
    fn resolve(&self, name: &str) -> Option<String> {
        let with_suffix = format!("{}.npy", name);
        self.names
            .iter()
            .find(|stored| stored.as_str() == name || **stored == with_suffix)
            .cloned()
    }

    /// Returns true if the archive holds `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.resolve(name).is_some()
    }

    fn missing_member(&self, name: &str) -> PipelineError {
        PipelineError::Format(format!("{}: dataset '{}' not present", self.path, name))
    }

    /// Reads a 1-D integer column of any common integer dtype, widened to `i64`.
    ///
    /// Returns `Ok(None)` if the member does not exist.
    pub fn int_column(&mut self, name: &str) -> Result<Option<Array1<i64>>, PipelineError> {
        let Some(stored) = self.resolve(name) else {
            return Ok(None);
        };
        let reader = &mut self.reader;
        let column = reader
            .by_name::<OwnedRepr<i64>, Ix1>(&stored)
            .or_else(|_| {
                reader
                    .by_name::<OwnedRepr<u16>, Ix1>(&stored)
                    .map(|a| a.mapv(i64::from))
            })
            .or_else(|_| {
                reader
                    .by_name::<OwnedRepr<i16>, Ix1>(&stored)
                    .map(|a| a.mapv(i64::from))
            })
            .or_else(|_| {
                reader
                    .by_name::<OwnedRepr<u32>, Ix1>(&stored)
                    .map(|a| a.mapv(i64::from))
            })
            .or_else(|_| {
                reader
                    .by_name::<OwnedRepr<i32>, Ix1>(&stored)
                    .map(|a| a.mapv(i64::from))
            })
            .or_else(|_| {
                reader
                    .by_name::<OwnedRepr<u8>, Ix1>(&stored)
                    .map(|a| a.mapv(i64::from))
            })
            .or_else(|_| {
                reader
                    .by_name::<OwnedRepr<i8>, Ix1>(&stored)
                    .map(|a| a.mapv(i64::from))
            })
            .or_else(|_| {
                reader
                    .by_name::<OwnedRepr<u64>, Ix1>(&stored)
                    .map(|a| a.mapv(|v| v as i64))
            })
            .map_err(|e| {
                PipelineError::Format(format!(
                    "{}: column '{}' is not a 1-D integer array ({})",
                    self.path, name, e
                ))
            })?;
        Ok(Some(column))
    }

    /// Reads a required 1-D integer column.
    pub fn require_int_column(&mut self, name: &str) -> Result<Array1<i64>, PipelineError> {
        match self.int_column(name)? {
            Some(column) => Ok(column),
            None => Err(self.missing_member(name)),
        }
    }

    /// Reads a required 2-D `i64` array.
    pub fn matrix_i64(&mut self, name: &str) -> Result<Array2<i64>, PipelineError> {
        let stored = self.resolve(name).ok_or_else(|| self.missing_member(name))?;
        self.reader
            .by_name::<OwnedRepr<i64>, Ix2>(&stored)
            .map_err(|e| PipelineError::Format(format!("{}: '{}': {}", self.path, name, e)))
    }

    /// Reads a required 4-D `u8` array (frame stacks).
    pub fn frames_u8(&mut self, name: &str) -> Result<Array4<u8>, PipelineError> {
        let stored = self.resolve(name).ok_or_else(|| self.missing_member(name))?;
        self.reader
            .by_name::<OwnedRepr<u8>, Ix4>(&stored)
            .map_err(|e| PipelineError::Format(format!("{}: '{}': {}", self.path, name, e)))
    }
}

/// Parses the shape tuple out of a `.npy` header, leaving the data unread.
pub fn npy_header_shape<R: Read>(reader: &mut R) -> Result<Vec<usize>, String> {
    let mut preamble = [0u8; 8];
    reader
        .read_exact(&mut preamble)
        .map_err(|e| format!("truncated .npy header: {}", e))?;
    if &preamble[..6] != b"\x93NUMPY" {
        return Err("not a .npy array".to_string());
    }
    let header_len = match preamble[6] {
        1 => {
            let mut len = [0u8; 2];
            reader.read_exact(&mut len).map_err(|e| e.to_string())?;
            u16::from_le_bytes(len) as usize
        }
        2 | 3 => {
            let mut len = [0u8; 4];
            reader.read_exact(&mut len).map_err(|e| e.to_string())?;
            u32::from_le_bytes(len) as usize
        }
        major => return Err(format!("unsupported .npy version {}", major)),
    };
    let mut header = vec![0u8; header_len];
    reader.read_exact(&mut header).map_err(|e| e.to_string())?;
    let header = String::from_utf8_lossy(&header);

    let tuple = header
        .find("'shape'")
        .and_then(|key| {
            let rest = &header[key..];
            let open = rest.find('(')?;
            let close = rest[open..].find(')')?;
            Some(&rest[open + 1..open + close])
        })
        .ok_or_else(|| format!("no shape in .npy header {:?}", header.trim_end()))?;
    tuple
        .split(',')
        .map(str::trim)
        .filter(|dim| !dim.is_empty())
        .map(|dim| {
            dim.trim_end_matches('L')
                .parse::<usize>()
                .map_err(|_| format!("bad dimension '{}' in .npy header", dim))
        })
        .collect()
}

/// Shape of an `.npz` member, read from its header alone.
pub fn npz_member_shape(path: &Path, name: &str) -> Result<Vec<usize>, PipelineError> {
    let file = File::open(path).map_err(|e| PipelineError::from_io_at(e, path))?;
    let mut zip = ZipArchive::new(file).map_err(|e| format_error(path, e))?;
    let with_suffix = format!("{}.npy", name);
    let stored = zip
        .file_names()
        .find(|stored| *stored == name || *stored == with_suffix)
        .map(str::to_owned)
        .ok_or_else(|| {
            PipelineError::Format(format!("{}: dataset '{}' not present", path.display(), name))
        })?;
    let mut member = zip.by_name(&stored).map_err(|e| format_error(path, e))?;
    npy_header_shape(&mut member).map_err(|e| format_error(path, e))
}

/// Writes an `i64` matrix to a `.npy` file.
pub fn write_matrix(path: &Path, matrix: &Array2<i64>) -> Result<(), PipelineError> {
    write_npy(path, matrix).map_err(|e| format_error(path, e))
}

/// Reads an `i64` `.npy` array of any rank.
pub fn read_matrix_dyn(path: &Path) -> Result<ArrayD<i64>, PipelineError> {
    if !path.exists() {
        return Err(PipelineError::missing("array file", path));
    }
    read_npy(path).map_err(|e| format_error(path, e))
}

/// Reads an N×4 (or any 2-D) `i64` matrix from a `.npy` file.
pub fn read_matrix(path: &Path) -> Result<Array2<i64>, PipelineError> {
    if !path.exists() {
        return Err(PipelineError::missing("array file", path));
    }
    read_npy::<_, Array2<i64>>(path).map_err(|e| format_error(path, e))
}

/// Reads a K×2 point list stored as `f64`, `f32` or `i64`.
pub fn read_points(path: &Path) -> Result<Array2<f64>, PipelineError> {
    if !path.exists() {
        return Err(PipelineError::missing("calibration file", path));
    }
    let points = read_npy::<_, Array2<f64>>(path)
        .or_else(|_| read_npy::<_, Array2<f32>>(path).map(|a| a.mapv(f64::from)))
        .or_else(|_| read_npy::<_, Array2<i64>>(path).map(|a| a.mapv(|v| v as f64)))
        .map_err(|e| format_error(path, e))?;
    if points.ncols() != 2 {
        return Err(PipelineError::Format(format!(
            "{}: expected K×2 points, got shape {:?}",
            path.display(),
            points.shape()
        )));
    }
    Ok(points)
}

/// Writes a compressed `.npz` archive holding `matrix` under [`EVENTS_MEMBER`].
pub fn write_event_archive(path: &Path, matrix: &Array2<i64>) -> Result<(), PipelineError> {
    let file = File::create(path)?;
    let mut npz = NpzWriter::new_compressed(BufWriter::new(file));
    npz.add_array(EVENTS_MEMBER, matrix)
        .map_err(|e| format_error(path, e))?;
    npz.finish().map_err(|e| format_error(path, e))?;
    Ok(())
}

/// Reads the [`EVENTS_MEMBER`] array back from a per-segment archive.
pub fn read_event_archive(path: &Path) -> Result<Array2<i64>, PipelineError> {
    NpzArchive::open(path)?.matrix_i64(EVENTS_MEMBER)
}
