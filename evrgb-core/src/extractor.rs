//! Event container extraction.
//!
//! Turns the structured container written by the external decoder into the
//! dense matrices every later stage works on, applying the vertical flip that
//! reconciles the sensor's row order with the RGB camera.

use crate::config::PipelineConfig;
use crate::container::{self, EventColumns};
use crate::error::PipelineError;
use crate::storage;
use crate::types::{
    matrix_to_events, matrix_to_triggers, EventRecord, TriggerPulse, COL_Y, EVENT_COLUMNS,
    TRIGGER_COL_TIMESTAMP,
};
use log::{debug, info};
use ndarray::{Array1, Array2};
use std::path::Path;

/// Dense matrices pulled out of one event container.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedStreams {
    /// N×4 `(x, y, p, t)`, y already flipped
    pub events: Array2<i64>,
    /// M×3 `(p, t, channel)`
    pub triggers: Array2<i64>,
}

impl ExtractedStreams {
    /// Trigger timestamps in container order.
    pub fn trigger_timestamps(&self) -> Vec<i64> {
        trigger_timestamps(&self.triggers)
    }

    /// Typed view of the event rows.
    pub fn event_records(&self) -> Vec<EventRecord> {
        matrix_to_events(self.events.view())
    }

    /// Typed view of the trigger rows.
    ///
    /// Rows whose polarity or channel do not fit `i16` are dropped.
    pub fn trigger_pulses(&self) -> Vec<TriggerPulse> {
        matrix_to_triggers(self.triggers.view())
    }
}

/// Returns the timestamp column of an M×3 trigger matrix.
pub fn trigger_timestamps(triggers: &Array2<i64>) -> Vec<i64> {
    triggers
        .column(TRIGGER_COL_TIMESTAMP)
        .iter()
        .copied()
        .collect()
}

/// Reads event and trigger datasets from a decoded container.
#[derive(Debug, Clone)]
pub struct EventExtractor<'a> {
    config: &'a PipelineConfig,
}

impl<'a> EventExtractor<'a> {
    /// Borrows `config` for the sensor geometry.
    pub fn new(config: &'a PipelineConfig) -> Self {
        Self { config }
    }

    /// Loads both datasets from `container` (`.h5` or `.npz`).
    ///
    /// Fails with `MissingInput` if the file does not exist and with `Format`
    /// if a dataset is absent or its columns disagree in length.
    pub fn extract(&self, container: &Path) -> Result<ExtractedStreams, PipelineError> {
        let EventColumns { events, triggers } = container::read_event_columns(container)?;
        let events = self.stack_events(container, events)?;
        let triggers = stack_columns(container, "EXT_TRIGGER", triggers)?;

        debug!(
            "Extracted {} events and {} triggers from {}",
            events.nrows(),
            triggers.nrows(),
            container.display()
        );
        Ok(ExtractedStreams { events, triggers })
    }

    /// Stacks `(x, y, p, t)` columns and flips y into the RGB row convention.
    fn stack_events(
        &self,
        container: &Path,
        columns: [Array1<i64>; EVENT_COLUMNS],
    ) -> Result<Array2<i64>, PipelineError> {
        let mut events = stack_columns(container, "CD", columns)?;
        let geometry = self.config.sensor;
        events
            .column_mut(COL_Y)
            .mapv_inplace(|y| geometry.flip_y(y));
        Ok(events)
    }

    /// Extracts `container` and writes both matrices next to it.
    pub fn extract_to(
        &self,
        container: &Path,
        events_out: &Path,
        triggers_out: &Path,
    ) -> Result<ExtractedStreams, PipelineError> {
        info!("Extracting events and triggers from {}", container.display());
        let streams = self.extract(container)?;
        storage::write_matrix(events_out, &streams.events)?;
        storage::write_matrix(triggers_out, &streams.triggers)?;
        info!(
            "Saved {} events to {} and {} triggers to {}",
            streams.events.nrows(),
            events_out.display(),
            streams.triggers.nrows(),
            triggers_out.display()
        );
        Ok(streams)
    }
}

/// Stacks equally long columns side by side into a dense matrix.
fn stack_columns<const N: usize>(
    container: &Path,
    dataset: &str,
    columns: [Array1<i64>; N],
) -> Result<Array2<i64>, PipelineError> {
    let rows = columns[0].len();
    if let Some(bad) = columns.iter().find(|c| c.len() != rows) {
        return Err(PipelineError::Format(format!(
            "{}: dataset '{}' has columns of unequal length ({} vs {})",
            container.display(),
            dataset,
            rows,
            bad.len()
        )));
    }
    let mut matrix = Array2::zeros((rows, N));
    for (i, column) in columns.iter().enumerate() {
        matrix.column_mut(i).assign(column);
    }
    Ok(matrix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{
        CD_POLARITY, CD_TIMESTAMP, CD_X, CD_Y, TRIGGER_CHANNEL, TRIGGER_POLARITY,
        TRIGGER_TIMESTAMP,
    };
    use ndarray::array;
    use ndarray_npy::NpzWriter;
    use std::fs::File;

    fn write_container(path: &Path, with_triggers: bool) {
        let mut npz = NpzWriter::new(File::create(path).unwrap());
        npz.add_array(CD_X, &array![10u16, 20, 30]).unwrap();
        npz.add_array(CD_Y, &array![0u16, 100, 719]).unwrap();
        npz.add_array(CD_POLARITY, &array![1i16, 0, 1]).unwrap();
        npz.add_array(CD_TIMESTAMP, &array![5i64, 15, 25]).unwrap();
        if with_triggers {
            npz.add_array(TRIGGER_POLARITY, &array![1i16, 0]).unwrap();
            npz.add_array(TRIGGER_CHANNEL, &array![0i16, 0]).unwrap();
            npz.add_array(TRIGGER_TIMESTAMP, &array![0i64, 100]).unwrap();
        }
        npz.finish().unwrap();
    }

    #[test]
    fn test_extract_flips_rows() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("seg_original.npz");
        write_container(&path, true);

        let config = PipelineConfig::default();
        let streams = EventExtractor::new(&config).extract(&path).unwrap();

        assert_eq!(
            streams.events,
            array![[10, 719, 1, 5], [20, 619, 0, 15], [30, 0, 1, 25]]
        );
        assert_eq!(streams.triggers, array![[1, 0, 0], [0, 100, 0]]);
        assert_eq!(streams.trigger_timestamps(), vec![0, 100]);
        assert_eq!(streams.event_records()[1], EventRecord::new(20, 619, 0, 15));
        assert_eq!(
            streams.trigger_pulses(),
            vec![TriggerPulse::new(1, 0, 0), TriggerPulse::new(0, 0, 100)]
        );
    }

    #[test]
    fn test_trigger_pulses_skip_out_of_range_channel() {
        let streams = ExtractedStreams {
            events: Array2::zeros((0, EVENT_COLUMNS)),
            triggers: array![[1, 0, 0], [0, 100, 70_000], [1, 200, 3]],
        };
        assert_eq!(
            streams.trigger_pulses(),
            vec![TriggerPulse::new(1, 0, 0), TriggerPulse::new(1, 3, 200)]
        );
        assert_eq!(streams.trigger_timestamps(), vec![0, 100, 200]);
    }

    #[test]
    fn test_missing_trigger_dataset_is_format_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("seg_original.npz");
        write_container(&path, false);

        let config = PipelineConfig::default();
        let result = EventExtractor::new(&config).extract(&path);
        assert!(matches!(result, Err(PipelineError::Format(_))));
    }

    #[test]
    fn test_missing_container_is_missing_input() {
        let config = PipelineConfig::default();
        let result = EventExtractor::new(&config).extract(Path::new("/nonexistent/seg.npz"));
        assert!(matches!(result, Err(PipelineError::MissingInput(_))));
    }

    #[test]
    fn test_unequal_columns_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bad.npz");
        {
            let mut npz = NpzWriter::new(File::create(&path).unwrap());
            npz.add_array(CD_X, &array![1u16, 2]).unwrap();
            npz.add_array(CD_Y, &array![1u16]).unwrap();
            npz.add_array(CD_POLARITY, &array![1i16, 0]).unwrap();
            npz.add_array(CD_TIMESTAMP, &array![1i64, 2]).unwrap();
            npz.add_array(TRIGGER_TIMESTAMP, &array![0i64]).unwrap();
            npz.finish().unwrap();
        }

        let config = PipelineConfig::default();
        let result = EventExtractor::new(&config).extract(&path);
        assert!(matches!(result, Err(PipelineError::Format(_))));
    }

    #[test]
    fn test_extract_to_persists_matrices() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("seg_original.npz");
        write_container(&path, true);
        let events_out = tmp.path().join("seg_original.npy");
        let triggers_out = tmp.path().join("seg_original_trigger.npy");

        let config = PipelineConfig::default();
        let streams = EventExtractor::new(&config)
            .extract_to(&path, &events_out, &triggers_out)
            .unwrap();

        assert_eq!(storage::read_matrix(&events_out).unwrap(), streams.events);
        assert_eq!(storage::read_matrix(&triggers_out).unwrap(), streams.triggers);
    }
}
