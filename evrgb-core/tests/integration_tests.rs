//! Integration tests running the pipeline on synthetic segment directories.
//!
//! Every test builds its own segment under a temporary directory: a decoded
//! event container, an RGB container and a pair of calibration files.
//! Containers are written as `.npz`; the `hdf5` module repeats the chain on
//! HDF5 containers laid out like the acquisition tools write them.
//! Run with: cargo test --test integration_tests [--features hdf5]

use evrgb_core::context::{CROPPED_EVENT_DIR, RGB_CROP_DIR, SEGMENT_DIR};
use evrgb_core::types::{events_to_matrix, triggers_to_matrix};
use evrgb_core::{
    storage, ContainerFormat, EventRecord, Orchestrator, PipelineConfig, PipelineError, RunContext,
    SpatialCropper, TriggerPulse,
};
use ndarray::{array, Array1, Array2, Array4};
use ndarray_npy::{write_npy, NpzWriter};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

const WIDTH: u32 = 16;
const HEIGHT: u32 = 8;
const X_MIN: u32 = 4;
const FRAMES: usize = 3;
const TRIGGERS: [i64; 6] = [0, 100, 100, 200, 200, 6300];

/// Events in sensor coordinates.
fn sample_events() -> Vec<EventRecord> {
    [
        (1, 0, 1, 50),
        (5, 1, 0, 100),
        (2, 2, 1, 120),
        (15, 7, 1, 199),
        (4, 3, 0, 200),
        (10, 6, 1, 4000),
        (12, 0, 0, 6299),
        (9, 5, 1, 6300),
    ]
    .into_iter()
    .map(|(x, y, p, t)| EventRecord::new(x, y, p, t))
    .collect()
}

/// Alternating rising/falling edges on channel 0.
fn sample_triggers() -> Vec<TriggerPulse> {
    TRIGGERS
        .iter()
        .enumerate()
        .map(|(i, &t)| TriggerPulse::new(((i + 1) % 2) as i16, 0, t))
        .collect()
}

fn write_event_container(path: &Path, events: &[EventRecord], triggers: &[TriggerPulse]) {
    let mut npz = NpzWriter::new(File::create(path).unwrap());
    npz.add_array("CD/x", &events.iter().map(|e| e.x).collect::<Array1<u16>>())
        .unwrap();
    npz.add_array("CD/y", &events.iter().map(|e| e.y).collect::<Array1<u16>>())
        .unwrap();
    npz.add_array("CD/p", &events.iter().map(|e| e.polarity).collect::<Array1<i16>>())
        .unwrap();
    npz.add_array("CD/t", &events.iter().map(|e| e.timestamp).collect::<Array1<i64>>())
        .unwrap();
    npz.add_array("EXT_TRIGGER/p", &triggers.iter().map(|t| t.polarity).collect::<Array1<i16>>())
        .unwrap();
    npz.add_array("EXT_TRIGGER/id", &triggers.iter().map(|t| t.channel).collect::<Array1<i16>>())
        .unwrap();
    npz.add_array("EXT_TRIGGER/t", &triggers.iter().map(|t| t.timestamp).collect::<Array1<i64>>())
        .unwrap();
    npz.finish().unwrap();
}

fn frame_stack(frames: usize) -> Array4<u8> {
    Array4::from_shape_fn(
        (frames, HEIGHT as usize, WIDTH as usize, 3),
        |(n, y, x, c)| (20 * n + 10 * y + x + 60 * c) as u8,
    )
}

fn write_rgb_container(path: &Path, frames: usize) {
    let stack = frame_stack(frames);
    let mut npz = NpzWriter::new(File::create(path).unwrap());
    npz.add_array("rgb/frames", &stack).unwrap();
    npz.finish().unwrap();
}

/// Writes calibration files that describe an identity mapping.
fn write_identity_calibration(dir: &Path, config: &mut PipelineConfig) {
    let event: Array2<f64> = array![
        [0.0, 0.0],
        [15.0, 0.0],
        [15.0, 7.0],
        [0.0, 7.0],
        [8.0, 4.0],
        [3.0, 5.0]
    ];
    // The RGB file stores the same points in reverse order.
    let mut rgb = event.clone();
    rgb.invert_axis(ndarray::Axis(0));

    config.calibration.event_points = dir.join("dvs_corners.npy");
    config.calibration.rgb_points = dir.join("normal_corners.npy");
    write_npy(&config.calibration.event_points, &event).unwrap();
    write_npy(&config.calibration.rgb_points, &rgb).unwrap();
}

/// Configuration for the synthetic sensor with containers in `format`.
fn small_config(tmp: &Path, format: ContainerFormat) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.sensor.width = WIDTH;
    config.sensor.height = HEIGHT;
    config.crop.x_min = X_MIN;
    config.containers.format = format;
    write_identity_calibration(tmp, &mut config);
    config
}

fn segment_context(tmp: &Path, config: &PipelineConfig) -> RunContext {
    let root = tmp.join("segment_1");
    fs::create_dir_all(&root).unwrap();
    RunContext::new(&root)
        .unwrap()
        .with_format(config.containers.format)
}

/// Creates `<tmp>/segment_1` with decoded `.npz` containers and returns its context.
fn prepare_segment(tmp: &Path) -> (RunContext, PipelineConfig) {
    let config = small_config(tmp, ContainerFormat::Npz);
    let ctx = segment_context(tmp, &config);
    write_event_container(&ctx.event_container(), &sample_events(), &sample_triggers());
    write_rgb_container(&ctx.rgb_container(), FRAMES);
    (ctx, config)
}

fn snapshot(dir: &Path) -> BTreeMap<String, Vec<u8>> {
    fs::read_dir(dir)
        .unwrap()
        .map(|e| {
            let path = e.unwrap().path();
            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            (name, fs::read(&path).unwrap())
        })
        .collect()
}

fn archives(dir: &Path) -> BTreeMap<String, Array2<i64>> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir).unwrap().map(|e| e.unwrap().path()).collect();
    paths.sort();
    paths
        .into_iter()
        .map(|p| {
            let name = p.file_name().unwrap().to_string_lossy().into_owned();
            (name, storage::read_event_archive(&p).unwrap())
        })
        .collect()
}

/// The in-process chain produces one image and one archive per segment.
#[test]
fn test_in_process_chain_pairs_segments() {
    let tmp = tempfile::tempdir().unwrap();
    let (ctx, config) = prepare_segment(tmp.path());

    let report = Orchestrator::in_process(&config).run(&ctx, |_| {}).unwrap();

    assert_eq!(report.state.frame_capacity, FRAMES);
    assert_eq!(report.state.num_segments, 2);

    let flipped: Vec<EventRecord> = sample_events()
        .into_iter()
        .map(|e| EventRecord::new(e.x, (HEIGHT as u16 - 1) - e.y, e.polarity, e.timestamp))
        .collect();
    assert_eq!(
        storage::read_matrix(&ctx.events_matrix()).unwrap(),
        events_to_matrix(&flipped)
    );
    assert_eq!(
        storage::read_matrix(&ctx.triggers_matrix()).unwrap(),
        triggers_to_matrix(&sample_triggers())
    );

    // Triggers → windows [100, 200) and [200, 6300).
    let first = storage::read_matrix(&ctx.segment_dir().join("event_000000.npy")).unwrap();
    let second = storage::read_matrix(&ctx.segment_dir().join("event_000001.npy")).unwrap();
    let flip = |y: i64| HEIGHT as i64 - 1 - y;
    assert_eq!(
        first,
        array![[5, flip(1), 0, 100], [2, flip(2), 1, 120], [15, flip(7), 1, 199]]
    );
    assert_eq!(
        second,
        array![[4, flip(3), 0, 200], [10, flip(6), 1, 4000], [12, flip(0), 0, 6299]]
    );

    let cropped = archives(&ctx.cropped_event_dir());
    assert_eq!(
        cropped.keys().collect::<Vec<_>>(),
        vec!["event_000000.npz", "event_000001.npz"]
    );
    assert_eq!(
        cropped["event_000000.npz"],
        array![[1, flip(1), 0, 100], [11, flip(7), 1, 199]]
    );
    let crop_width = (WIDTH - X_MIN) as i64;
    for events in cropped.values() {
        assert!(events.column(0).iter().all(|&x| (0..crop_width).contains(&x)));
    }

    let images: Vec<String> = snapshot(&ctx.rgb_crop_dir()).into_keys().collect();
    assert_eq!(images, vec!["000000.png", "000001.png"]);
    for name in &images {
        let dims = image::image_dimensions(ctx.rgb_crop_dir().join(name)).unwrap();
        assert_eq!(dims, (WIDTH - X_MIN, HEIGHT));
    }
}

/// Identity calibration leaves pixels untouched apart from the crop.
#[test]
fn test_aligned_image_matches_cropped_frame() {
    let tmp = tempfile::tempdir().unwrap();
    let (ctx, config) = prepare_segment(tmp.path());

    Orchestrator::in_process(&config).run(&ctx, |_| {}).unwrap();

    let img = image::open(ctx.rgb_crop_dir().join("000001.png"))
        .unwrap()
        .to_rgb8();
    // Stored BGR frame (n=1, y=2, x=X_MIN+3) → PNG pixel in RGB order.
    let x = (X_MIN + 3) as usize;
    let bgr = [20 + 20 + x, 20 + 20 + x + 60, 20 + 20 + x + 120];
    assert_eq!(
        img.get_pixel(3, 2).0,
        [bgr[2] as u8, bgr[1] as u8, bgr[0] as u8]
    );
}

/// Re-running over stale outputs gives the same directories as a fresh run.
#[test]
fn test_rerun_replaces_outputs() {
    let tmp = tempfile::tempdir().unwrap();
    let (ctx, config) = prepare_segment(tmp.path());
    let orchestrator = Orchestrator::in_process(&config);

    orchestrator.run(&ctx, |_| {}).unwrap();
    let images = snapshot(&ctx.rgb_crop_dir());
    let segments = snapshot(&ctx.segment_dir());
    let cropped = archives(&ctx.cropped_event_dir());

    fs::write(ctx.rgb_crop_dir().join("000099.png"), b"stale").unwrap();
    fs::write(ctx.segment_dir().join("event_000099.npy"), b"stale").unwrap();
    storage::write_event_archive(
        &ctx.cropped_event_dir().join("event_000099.npz"),
        &array![[0, 0, 0, 0]],
    )
    .unwrap();

    orchestrator.run(&ctx, |_| {}).unwrap();

    assert_eq!(snapshot(&ctx.rgb_crop_dir()), images);
    assert_eq!(snapshot(&ctx.segment_dir()), segments);
    assert_eq!(archives(&ctx.cropped_event_dir()), cropped);
}

/// Fewer RGB frames than trigger pairs caps the segment count.
#[test]
fn test_frame_capacity_caps_segments() {
    let tmp = tempfile::tempdir().unwrap();
    let (ctx, config) = prepare_segment(tmp.path());
    write_rgb_container(&ctx.rgb_container(), 1);

    let report = Orchestrator::in_process(&config).run(&ctx, |_| {}).unwrap();

    assert_eq!(report.state.num_segments, 1);
    assert_eq!(snapshot(&ctx.rgb_crop_dir()).len(), 1);
    assert_eq!(archives(&ctx.cropped_event_dir()).len(), 1);
}

/// An empty window still yields a persisted, empty archive.
#[test]
fn test_empty_window_is_persisted() {
    let tmp = tempfile::tempdir().unwrap();
    let (ctx, config) = prepare_segment(tmp.path());
    write_event_container(
        &ctx.event_container(),
        &[EventRecord::new(6, 0, 1, 150)],
        &sample_triggers(),
    );

    Orchestrator::in_process(&config).run(&ctx, |_| {}).unwrap();

    let cropped = archives(&ctx.cropped_event_dir());
    assert_eq!(cropped["event_000000.npz"].nrows(), 1);
    assert_eq!(cropped["event_000001.npz"].dim(), (0, 4));
}

/// A container without trigger timestamps fails extraction with a format error
/// and leaves the probe's work in place.
#[test]
fn test_missing_trigger_dataset_halts() {
    let tmp = tempfile::tempdir().unwrap();
    let (ctx, config) = prepare_segment(tmp.path());
    let mut npz = NpzWriter::new(File::create(ctx.event_container()).unwrap());
    for name in ["CD/x", "CD/y", "CD/p", "CD/t"] {
        npz.add_array(name, &Array1::<i64>::zeros(2)).unwrap();
    }
    npz.finish().unwrap();

    let failure = Orchestrator::in_process(&config)
        .run(&ctx, |_| {})
        .unwrap_err();

    assert_eq!(failure.stage, "Extracting events and triggers");
    assert!(matches!(failure.error, PipelineError::Format(_)));
    assert!(!ctx.root().join(SEGMENT_DIR).exists());
}

/// With the default layout the segment is expected to hold `rgb_data.h5`.
#[test]
fn test_default_layout_expects_h5_containers() {
    let tmp = tempfile::tempdir().unwrap();
    let (npz_ctx, mut config) = prepare_segment(tmp.path());
    config.containers.format = ContainerFormat::default();
    let ctx = segment_context(tmp.path(), &config);

    let failure = Orchestrator::in_process(&config)
        .run(&ctx, |_| {})
        .unwrap_err();

    assert!(npz_ctx.rgb_container().exists());
    assert_eq!(ctx.rgb_container(), ctx.root().join("rgb_data.h5"));
    assert!(matches!(failure.error, PipelineError::MissingInput(_)));
}

/// Malformed slices are skipped; the rest of the batch is still cropped.
#[test]
fn test_cropper_skips_three_column_slices() {
    let tmp = tempfile::tempdir().unwrap();
    let (ctx, config) = prepare_segment(tmp.path());
    Orchestrator::in_process(&config).run(&ctx, |_| {}).unwrap();
    storage::write_matrix(
        &ctx.segment_dir().join("event_000002.npy"),
        &array![[5, 1, 100], [6, 2, 120]],
    )
    .unwrap();

    let report = SpatialCropper::new(&config)
        .crop_dir(&ctx.segment_dir(), &ctx.cropped_event_dir())
        .unwrap();

    assert_eq!(report.written.len(), 2);
    assert_eq!(
        report.skipped,
        vec![ctx.segment_dir().join("event_000002.npy")]
    );
    assert!(!ctx.root().join(CROPPED_EVENT_DIR).join("event_000002.npz").exists());
    assert!(ctx.root().join(RGB_CROP_DIR).join("000001.png").exists());
}

#[cfg(unix)]
mod external {
    use super::*;
    use evrgb_core::config::CommandConfig;

    fn command(program: &str, args: &[&str]) -> CommandConfig {
        CommandConfig {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            working_dir: None,
        }
    }

    /// Moves the decoded container into place as the `.raw` recording so that
    /// `cp` can stand in for the decoder.
    fn prepare_raw(tmp: &Path) -> (RunContext, PipelineConfig) {
        let (ctx, mut config) = prepare_segment(tmp);
        fs::rename(ctx.event_container(), ctx.raw_file()).unwrap();
        config.decoder = command("cp", &["{input}", "{output}"]);
        (ctx, config)
    }

    fn write_template(tmp: &Path, config: &mut PipelineConfig) {
        let template = tmp.join("real.yml");
        fs::write(
            &template,
            "name: template\ndatasets:\n  test:\n    dataroot: /nowhere\npath:\n  root: /nowhere\nval:\n  save_img: false\n",
        )
        .unwrap();
        config.restoration.config_template = template;
    }

    #[test]
    fn test_decode_stage_runs_external_tool() {
        let tmp = tempfile::tempdir().unwrap();
        let (ctx, config) = prepare_raw(tmp.path());

        let report = Orchestrator::without_restoration(&config)
            .run(&ctx, |_| {})
            .unwrap();

        assert!(ctx.event_container().exists());
        assert_eq!(report.state.num_segments, 2);
        assert_eq!(archives(&ctx.cropped_event_dir()).len(), 2);
    }

    #[test]
    fn test_missing_raw_halts_at_decode() {
        let tmp = tempfile::tempdir().unwrap();
        let (ctx, config) = prepare_raw(tmp.path());
        fs::remove_file(ctx.raw_file()).unwrap();

        let failure = Orchestrator::new(&config).run(&ctx, |_| {}).unwrap_err();

        assert!(matches!(failure.error, PipelineError::MissingInput(_)));
        assert!(!ctx.segment_dir().exists());
    }

    #[test]
    fn test_decoder_without_output_is_missing_input() {
        let tmp = tempfile::tempdir().unwrap();
        let (ctx, mut config) = prepare_raw(tmp.path());
        config.decoder = command("true", &[]);

        let failure = Orchestrator::new(&config).run(&ctx, |_| {}).unwrap_err();

        assert!(matches!(failure.error, PipelineError::MissingInput(_)));
    }

    #[test]
    fn test_restoration_receives_rewritten_config() {
        let tmp = tempfile::tempdir().unwrap();
        let (ctx, mut config) = prepare_raw(tmp.path());
        write_template(tmp.path(), &mut config);
        let marker = tmp.path().join("seen.yml");
        config.restoration.command = command(
            "sh",
            &["-c", "cp \"$0\" \"$1\"", "{config}", marker.to_str().unwrap()],
        );

        Orchestrator::new(&config).run(&ctx, |_| {}).unwrap();

        let seen: serde_yaml::Value =
            serde_yaml::from_str(&fs::read_to_string(&marker).unwrap()).unwrap();
        let root = ctx.root().display().to_string();
        assert_eq!(seen["datasets"]["test"]["dataroot"].as_str(), Some(root.as_str()));
        assert_eq!(seen["path"]["root"].as_str(), Some(root.as_str()));
        assert_eq!(seen["name"].as_str(), Some("final_output"));
        assert_eq!(seen["val"]["save_img"].as_bool(), Some(true));
        assert!(ctx.deblurred_dir().is_dir());
        assert!(ctx.run_config().exists());
    }

    #[test]
    fn test_restoration_failure_keeps_artifacts() {
        let tmp = tempfile::tempdir().unwrap();
        let (ctx, mut config) = prepare_raw(tmp.path());
        write_template(tmp.path(), &mut config);
        config.restoration.command = command("sh", &["-c", "exit 3"]);

        let failure = Orchestrator::new(&config).run(&ctx, |_| {}).unwrap_err();

        match failure.error {
            PipelineError::ExternalTool { tool, .. } => assert_eq!(tool, "restoration"),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(archives(&ctx.cropped_event_dir()).len(), 2);
        assert_eq!(snapshot(&ctx.rgb_crop_dir()).len(), 2);
    }
}

#[cfg(feature = "hdf5")]
mod hdf5_containers {
    use super::*;
    use evrgb_core::container::h5::{CdEvent, TriggerEvent};
    use evrgb_core::RgbContainer;

    /// Builder for a dataset inside a new top-level `group`.
    fn dataset_builder(file: &hdf5::File, group: &str) -> hdf5::DatasetBuilder {
        file.create_group(group).unwrap().new_dataset_builder()
    }

    fn write_h5_event_container(path: &Path, events: &[EventRecord], triggers: &[TriggerPulse]) {
        let file = hdf5::File::create(path).unwrap();
        let cd: Vec<CdEvent> = events
            .iter()
            .map(|e| CdEvent {
                x: e.x,
                y: e.y,
                p: e.polarity,
                t: e.timestamp,
            })
            .collect();
        let ext: Vec<TriggerEvent> = triggers
            .iter()
            .map(|t| TriggerEvent {
                p: t.polarity,
                id: t.channel,
                t: t.timestamp,
            })
            .collect();
        dataset_builder(&file, "CD")
            .with_data(cd.as_slice())
            .create("events")
            .unwrap();
        dataset_builder(&file, "EXT_TRIGGER")
            .with_data(ext.as_slice())
            .create("events")
            .unwrap();
    }

    fn write_h5_rgb_container(path: &Path, frames: usize) {
        let file = hdf5::File::create(path).unwrap();
        dataset_builder(&file, "rgb")
            .with_data(&frame_stack(frames))
            .create("frames")
            .unwrap();
    }

    fn prepare_h5_segment(tmp: &Path) -> (RunContext, PipelineConfig) {
        let config = small_config(tmp, ContainerFormat::Hdf5);
        let ctx = segment_context(tmp, &config);
        write_h5_event_container(&ctx.event_container(), &sample_events(), &sample_triggers());
        write_h5_rgb_container(&ctx.rgb_container(), FRAMES);
        (ctx, config)
    }

    /// HDF5 and `.npz` containers with the same content produce the same outputs.
    #[test]
    fn test_h5_chain_matches_npz_chain() {
        let h5_tmp = tempfile::tempdir().unwrap();
        let (h5_ctx, h5_config) = prepare_h5_segment(h5_tmp.path());
        let npz_tmp = tempfile::tempdir().unwrap();
        let (npz_ctx, npz_config) = prepare_segment(npz_tmp.path());

        let report = Orchestrator::in_process(&h5_config)
            .run(&h5_ctx, |_| {})
            .unwrap();
        Orchestrator::in_process(&npz_config)
            .run(&npz_ctx, |_| {})
            .unwrap();

        assert_eq!(h5_ctx.event_container().extension().unwrap(), "h5");
        assert_eq!(report.state.frame_capacity, FRAMES);
        assert_eq!(report.state.num_segments, 2);
        assert_eq!(
            storage::read_matrix(&h5_ctx.events_matrix()).unwrap(),
            storage::read_matrix(&npz_ctx.events_matrix()).unwrap()
        );
        assert_eq!(
            storage::read_matrix(&h5_ctx.triggers_matrix()).unwrap(),
            triggers_to_matrix(&sample_triggers())
        );
        assert_eq!(snapshot(&h5_ctx.segment_dir()), snapshot(&npz_ctx.segment_dir()));
        assert_eq!(snapshot(&h5_ctx.rgb_crop_dir()), snapshot(&npz_ctx.rgb_crop_dir()));
        assert_eq!(
            archives(&h5_ctx.cropped_event_dir()),
            archives(&npz_ctx.cropped_event_dir())
        );
    }

    #[test]
    fn test_h5_frame_stack_partial_read() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("rgb_data.h5");
        write_h5_rgb_container(&path, 4);

        assert_eq!(evrgb_core::aligner::probe_frame_count(&path).unwrap(), 4);
        let first = RgbContainer::open_first(&path, 2).unwrap();
        assert_eq!(first.frame_count(), 2);
        assert_eq!(first.frame(1), frame_stack(4).index_axis(ndarray::Axis(0), 1));
        assert_eq!(RgbContainer::open_first(&path, 0).unwrap().frame_count(), 0);
    }

    #[test]
    fn test_h5_without_trigger_dataset_halts() {
        let tmp = tempfile::tempdir().unwrap();
        let (ctx, config) = prepare_h5_segment(tmp.path());
        let file = hdf5::File::create(ctx.event_container()).unwrap();
        dataset_builder(&file, "CD")
            .with_data(&[CdEvent { x: 1, y: 1, p: 1, t: 5 }][..])
            .create("events")
            .unwrap();
        drop(file);

        let failure = Orchestrator::in_process(&config)
            .run(&ctx, |_| {})
            .unwrap_err();

        assert_eq!(failure.stage, "Extracting events and triggers");
        assert!(matches!(failure.error, PipelineError::Format(_)));
    }
}
