//! Stage sequencing.
//!
//! Every step of a run, whether it executes in-process or launches another
//! program, implements [`Stage`]. The [`Orchestrator`] runs them in order and
//! stops at the first failure, leaving everything already written on disk.

use crate::aligner::{probe_frame_count, HomographyAligner, RgbContainer};
use crate::config::PipelineConfig;
use crate::context::RunContext;
use crate::cropper::SpatialCropper;
use crate::error::PipelineError;
use crate::external::{DecodeStage, RestorationStage};
use crate::extractor::EventExtractor;
use crate::segmenter::TriggerSegmenter;
use crate::storage;
use log::{error, info};
use std::path::PathBuf;
use thiserror::Error;

/// Values handed from one stage to the next besides the files on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunState {
    /// Number of frames in the RGB container
    pub frame_capacity: usize,
    /// Number of segments cut by the segmenter
    pub num_segments: usize,
}

/// Locations a stage produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageOutput {
    pub outputs: Vec<PathBuf>,
}

impl StageOutput {
    /// Wraps the paths a stage wrote.
    pub fn new(outputs: Vec<PathBuf>) -> Self {
        Self { outputs }
    }

    /// A stage that produced exactly one file or directory.
    pub fn single(output: PathBuf) -> Self {
        Self {
            outputs: vec![output],
        }
    }
}

/// One step of the pipeline.
pub trait Stage {
    /// Human-readable label used in progress lines.
    fn name(&self) -> &'static str;

    /// Runs the step to completion, persisting its output under `ctx`.
    fn run(&self, ctx: &RunContext, state: &mut RunState) -> Result<StageOutput, PipelineError>;
}

/// The first stage that failed and why.
#[derive(Error, Debug)]
#[error("{stage} failed: {error}")]
pub struct StageFailure {
    pub stage: &'static str,
    pub error: PipelineError,
}

/// Progress notifications emitted while a run advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageProgress {
    Started {
        index: usize,
        total: usize,
        name: &'static str,
    },
    Finished {
        index: usize,
        total: usize,
        name: &'static str,
    },
}

/// Result of a completed run.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub state: RunState,
    pub stages: Vec<(&'static str, StageOutput)>,
}

/// Reads the shape of the RGB frame stack and records how many frames are available.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProbeStage;

impl Stage for ProbeStage {
    fn name(&self) -> &'static str {
        "Probing RGB frame capacity"
    }

    fn run(&self, ctx: &RunContext, state: &mut RunState) -> Result<StageOutput, PipelineError> {
        let container = ctx.rgb_container();
        let frames = probe_frame_count(&container)?;
        if frames == 0 {
            return Err(PipelineError::MissingInput(format!(
                "RGB container holds no frames: {}",
                container.display()
            )));
        }
        info!("RGB container holds {} frames", frames);
        state.frame_capacity = frames;
        Ok(StageOutput::single(container))
    }
}

/// Pulls dense event and trigger matrices out of the decoded container.
#[derive(Debug, Clone)]
pub struct ExtractStage {
    config: PipelineConfig,
}

impl Stage for ExtractStage {
    fn name(&self) -> &'static str {
        "Extracting events and triggers"
    }

    fn run(&self, ctx: &RunContext, _state: &mut RunState) -> Result<StageOutput, PipelineError> {
        let events = ctx.events_matrix();
        let triggers = ctx.triggers_matrix();
        EventExtractor::new(&self.config).extract_to(&ctx.event_container(), &events, &triggers)?;
        Ok(StageOutput::new(vec![events, triggers]))
    }
}

/// Cuts the extracted events into per-frame slices.
#[derive(Debug, Clone)]
pub struct SegmentStage {
    segmenter: TriggerSegmenter,
}

impl Stage for SegmentStage {
    fn name(&self) -> &'static str {
        "Segmenting events by trigger"
    }

    fn run(&self, ctx: &RunContext, state: &mut RunState) -> Result<StageOutput, PipelineError> {
        let events = storage::read_matrix(&ctx.events_matrix())?;
        let triggers = storage::read_matrix(&ctx.triggers_matrix())?;
        let timestamps = crate::extractor::trigger_timestamps(&triggers);
        let written = self.segmenter.split_to_dir(
            events.view(),
            &timestamps,
            state.frame_capacity,
            &ctx.segment_dir(),
        )?;
        state.num_segments = written.len();
        Ok(StageOutput::new(written))
    }
}

/// Warps and crops one RGB frame per segment.
#[derive(Debug, Clone)]
pub struct AlignStage {
    config: PipelineConfig,
}

impl Stage for AlignStage {
    fn name(&self) -> &'static str {
        "Aligning RGB frames"
    }

    fn run(&self, ctx: &RunContext, state: &mut RunState) -> Result<StageOutput, PipelineError> {
        let aligner = HomographyAligner::new(&self.config)?;
        let container = RgbContainer::open_first(&ctx.rgb_container(), state.num_segments)?;
        let written = aligner.align_to_dir(&container, state.num_segments, &ctx.rgb_crop_dir())?;
        Ok(StageOutput::new(written))
    }
}

/// Crops the per-segment event slices to the shared window.
#[derive(Debug, Clone)]
pub struct CropStage {
    cropper: SpatialCropper,
}

impl Stage for CropStage {
    fn name(&self) -> &'static str {
        "Cropping event segments"
    }

    fn run(&self, ctx: &RunContext, _state: &mut RunState) -> Result<StageOutput, PipelineError> {
        let report = self
            .cropper
            .crop_dir(&ctx.segment_dir(), &ctx.cropped_event_dir())?;
        Ok(StageOutput::new(report.written))
    }
}

/// Runs stages in order, halting on the first failure.
pub struct Orchestrator {
    stages: Vec<Box<dyn Stage>>,
}

impl Orchestrator {
    /// The full sequence: probe, decode, extract, segment, align, crop, restore.
    pub fn new(config: &PipelineConfig) -> Self {
        let mut orchestrator = Self::without_restoration(config);
        orchestrator.push(RestorationStage::new(config));
        orchestrator
    }

    /// Everything up to and including the cropper.
    pub fn without_restoration(config: &PipelineConfig) -> Self {
        let mut orchestrator = Self::in_process(config);
        orchestrator.stages.insert(1, Box::new(DecodeStage::new(config)));
        orchestrator
    }

    /// Only the in-process stages, starting from an already decoded container.
    pub fn in_process(config: &PipelineConfig) -> Self {
        Self::from_stages(vec![
            Box::new(ProbeStage),
            Box::new(ExtractStage {
                config: config.clone(),
            }),
            Box::new(SegmentStage {
                segmenter: TriggerSegmenter::new(config),
            }),
            Box::new(AlignStage {
                config: config.clone(),
            }),
            Box::new(CropStage {
                cropper: SpatialCropper::new(config),
            }),
        ])
    }

    /// An arbitrary sequence, run in the given order.
    pub fn from_stages(stages: Vec<Box<dyn Stage>>) -> Self {
        Self { stages }
    }

    /// Appends a stage to the end of the sequence.
    pub fn push<S: Stage + 'static>(&mut self, stage: S) {
        self.stages.push(Box::new(stage));
    }

    /// Labels of the stages in run order.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Runs every stage against `ctx`.
    ///
    /// `on_progress` is called before and after each stage. Nothing is rolled
    /// back when a stage fails.
    pub fn run<F>(&self, ctx: &RunContext, mut on_progress: F) -> Result<RunReport, StageFailure>
    where
        F: FnMut(StageProgress),
    {
        let total = self.stages.len();
        let mut report = RunReport::default();
        info!("Processing segment {} at {}", ctx.name(), ctx.root().display());

        for (index, stage) in self.stages.iter().enumerate() {
            let name = stage.name();
            on_progress(StageProgress::Started { index, total, name });
            info!("[{}/{}] {}", index + 1, total, name);

            match stage.run(ctx, &mut report.state) {
                Ok(output) => report.stages.push((name, output)),
                Err(error) => {
                    error!("{} failed: {}", name, error);
                    return Err(StageFailure { stage: name, error });
                }
            }
            on_progress(StageProgress::Finished { index, total, name });
        }

        info!(
            "Segment {} finished: {} segments from {} frames",
            ctx.name(),
            report.state.num_segments,
            report.state.frame_capacity
        );
        Ok(report)
    }
}
