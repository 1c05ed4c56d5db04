//! Event/RGB fusion library for Prophesee event cameras paired with a
//! trigger-synchronised RGB camera.
//!
//! A recorded segment directory holds a decoded event container, an RGB frame
//! container and (optionally) the raw recording. Containers are HDF5 files as
//! written by the acquisition tools (with the `hdf5` feature) or `.npz`
//! archives with the same datasets. This crate cuts the event
//! stream into one slice per RGB exposure, registers every RGB frame onto the
//! event sensor plane, and crops both modalities to one shared window so each
//! pair shares an origin and field of view.
//!
//! # Example
//!
//! ```no_run
//! use evrgb_core::{Orchestrator, PipelineConfig, RunContext};
//!
//! let config = PipelineConfig::default();
//! let ctx = RunContext::new("recordings/segment_1").unwrap();
//! let report = Orchestrator::without_restoration(&config)
//!     .run(&ctx, |_| {})
//!     .unwrap();
//!
//! println!("Wrote {} paired segments", report.state.num_segments);
//! ```
//!
//! # Stages
//!
//! - Frame-capacity probe of the RGB container
//! - Raw decode (external program)
//! - Event and trigger extraction with the vertical flip applied
//! - Trigger segmentation into half-open `[start, end)` windows
//! - Homography alignment of RGB frames with a shared crop
//! - Spatial crop of the event slices
//! - Restoration inference (external program)

pub mod aligner;
pub mod config;
pub mod container;
pub mod context;
pub mod cropper;
pub mod error;
pub mod external;
pub mod extractor;
pub mod homography;
pub mod pipeline;
pub mod segmenter;
pub mod storage;
pub mod types;

// Re-export commonly used types
pub use aligner::{Calibration, HomographyAligner, RgbContainer};
pub use config::PipelineConfig;
pub use container::ContainerFormat;
pub use context::RunContext;
pub use cropper::SpatialCropper;
pub use error::PipelineError;
pub use extractor::EventExtractor;
pub use homography::Homography;
pub use pipeline::{Orchestrator, RunReport, RunState, Stage, StageFailure, StageOutput, StageProgress};
pub use segmenter::TriggerSegmenter;
pub use types::{CropWindow, EventRecord, FrameWindow, TriggerPulse};
