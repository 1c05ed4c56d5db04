//! Event/RGB fusion CLI application.
//!
//! Turns one recorded segment directory into paired, aligned event slices and
//! RGB images, then hands them to the restoration model.

use anyhow::{Context, Result};
use clap::Parser;
use evrgb_core::{Orchestrator, PipelineConfig, RunContext, RunReport, StageProgress};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;

/// Builds a paired event/RGB dataset from one recorded segment.
///
/// The segment directory must contain `<name>.raw` and `rgb_data.npz`, where
/// `<name>` is the directory's own name.
#[derive(Parser, Debug)]
#[command(name = "evrgb")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Segment directory
    #[arg(value_name = "SEGMENT")]
    segment: PathBuf,

    /// Pipeline configuration (YAML)
    ///
    /// Every field is optional; missing fields keep their defaults
    /// (1280x720 sensor, crop from x = 280, 6000 us fallback interval).
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Length in microseconds of the last segment when no closing trigger exists
    #[arg(long, value_name = "MICROSECONDS")]
    fallback_interval: Option<i64>,

    /// Stop after the cropped hand-off artifacts are written
    #[arg(long)]
    skip_restoration: bool,

    /// Suppress progress output
    #[arg(short, long)]
    quiet: bool,
}

fn load_config(args: &Args) -> Result<PipelineConfig> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_yaml_file(path)
            .with_context(|| format!("Failed to load configuration {:?}", path))?,
        None => PipelineConfig::default(),
    };
    if let Some(interval) = args.fallback_interval {
        config.segmenter.fallback_interval_us = interval;
    }
    config.validate().context("Invalid pipeline configuration")?;
    Ok(config)
}

fn run(args: &Args, progress: &ProgressBar) -> Result<RunReport> {
    let config = load_config(args)?;
    let ctx = RunContext::new(&args.segment)
        .context("Invalid segment directory")?
        .with_format(config.containers.format);

    let orchestrator = if args.skip_restoration {
        Orchestrator::without_restoration(&config)
    } else {
        Orchestrator::new(&config)
    };

    let report = orchestrator.run(&ctx, |event| match event {
        StageProgress::Started { index, total, name } => {
            progress.set_message(format!("[{}/{}] {}...", index + 1, total, name));
        }
        StageProgress::Finished { index, total, name } => {
            progress.set_message(format!("[{}/{}] {} done", index + 1, total, name));
        }
    })?;
    Ok(report)
}

fn main() {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Setup progress spinner
    let progress = if args.quiet {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message("Starting...");
        pb
    };

    let start_time = Instant::now();
    let outcome = run(&args, &progress);
    let duration = start_time.elapsed();

    let mut stdout = std::io::stdout();
    match outcome {
        Ok(report) => {
            progress.finish_with_message(format!(
                "Done! {} segments in {:.2}s",
                report.state.num_segments,
                duration.as_secs_f64()
            ));

            if !args.quiet {
                eprintln!();
                eprintln!("Summary:");
                eprintln!("  Segment:      {:?}", args.segment);
                eprintln!("  RGB frames:   {}", report.state.frame_capacity);
                eprintln!("  Segments:     {}", report.state.num_segments);
                eprintln!("  Stages:       {}", report.stages.len());
                eprintln!("  Duration:     {:.3}s", duration.as_secs_f64());
            }

            let _ = writeln!(stdout, "PIPELINE_FINISHED");
            let _ = stdout.flush();
        }
        Err(err) => {
            progress.abandon_with_message("Failed");
            let _ = writeln!(stdout, "PIPELINE_ERROR: {:#}", err);
            let _ = stdout.flush();
            std::process::exit(1);
        }
    }
}
