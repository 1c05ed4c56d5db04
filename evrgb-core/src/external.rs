//! Out-of-process stages.
//!
//! The raw decoder and the restoration model are separate programs. Both are
//! launched through [`ExternalCommand`], which blocks until the child exits and
//! treats any non-zero status as failure. Their stdout is relayed into the log.

use crate::config::{CommandConfig, PipelineConfig, RestorationConfig};
use crate::context::RunContext;
use crate::error::{require_file, PipelineError};
use crate::pipeline::{RunState, Stage, StageOutput};
use log::{info, warn};
use serde_yaml::{Mapping, Value};
use std::fs;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// A configured external program with `{placeholder}` arguments.
#[derive(Debug, Clone)]
pub struct ExternalCommand {
    name: String,
    config: CommandConfig,
}

impl ExternalCommand {
    /// Wraps `config` under a label used in log lines and errors.
    pub fn new(name: impl Into<String>, config: &CommandConfig) -> Self {
        Self {
            name: name.into(),
            config: config.clone(),
        }
    }

    /// Label passed to [`ExternalCommand::new`].
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Substitutes every `{key}` in the argument template.
    pub fn render_args(&self, vars: &[(&str, &Path)]) -> Vec<String> {
        self.config
            .args
            .iter()
            .map(|arg| {
                vars.iter().fold(arg.clone(), |acc, (key, value)| {
                    acc.replace(&format!("{{{}}}", key), &value.display().to_string())
                })
            })
            .collect()
    }

    /// Runs the program to completion.
    ///
    /// Only the exit status decides success. Output that is not valid UTF-8
    /// is logged lossily.
    pub fn run(&self, vars: &[(&str, &Path)]) -> Result<(), PipelineError> {
        let args = self.render_args(vars);
        info!("[Exec] {} {}", self.config.program, args.join(" "));

        let mut command = Command::new(&self.config.program);
        command.args(&args).stdout(Stdio::piped());
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }
        let mut child = command.spawn().map_err(|e| PipelineError::ExternalTool {
            tool: self.name.clone(),
            reason: format!("failed to launch '{}': {}", self.config.program, e),
        })?;

        let relayed = child.stdout.take().map(|stdout| self.relay(stdout));
        let status = child.wait()?;
        if let Some(Err(e)) = relayed {
            warn!("[{}] stopped reading output: {}", self.name, e);
        }
        if status.success() {
            Ok(())
        } else {
            Err(PipelineError::ExternalTool {
                tool: self.name.clone(),
                reason: format!("finished with {}", status),
            })
        }
    }

    fn relay<R: Read>(&self, output: R) -> io::Result<()> {
        let mut reader = BufReader::new(output);
        let mut line = Vec::new();
        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line)? == 0 {
                return Ok(());
            }
            info!("[{}] {}", self.name, String::from_utf8_lossy(&line).trim_end());
        }
    }
}

/// Converts the raw sensor dump into the structured event container.
#[derive(Debug, Clone)]
pub struct DecodeStage {
    command: ExternalCommand,
}

impl DecodeStage {
    /// Uses the `decoder` command section of `config`.
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            command: ExternalCommand::new("decoder", &config.decoder),
        }
    }
}

impl Stage for DecodeStage {
    fn name(&self) -> &'static str {
        "Converting raw recording to event container"
    }

    fn run(&self, ctx: &RunContext, _state: &mut RunState) -> Result<StageOutput, PipelineError> {
        let raw = require_file("RAW file", &ctx.raw_file())?;
        let container = ctx.event_container();
        self.command
            .run(&[("input", raw.as_path()), ("output", container.as_path())])?;
        let container = require_file("decoded event container", &container)?;
        Ok(StageOutput::single(container))
    }
}

/// Sets `keys` (a nested path) in a YAML document, creating mappings as needed.
pub fn set_yaml_path(doc: &mut Value, keys: &[&str], value: Value) {
    let Some((last, parents)) = keys.split_last() else {
        return;
    };
    let mut node = doc;
    for key in parents {
        if !node.is_mapping() {
            *node = Value::Mapping(Mapping::new());
        }
        node = match node {
            Value::Mapping(map) => map
                .entry(Value::String((*key).to_string()))
                .or_insert_with(|| Value::Mapping(Mapping::new())),
            _ => return,
        };
    }
    if !node.is_mapping() {
        *node = Value::Mapping(Mapping::new());
    }
    if let Value::Mapping(map) = node {
        map.insert(Value::String((*last).to_string()), value);
    }
}

/// Rewrites the restoration run configuration for this segment.
///
/// Returns the rewritten document; the template file is left untouched.
pub fn render_run_config(
    template: &Path,
    ctx: &RunContext,
    restoration: &RestorationConfig,
) -> Result<Value, PipelineError> {
    let text = fs::read_to_string(template).map_err(|e| PipelineError::from_io_at(e, template))?;
    let mut doc: Value = serde_yaml::from_str(&text)
        .map_err(|e| PipelineError::Format(format!("{}: {}", template.display(), e)))?;

    let root = Value::String(ctx.root().display().to_string());
    set_yaml_path(&mut doc, &["datasets", "test", "dataroot"], root.clone());
    set_yaml_path(&mut doc, &["path", "root"], root);
    set_yaml_path(
        &mut doc,
        &["path", "visualization"],
        Value::String(ctx.deblurred_dir().display().to_string()),
    );
    set_yaml_path(
        &mut doc,
        &["name"],
        Value::String(restoration.output_name.clone()),
    );
    set_yaml_path(
        &mut doc,
        &["val", "save_img"],
        Value::Bool(restoration.save_images),
    );
    Ok(doc)
}

/// Prepares the run configuration and launches the restoration model.
#[derive(Debug, Clone)]
pub struct RestorationStage {
    command: ExternalCommand,
    restoration: RestorationConfig,
}

impl RestorationStage {
    /// Uses the `restoration` section of `config`.
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            command: ExternalCommand::new("restoration", &config.restoration.command),
            restoration: config.restoration.clone(),
        }
    }

    /// Writes the rewritten run configuration and returns its path.
    pub fn prepare(&self, ctx: &RunContext) -> Result<PathBuf, PipelineError> {
        let template = require_file("run configuration template", &self.restoration.config_template)?;
        let doc = render_run_config(&template, ctx, &self.restoration)?;
        let text = serde_yaml::to_string(&doc)
            .map_err(|e| PipelineError::Format(format!("run configuration: {}", e)))?;
        let path = ctx.run_config();
        fs::write(&path, text)?;
        info!("Temporary config saved to {}", path.display());
        Ok(path)
    }
}

impl Stage for RestorationStage {
    fn name(&self) -> &'static str {
        "Running restoration inference"
    }

    fn run(&self, ctx: &RunContext, _state: &mut RunState) -> Result<StageOutput, PipelineError> {
        let config_path = self.prepare(ctx)?;
        let output_dir = ctx.deblurred_dir();
        RunContext::reset_dir(&output_dir)?;
        self.command.run(&[("config", config_path.as_path())])?;
        let results = output_dir.join(&self.restoration.output_name);
        info!("Restoration complete, results in {}", results.display());
        Ok(StageOutput::new(vec![config_path, results]))
    }
}
