//! Inference through an external runner process.
//!
//! The runner is invoked as
//! `runner --model <id> --device <cpu|cuda> --input <in.wav> --output <dir>`
//! and must write `<stem>.wav` into `<dir>` for every stem of the model's
//! layout. `runner --check --model <id>` exits 0 when the model can be
//! loaded and `runner --probe-gpu` exits 0 when a GPU is usable.
//!
//! Each invocation covers one model-native segment: the engine cuts inputs
//! longer than the registry's `segment_secs` into windows at the requested
//! overlap and merges the runner outputs itself.

use std::{
    path::{Path, PathBuf},
    process::{Command, Output, Stdio},
};

use anyhow::{anyhow, Context};
use ndarray::{s, Array3};

use crate::{
    config::{PipelineConfig, TARGET_SAMPLE_RATE},
    core::{
        audio::{canonicalize, read_audio, write_wav},
        buffer::{SourceBuffer, Waveform},
    },
    error::InferenceError,
    model::{registry, ModelDescriptor, ModelLoader, SeparationModel},
    types::Device,
};

pub struct ProcessModel {
    descriptor: ModelDescriptor,
    command: Vec<String>,
    tmp_root: PathBuf,
}

impl ProcessModel {
    pub fn new(descriptor: ModelDescriptor, command: Vec<String>, tmp_root: PathBuf) -> Self {
        Self {
            descriptor,
            command,
            tmp_root,
        }
    }

    fn run(&self, input_wav: &Path, output_dir: &Path) -> Result<(), InferenceError> {
        let output = runner_command(&self.command)
            .map_err(|e| InferenceError::Failed(e.to_string()))?
            .arg("--model")
            .arg(&self.descriptor.id)
            .arg("--device")
            .arg(self.descriptor.device.runner_name())
            .arg("--input")
            .arg(input_wav)
            .arg("--output")
            .arg(output_dir)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| InferenceError::Failed(format!("failed to start runner: {e}")))?;

        if output.status.success() {
            return Ok(());
        }
        Err(classify_failure(&output))
    }
}

impl SeparationModel for ProcessModel {
    fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    fn infer(&self, input: &Waveform) -> Result<SourceBuffer, InferenceError> {
        let scratch = tempfile::Builder::new()
            .prefix("stem-weaver-infer")
            .tempdir_in(&self.tmp_root)
            .map_err(|e| InferenceError::Failed(format!("no scratch dir: {e}")))?;
        let input_wav = scratch.path().join("input.wav");
        let output_dir = scratch.path().join("out");
        std::fs::create_dir_all(&output_dir)
            .map_err(|e| InferenceError::Failed(e.to_string()))?;

        log::debug!("Wrote runner input to {}", input_wav.display());
        write_wav(&input_wav, input).map_err(|e| InferenceError::Failed(e.to_string()))?;

        self.run(&input_wav, &output_dir)?;

        let frames = input.frames();
        let layout = &self.descriptor.layout;
        let mut data = Array3::<f32>::zeros((layout.len(), Waveform::CHANNELS, frames));
        for (idx, stem) in layout.iter().enumerate() {
            let path = output_dir.join(format!("{}.wav", stem.key()));
            let audio = read_audio(&path)
                .and_then(|a| canonicalize(&a))
                .map_err(|e| InferenceError::Failed(format!("missing {} output: {e}", stem.key())))?;
            // 16-bit round trips can drop or add a frame at most.
            if audio.frames().abs_diff(frames) > 1 {
                return Err(InferenceError::Shape(format!(
                    "{} has {} frames, input has {frames}",
                    stem.key(),
                    audio.frames()
                )));
            }
            let keep = audio.frames().min(frames);
            data.slice_mut(s![idx, .., ..keep])
                .assign(&audio.view().slice(s![.., ..keep]));
        }
        Ok(SourceBuffer::new(data))
    }
}

fn classify_failure(output: &Output) -> InferenceError {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let tail: String = stderr
        .lines()
        .rev()
        .take(5)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect::<Vec<_>>()
        .join(" | ");
    let lower = stderr.to_lowercase();
    if lower.contains("out of memory") || lower.contains("memoryerror") {
        InferenceError::OutOfMemory(tail)
    } else if lower.contains("shape") {
        InferenceError::Shape(tail)
    } else {
        InferenceError::Failed(format!("runner exited with {}: {tail}", output.status))
    }
}

fn runner_command(parts: &[String]) -> anyhow::Result<Command> {
    let (program, args) = parts
        .split_first()
        .ok_or_else(|| anyhow!("empty runner command"))?;
    let mut cmd = Command::new(program);
    cmd.args(args);
    Ok(cmd)
}

/// Loads models by asking the runner whether it can serve them.
pub struct ProcessLoader {
    command: Vec<String>,
    tmp_root: PathBuf,
}

impl ProcessLoader {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            command: config.runner.split_whitespace().map(String::from).collect(),
            tmp_root: config.tmp_root(),
        }
    }
}

impl ModelLoader for ProcessLoader {
    fn load(&self, id: &str, device: Device) -> anyhow::Result<Box<dyn SeparationModel>> {
        let entry = registry::resolve(id)?;
        let layout = entry.layout()?;

        let status = runner_command(&self.command)?
            .args(["--check", "--model", id])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .context("Failed to run inference runner")?;
        if !status.success() {
            return Err(anyhow!("runner cannot load `{id}` ({status})"));
        }

        let descriptor = ModelDescriptor {
            id: entry.name,
            layout,
            device,
            segment_secs: entry.segment_secs,
        };
        log::debug!(
            "Runner model {} ready ({} stems @ {}Hz)",
            descriptor.id,
            descriptor.layout.len(),
            TARGET_SAMPLE_RATE
        );
        Ok(Box::new(ProcessModel::new(
            descriptor,
            self.command.clone(),
            self.tmp_root.clone(),
        )))
    }

    fn gpu_available(&self) -> bool {
        runner_command(&self.command)
            .and_then(|mut cmd| {
                cmd.arg("--probe-gpu")
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()
                    .context("Failed to run inference runner")
            })
            .map(|s| s.success())
            .unwrap_or(false)
    }
}
