use std::{
    env,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub const TARGET_SAMPLE_RATE: u32 = 44_100;

/// Thresholds and external tool locations for the pipeline.
///
/// Defaults follow the values the pipeline was tuned with; every field can be
/// overridden from a JSON file, and the tool paths from the environment.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Inputs longer than this are chunked on the memory-constrained path.
    pub chunk_threshold_secs: f32,
    pub chunk_secs: f32,
    /// Chunk length after an out-of-memory or shape failure.
    pub retry_chunk_secs: f32,
    pub min_file_bytes: u64,
    /// Files above this size are converted before decoding.
    pub large_file_bytes: u64,
    pub silence_threshold: f32,
    pub target_peak: f32,
    /// Maximum delay applied by shift-averaging, in seconds.
    pub max_shift_secs: f32,
    pub convert_timeout_secs: u64,
    /// Command used to reach the inference service, split on whitespace.
    pub runner: String,
    pub ffmpeg: String,
    pub tmp_dir: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunk_threshold_secs: 60.0,
            chunk_secs: 15.0,
            retry_chunk_secs: 10.0,
            min_file_bytes: 1000,
            large_file_bytes: 500 * 1024 * 1024,
            silence_threshold: 1e-4,
            target_peak: 0.95,
            max_shift_secs: 0.5,
            convert_timeout_secs: 60,
            runner: "python3 demucs_runner.py".into(),
            ffmpeg: "ffmpeg".into(),
            tmp_dir: None,
        }
    }
}

impl PipelineConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let cfg: PipelineConfig = serde_json::from_str(&raw)?;
        Ok(cfg.with_env_overrides())
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(runner) = env::var("STEM_WEAVER_RUNNER") {
            self.runner = runner;
        }
        if let Ok(ffmpeg) = env::var("STEM_WEAVER_FFMPEG") {
            self.ffmpeg = ffmpeg;
        }
        if let Ok(dir) = env::var("STEM_WEAVER_TMP_DIR") {
            self.tmp_dir = Some(PathBuf::from(dir));
        }
        self
    }

    pub fn seconds_to_frames(&self, secs: f32) -> usize {
        (secs * TARGET_SAMPLE_RATE as f32).round() as usize
    }

    /// Scratch location for converted inputs and runner exchange files.
    pub fn tmp_root(&self) -> PathBuf {
        self.tmp_dir.clone().unwrap_or_else(env::temp_dir)
    }
}
