use std::path::PathBuf;

use thiserror::Error;

/// Central error type for the stem-weaver crate.
#[derive(Debug, Error)]
pub enum StemError {
    // Generic fallback (wraps anyhow)
    #[error("{0}")]
    Anyhow(#[from] anyhow::Error),

    /// Input could not be decoded; the file is skipped.
    #[error("Decode error for {path}: {reason}")]
    Decode { path: PathBuf, reason: String },

    /// No candidate model could be loaded; the batch aborts.
    #[error("No separation model available (tried: {tried})")]
    ModelUnavailable { tried: String },

    /// Chunk outputs disagree outside the time axis; the file fails.
    #[error("Chunk shape mismatch: expected {expected:?}, got {got:?} at chunk {index}")]
    ChunkShape {
        index: usize,
        expected: (usize, usize),
        got: (usize, usize),
    },

    #[error("Out of memory during inference: {0}")]
    OutOfMemory(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("Output directory is not writable: {path}")]
    OutputNotWritable { path: PathBuf },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StemError {
    pub fn decode(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        StemError::Decode {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Errors after which the whole batch stops.
    pub fn is_batch_fatal(&self) -> bool {
        matches!(
            self,
            StemError::ModelUnavailable { .. }
                | StemError::InvalidSettings(_)
                | StemError::OutputNotWritable { .. }
        )
    }
}

// --- Implement From conversions for common errors ---
impl From<serde_json::Error> for StemError {
    fn from(e: serde_json::Error) -> Self {
        StemError::Anyhow(e.into())
    }
}

impl From<hound::Error> for StemError {
    fn from(e: hound::Error) -> Self {
        StemError::Anyhow(e.into())
    }
}

impl From<InferenceError> for StemError {
    fn from(e: InferenceError) -> Self {
        match e {
            InferenceError::OutOfMemory(msg) => StemError::OutOfMemory(msg),
            other => StemError::Inference(other.to_string()),
        }
    }
}

/// Failure reported by one call into the inference service.
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// The model returned a buffer that does not fit the input.
    #[error("unexpected output shape: {0}")]
    Shape(String),

    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, Error)]
pub enum DenoiseError {
    #[error("degenerate noise profile (mean={mean:.6}, std={std:.6}, threshold={threshold:.6})")]
    DegenerateProfile { mean: f32, std: f32, threshold: f32 },

    #[error("denoised stem is silent")]
    SilentResult,
}

#[derive(Debug, Error)]
pub enum TranscriptionError {
    #[error("no onsets detected")]
    NoOnsets,

    #[error("no valid pitched notes among {onsets} onsets")]
    NoPitchedNotes { onsets: usize },

    #[error("failed to write MIDI file: {0}")]
    Write(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StemError>;
