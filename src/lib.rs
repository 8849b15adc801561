//! # stem-weaver
//!
//! Splits mixed recordings into isolated stems with an external separation
//! model: bounded-memory chunked inference, shift-averaging and overlap,
//! ensembles, a vocal-first pre-pass, denoising and MIDI transcription.
//!
//! The entry point is [`submit`], which processes a batch of files with a
//! [`Session`] carrying the resolved device, cancellation and event sink.

pub mod config;
pub mod error;
pub mod model;
pub mod session;
pub mod types;

pub mod core {
    pub mod analysis;
    pub mod audio;
    pub mod buffer;
    pub mod dsp;
    pub mod engine;
    pub mod postprocess;
    pub mod splitter;
    pub mod transcribe;
    pub mod vocal_first;
}

pub mod io {
    pub mod convert;
}

pub use crate::{
    config::PipelineConfig,
    core::{
        analysis::{analyze, TrackAnalysis},
        audio::{ingest, read_audio, write_wav},
        buffer::{SourceBuffer, Waveform},
        engine::{ModelSet, SeparationEngine, SeparationResult},
        splitter::{submit, BatchSummary, FileOutcome, FileReport},
    },
    error::{Result, StemError},
    model::{runner::ProcessLoader, ModelDescriptor, ModelLoader, SeparationModel},
    session::{CancellationToken, EventCallback, PipelineEvent, Session},
    types::{DevicePreference, ModelVariant, NoteEvent, StemKind, StemSettings},
};
