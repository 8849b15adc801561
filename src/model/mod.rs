//! Inference-service seam.
//!
//! The separation network is opaque: a `SeparationModel` takes a stereo
//! segment and returns one stereo signal per source in its declared layout.
//! `ModelLoader` resolves model ids for a device; the pipeline only talks to
//! these two traits.

pub mod registry;
pub mod runner;
pub mod selector;

use crate::{
    core::buffer::{SourceBuffer, Waveform},
    error::InferenceError,
    types::{Device, StemKind},
};

/// Vocal source index, identical for 4- and 6-stem layouts.
pub const VOCAL_INDEX: usize = 3;

#[derive(Clone, Debug, PartialEq)]
pub struct ModelDescriptor {
    pub id: String,
    /// Sources in output order.
    pub layout: Vec<StemKind>,
    pub device: Device,
    /// Native inference window; `None` accepts any length in one call.
    pub segment_secs: Option<f32>,
}

impl ModelDescriptor {
    pub fn is_six_stem(&self) -> bool {
        self.layout.len() >= 6
    }

    pub fn has_vocal_index(&self) -> bool {
        self.layout.get(VOCAL_INDEX) == Some(&StemKind::Vocals)
    }
}

pub trait SeparationModel {
    fn descriptor(&self) -> &ModelDescriptor;

    /// One inference call. The output must be
    /// `(layout.len(), 2, input.frames())`.
    fn infer(&self, input: &Waveform) -> Result<SourceBuffer, InferenceError>;
}

pub trait ModelLoader {
    fn load(&self, id: &str, device: Device) -> anyhow::Result<Box<dyn SeparationModel>>;

    /// Whether a GPU can be used for this batch.
    fn gpu_available(&self) -> bool {
        false
    }
}
