#![allow(dead_code)]

use std::{
    cell::{Cell, RefCell},
    f32::consts::PI,
    path::Path,
    sync::{Arc, Mutex},
};

use anyhow::anyhow;
use ndarray::Array3;
use stem_weaver::{
    error::InferenceError,
    types::Device,
    ModelDescriptor, ModelLoader, SeparationModel, SourceBuffer, StemKind, Waveform,
};

pub const SR: u32 = 44_100;

pub const FOUR_GAINS: &[f32] = &[0.5, 0.3, 0.2, 0.4];
pub const SIX_GAINS: &[f32] = &[0.5, 0.3, 0.2, 0.4, 0.25, 0.15];

pub fn descriptor(id: &str, layout: &[StemKind], segment_secs: Option<f32>) -> ModelDescriptor {
    ModelDescriptor {
        id: id.into(),
        layout: layout.to_vec(),
        device: Device::Cpu,
        segment_secs,
    }
}

/// Every source is the input scaled by a fixed per-source gain.
pub struct GainModel {
    pub descriptor: ModelDescriptor,
    pub gains: Vec<f32>,
    pub calls: Cell<usize>,
}

impl GainModel {
    pub fn new(id: &str, gains: &[f32], segment_secs: Option<f32>) -> Self {
        let layout = if gains.len() >= 6 {
            &StemKind::ALL[..]
        } else {
            &StemKind::BASE[..]
        };
        Self {
            descriptor: descriptor(id, &layout[..gains.len()], segment_secs),
            gains: gains.to_vec(),
            calls: Cell::new(0),
        }
    }

    pub fn four(id: &str) -> Self {
        Self::new(id, FOUR_GAINS, None)
    }
}

pub fn scaled(input: &Waveform, gains: &[f32]) -> SourceBuffer {
    let view = input.view();
    let mut out = Array3::<f32>::zeros((gains.len(), 2, input.frames()));
    for (s, g) in gains.iter().enumerate() {
        let mut src = out.index_axis_mut(ndarray::Axis(0), s);
        src.assign(&view);
        src.mapv_inplace(|x| x * g);
    }
    SourceBuffer::new(out)
}

impl SeparationModel for GainModel {
    fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    fn infer(&self, input: &Waveform) -> Result<SourceBuffer, InferenceError> {
        self.calls.set(self.calls.get() + 1);
        Ok(scaled(input, &self.gains))
    }
}

/// A gain model that runs out of memory above `limit` frames.
pub struct OomModel {
    pub inner: GainModel,
    pub limit: usize,
}

impl SeparationModel for OomModel {
    fn descriptor(&self) -> &ModelDescriptor {
        &self.inner.descriptor
    }

    fn infer(&self, input: &Waveform) -> Result<SourceBuffer, InferenceError> {
        if input.frames() > self.limit {
            return Err(InferenceError::OutOfMemory(format!(
                "CUDA out of memory for {} frames",
                input.frames()
            )));
        }
        self.inner.infer(input)
    }
}

/// Returns one extra source on every call after the first.
pub struct DriftingModel {
    pub inner: GainModel,
}

impl SeparationModel for DriftingModel {
    fn descriptor(&self) -> &ModelDescriptor {
        &self.inner.descriptor
    }

    fn infer(&self, input: &Waveform) -> Result<SourceBuffer, InferenceError> {
        let first = self.inner.calls.get() == 0;
        self.inner.calls.set(self.inner.calls.get() + 1);
        let mut gains = self.inner.gains.clone();
        if !first {
            gains.push(0.1);
        }
        Ok(scaled(input, &gains))
    }
}

/// Always fails with a non-retryable error.
pub struct BrokenModel {
    pub inner: GainModel,
}

impl SeparationModel for BrokenModel {
    fn descriptor(&self) -> &ModelDescriptor {
        &self.inner.descriptor
    }

    fn infer(&self, _input: &Waveform) -> Result<SourceBuffer, InferenceError> {
        self.inner.calls.set(self.inner.calls.get() + 1);
        Err(InferenceError::Failed("runner crashed".into()))
    }
}

/// Serves gain models for a fixed set of ids and records every load request.
pub struct MockLoader {
    pub models: Vec<(String, Vec<f32>)>,
    pub requested: RefCell<Vec<String>>,
}

impl MockLoader {
    pub fn new(models: &[(&str, &[f32])]) -> Self {
        Self {
            models: models
                .iter()
                .map(|(id, gains)| (id.to_string(), gains.to_vec()))
                .collect(),
            requested: RefCell::new(Vec::new()),
        }
    }

    pub fn empty() -> Self {
        Self::new(&[])
    }
}

impl ModelLoader for MockLoader {
    fn load(&self, id: &str, _device: Device) -> anyhow::Result<Box<dyn SeparationModel>> {
        self.requested.borrow_mut().push(id.to_string());
        let (_, gains) = self
            .models
            .iter()
            .find(|(known, _)| known == id)
            .ok_or_else(|| anyhow!("unknown model {id}"))?;
        Ok(Box::new(GainModel::new(id, gains, None)))
    }
}

/// A gain model that records the peak of every input it is given and fails
/// its first `fail_first` calls.
pub struct RecordingModel {
    pub inner: GainModel,
    pub inputs: Arc<Mutex<Vec<f32>>>,
    pub fail_first: usize,
}

impl SeparationModel for RecordingModel {
    fn descriptor(&self) -> &ModelDescriptor {
        &self.inner.descriptor
    }

    fn infer(&self, input: &Waveform) -> Result<SourceBuffer, InferenceError> {
        let call = {
            let mut inputs = self.inputs.lock().unwrap();
            inputs.push(input.peak());
            inputs.len()
        };
        if call <= self.fail_first {
            return Err(InferenceError::Failed("runner crashed".into()));
        }
        self.inner.infer(input)
    }
}

/// Serves one `RecordingModel` under `id`; every loaded copy shares the
/// same input log.
pub struct RecordingLoader {
    pub id: String,
    pub gains: Vec<f32>,
    pub fail_first: usize,
    pub inputs: Arc<Mutex<Vec<f32>>>,
}

impl RecordingLoader {
    pub fn new(id: &str, gains: &[f32], fail_first: usize) -> Self {
        Self {
            id: id.into(),
            gains: gains.to_vec(),
            fail_first,
            inputs: Arc::default(),
        }
    }

    pub fn input_peaks(&self) -> Vec<f32> {
        self.inputs.lock().unwrap().clone()
    }
}

impl ModelLoader for RecordingLoader {
    fn load(&self, id: &str, _device: Device) -> anyhow::Result<Box<dyn SeparationModel>> {
        if id != self.id {
            return Err(anyhow!("unknown model {id}"));
        }
        Ok(Box::new(RecordingModel {
            inner: GainModel::new(id, &self.gains, None),
            inputs: Arc::clone(&self.inputs),
            fail_first: self.fail_first,
        }))
    }
}

pub fn sine(freq: f32, secs: f32, amp: f32) -> Waveform {
    let n = (secs * SR as f32) as usize;
    let left: Vec<f32> = (0..n)
        .map(|i| amp * (2.0 * PI * freq * i as f32 / SR as f32).sin())
        .collect();
    let right = left.iter().map(|x| x * 0.5).collect();
    Waveform::from_planar(left, right, SR).unwrap()
}

/// Decaying noise-like bursts every `period` samples.
pub fn clicks(period: usize, secs: f32) -> Waveform {
    let n = (secs * SR as f32) as usize;
    let samples: Vec<f32> = (0..n)
        .map(|i| {
            let k = i % period;
            if k < 400 {
                let sign = if (k * 7919) % 3 == 0 { -1.0 } else { 1.0 };
                0.9 * (1.0 - k as f32 / 400.0) * sign
            } else {
                0.0
            }
        })
        .collect();
    Waveform::from_planar(samples.clone(), samples, SR).unwrap()
}

/// Writes a 16-bit stereo WAV.
pub fn write_wav(path: &Path, wave: &Waveform) {
    let spec = hound::WavSpec {
        channels: 2,
        sample_rate: wave.sample_rate(),
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut w = hound::WavWriter::create(path, spec).unwrap();
    for s in wave.to_interleaved() {
        w.write_sample((s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
            .unwrap();
    }
    w.finalize().unwrap();
}
