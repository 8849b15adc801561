//! Owned sample buffers passed between stages.
//!
//! `Waveform` is the canonical stereo signal produced by ingest. `SourceBuffer`
//! is the `(sources, channels, frames)` output of one inference pass; it is the
//! only place where chunk outputs are padded and joined.

use anyhow::anyhow;
use ndarray::{concatenate, s, Array2, Array3, ArrayView1, ArrayView2, ArrayView3, Axis};

use crate::error::{Result, StemError};

/// Immutable two-channel planar signal.
#[derive(Clone, Debug, PartialEq)]
pub struct Waveform {
    data: Array2<f32>,
    sample_rate: u32,
}

impl Waveform {
    pub const CHANNELS: usize = 2;

    pub fn from_planar(left: Vec<f32>, right: Vec<f32>, sample_rate: u32) -> Result<Self> {
        if left.len() != right.len() {
            return Err(anyhow!("L/R length mismatch: {} vs {}", left.len(), right.len()).into());
        }
        let frames = left.len();
        let mut data = left;
        data.extend_from_slice(&right);
        let data = Array2::from_shape_vec((Self::CHANNELS, frames), data)
            .map_err(|e| StemError::Anyhow(e.into()))?;
        Ok(Self { data, sample_rate })
    }

    pub fn from_array(data: Array2<f32>, sample_rate: u32) -> Result<Self> {
        if data.nrows() != Self::CHANNELS {
            return Err(anyhow!("expected 2 channels, got {}", data.nrows()).into());
        }
        Ok(Self { data, sample_rate })
    }

    /// Builds a stereo waveform from interleaved samples of any channel count:
    /// mono is duplicated, more than two channels keep the first two.
    pub fn from_interleaved(samples: &[f32], channels: usize, sample_rate: u32) -> Result<Self> {
        if channels == 0 {
            return Err(anyhow!("zero channels").into());
        }
        let frames = samples.len() / channels;
        let mut data = Array2::<f32>::zeros((Self::CHANNELS, frames));
        for (i, frame) in samples.chunks_exact(channels).enumerate() {
            data[[0, i]] = frame[0];
            data[[1, i]] = if channels == 1 { frame[0] } else { frame[1] };
        }
        Ok(Self { data, sample_rate })
    }

    pub fn silence(frames: usize, sample_rate: u32) -> Self {
        Self {
            data: Array2::zeros((Self::CHANNELS, frames)),
            sample_rate,
        }
    }

    pub fn frames(&self) -> usize {
        self.data.ncols()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn duration_secs(&self) -> f32 {
        self.frames() as f32 / self.sample_rate as f32
    }

    pub fn is_empty(&self) -> bool {
        self.frames() == 0
    }

    pub fn channel(&self, ch: usize) -> ArrayView1<'_, f32> {
        self.data.row(ch)
    }

    pub fn view(&self) -> ArrayView2<'_, f32> {
        self.data.view()
    }

    /// Copy of frames `[start, end)`, clamped to the signal.
    pub fn slice(&self, start: usize, end: usize) -> Waveform {
        let end = end.min(self.frames());
        let start = start.min(end);
        Waveform {
            data: self.data.slice(s![.., start..end]).to_owned(),
            sample_rate: self.sample_rate,
        }
    }

    pub fn peak(&self) -> f32 {
        self.data.iter().fold(0.0f32, |m, &x| m.max(x.abs()))
    }

    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|x| x.is_finite())
    }

    /// Returns a copy scaled so the absolute peak equals `target`.
    /// A silent signal is returned unchanged.
    pub fn peak_normalized(&self, target: f32) -> Waveform {
        let peak = self.peak();
        if peak <= 0.0 {
            return self.clone();
        }
        let gain = target / peak;
        Waveform {
            data: self.data.mapv(|x| x * gain),
            sample_rate: self.sample_rate,
        }
    }

    pub fn mono(&self) -> Vec<f32> {
        self.data
            .axis_iter(Axis(1))
            .map(|frame| (frame[0] + frame[1]) * 0.5)
            .collect()
    }

    pub fn to_interleaved(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.frames() * Self::CHANNELS);
        for frame in self.data.axis_iter(Axis(1)) {
            out.push(frame[0]);
            out.push(frame[1]);
        }
        out
    }
}

/// Output of an inference pass: `(sources, channels, frames)`.
#[derive(Clone, Debug, PartialEq)]
pub struct SourceBuffer {
    data: Array3<f32>,
}

impl SourceBuffer {
    pub fn new(data: Array3<f32>) -> Self {
        Self { data }
    }

    pub fn sources(&self) -> usize {
        self.data.shape()[0]
    }

    pub fn channels(&self) -> usize {
        self.data.shape()[1]
    }

    pub fn frames(&self) -> usize {
        self.data.shape()[2]
    }

    /// The non-time dimensions that every chunk of one file must share.
    pub fn layout(&self) -> (usize, usize) {
        (self.sources(), self.channels())
    }

    pub fn view(&self) -> ArrayView3<'_, f32> {
        self.data.view()
    }

    /// Zero-pads (or cuts) the time axis to exactly `frames`.
    pub fn with_frames(self, frames: usize) -> SourceBuffer {
        let current = self.frames();
        if current == frames {
            return self;
        }
        let (sources, channels) = self.layout();
        let mut out = Array3::<f32>::zeros((sources, channels, frames));
        let keep = current.min(frames);
        out.slice_mut(s![.., .., ..keep])
            .assign(&self.data.slice(s![.., .., ..keep]));
        SourceBuffer { data: out }
    }

    /// One source as a stereo waveform. `None` when the index is outside the layout.
    pub fn source(&self, index: usize, sample_rate: u32) -> Option<Waveform> {
        if index >= self.sources() || self.channels() != Waveform::CHANNELS {
            return None;
        }
        Some(Waveform {
            data: self.data.index_axis(Axis(0), index).to_owned(),
            sample_rate,
        })
    }

    /// Sum of every source except `skip`.
    pub fn sum_excluding(&self, skip: usize, sample_rate: u32) -> Option<Waveform> {
        if skip >= self.sources() || self.channels() != Waveform::CHANNELS {
            return None;
        }
        let mut acc = Array2::<f32>::zeros((self.channels(), self.frames()));
        for (idx, src) in self.data.axis_iter(Axis(0)).enumerate() {
            if idx != skip {
                acc += &src;
            }
        }
        Some(Waveform {
            data: acc,
            sample_rate,
        })
    }

    /// Pads every part with trailing zeros to the longest part, then joins
    /// them along time.
    ///
    /// All parts must share `(sources, channels)`; the first part defines the
    /// expected layout and any other layout is a `ChunkShape` error.
    pub fn equalize_then_concat(parts: Vec<SourceBuffer>) -> Result<SourceBuffer> {
        let Some(first) = parts.first() else {
            return Err(anyhow!("no chunk outputs to merge").into());
        };
        let expected = first.layout();
        if let Some((index, bad)) = parts
            .iter()
            .enumerate()
            .find(|(_, p)| p.layout() != expected)
        {
            return Err(StemError::ChunkShape {
                index,
                expected,
                got: bad.layout(),
            });
        }

        let longest = parts.iter().map(SourceBuffer::frames).max().unwrap_or(0);
        let padded: Vec<SourceBuffer> = parts.into_iter().map(|p| p.with_frames(longest)).collect();
        let views: Vec<ArrayView3<'_, f32>> = padded.iter().map(|p| p.data.view()).collect();
        let data = concatenate(Axis(2), &views).map_err(|e| StemError::Anyhow(e.into()))?;
        Ok(SourceBuffer { data })
    }

    /// Element-wise mean of buffers that share a layout. Shorter buffers are
    /// zero-padded to the longest one first.
    pub fn mean(parts: Vec<SourceBuffer>) -> Result<SourceBuffer> {
        let Some(first) = parts.first() else {
            return Err(anyhow!("no outputs to combine").into());
        };
        let expected = first.layout();
        if let Some((index, bad)) = parts
            .iter()
            .enumerate()
            .find(|(_, p)| p.layout() != expected)
        {
            return Err(StemError::ChunkShape {
                index,
                expected,
                got: bad.layout(),
            });
        }
        let longest = parts.iter().map(SourceBuffer::frames).max().unwrap_or(0);
        let count = parts.len() as f32;
        let mut acc = Array3::<f32>::zeros((expected.0, expected.1, longest));
        for part in parts {
            acc += &part.with_frames(longest).data;
        }
        acc.mapv_inplace(|x| x / count);
        Ok(SourceBuffer { data: acc })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interleaved_mono_is_duplicated() {
        let w = Waveform::from_interleaved(&[0.1, -0.2, 0.3], 1, 44_100).unwrap();
        assert_eq!(w.frames(), 3);
        assert_eq!(w.channel(0).to_vec(), w.channel(1).to_vec());
    }

    #[test]
    fn interleaved_surround_keeps_first_two_channels() {
        let samples = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let w = Waveform::from_interleaved(&samples, 3, 44_100).unwrap();
        assert_eq!(w.frames(), 2);
        assert_eq!(w.channel(0).to_vec(), vec![1.0, 4.0]);
        assert_eq!(w.channel(1).to_vec(), vec![2.0, 5.0]);
    }

    #[test]
    fn slice_clamps_to_signal() {
        let w = Waveform::silence(10, 44_100);
        assert_eq!(w.slice(8, 20).frames(), 2);
        assert_eq!(w.slice(12, 20).frames(), 0);
    }
}
