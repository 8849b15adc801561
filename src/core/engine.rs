//! Runs inference passes over a waveform.
//!
//! A pass splits the signal into the model's native segments, merges them by
//! weighted overlap-add and optionally averages several time-shifted passes.
//! Long inputs on the memory-constrained path are processed in fixed chunks
//! whose outputs are joined with [`SourceBuffer::equalize_then_concat`].
//! Out-of-memory failures advance through an explicit list of attempts.

use ndarray::{s, Array1, Array3, Axis};

use crate::{
    core::buffer::{SourceBuffer, Waveform},
    error::{InferenceError, Result, StemError},
    model::{SeparationModel, VOCAL_INDEX},
    session::Session,
    types::{PassParams, StemKind},
};

/// Chunk overlap used when ensemble mode falls back to chunking.
const ENSEMBLE_CHUNK_OVERLAP: f32 = 0.2;

/// Models taking part in one separation.
#[derive(Clone, Copy)]
pub struct ModelSet<'m> {
    pub primary: &'m dyn SeparationModel,
    /// Averaged with the primary output when present.
    pub partner: Option<&'m dyn SeparationModel>,
    pub ensemble: bool,
}

impl<'m> ModelSet<'m> {
    pub fn single(model: &'m dyn SeparationModel) -> Self {
        Self {
            primary: model,
            partner: None,
            ensemble: false,
        }
    }

    pub fn ensemble(primary: &'m dyn SeparationModel, partner: Option<&'m dyn SeparationModel>) -> Self {
        Self {
            primary,
            partner,
            ensemble: true,
        }
    }

    fn members(&self) -> impl Iterator<Item = &'m dyn SeparationModel> {
        std::iter::once(self.primary).chain(self.partner)
    }
}

/// How one attempt walks the input.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Attempt {
    WholeFile,
    Chunked { frames: usize },
}

/// Stems of one file, time-aligned with the input.
#[derive(Clone, Debug)]
pub struct SeparationResult {
    layout: Vec<StemKind>,
    sources: SourceBuffer,
    sample_rate: u32,
    chunks: usize,
}

impl SeparationResult {
    pub fn layout(&self) -> &[StemKind] {
        &self.layout
    }

    pub fn frames(&self) -> usize {
        self.sources.frames()
    }

    /// Number of inference chunks the successful attempt used.
    pub fn chunks(&self) -> usize {
        self.chunks
    }

    pub fn sources(&self) -> &SourceBuffer {
        &self.sources
    }

    pub fn stem(&self, kind: StemKind) -> Option<Waveform> {
        let idx = self.layout.iter().position(|s| *s == kind)?;
        self.sources.source(idx, self.sample_rate)
    }

    /// Stems in layout order.
    pub fn stems(&self) -> Vec<(StemKind, Waveform)> {
        self.layout
            .iter()
            .enumerate()
            .filter_map(|(i, k)| self.sources.source(i, self.sample_rate).map(|w| (*k, w)))
            .collect()
    }

    /// Sum of every non-vocal source.
    pub fn accompaniment(&self) -> Option<Waveform> {
        self.sources.sum_excluding(VOCAL_INDEX, self.sample_rate)
    }
}

struct Failure {
    error: StemError,
    retryable: bool,
}

impl Failure {
    fn fatal(error: StemError) -> Self {
        Self {
            error,
            retryable: false,
        }
    }

    fn from_inference(err: InferenceError, attempt: Attempt) -> Self {
        let retryable = match err {
            InferenceError::OutOfMemory(_) => true,
            InferenceError::Shape(_) => attempt == Attempt::WholeFile,
            InferenceError::Failed(_) => false,
        };
        Self {
            error: err.into(),
            retryable,
        }
    }
}

pub struct SeparationEngine<'s> {
    session: &'s Session,
}

impl<'s> SeparationEngine<'s> {
    pub fn new(session: &'s Session) -> Self {
        Self { session }
    }

    /// The attempts tried in order for `wave`.
    pub fn attempts(&self, wave: &Waveform) -> Vec<Attempt> {
        let cfg = self.session.config();
        let retry = Attempt::Chunked {
            frames: cfg.seconds_to_frames(cfg.retry_chunk_secs),
        };
        let chunked = self.session.device().is_memory_constrained()
            && wave.duration_secs() > cfg.chunk_threshold_secs;
        if chunked {
            vec![
                Attempt::Chunked {
                    frames: cfg.seconds_to_frames(cfg.chunk_secs),
                },
                retry,
            ]
        } else {
            vec![Attempt::WholeFile, retry]
        }
    }

    pub fn separate(
        &self,
        wave: &Waveform,
        models: ModelSet<'_>,
        params: PassParams,
    ) -> Result<SeparationResult> {
        self.separate_with_progress(wave, models, params, &mut |_| {})
    }

    /// Like [`separate`](Self::separate), reporting the fraction of chunks done.
    pub fn separate_with_progress(
        &self,
        wave: &Waveform,
        models: ModelSet<'_>,
        params: PassParams,
        progress: &mut dyn FnMut(f32),
    ) -> Result<SeparationResult> {
        if wave.is_empty() {
            return Err(StemError::Inference("empty input".into()));
        }
        let attempts = self.attempts(wave);
        let last = attempts.len() - 1;

        for (i, attempt) in attempts.into_iter().enumerate() {
            match self.run_attempt(wave, models, params, attempt, progress) {
                Ok((sources, chunks)) => return self.finish(wave, models, sources, chunks),
                Err(f) if f.retryable && i < last => {
                    self.session.warn(format!(
                        "[!] {} during {}, retrying with smaller chunks",
                        f.error,
                        describe(attempt)
                    ));
                }
                Err(f) => return Err(f.error),
            }
        }
        Err(StemError::Inference("no separation attempt succeeded".into()))
    }

    fn finish(
        &self,
        wave: &Waveform,
        models: ModelSet<'_>,
        sources: SourceBuffer,
        chunks: usize,
    ) -> Result<SeparationResult> {
        let layout = models.primary.descriptor().layout.clone();
        if sources.sources() != layout.len() {
            return Err(StemError::Inference(format!(
                "model returned {} sources for a {}-stem layout",
                sources.sources(),
                layout.len()
            )));
        }
        Ok(SeparationResult {
            layout,
            sources: sources.with_frames(wave.frames()),
            sample_rate: wave.sample_rate(),
            chunks,
        })
    }

    fn run_attempt(
        &self,
        wave: &Waveform,
        models: ModelSet<'_>,
        params: PassParams,
        attempt: Attempt,
        progress: &mut dyn FnMut(f32),
    ) -> std::result::Result<(SourceBuffer, usize), Failure> {
        match attempt {
            Attempt::WholeFile => {
                self.session.info(format!(
                    "Separating whole file ({:.1}s, shifts={}, overlap={:.2})",
                    wave.duration_secs(),
                    params.shifts,
                    params.overlap
                ));
                let out = self.infer_span(wave, models, params, attempt)?;
                let expected = models.primary.descriptor().layout.len();
                if out.sources() != expected {
                    return Err(Failure::from_inference(
                        InferenceError::Shape(format!(
                            "{} sources for a {expected}-stem layout",
                            out.sources()
                        )),
                        attempt,
                    ));
                }
                progress(1.0);
                Ok((out, 1))
            }
            Attempt::Chunked { frames } => {
                let frames = frames.max(1);
                let total = wave.frames().div_ceil(frames);
                let chunk_params = PassParams {
                    shifts: 0,
                    overlap: if models.ensemble {
                        ENSEMBLE_CHUNK_OVERLAP
                    } else {
                        PassParams::CHUNK.overlap
                    },
                };
                self.session.info(format!(
                    "[CHUNKED] Processing {:.1}s in {total} chunks of {:.1}s",
                    wave.duration_secs(),
                    frames as f32 / wave.sample_rate() as f32
                ));

                let mut parts = Vec::with_capacity(total);
                for index in 0..total {
                    if self.session.is_cancelled() {
                        return Err(Failure::fatal(StemError::Cancelled));
                    }
                    let start = index * frames;
                    let chunk = wave.slice(start, start + frames);
                    self.session.debug(format!("Chunk {}/{total}", index + 1));
                    parts.push(self.infer_span(&chunk, models, chunk_params, attempt)?);
                    progress((index + 1) as f32 / total as f32);
                }

                let merged = SourceBuffer::equalize_then_concat(parts).map_err(Failure::fatal)?;
                Ok((merged, total))
            }
        }
    }

    /// One span through every model of the set, averaged.
    fn infer_span(
        &self,
        span: &Waveform,
        models: ModelSet<'_>,
        params: PassParams,
        attempt: Attempt,
    ) -> std::result::Result<SourceBuffer, Failure> {
        let max_shift = self
            .session
            .config()
            .seconds_to_frames(self.session.config().max_shift_secs);
        let mut outputs = models
            .members()
            .map(|m| shifted_pass(span, m, params, max_shift))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Failure::from_inference(e, attempt))?;
        if outputs.len() == 1 {
            return Ok(outputs.remove(0));
        }
        SourceBuffer::mean(outputs).map_err(Failure::fatal)
    }
}

fn describe(attempt: Attempt) -> String {
    match attempt {
        Attempt::WholeFile => "whole-file separation".into(),
        Attempt::Chunked { frames } => format!("chunked separation ({frames} frames)"),
    }
}

/// Averages `shifts` passes over copies of `input` delayed by evenly spaced
/// offsets in `(0, max_shift)`. Zero shifts is a single plain pass.
pub fn shifted_pass(
    input: &Waveform,
    model: &dyn SeparationModel,
    params: PassParams,
    max_shift: usize,
) -> std::result::Result<SourceBuffer, InferenceError> {
    if params.shifts == 0 || max_shift == 0 {
        return overlap_pass(input, model, params.overlap);
    }
    let frames = input.frames();
    let mut acc: Option<Array3<f32>> = None;
    for k in 0..params.shifts as usize {
        let offset = (k + 1) * max_shift / (params.shifts as usize + 1);
        let delayed = delay(input, offset);
        let out = overlap_pass(&delayed, model, params.overlap)?;
        let aligned = out.view().slice(s![.., .., offset..offset + frames]).to_owned();
        if let Some(a) = acc.as_mut() {
            *a += &aligned;
        } else {
            acc = Some(aligned);
        }
    }
    let mut acc = acc.unwrap_or_else(|| Array3::zeros((0, 0, frames)));
    let n = params.shifts as f32;
    acc.mapv_inplace(|x| x / n);
    Ok(SourceBuffer::new(acc))
}

fn delay(input: &Waveform, offset: usize) -> Waveform {
    let mut left = vec![0.0f32; offset];
    let mut right = vec![0.0f32; offset];
    left.extend(input.channel(0).iter());
    right.extend(input.channel(1).iter());
    Waveform::from_planar(left, right, input.sample_rate())
        .unwrap_or_else(|_| Waveform::silence(input.frames() + offset, input.sample_rate()))
}

/// Triangular window peaking at the segment center, never zero.
fn triangle(len: usize) -> Array1<f32> {
    let half = len / 2;
    let w: Vec<f32> = (0..len)
        .map(|i| if i < half { (i + 1) as f32 } else { (len - i) as f32 })
        .collect();
    let max = w.iter().copied().fold(1.0f32, f32::max);
    Array1::from_vec(w) / max
}

/// Splits `input` into the model's native segments with the given overlap
/// and merges them by weighted overlap-add.
pub fn overlap_pass(
    input: &Waveform,
    model: &dyn SeparationModel,
    overlap: f32,
) -> std::result::Result<SourceBuffer, InferenceError> {
    let frames = input.frames();
    let segment = model
        .descriptor()
        .segment_secs
        .map(|secs| (secs * input.sample_rate() as f32).round() as usize)
        .filter(|&seg| seg > 0 && seg < frames);

    let Some(segment) = segment else {
        return checked_infer(input, model);
    };

    let stride = ((segment as f32 * (1.0 - overlap.clamp(0.0, 0.99))).round() as usize).max(1);
    let weight = triangle(segment);

    let mut out: Option<Array3<f32>> = None;
    let mut sum_weight = Array1::<f32>::zeros(frames);
    let mut offset = 0usize;
    while offset < frames {
        let end = (offset + segment).min(frames);
        let piece = checked_infer(&input.slice(offset, end), model)?;
        let len = end - offset;
        let w = weight.slice(s![..len]);

        let acc = out.get_or_insert_with(|| Array3::zeros((piece.sources(), piece.channels(), frames)));
        if (acc.shape()[0], acc.shape()[1]) != piece.layout() {
            return Err(InferenceError::Shape(format!(
                "segment at frame {offset} has layout {:?}",
                piece.layout()
            )));
        }
        let mut target = acc.slice_mut(s![.., .., offset..end]);
        let weighted = &piece.view() * &w;
        target += &weighted;
        let mut ws = sum_weight.slice_mut(s![offset..end]);
        ws += &w;

        if end == frames {
            break;
        }
        offset += stride;
    }

    let mut out = out.unwrap_or_else(|| Array3::zeros((0, 0, frames)));
    for mut lane in out.lanes_mut(Axis(2)) {
        lane /= &sum_weight;
    }
    Ok(SourceBuffer::new(out))
}

fn checked_infer(
    input: &Waveform,
    model: &dyn SeparationModel,
) -> std::result::Result<SourceBuffer, InferenceError> {
    let out = model.infer(input)?;
    if out.frames() != input.frames() {
        return Err(InferenceError::Shape(format!(
            "expected {} frames, got {}",
            input.frames(),
            out.frames()
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triangle_is_positive_and_peaks_at_one() {
        let w = triangle(7);
        assert!(w.iter().all(|&x| x > 0.0));
        assert_eq!(w.iter().copied().fold(0.0f32, f32::max), 1.0);
        assert_eq!(w[0], w[6]);
    }

    #[test]
    fn delay_prepends_silence() {
        let wave = Waveform::from_planar(vec![1.0; 3], vec![2.0; 3], 44_100).unwrap();
        let d = delay(&wave, 2);
        assert_eq!(d.frames(), 5);
        assert_eq!(d.channel(0).to_vec(), vec![0.0, 0.0, 1.0, 1.0, 1.0]);
    }
}
