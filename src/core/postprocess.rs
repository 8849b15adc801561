//! Per-stem validation, peak normalization and denoising.
//!
//! ## Spectral gating
//!
//! The denoiser estimates a noise floor from the stem itself and gates each
//! sample with a smooth mask:
//!
//! ```text
//! t    = mean(profile) + std(profile) * (2.5 - 5 * level)
//! mask = clamp(tanh((|x| - t) / (0.5 * t)), 0, 1)
//! y    = x            if |x| > 2t
//!        x * mask     otherwise
//! ```
//!
//! The profile is the first half second of the mono downmix when that holds
//! more than 1000 samples, otherwise the quietest fifth of the signal. A
//! higher level lowers the threshold, so more of the signal survives.

use ndarray::Array2;

use crate::{
    config::PipelineConfig,
    core::{
        buffer::Waveform,
        dsp::{mean_std, percentile},
    },
    error::DenoiseError,
    session::Session,
    types::{StemKind, StemSettings},
};

/// Length of the leading noise profile, in seconds.
const NOISE_PROFILE_SECS: f32 = 0.5;
/// The leading profile is used only above this many samples.
const MIN_PROFILE_SAMPLES: usize = 1000;
/// Fallback profile: samples below this magnitude percentile.
const QUIET_PERCENTILE: f32 = 20.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    NonFinite,
    Silent,
    /// The loaded model has no such source.
    Unavailable,
    /// The vocal re-inference from the original mix failed.
    RetrievalFailed,
}

/// A stem that was not written, with the peak measured when it was rejected.
#[derive(Clone, Debug, PartialEq)]
pub struct SkippedStem {
    pub stem: StemKind,
    pub reason: SkipReason,
    pub peak: f32,
}

impl std::fmt::Display for SkippedStem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.reason {
            SkipReason::NonFinite => write!(f, "{} contains non-finite samples", self.stem),
            SkipReason::Silent => write!(f, "{} is silent/empty (max={:.8})", self.stem, self.peak),
            SkipReason::Unavailable => write!(f, "{} not available in this model", self.stem),
            SkipReason::RetrievalFailed => write!(f, "{} (vocal-first retrieval failed)", self.stem),
        }
    }
}

pub struct StemPostProcessor {
    silence_threshold: f32,
    target_peak: f32,
    /// `Some(level)` when denoising is enabled with a positive level.
    denoise_level: Option<f32>,
}

impl StemPostProcessor {
    pub fn new(config: &PipelineConfig, settings: &StemSettings) -> Self {
        let denoise_level = (settings.denoise && settings.denoise_level > 0.0).then_some(settings.denoise_level);
        Self {
            silence_threshold: config.silence_threshold,
            target_peak: config.target_peak,
            denoise_level,
        }
    }

    /// Validates, normalizes and optionally denoises one stem.
    ///
    /// A stem with non-finite samples or a peak below the silence threshold is
    /// returned as `Err(SkippedStem)`. Denoising failures are logged and the
    /// normalized stem is kept.
    pub fn process(
        &self,
        stem: StemKind,
        wave: &Waveform,
        session: &Session,
    ) -> Result<Waveform, SkippedStem> {
        if !wave.is_finite() {
            return Err(SkippedStem {
                stem,
                reason: SkipReason::NonFinite,
                peak: f32::NAN,
            });
        }
        let peak = wave.peak();
        session.debug(format!("  [DEBUG] {stem} max_val: {peak:.8}"));
        if peak < self.silence_threshold {
            return Err(SkippedStem {
                stem,
                reason: SkipReason::Silent,
                peak,
            });
        }

        let normalized = wave.peak_normalized(self.target_peak);
        let Some(level) = self.denoise_level else {
            return Ok(normalized);
        };

        session.info(format!("  [DENOISE] Applying noise reduction to {stem} (level={level:.2})"));
        match denoise(&normalized, level, self.target_peak) {
            Ok(clean) => Ok(clean),
            Err(e) => {
                session.warn(format!("  [DENOISE ERROR] {stem}: {e}; keeping original stem"));
                Ok(normalized)
            }
        }
    }
}

/// Standard deviations above the profile mean at which the gate opens.
pub fn threshold_multiplier(level: f32) -> f32 {
    2.5 - 5.0 * level
}

/// Gate threshold for `mono` at `level`; see the module docs.
pub fn noise_threshold(mono: &[f32], sample_rate: u32, level: f32) -> Result<f32, DenoiseError> {
    let lead = ((NOISE_PROFILE_SECS * sample_rate as f32) as usize).min(mono.len());
    let profile: Vec<f32> = if lead > MIN_PROFILE_SAMPLES {
        mono[..lead].to_vec()
    } else {
        let magnitudes: Vec<f32> = mono.iter().map(|x| x.abs()).collect();
        let cutoff = percentile(&magnitudes, QUIET_PERCENTILE);
        mono.iter().copied().filter(|x| x.abs() < cutoff).collect()
    };

    let (mean, std) = mean_std(&profile);
    let threshold = mean + std * threshold_multiplier(level);
    if profile.is_empty() || !threshold.is_finite() || threshold <= 0.0 {
        return Err(DenoiseError::DegenerateProfile {
            mean,
            std,
            threshold,
        });
    }
    Ok(threshold)
}

/// Applies the soft gate to both channels and renormalizes to `target_peak`.
pub fn denoise(wave: &Waveform, level: f32, target_peak: f32) -> Result<Waveform, DenoiseError> {
    let t = noise_threshold(&wave.mono(), wave.sample_rate(), level)?;
    let gated: Array2<f32> = wave.view().mapv(|x| {
        let m = x.abs();
        if m > 2.0 * t {
            x
        } else {
            x * ((m - t) / (0.5 * t)).tanh().clamp(0.0, 1.0)
        }
    });
    let clean = Waveform::from_array(gated, wave.sample_rate())
        .map_err(|_| DenoiseError::SilentResult)?;
    if clean.peak() <= 0.0 {
        return Err(DenoiseError::SilentResult);
    }
    Ok(clean.peak_normalized(target_peak))
}
