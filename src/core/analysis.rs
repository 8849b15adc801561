//! Track content analysis and model recommendation.

use std::path::Path;

use serde::Serialize;

use crate::{
    config::PipelineConfig,
    core::{
        audio,
        buffer::Waveform,
        dsp::{analysis_sizes, median_filter, stft_magnitude, Spectrogram},
        transcribe::{detect_onsets, onset_envelope},
    },
    error::Result,
    types::{ModelVariant, StemKind},
};

const ANALYSIS_SECS: f32 = 60.0;
/// Bins below this are DC and rumble, outside every band.
const SUB_HZ: f32 = 20.0;
const BASS_HZ: f32 = 250.0;
const HIGH_HZ: f32 = 4000.0;
const HPSS_KERNEL: usize = 31;
const MIN_BPM: f32 = 60.0;
const MAX_BPM: f32 = 200.0;

#[derive(Clone, Debug, Serialize)]
pub struct TrackAnalysis {
    pub duration_secs: f32,
    /// Share of mean spectral magnitude below 250 Hz, in percent.
    pub bass_pct: f32,
    pub mid_pct: f32,
    pub high_pct: f32,
    pub onset_count: usize,
    pub tempo_bpm: f32,
    /// Mean absolute amplitude of the harmonic component.
    pub harmonic_energy: f32,
    pub detected: Vec<StemKind>,
    pub recommended: ModelVariant,
    pub reason: String,
    pub vocal_first: bool,
}

/// Analyzes the first minute of `path`.
pub fn analyze(path: &Path, config: &PipelineConfig) -> Result<TrackAnalysis> {
    let wave = audio::ingest(path, config)?;
    let limit = (ANALYSIS_SECS * wave.sample_rate() as f32) as usize;
    Ok(analyze_waveform(&wave.slice(0, limit)))
}

pub fn analyze_waveform(wave: &Waveform) -> TrackAnalysis {
    let mono = wave.mono();
    let (n_fft, hop) = analysis_sizes(wave.sample_rate());
    let spec = stft_magnitude(&mono, n_fft, hop, wave.sample_rate());

    let (bass_pct, mid_pct, high_pct) = band_shares(&spec);
    let onset_count = detect_onsets(&spec, false).len();
    let tempo_bpm = estimate_tempo(&spec);
    let mean_abs = mono.iter().map(|x| x.abs()).sum::<f32>() / mono.len().max(1) as f32;
    let harmonic_energy = harmonic_ratio(&spec) * mean_abs;

    let has_drums = onset_count > 10 && tempo_bpm > MIN_BPM;
    let has_melody = harmonic_energy > 0.01;

    let mut detected = Vec::new();
    if has_drums {
        detected.push(StemKind::Drums);
    }
    if bass_pct > 15.0 {
        detected.push(StemKind::Bass);
    }
    if has_melody && mid_pct > 30.0 {
        detected.push(StemKind::Vocals);
    }
    if mid_pct > 20.0 {
        detected.push(StemKind::Other);
    }

    let drum_score = 2 * u32::from(has_drums)
        + u32::from(high_pct > 25.0)
        + u32::from(bass_pct > 20.0 && has_drums);
    let vocal_score =
        2 * u32::from(has_melody) + u32::from(mid_pct > 40.0) + u32::from(bass_pct < 20.0);
    let complexity = detected.len() as u32
        + u32::from(bass_pct > 15.0 && mid_pct > 30.0 && high_pct > 15.0);

    let (recommended, reason) = if drum_score >= 3 && has_drums {
        (ModelVariant::Drums, "Strong drum/percussion content detected")
    } else if vocal_score >= 3 && has_melody {
        (ModelVariant::FineTuned, "Prominent vocals/melody detected")
    } else if complexity >= 4 {
        (ModelVariant::Ensemble, "Complex mix with many instruments")
    } else {
        (ModelVariant::Balanced, "Good all-around choice for this track")
    };

    let vocal_strength = mid_pct * (harmonic_energy / (mean_abs + 1e-9));
    let vocal_first = has_melody && (mid_pct > 30.0 || vocal_strength > 0.02 || vocal_score >= 3);

    TrackAnalysis {
        duration_secs: wave.duration_secs(),
        bass_pct,
        mid_pct,
        high_pct,
        onset_count,
        tempo_bpm,
        harmonic_energy,
        detected,
        recommended,
        reason: reason.into(),
        vocal_first,
    }
}

/// Mean magnitude per band as a percentage of the three-band total.
fn band_shares(spec: &Spectrogram) -> (f32, f32, f32) {
    let bin_hz = spec.bin_hz();
    let mut sums = [0.0f64; 3];
    let mut counts = [0usize; 3];
    for frame in &spec.frames {
        for (b, &m) in frame.iter().enumerate() {
            let hz = b as f32 * bin_hz;
            if hz < SUB_HZ {
                continue;
            }
            let band = if hz < BASS_HZ {
                0
            } else if hz < HIGH_HZ {
                1
            } else {
                2
            };
            sums[band] += f64::from(m);
            counts[band] += 1;
        }
    }
    let means: Vec<f64> = sums
        .iter()
        .zip(counts)
        .map(|(s, c)| if c > 0 { s / c as f64 } else { 0.0 })
        .collect();
    let total: f64 = means.iter().sum();
    if total <= 0.0 {
        return (0.0, 0.0, 0.0);
    }
    let pct = |m: f64| (m / total * 100.0) as f32;
    (pct(means[0]), pct(means[1]), pct(means[2]))
}

/// Tempo from the autocorrelation peak of the onset envelope within
/// 60-200 BPM. Zero when the envelope is flat.
pub fn estimate_tempo(spec: &Spectrogram) -> f32 {
    let env = onset_envelope(spec);
    let fps = spec.sample_rate as f32 / spec.hop as f32;
    let min_lag = ((60.0 / MAX_BPM) * fps).floor().max(1.0) as usize;
    let max_lag = ((60.0 / MIN_BPM) * fps).ceil() as usize;
    if env.len() <= min_lag {
        return 0.0;
    }

    let mean = env.iter().sum::<f32>() / env.len() as f32;
    let centered: Vec<f32> = env.iter().map(|v| v - mean).collect();
    let best = (min_lag..=max_lag.min(centered.len() - 1))
        .map(|lag| {
            let score: f32 = centered[lag..]
                .iter()
                .zip(&centered)
                .map(|(a, b)| a * b)
                .sum();
            (lag, score)
        })
        .max_by(|a, b| a.1.total_cmp(&b.1));
    match best {
        Some((lag, score)) if score > 0.0 => 60.0 * fps / lag as f32,
        _ => 0.0,
    }
}

/// Fraction of spectral magnitude assigned to the harmonic component by a
/// median-filter harmonic/percussive soft mask.
fn harmonic_ratio(spec: &Spectrogram) -> f32 {
    if spec.is_empty() {
        return 0.0;
    }
    let bins = spec.bins();
    let frames = spec.len();

    // Harmonic: smooth along time, per bin.
    let mut harmonic = vec![vec![0.0f32; bins]; frames];
    let mut row = Vec::with_capacity(frames);
    for b in 0..bins {
        row.clear();
        row.extend(spec.frames.iter().map(|f| f[b]));
        for (t, v) in median_filter(&row, HPSS_KERNEL).into_iter().enumerate() {
            harmonic[t][b] = v;
        }
    }

    let mut harmonic_sum = 0.0f64;
    let mut total = 0.0f64;
    for (t, frame) in spec.frames.iter().enumerate() {
        // Percussive: smooth along frequency.
        let percussive = median_filter(frame, HPSS_KERNEL);
        for b in 0..bins {
            let h = harmonic[t][b];
            let p = percussive[b];
            let denom = h * h + p * p;
            let mask = if denom > 0.0 { h * h / denom } else { 0.0 };
            harmonic_sum += f64::from(mask * frame[b]);
            total += f64::from(frame[b]);
        }
    }
    if total > 0.0 {
        (harmonic_sum / total) as f32
    } else {
        0.0
    }
}
