use rustfft::{
    num_complex::Complex32,
    num_traits::Zero,
    FftPlanner,
};

/// Reference analysis rate the frame sizes below are expressed against.
const REFERENCE_RATE: f32 = 22_050.0;
const REFERENCE_N_FFT: f32 = 2048.0;
const REFERENCE_HOP: f32 = 512.0;

pub fn compute_hann(n_fft: usize) -> Vec<f32> {
    if n_fft <= 1 {
        return vec![1.0];
    }
    let denom = (n_fft - 1) as f32;
    (0..n_fft)
        .map(|i| 0.5 - 0.5 * (2.0 * std::f32::consts::PI * (i as f32) / denom).cos())
        .collect()
}

/// Frame and hop sizes that keep the same time resolution at any rate:
/// 2048/512 at 22.05 kHz, scaled, with the FFT size rounded to a power of two.
pub fn analysis_sizes(sample_rate: u32) -> (usize, usize) {
    let scale = sample_rate as f32 / REFERENCE_RATE;
    let n_fft = ((REFERENCE_N_FFT * scale).round().max(2.0) as usize).next_power_of_two();
    let hop = ((REFERENCE_HOP * scale).round() as usize).max(1);
    (n_fft, hop)
}

/// Magnitude spectrogram, one row of `n_fft / 2 + 1` bins per frame.
#[derive(Clone, Debug)]
pub struct Spectrogram {
    pub frames: Vec<Vec<f32>>,
    pub n_fft: usize,
    pub hop: usize,
    pub sample_rate: u32,
}

impl Spectrogram {
    pub fn bins(&self) -> usize {
        self.n_fft / 2 + 1
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn bin_hz(&self) -> f32 {
        self.sample_rate as f32 / self.n_fft as f32
    }

    /// Center time of a frame, in seconds.
    pub fn frame_time(&self, frame: usize) -> f32 {
        (frame * self.hop) as f32 / self.sample_rate as f32
    }

    /// Half-open bin range covering `[lo_hz, hi_hz]`.
    pub fn bin_range(&self, lo_hz: f32, hi_hz: f32) -> std::ops::Range<usize> {
        let lo = (lo_hz / self.bin_hz()).ceil().max(0.0) as usize;
        let hi = ((hi_hz / self.bin_hz()).floor() as usize + 1).min(self.bins());
        lo.min(hi)..hi
    }
}

/// Hann-windowed STFT magnitude of a mono signal with center padding.
pub fn stft_magnitude(signal: &[f32], n_fft: usize, hop: usize, sample_rate: u32) -> Spectrogram {
    let t = signal.len();
    let pad = n_fft / 2;
    let mut padded = vec![0.0f32; pad + t + pad];
    padded[pad..pad + t].copy_from_slice(signal);

    let frame_count = if t == 0 { 0 } else { 1 + t / hop };
    let bins = n_fft / 2 + 1;

    let mut planner = FftPlanner::<f32>::new();
    let fft = planner.plan_fft_forward(n_fft);
    let window = compute_hann(n_fft);
    let mut buf = vec![Complex32::zero(); n_fft];

    let mut frames = Vec::with_capacity(frame_count);
    for fr in 0..frame_count {
        let start = fr * hop;
        let frame = &padded[start..start + n_fft];
        for (i, (x, w)) in frame.iter().zip(&window).enumerate() {
            buf[i] = Complex32::new(x * w, 0.0);
        }
        fft.process(&mut buf);
        frames.push(buf[..bins].iter().map(|c| c.norm()).collect());
    }

    Spectrogram {
        frames,
        n_fft,
        hop,
        sample_rate,
    }
}

/// Population mean and standard deviation.
pub fn mean_std(values: &[f32]) -> (f32, f32) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().map(|&v| f64::from(v)).sum::<f64>() / n;
    let var = values
        .iter()
        .map(|&v| (f64::from(v) - mean).powi(2))
        .sum::<f64>()
        / n;
    (mean as f32, var.sqrt() as f32)
}

/// Linear-interpolated percentile, `q` in `[0, 100]`.
pub fn percentile(values: &[f32], q: f32) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = (q.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f32;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f32;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// Sliding median with an odd window; edges use the available neighbours.
pub fn median_filter(values: &[f32], size: usize) -> Vec<f32> {
    let half = size / 2;
    let mut window = Vec::with_capacity(size);
    (0..values.len())
        .map(|i| {
            let lo = i.saturating_sub(half);
            let hi = (i + half + 1).min(values.len());
            window.clear();
            window.extend_from_slice(&values[lo..hi]);
            window.sort_by(|a, b| a.total_cmp(b));
            window[window.len() / 2]
        })
        .collect()
}

/// Refines a spectral peak at `bin` by fitting a parabola through its
/// neighbours. Returns the fractional bin.
pub fn parabolic_peak(mags: &[f32], bin: usize) -> f32 {
    if bin == 0 || bin + 1 >= mags.len() {
        return bin as f32;
    }
    let (a, b, c) = (mags[bin - 1], mags[bin], mags[bin + 1]);
    let denom = a - 2.0 * b + c;
    if denom.abs() < f32::EPSILON {
        return bin as f32;
    }
    let offset = 0.5 * (a - c) / denom;
    bin as f32 + offset.clamp(-0.5, 0.5)
}
