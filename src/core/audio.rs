use std::{fs, fs::File, path::Path, time::Duration};

use anyhow::{anyhow, Context};
use hound::WavWriter;
use rubato::{FftFixedIn, Resampler};
use symphonia::core::{
    audio::SampleBuffer,
    codecs::{DecoderOptions, CODEC_TYPE_NULL},
    errors::Error as SymphoniaError,
    formats::FormatOptions,
    io::MediaSourceStream,
    meta::MetadataOptions,
    probe::Hint,
};
use symphonia::default::{get_codecs, get_probe};

use crate::{
    config::{PipelineConfig, TARGET_SAMPLE_RATE},
    core::buffer::Waveform,
    error::{Result, StemError},
    io::convert,
};

/// Interleaved samples as they come out of the decoder.
#[derive(Clone, Debug)]
pub struct AudioData {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Decodes `path` into the canonical 44.1 kHz stereo waveform.
///
/// Files below the minimum size are rejected outright. Oversized files, and
/// files the primary decoder cannot read, are converted to WAV by the external
/// converter and decoded once more.
pub fn ingest(path: &Path, config: &PipelineConfig) -> Result<Waveform> {
    let meta = fs::metadata(path).map_err(|e| StemError::decode(path, format!("cannot open: {e}")))?;
    let size = meta.len();
    if size < config.min_file_bytes {
        return Err(StemError::decode(path, format!("file too small ({size} bytes)")));
    }

    if size > config.large_file_bytes {
        log::info!(
            "[LARGE FILE] Converting {:.1}MB file to WAV first",
            size as f64 / (1024.0 * 1024.0)
        );
        return ingest_converted(path, config);
    }

    match read_audio(path).and_then(|audio| canonicalize(&audio)) {
        Ok(wave) => Ok(wave),
        Err(primary) => {
            log::warn!("Initial load failed for {}: {primary}", path.display());
            if !convert::is_convertible(path) {
                return Err(StemError::decode(path, primary));
            }
            ingest_converted(path, config)
        }
    }
}

fn ingest_converted(path: &Path, config: &PipelineConfig) -> Result<Waveform> {
    let tmp = tempfile::Builder::new()
        .prefix("stem-weaver-convert")
        .tempdir_in(config.tmp_root())
        .map_err(|e| StemError::decode(path, format!("no scratch dir: {e}")))?;
    let wav = tmp.path().join("converted.wav");

    convert::convert_to_wav(
        &config.ffmpeg,
        path,
        &wav,
        Duration::from_secs(config.convert_timeout_secs),
    )
    .map_err(|e| StemError::decode(path, format!("conversion failed: {e}")))?;

    let audio = read_audio(&wav).map_err(|e| StemError::decode(path, e))?;
    log::info!("Converted {} via external converter", path.display());
    canonicalize(&audio).map_err(|e| StemError::decode(path, e))
}

/// Stereo-normalizes and resamples decoded audio.
pub fn canonicalize(audio: &AudioData) -> Result<Waveform> {
    let wave = Waveform::from_interleaved(&audio.samples, usize::from(audio.channels), audio.sample_rate)?;
    if wave.is_empty() {
        return Err(anyhow!("no audio frames decoded").into());
    }
    if audio.channels > 2 {
        log::info!("Downmixing {} channels to stereo", audio.channels);
    }
    if wave.sample_rate() != TARGET_SAMPLE_RATE {
        log::info!("Resampling {}Hz -> {}Hz", wave.sample_rate(), TARGET_SAMPLE_RATE);
        return resample(&wave, TARGET_SAMPLE_RATE);
    }
    Ok(wave)
}

pub fn read_audio<P: AsRef<Path>>(path: P) -> Result<AudioData> {
    let path: &Path = path.as_ref();

    let file: File =
        File::open(path).with_context(|| format!("Failed to open audio file: {:?}", path))?;

    let mss: MediaSourceStream = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint: Hint = Hint::new();

    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| anyhow!("unsupported format: {e}"))?;

    let mut format = probed.format;
    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .context("No audio track found")?;
    let track_id = track.id;

    let mut decoder = get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| anyhow!("no decoder: {e}"))?;

    let mut samples: Vec<f32> = Vec::new();
    let mut sample_rate: u32 = track.codec_params.sample_rate.unwrap_or(0);
    let mut channels: u16 = track
        .codec_params
        .channels
        .map(|c| c.count() as u16)
        .unwrap_or(0);

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(anyhow!("read error: {e}").into()),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(e)) => {
                log::warn!("Skipping corrupt packet: {e}");
                continue;
            }
            Err(e) => return Err(anyhow!("decode error: {e}").into()),
        };
        sample_rate = decoded.spec().rate;
        channels = decoded.spec().channels.count() as u16;

        let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, *decoded.spec());
        buffer.copy_interleaved_ref(decoded);

        samples.extend_from_slice(buffer.samples());
    }

    if samples.is_empty() || channels == 0 || sample_rate == 0 {
        return Err(anyhow!("no audio frames decoded").into());
    }

    log::debug!(
        "Read audio: sample_rate={}, channels={}, samples={}",
        sample_rate,
        channels,
        samples.len()
    );

    Ok(AudioData {
        samples,
        sample_rate,
        channels,
    })
}

/// Writes a stereo waveform as 16-bit PCM WAV.
pub fn write_wav(path: &Path, wave: &Waveform) -> Result<()> {
    let spec = hound::WavSpec {
        channels: Waveform::CHANNELS as u16,
        sample_rate: wave.sample_rate(),
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer = WavWriter::create(path, spec)?;
    for sample in wave.to_interleaved() {
        let s = (sample * i16::MAX as f32).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        writer.write_sample(s)?;
    }

    writer.finalize()?;
    Ok(())
}

const RESAMPLE_CHUNK: usize = 1024;

pub fn resample(wave: &Waveform, target_rate: u32) -> Result<Waveform> {
    let source_rate = wave.sample_rate();
    if source_rate == target_rate || wave.is_empty() {
        return Ok(wave.clone());
    }

    let mut resampler = FftFixedIn::<f32>::new(
        source_rate as usize,
        target_rate as usize,
        RESAMPLE_CHUNK,
        2,
        Waveform::CHANNELS,
    )
    .map_err(|e| anyhow!("resampler setup failed: {e}"))?;

    let frames = wave.frames();
    let expected = (frames as u64 * u64::from(target_rate) / u64::from(source_rate)) as usize;
    let left = wave.channel(0).to_vec();
    let right = wave.channel(1).to_vec();

    // The resampler may round the block size up to its FFT size.
    let block_len = resampler.input_frames_next();
    let mut out_left = Vec::with_capacity(expected + block_len);
    let mut out_right = Vec::with_capacity(expected + block_len);
    let mut pos = 0usize;

    // Trailing zero blocks flush the resampler's internal delay.
    while out_left.len() < expected && pos < frames + 8 * block_len {
        let mut block = vec![vec![0.0f32; block_len]; Waveform::CHANNELS];
        if pos < frames {
            let end = (pos + block_len).min(frames);
            block[0][..end - pos].copy_from_slice(&left[pos..end]);
            block[1][..end - pos].copy_from_slice(&right[pos..end]);
        }
        let out = resampler
            .process(&block, None)
            .map_err(|e| anyhow!("resample failed: {e}"))?;
        out_left.extend_from_slice(&out[0]);
        out_right.extend_from_slice(&out[1]);
        pos += block_len;
    }

    out_left.resize(expected, 0.0);
    out_right.resize(expected, 0.0);
    Waveform::from_planar(out_left, out_right, target_rate)
}
