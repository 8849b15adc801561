//! Onset/pitch-driven transcription of a stem into a Standard MIDI File.

use std::path::Path;

use midly::{
    num::{u15, u24, u28, u4, u7},
    Format, Header, MetaMessage, MidiMessage, Smf, Timing, TrackEvent, TrackEventKind,
};

use crate::{
    core::{
        buffer::Waveform,
        dsp::{analysis_sizes, parabolic_peak, stft_magnitude, Spectrogram},
    },
    error::TranscriptionError,
    types::{NoteEvent, StemKind},
};

pub const TICKS_PER_BEAT: u16 = 480;
pub const TEMPO_BPM: f32 = 120.0;
const MICROS_PER_BEAT: u32 = 500_000;
const VELOCITY: u8 = 100;

const DRUM_CHANNEL: u8 = 9;
const MELODIC_CHANNEL: u8 = 0;
const KICK: i32 = 36;
const SNARE: i32 = 38;
/// Drum hits last a sixteenth note.
const DRUM_HIT_BEATS: f32 = 0.25;
const LAST_NOTE_SECS: f32 = 0.5;
/// Spectral peaks below this fraction of the frame maximum are ignored.
const PEAK_THRESHOLD: f32 = 0.1;
const PITCH_LOOKAHEAD_SECS: f32 = 0.1;

// Peak picking, in seconds.
const PRE_MAX_SECS: f32 = 0.03;
const AVG_SECS: f32 = 0.10;
const WAIT_SECS: f32 = 0.03;
const ONSET_DELTA: f32 = 0.07;
const FLOOR_DB: f32 = -80.0;

/// Notes of one stem, ready to be written.
#[derive(Clone, Debug, PartialEq)]
pub struct NoteTrack {
    pub stem: StemKind,
    pub channel: u8,
    /// General MIDI program; `None` on the percussion channel.
    pub program: Option<u8>,
    pub notes: Vec<NoteEvent>,
}

impl NoteTrack {
    pub fn name(&self) -> String {
        format!("StemWeaver - {}", self.stem.label())
    }
}

/// General MIDI program for a melodic stem.
pub fn program_for(stem: StemKind) -> u8 {
    match stem {
        StemKind::Vocals => 52,
        StemKind::Bass => 33,
        StemKind::Piano => 0,
        StemKind::Guitar => 25,
        StemKind::Other => 48,
        StemKind::Drums => 0,
    }
}

/// Search band for the fundamental, in Hz.
fn pitch_band(stem: StemKind) -> (f32, f32) {
    match stem {
        StemKind::Bass => (50.0, 500.0),
        _ => (80.0, 2000.0),
    }
}

pub fn hz_to_midi(hz: f32) -> f32 {
    69.0 + 12.0 * (hz / 440.0).log2()
}

pub fn seconds_to_ticks(secs: f32) -> u32 {
    (secs * TEMPO_BPM / 60.0 * f32::from(TICKS_PER_BEAT)).round().max(0.0) as u32
}

#[derive(Default)]
pub struct MidiTranscriber;

impl MidiTranscriber {
    pub fn new() -> Self {
        Self
    }

    /// Detects notes in `wave`. Drums map onsets to alternating kick/snare
    /// hits; every other stem is pitch-tracked at its onsets.
    pub fn transcribe(
        &self,
        stem: StemKind,
        wave: &Waveform,
    ) -> Result<NoteTrack, TranscriptionError> {
        let mono = wave.mono();
        let (n_fft, hop) = analysis_sizes(wave.sample_rate());
        let spec = stft_magnitude(&mono, n_fft, hop, wave.sample_rate());

        let melodic = stem != StemKind::Drums;
        let onsets = detect_onsets(&spec, melodic);
        if onsets.is_empty() {
            return Err(TranscriptionError::NoOnsets);
        }
        let times: Vec<f32> = onsets.iter().map(|&f| spec.frame_time(f)).collect();

        if !melodic {
            let hit = DRUM_HIT_BEATS * 60.0 / TEMPO_BPM;
            let notes = times
                .iter()
                .enumerate()
                .map(|(i, &t)| NoteEvent::clamped(if i % 2 == 0 { KICK } else { SNARE }, t, hit, VELOCITY))
                .collect();
            return Ok(NoteTrack {
                stem,
                channel: DRUM_CHANNEL,
                program: None,
                notes,
            });
        }

        let (lo, hi) = pitch_band(stem);
        let mut notes = Vec::new();
        for (i, &onset) in onsets.iter().enumerate() {
            let frame = settled_frame(&spec, onset, onsets.get(i + 1).copied());
            let Some(hz) = strongest_pitch(&spec, frame, lo, hi) else {
                continue;
            };
            let duration = match times.get(i + 1) {
                Some(next) => next - times[i],
                None => LAST_NOTE_SECS,
            };
            let pitch = hz_to_midi(hz).round() as i32;
            notes.push(NoteEvent::clamped(pitch, times[i], duration, VELOCITY));
        }
        if notes.is_empty() {
            return Err(TranscriptionError::NoPitchedNotes {
                onsets: onsets.len(),
            });
        }
        Ok(NoteTrack {
            stem,
            channel: MELODIC_CHANNEL,
            program: Some(program_for(stem)),
            notes,
        })
    }

    /// Transcribes `wave` and writes the file. Returns the note count.
    pub fn export(
        &self,
        stem: StemKind,
        wave: &Waveform,
        path: &Path,
    ) -> Result<usize, TranscriptionError> {
        let track = self.transcribe(stem, wave)?;
        write_midi(&track, path)?;
        Ok(track.notes.len())
    }
}

/// Loudest frame between `onset` and the lookahead limit (or the next onset).
/// Backtracked onsets sit before the attack, where there is no pitch yet.
fn settled_frame(spec: &Spectrogram, onset: usize, next: Option<usize>) -> usize {
    let lookahead = (PITCH_LOOKAHEAD_SECS * spec.sample_rate as f32 / spec.hop as f32).round() as usize;
    let end = (onset + lookahead + 1)
        .min(next.unwrap_or(usize::MAX))
        .min(spec.len());
    let energy = |f: usize| spec.frames[f].iter().sum::<f32>();
    (onset..end)
        .max_by(|&a, &b| energy(a).total_cmp(&energy(b)))
        .unwrap_or(onset)
}

/// Frequency of the strongest spectral peak within `[lo, hi]` Hz, if any
/// peak reaches the relative threshold.
fn strongest_pitch(spec: &Spectrogram, frame: usize, lo: f32, hi: f32) -> Option<f32> {
    let mags = spec.frames.get(frame)?;
    let frame_max = mags.iter().copied().fold(0.0f32, f32::max);
    if frame_max <= 0.0 {
        return None;
    }
    let floor = PEAK_THRESHOLD * frame_max;
    let range = spec.bin_range(lo, hi);

    let best = range
        .filter(|&b| b > 0 && b + 1 < mags.len())
        .filter(|&b| mags[b] >= floor && mags[b] > mags[b - 1] && mags[b] >= mags[b + 1])
        .max_by(|&a, &b| mags[a].total_cmp(&mags[b]))?;
    let hz = parabolic_peak(mags, best) * spec.bin_hz();
    (hz > 0.0).then_some(hz)
}

/// Half-wave rectified log-magnitude spectral flux, scaled to `[0, 1]`.
pub fn onset_envelope(spec: &Spectrogram) -> Vec<f32> {
    let global_max = spec
        .frames
        .iter()
        .flat_map(|f| f.iter())
        .copied()
        .fold(0.0f32, f32::max);
    if global_max <= 0.0 {
        return vec![0.0; spec.len()];
    }
    let to_db = |m: f32| (20.0 * (m.max(1e-10) / global_max).log10()).max(FLOOR_DB);
    let db: Vec<Vec<f32>> = spec
        .frames
        .iter()
        .map(|f| f.iter().map(|&m| to_db(m)).collect())
        .collect();

    let mut env = vec![0.0f32; db.len()];
    for t in 1..db.len() {
        let rise: f32 = db[t]
            .iter()
            .zip(&db[t - 1])
            .map(|(cur, prev)| (cur - prev).max(0.0))
            .sum();
        env[t] = rise / db[t].len() as f32;
    }

    let min = env.iter().copied().fold(f32::INFINITY, f32::min);
    let max = env.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let span = max - min;
    if !span.is_finite() || span <= 0.0 {
        return vec![0.0; env.len()];
    }
    env.iter().map(|v| (v - min) / span).collect()
}

/// Onset frames of a spectrogram. With `backtrack`, each onset moves to the
/// preceding local minimum of the envelope.
pub fn detect_onsets(spec: &Spectrogram, backtrack: bool) -> Vec<usize> {
    let env = onset_envelope(spec);
    let frames_per_sec = spec.sample_rate as f32 / spec.hop as f32;
    let to_frames = |secs: f32| (secs * frames_per_sec).round() as usize;

    let peaks = pick_peaks(
        &env,
        to_frames(PRE_MAX_SECS),
        to_frames(AVG_SECS),
        to_frames(AVG_SECS) + 1,
        ONSET_DELTA,
        to_frames(WAIT_SECS),
    );
    if backtrack {
        backtrack_to_minima(&peaks, &env)
    } else {
        peaks
    }
}

fn pick_peaks(
    env: &[f32],
    pre_max: usize,
    pre_avg: usize,
    post_avg: usize,
    delta: f32,
    wait: usize,
) -> Vec<usize> {
    let mut peaks = Vec::new();
    let mut last: Option<usize> = None;
    for n in 0..env.len() {
        let lo = n.saturating_sub(pre_max);
        let is_max = env[lo..=n].iter().all(|&v| v <= env[n]);
        if !is_max {
            continue;
        }
        let a_lo = n.saturating_sub(pre_avg);
        let a_hi = (n + post_avg).min(env.len());
        let window = &env[a_lo..a_hi];
        let avg = window.iter().sum::<f32>() / window.len() as f32;
        if env[n] < avg + delta {
            continue;
        }
        if last.is_some_and(|p| n <= p + wait) {
            continue;
        }
        peaks.push(n);
        last = Some(n);
    }
    peaks
}

fn backtrack_to_minima(onsets: &[usize], env: &[f32]) -> Vec<usize> {
    let mut minima = vec![0usize];
    for i in 1..env.len().saturating_sub(1) {
        if env[i] <= env[i - 1] && env[i] < env[i + 1] {
            minima.push(i);
        }
    }
    let mut out: Vec<usize> = onsets
        .iter()
        .map(|&o| minima.iter().rev().find(|&&m| m <= o).copied().unwrap_or(0))
        .collect();
    out.dedup();
    out
}

/// Writes a single-track SMF: track name, tempo, program change, notes and
/// end of track.
pub fn write_midi(track: &NoteTrack, path: &Path) -> Result<(), TranscriptionError> {
    let name = track.name();
    let channel = u4::new(track.channel.min(15));

    let mut timed: Vec<(u32, u8, TrackEventKind<'_>)> = Vec::with_capacity(track.notes.len() * 2);
    for note in &track.notes {
        let key = u7::new(note.pitch.min(127));
        let on = seconds_to_ticks(note.start);
        let off = on + seconds_to_ticks(note.duration).max(1);
        timed.push((
            on,
            1,
            TrackEventKind::Midi {
                channel,
                message: MidiMessage::NoteOn {
                    key,
                    vel: u7::new(note.velocity.min(127)),
                },
            },
        ));
        timed.push((
            off,
            0,
            TrackEventKind::Midi {
                channel,
                message: MidiMessage::NoteOff {
                    key,
                    vel: u7::new(0),
                },
            },
        ));
    }
    // Note-offs sort before note-ons on the same tick.
    timed.sort_by_key(|(tick, order, _)| (*tick, *order));

    let mut events = vec![
        TrackEvent {
            delta: u28::new(0),
            kind: TrackEventKind::Meta(MetaMessage::TrackName(name.as_bytes())),
        },
        TrackEvent {
            delta: u28::new(0),
            kind: TrackEventKind::Meta(MetaMessage::Tempo(u24::new(MICROS_PER_BEAT))),
        },
    ];
    if let Some(program) = track.program {
        events.push(TrackEvent {
            delta: u28::new(0),
            kind: TrackEventKind::Midi {
                channel,
                message: MidiMessage::ProgramChange {
                    program: u7::new(program.min(127)),
                },
            },
        });
    }
    let mut now = 0u32;
    for (tick, _, kind) in timed {
        events.push(TrackEvent {
            delta: u28::new(tick - now),
            kind,
        });
        now = tick;
    }
    events.push(TrackEvent {
        delta: u28::new(0),
        kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
    });

    let mut smf = Smf::new(Header::new(
        Format::SingleTrack,
        Timing::Metrical(u15::new(TICKS_PER_BEAT)),
    ));
    smf.tracks.push(events);
    smf.save(path)?;
    Ok(())
}
