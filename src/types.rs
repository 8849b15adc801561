use std::fmt;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StemError};

/// One isolated source track.
///
/// The discriminant order is the source order of the separation models:
/// drums, bass, other, vocals, then guitar and piano for 6-stem layouts.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum StemKind {
    Drums,
    Bass,
    Other,
    Vocals,
    Guitar,
    Piano,
}

impl StemKind {
    pub const BASE: [StemKind; 4] = [
        StemKind::Drums,
        StemKind::Bass,
        StemKind::Other,
        StemKind::Vocals,
    ];

    pub const ALL: [StemKind; 6] = [
        StemKind::Drums,
        StemKind::Bass,
        StemKind::Other,
        StemKind::Vocals,
        StemKind::Guitar,
        StemKind::Piano,
    ];

    /// Lowercase identifier used by the inference runner and the registry.
    pub fn key(self) -> &'static str {
        match self {
            StemKind::Drums => "drums",
            StemKind::Bass => "bass",
            StemKind::Other => "other",
            StemKind::Vocals => "vocals",
            StemKind::Guitar => "guitar",
            StemKind::Piano => "piano",
        }
    }

    /// Capitalized name used in output file names (`song_Vocals.wav`).
    pub fn label(self) -> &'static str {
        match self {
            StemKind::Drums => "Drums",
            StemKind::Bass => "Bass",
            StemKind::Other => "Other",
            StemKind::Vocals => "Vocals",
            StemKind::Guitar => "Guitar",
            StemKind::Piano => "Piano",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|s| s.key().eq_ignore_ascii_case(key))
    }
}

impl fmt::Display for StemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Closed set of user-facing model choices.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ModelVariant {
    #[default]
    Balanced,
    FineTuned,
    Drums,
    SixStem,
    Fast,
    Ensemble,
}

impl ModelVariant {
    pub const ALL: [ModelVariant; 6] = [
        ModelVariant::Balanced,
        ModelVariant::FineTuned,
        ModelVariant::Drums,
        ModelVariant::SixStem,
        ModelVariant::Fast,
        ModelVariant::Ensemble,
    ];

    pub fn description(self) -> &'static str {
        match self {
            ModelVariant::Balanced => "Good all-around separation, fast",
            ModelVariant::FineTuned => "Cleanest vocal isolation",
            ModelVariant::Drums => "Optimized for drums/percussion extraction",
            ModelVariant::SixStem => "Separates piano and guitar from other",
            ModelVariant::Fast => "Fast processing, good for previews",
            ModelVariant::Ensemble => "Combines multiple models for best results",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    #[default]
    Cpu,
    Gpu,
}

/// Device resolved once per batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Gpu,
}

impl Device {
    /// The CPU path is the memory-constrained one; long inputs are chunked there.
    pub fn is_memory_constrained(self) -> bool {
        matches!(self, Device::Cpu)
    }

    pub fn runner_name(self) -> &'static str {
        match self {
            Device::Cpu => "cpu",
            Device::Gpu => "cuda",
        }
    }
}

/// Inference-quality parameters for one separation call.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PassParams {
    /// Number of shifted passes averaged together. 0 means a single plain pass.
    pub shifts: u32,
    /// Fractional overlap between inference windows, in `[0, 1)`.
    pub overlap: f32,
}

impl PassParams {
    pub const CHUNK: PassParams = PassParams {
        shifts: 0,
        overlap: 0.1,
    };

    /// Maps a quality level 1..=5 to shifts and overlap. Out-of-range levels clamp.
    pub fn for_quality(level: u8) -> Self {
        const SHIFTS: [u32; 5] = [0, 0, 1, 1, 2];
        const OVERLAP: [f32; 5] = [0.10, 0.15, 0.20, 0.25, 0.30];
        let idx = usize::from(level.clamp(1, 5) - 1);
        PassParams {
            shifts: SHIFTS[idx],
            overlap: OVERLAP[idx],
        }
    }

    pub fn with_floor(self, shifts: u32, overlap: f32) -> Self {
        PassParams {
            shifts: self.shifts.max(shifts),
            overlap: self.overlap.max(overlap),
        }
    }
}

pub const MAX_DENOISE_LEVEL: f32 = 0.3;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StemSettings {
    pub model: ModelVariant,
    /// 1 (fastest) to 5 (cleanest).
    pub quality: u8,
    pub stems: Vec<StemKind>,
    pub vocal_first: bool,
    pub export_accompaniment: bool,
    pub denoise: bool,
    /// 0.0 to 0.3; 0.08 is light, 0.2 strong.
    pub denoise_level: f32,
    pub export_midi: bool,
    pub device: DevicePreference,
    pub output_dir: String,
}

impl Default for StemSettings {
    fn default() -> Self {
        Self {
            model: ModelVariant::Balanced,
            quality: 3,
            stems: StemKind::BASE.to_vec(),
            vocal_first: false,
            export_accompaniment: false,
            denoise: false,
            denoise_level: 0.08,
            export_midi: false,
            device: DevicePreference::Cpu,
            output_dir: ".".into(),
        }
    }
}

impl StemSettings {
    pub fn from_json_file(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let settings: StemSettings = serde_json::from_str(&raw)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=5).contains(&self.quality) {
            return Err(StemError::InvalidSettings(format!(
                "quality must be 1-5, got {}",
                self.quality
            )));
        }
        if !(0.0..=MAX_DENOISE_LEVEL).contains(&self.denoise_level) {
            return Err(StemError::InvalidSettings(format!(
                "denoise level must be 0.0-{MAX_DENOISE_LEVEL}, got {}",
                self.denoise_level
            )));
        }
        if self.stems.is_empty() {
            return Err(StemError::InvalidSettings("no stems selected".into()));
        }
        Ok(())
    }

    pub fn pass_params(&self) -> PassParams {
        PassParams::for_quality(self.quality)
    }
}

/// One transcribed note. Times are in seconds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NoteEvent {
    pub pitch: u8,
    pub start: f32,
    pub duration: f32,
    pub velocity: u8,
}

impl NoteEvent {
    pub const MIN_PITCH: u8 = 21;
    pub const MAX_PITCH: u8 = 108;
    pub const MIN_DURATION: f32 = 0.1;
    pub const MAX_DURATION: f32 = 4.0;

    /// Builds a note with pitch and duration forced into the piano range.
    pub fn clamped(pitch: i32, start: f32, duration: f32, velocity: u8) -> Self {
        Self {
            pitch: pitch.clamp(i32::from(Self::MIN_PITCH), i32::from(Self::MAX_PITCH)) as u8,
            start: start.max(0.0),
            duration: duration.clamp(Self::MIN_DURATION, Self::MAX_DURATION),
            velocity: velocity.min(127),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_levels_map_to_the_pass_table() {
        let table: Vec<(u32, f32)> = (1..=5)
            .map(PassParams::for_quality)
            .map(|p| (p.shifts, p.overlap))
            .collect();
        assert_eq!(
            table,
            vec![(0, 0.10), (0, 0.15), (1, 0.20), (1, 0.25), (2, 0.30)]
        );
    }

    #[test]
    fn higher_quality_never_lowers_shifts_or_overlap() {
        for level in 1..5u8 {
            let lo = PassParams::for_quality(level);
            let hi = PassParams::for_quality(level + 1);
            assert!(hi.shifts >= lo.shifts, "level {level}");
            assert!(hi.overlap >= lo.overlap, "level {level}");
        }
        assert_eq!(PassParams::for_quality(0), PassParams::for_quality(1));
        assert_eq!(PassParams::for_quality(9), PassParams::for_quality(5));
    }

    #[test]
    fn notes_are_clamped_to_the_piano_range() {
        // 20 Hz and 5 kHz land below A0 and above C8.
        let low = NoteEvent::clamped(15, 1.0, 0.5, 90);
        let high = NoteEvent::clamped(111, 1.0, 0.5, 90);
        assert_eq!(low.pitch, NoteEvent::MIN_PITCH);
        assert_eq!(high.pitch, NoteEvent::MAX_PITCH);

        let long = NoteEvent::clamped(60, 0.0, 6.5, 90);
        let short = NoteEvent::clamped(60, 0.0, 0.01, 90);
        assert_eq!(long.duration, NoteEvent::MAX_DURATION);
        assert_eq!(short.duration, NoteEvent::MIN_DURATION);

        let odd = NoteEvent::clamped(-4, -0.2, 1.0, 200);
        assert_eq!(odd.pitch, 21);
        assert_eq!(odd.start, 0.0);
        assert_eq!(odd.velocity, 127);
    }

    #[test]
    fn in_range_notes_are_unchanged() {
        let note = NoteEvent::clamped(69, 2.5, 1.25, 100);
        assert_eq!(
            note,
            NoteEvent {
                pitch: 69,
                start: 2.5,
                duration: 1.25,
                velocity: 100
            }
        );
    }
}
