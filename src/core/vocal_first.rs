//! Vocal/accompaniment pre-pass.
//!
//! One separation of the original mix yields an accompaniment (every source
//! but vocals). It can be exported on its own and, in vocal-first mode, it
//! replaces the waveform fed to the main separation.

use std::path::PathBuf;

use crate::{
    core::{
        buffer::Waveform,
        engine::{ModelSet, SeparationEngine},
    },
    error::{Result, StemError},
    model::VOCAL_INDEX,
    session::Session,
    types::{PassParams, StemKind, StemSettings},
};

pub struct VocalFirstStage<'s> {
    session: &'s Session,
    /// Replace the working waveform with the accompaniment.
    replace: bool,
    export: bool,
}

impl<'s> VocalFirstStage<'s> {
    /// `None` when neither vocal-first nor accompaniment export is requested.
    pub fn from_settings(session: &'s Session, settings: &StemSettings) -> Option<Self> {
        (settings.vocal_first || settings.export_accompaniment).then_some(Self {
            session,
            replace: settings.vocal_first,
            export: settings.export_accompaniment,
        })
    }

    /// Parameters of the pre-pass: a single light pass on the memory-constrained
    /// path, the quality parameters otherwise.
    pub fn pass_params(&self, quality: PassParams) -> PassParams {
        if self.session.device().is_memory_constrained() {
            PassParams::CHUNK
        } else {
            quality
        }
    }

    /// Runs the pre-pass and returns the replacement waveform, if any.
    ///
    /// `write_accompaniment` persists the accompaniment when export is on.
    /// Every failure is logged and yields `None`, leaving the original
    /// waveform in place.
    pub fn run(
        &self,
        original: &Waveform,
        models: ModelSet<'_>,
        quality: PassParams,
        write_accompaniment: &mut dyn FnMut(&Waveform) -> Result<PathBuf>,
    ) -> Option<Waveform> {
        let descriptor = models.primary.descriptor();
        if self.replace && !descriptor.is_six_stem() {
            self.session.warn(
                "  [VOCAL-FIRST] 4-stem model with vocal-first may produce noisy non-vocal stems",
            );
            self.session
                .warn("  [VOCAL-FIRST] Recommendation: Use 6-Stem model or disable vocal-first");
        }
        if !descriptor.has_vocal_index() {
            self.session
                .warn("  [WARN] Vocal index not present in model output; skipping vocal-first");
            return None;
        }

        self.session
            .info("  [VOCAL-FIRST] Performing initial vocal/accompaniment separation...");
        let accompaniment = match self.accompaniment(original, models, quality) {
            Ok(acc) => acc,
            Err(e) => {
                self.session.warn(format!("  [WARN] Vocal-first step failed: {e}"));
                return None;
            }
        };

        if self.export {
            match write_accompaniment(&accompaniment) {
                Ok(path) => self.session.info(format!(
                    "  [+] Saved accompaniment-only: {}",
                    path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
                )),
                Err(e) => self
                    .session
                    .warn(format!("  [WARN] Failed to save accompaniment: {e}")),
            }
        }

        if self.replace {
            self.session
                .info("  [VOCAL-FIRST] Accompaniment computed (vocals removed)");
            Some(accompaniment)
        } else {
            None
        }
    }

    fn accompaniment(
        &self,
        original: &Waveform,
        models: ModelSet<'_>,
        quality: PassParams,
    ) -> Result<Waveform> {
        let result = SeparationEngine::new(self.session).separate(
            original,
            models,
            self.pass_params(quality),
        )?;
        result
            .accompaniment()
            .ok_or_else(|| StemError::Inference("no sources to build an accompaniment".into()))
    }

    /// Re-infers the vocal source from the original mix.
    pub fn recover_vocals(
        &self,
        original: &Waveform,
        models: ModelSet<'_>,
        quality: PassParams,
    ) -> Result<Waveform> {
        self.session
            .info("  [VOCAL-FIRST] Extracting vocals from initial separation...");
        let result = SeparationEngine::new(self.session).separate(
            original,
            models,
            self.pass_params(quality),
        )?;
        let vocals = result
            .sources()
            .source(VOCAL_INDEX, original.sample_rate())
            .filter(|_| result.layout().get(VOCAL_INDEX) == Some(&StemKind::Vocals))
            .ok_or_else(|| StemError::Inference("vocal source missing from output".into()))?;
        self.session.info("  [VOCAL-FIRST] Got vocals from initial pass");
        Ok(vocals)
    }
}
