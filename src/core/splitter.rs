//! Batch orchestration: one file at a time through ingest, the optional
//! vocal-first pass, separation, post-processing and transcription.

use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::{
    core::{
        audio::{ingest, write_wav},
        buffer::Waveform,
        engine::{ModelSet, SeparationEngine, SeparationResult},
        postprocess::{SkipReason, SkippedStem, StemPostProcessor},
        transcribe::MidiTranscriber,
        vocal_first::VocalFirstStage,
    },
    error::{Result, StemError},
    model::{
        selector::{load_first, select},
        ModelLoader, SeparationModel,
    },
    session::{FileProgress, PipelineEvent, Session},
    types::{PassParams, StemKind, StemSettings},
};

#[derive(Clone, Debug, PartialEq)]
pub enum FileOutcome {
    Processed {
        stems: Vec<PathBuf>,
        midi: Vec<PathBuf>,
        accompaniment: Option<PathBuf>,
        skipped: Vec<SkippedStem>,
        /// Inference chunks used by the main separation.
        chunks: usize,
    },
    Failed {
        reason: String,
        skipped: Vec<SkippedStem>,
    },
    NotProcessed,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FileReport {
    pub path: PathBuf,
    pub outcome: FileOutcome,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchSummary {
    pub processed: usize,
    pub failed: usize,
    pub not_processed: usize,
    pub cancelled: bool,
    pub files: Vec<FileReport>,
}

impl BatchSummary {
    fn record(&mut self, path: &Path, outcome: FileOutcome) {
        match outcome {
            FileOutcome::Processed { .. } => self.processed += 1,
            FileOutcome::Failed { .. } => self.failed += 1,
            FileOutcome::NotProcessed => self.not_processed += 1,
        }
        self.files.push(FileReport {
            path: path.to_path_buf(),
            outcome,
        });
    }

    pub fn outcome(&self, path: &Path) -> Option<&FileOutcome> {
        self.files.iter().find(|r| r.path == path).map(|r| &r.outcome)
    }
}

/// Runs the whole pipeline over `files`.
///
/// Per-file problems are recorded in the summary; `Err` is returned only for
/// conditions that stop the batch: invalid settings, an unwritable output
/// directory or no loadable model.
pub fn submit(
    files: &[PathBuf],
    settings: &StemSettings,
    loader: &dyn ModelLoader,
    session: &Session,
) -> Result<BatchSummary> {
    settings.validate()?;
    let out_root = PathBuf::from(&settings.output_dir);
    ensure_writable(&out_root)?;

    let mut summary = BatchSummary::default();
    if session.is_cancelled() {
        session.warn("[!] Cancelled before start");
        for path in files {
            summary.record(path, FileOutcome::NotProcessed);
        }
        summary.cancelled = true;
        session.emit(PipelineEvent::BatchFinished(summary.clone()));
        return Ok(summary);
    }

    let plan = select(settings);
    let primary = load_first(&plan, loader, session)?;
    let partner = load_partner(plan.ensemble, primary.as_ref(), loader, session);
    let models = if plan.is_ensemble() {
        session.info("[ENSEMBLE] Using ensemble settings (shifts>=1, overlap>=0.25)");
        ModelSet::ensemble(primary.as_ref(), partner.as_deref())
    } else {
        ModelSet::single(primary.as_ref())
    };
    let params = plan.params(settings.pass_params());
    session.info(format!(
        "[*] Quality: shifts={}, overlap={:.2}",
        params.shifts, params.overlap
    ));

    let batch = Batch {
        settings,
        session,
        models,
        params,
        out_root,
        post: StemPostProcessor::new(session.config(), settings),
        transcriber: MidiTranscriber::new(),
    };

    for (index, path) in files.iter().enumerate() {
        if session.is_cancelled() {
            summary.cancelled = true;
            summary.record(path, FileOutcome::NotProcessed);
            continue;
        }
        let outcome = batch.process_file(path, index, files.len());
        session.emit(PipelineEvent::FileFinished {
            path: path.clone(),
            outcome: outcome.clone(),
        });
        summary.record(path, outcome);
    }
    if summary.cancelled {
        session.warn("[!] Processing stopped by user");
    }

    session.info(format!(
        "\n[DONE] {} processed, {} failed, {} not processed",
        summary.processed, summary.failed, summary.not_processed
    ));
    session.emit(PipelineEvent::BatchFinished(summary.clone()));
    Ok(summary)
}

fn ensure_writable(dir: &Path) -> Result<()> {
    let not_writable = |_| StemError::OutputNotWritable {
        path: dir.to_path_buf(),
    };
    fs::create_dir_all(dir).map_err(not_writable)?;
    tempfile::Builder::new()
        .prefix(".stem-weaver-probe")
        .tempfile_in(dir)
        .map_err(not_writable)?;
    Ok(())
}

fn load_partner(
    ensemble: Option<&str>,
    primary: &dyn SeparationModel,
    loader: &dyn ModelLoader,
    session: &Session,
) -> Option<Box<dyn SeparationModel>> {
    let id = ensemble?;
    if primary.descriptor().id == id {
        return None;
    }
    match loader.load(id, session.device()) {
        Ok(model) if model.descriptor().layout == primary.descriptor().layout => Some(model),
        Ok(_) => {
            session.warn(format!(
                "[ENSEMBLE] {id} has a different stem layout, using primary model only"
            ));
            None
        }
        Err(e) => {
            session.warn(format!(
                "[ENSEMBLE] Failed to load {id}: {e:#}; using primary model only"
            ));
            None
        }
    }
}

struct Batch<'a> {
    settings: &'a StemSettings,
    session: &'a Session,
    models: ModelSet<'a>,
    params: PassParams,
    out_root: PathBuf,
    post: StemPostProcessor,
    transcriber: MidiTranscriber,
}

/// Output directory of one file, created on the first write.
struct FileOutput {
    dir: PathBuf,
    name: String,
}

impl FileOutput {
    fn path(&self, suffix: &str, ext: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        Ok(self.dir.join(format!("{}_{suffix}.{ext}", self.name)))
    }

    fn write_wav(&self, suffix: &str, wave: &Waveform) -> Result<PathBuf> {
        let path = self.path(suffix, "wav")?;
        write_wav(&path, wave)?;
        Ok(path)
    }
}

impl Batch<'_> {
    fn process_file(&self, path: &Path, index: usize, count: usize) -> FileOutcome {
        let session = self.session;
        let mut progress = FileProgress::start(session, index, count);
        let display = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        session.info(format!("\n[{}/{}] {display}", index + 1, count));

        let original = match ingest(path, session.config()) {
            Ok(wave) => wave,
            Err(e) => {
                session.error(format!("  [ERROR] {e}"));
                return FileOutcome::Failed {
                    reason: e.to_string(),
                    skipped: Vec::new(),
                };
            }
        };
        session.info(format!(
            "  Loaded {:.1}s @ {}Hz",
            original.duration_secs(),
            original.sample_rate()
        ));
        progress.advance(0.1);

        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output".into());
        let output = FileOutput {
            dir: self.out_root.join(&name),
            name,
        };

        let stage = VocalFirstStage::from_settings(session, self.settings);
        let mut accompaniment = None;
        let replacement = stage.as_ref().and_then(|stage| {
            stage.run(&original, self.models, self.params, &mut |acc| {
                let p = output.write_wav("accompaniment", acc)?;
                accompaniment = Some(p.clone());
                Ok(p)
            })
        });
        // Vocals are re-inferred from the original only when the main pass
        // ran on the accompaniment.
        let stage = stage.filter(|_| replacement.is_some());
        let working = replacement.unwrap_or_else(|| original.clone());
        progress.advance(0.2);

        if session.is_cancelled() {
            return FileOutcome::NotProcessed;
        }
        session.info("  Running AI separation...");
        if self.params.shifts > 0 {
            session.info(format!(
                "  Multi-pass mode: {} shifts for cleaner output",
                self.params.shifts
            ));
        }
        let result = SeparationEngine::new(session).separate_with_progress(
            &working,
            self.models,
            self.params,
            &mut |f| progress.advance(0.2 + 0.6 * f),
        );
        let result = match result {
            Ok(r) => r,
            Err(StemError::Cancelled) => return FileOutcome::NotProcessed,
            Err(e) => {
                session.error(format!("  [ERROR] Separation failed: {e}"));
                return FileOutcome::Failed {
                    reason: e.to_string(),
                    skipped: Vec::new(),
                };
            }
        };
        drop(working);

        let mut stems = Vec::new();
        let mut midi = Vec::new();
        let mut skipped = Vec::new();
        let wanted = &self.settings.stems;
        for (i, &kind) in wanted.iter().enumerate() {
            if session.is_cancelled() {
                break;
            }
            let raw = match self.stem_source(kind, &result, &original, stage.as_ref()) {
                Ok(raw) => raw,
                Err(skip) => {
                    session.info(format!("  [SKIP] {skip}"));
                    skipped.push(skip);
                    continue;
                }
            };
            let clean = match self.post.process(kind, &raw, session) {
                Ok(clean) => clean,
                Err(skip) => {
                    session.info(format!("  [SKIP] {skip}"));
                    skipped.push(skip);
                    continue;
                }
            };
            match output.write_wav(kind.label(), &clean) {
                Ok(p) => {
                    session.info(format!("  [+] {}_{}.wav", output.name, kind.label()));
                    stems.push(p);
                }
                Err(e) => {
                    session.error(format!("  [ERROR] Failed to save {kind}: {e}"));
                    continue;
                }
            }
            if self.settings.export_midi {
                if let Some(p) = self.export_midi(kind, &clean, &output) {
                    midi.push(p);
                }
            }
            progress.advance(0.8 + 0.2 * (i + 1) as f32 / wanted.len() as f32);
        }

        if stems.is_empty() {
            if session.is_cancelled() {
                return FileOutcome::NotProcessed;
            }
            session.error("  [ERROR] No stems were saved");
            return FileOutcome::Failed {
                reason: "no stems saved".into(),
                skipped,
            };
        }
        progress.advance(1.0);
        session.info(format!(
            "  [OK] {} stems saved, {} skipped",
            stems.len(),
            skipped.len()
        ));
        FileOutcome::Processed {
            stems,
            midi,
            accompaniment,
            skipped,
            chunks: result.chunks(),
        }
    }

    fn stem_source(
        &self,
        kind: StemKind,
        result: &SeparationResult,
        original: &Waveform,
        vocal_first: Option<&VocalFirstStage<'_>>,
    ) -> std::result::Result<Waveform, SkippedStem> {
        let skip = |reason| SkippedStem {
            stem: kind,
            reason,
            peak: 0.0,
        };
        match vocal_first {
            Some(stage) if kind == StemKind::Vocals => stage
                .recover_vocals(original, self.models, self.params)
                .map_err(|e| {
                    self.session
                        .warn(format!("  [SKIP] Vocal retrieval failed: {e}"));
                    skip(SkipReason::RetrievalFailed)
                }),
            _ => result.stem(kind).ok_or_else(|| skip(SkipReason::Unavailable)),
        }
    }

    fn export_midi(&self, kind: StemKind, clean: &Waveform, output: &FileOutput) -> Option<PathBuf> {
        let path = match output.path(kind.label(), "mid") {
            Ok(p) => p,
            Err(e) => {
                self.session.warn(format!("  [WARN] MIDI export failed for {kind}: {e}"));
                return None;
            }
        };
        match self.transcriber.export(kind, clean, &path) {
            Ok(notes) => {
                self.session
                    .info(format!("  [MIDI] {}_{}.mid ({notes} notes)", output.name, kind.label()));
                Some(path)
            }
            Err(e) => {
                self.session
                    .warn(format!("  [WARN] MIDI export failed for {kind}: {e}"));
                None
            }
        }
    }
}
