mod common;

use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use common::*;
use stem_weaver::{
    core::postprocess::SkipReason, read_audio, submit, types::Device, CancellationToken, FileOutcome,
    PipelineConfig, PipelineEvent, Session, StemError, StemKind, StemSettings, Waveform,
};
use tempfile::{tempdir, TempDir};

struct Fixture {
    tmp: TempDir,
}

impl Fixture {
    fn new() -> Self {
        Self {
            tmp: tempdir().unwrap(),
        }
    }

    fn input(&self, name: &str, wave: &Waveform) -> PathBuf {
        let path = self.tmp.path().join(name);
        write_wav(&path, wave);
        path
    }

    fn out(&self) -> PathBuf {
        self.tmp.path().join("out")
    }

    fn settings(&self) -> StemSettings {
        StemSettings {
            output_dir: self.out().to_string_lossy().into_owned(),
            ..StemSettings::default()
        }
    }
}

fn session() -> Session {
    Session::new(Device::Cpu, PipelineConfig::default())
}

fn four_stem_loader() -> MockLoader {
    MockLoader::new(&[("htdemucs", FOUR_GAINS)])
}

fn peak_of(path: &Path) -> f32 {
    let audio = read_audio(path).unwrap();
    audio.samples.iter().fold(0.0f32, |m, x| m.max(x.abs()))
}

#[test]
fn normal_run_writes_every_requested_stem() {
    let fx = Fixture::new();
    let song = fx.input("song.wav", &sine(220.0, 1.0, 0.5));
    let loader = four_stem_loader();

    let summary = submit(&[song.clone()], &fx.settings(), &loader, &session()).unwrap();

    assert_eq!(summary.processed, 1);
    assert_eq!(*loader.requested.borrow(), vec!["htdemucs".to_string()]);
    let Some(FileOutcome::Processed {
        stems,
        skipped,
        chunks,
        accompaniment,
        ..
    }) = summary.outcome(&song)
    else {
        panic!("song was not processed: {:?}", summary.outcome(&song));
    };
    assert_eq!(*chunks, 1);
    assert!(skipped.is_empty());
    assert!(accompaniment.is_none());
    assert_eq!(stems.len(), 4);
    for kind in StemKind::BASE {
        let path = fx.out().join("song").join(format!("song_{}.wav", kind.label()));
        assert!(path.exists(), "missing {}", path.display());
        assert!((peak_of(&path) - 0.95).abs() < 0.01);
    }
}

#[test]
fn stems_outside_the_model_layout_are_skipped() {
    let fx = Fixture::new();
    let song = fx.input("song.wav", &sine(220.0, 1.0, 0.5));
    let settings = StemSettings {
        stems: vec![StemKind::Drums, StemKind::Guitar],
        ..fx.settings()
    };

    let summary = submit(&[song.clone()], &settings, &four_stem_loader(), &session()).unwrap();

    match summary.outcome(&song) {
        Some(FileOutcome::Processed { stems, skipped, .. }) => {
            assert_eq!(stems.len(), 1);
            assert_eq!(skipped.len(), 1);
            assert_eq!(skipped[0].stem, StemKind::Guitar);
            assert_eq!(skipped[0].reason, SkipReason::Unavailable);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[test]
fn silent_input_fails_without_creating_a_directory() {
    let fx = Fixture::new();
    let silent = fx.input("silent.wav", &Waveform::silence(SR as usize, SR));

    let summary = submit(&[silent.clone()], &fx.settings(), &four_stem_loader(), &session()).unwrap();

    assert_eq!(summary.failed, 1);
    match summary.outcome(&silent) {
        Some(FileOutcome::Failed { skipped, .. }) => {
            assert_eq!(skipped.len(), 4);
            assert!(skipped.iter().all(|s| s.reason == SkipReason::Silent));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(!fx.out().join("silent").exists());
}

#[test]
fn vocal_first_exports_the_accompaniment() {
    let fx = Fixture::new();
    let song = fx.input("song.wav", &sine(220.0, 1.0, 0.5));
    let settings = StemSettings {
        stems: vec![StemKind::Vocals, StemKind::Bass],
        vocal_first: true,
        export_accompaniment: true,
        ..fx.settings()
    };

    let summary = submit(&[song.clone()], &settings, &four_stem_loader(), &session()).unwrap();

    match summary.outcome(&song) {
        Some(FileOutcome::Processed {
            stems,
            accompaniment: Some(acc),
            ..
        }) => {
            assert_eq!(stems.len(), 2);
            assert_eq!(acc, &fx.out().join("song").join("song_accompaniment.wav"));
            assert!(acc.exists());
            // drums + bass + other gains sum to one
            assert!((peak_of(acc) - 0.5).abs() < 0.01);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(fx.out().join("song").join("song_Vocals.wav").exists());
}

#[test]
fn accompaniment_export_alone_keeps_the_original_mix() {
    let fx = Fixture::new();
    let song = fx.input("song.wav", &sine(220.0, 1.0, 0.5));
    let settings = StemSettings {
        stems: vec![StemKind::Drums],
        export_accompaniment: true,
        ..fx.settings()
    };

    let summary = submit(&[song.clone()], &settings, &four_stem_loader(), &session()).unwrap();

    assert!(matches!(
        summary.outcome(&song),
        Some(FileOutcome::Processed {
            accompaniment: Some(_),
            ..
        })
    ));
}

#[test]
fn unavailable_model_aborts_the_batch() {
    let fx = Fixture::new();
    let song = fx.input("song.wav", &sine(220.0, 1.0, 0.5));
    let loader = MockLoader::empty();

    let err = submit(&[song], &fx.settings(), &loader, &session()).unwrap_err();

    assert!(err.is_batch_fatal());
    match err {
        StemError::ModelUnavailable { tried } => assert_eq!(tried, "htdemucs, htdemucs_ft"),
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(loader.requested.borrow().len(), 2);
}

#[test]
fn balanced_falls_back_to_the_second_candidate() {
    let fx = Fixture::new();
    let song = fx.input("song.wav", &sine(220.0, 1.0, 0.5));
    let loader = MockLoader::new(&[("htdemucs_ft", FOUR_GAINS)]);

    let summary = submit(&[song], &fx.settings(), &loader, &session()).unwrap();

    assert_eq!(summary.processed, 1);
    assert_eq!(
        *loader.requested.borrow(),
        vec!["htdemucs".to_string(), "htdemucs_ft".to_string()]
    );
}

#[test]
fn cancelled_batch_loads_no_model() {
    let fx = Fixture::new();
    let a = fx.input("a.wav", &sine(220.0, 1.0, 0.5));
    let b = fx.input("b.wav", &sine(330.0, 1.0, 0.5));
    let loader = four_stem_loader();
    let token = CancellationToken::new();
    let session = session().with_cancellation(token.clone());
    token.cancel();

    let summary = submit(&[a, b], &fx.settings(), &loader, &session).unwrap();

    assert!(summary.cancelled);
    assert_eq!(summary.not_processed, 2);
    assert_eq!(summary.processed + summary.failed, 0);
    assert!(loader.requested.borrow().is_empty());
}

#[test]
fn undecodable_file_does_not_stop_the_batch() {
    let fx = Fixture::new();
    let broken = fx.tmp.path().join("broken.wav");
    std::fs::write(&broken, vec![0u8; 500]).unwrap();
    let song = fx.input("song.wav", &sine(220.0, 1.0, 0.5));

    let summary = submit(
        &[broken.clone(), song.clone()],
        &fx.settings(),
        &four_stem_loader(),
        &session(),
    )
    .unwrap();

    assert!(matches!(summary.outcome(&broken), Some(FileOutcome::Failed { .. })));
    assert!(matches!(summary.outcome(&song), Some(FileOutcome::Processed { .. })));
    assert!(!fx.out().join("broken").exists());
}

#[test]
fn unwritable_output_is_rejected_before_loading() {
    let fx = Fixture::new();
    let song = fx.input("song.wav", &sine(220.0, 1.0, 0.5));
    let blocker = fx.tmp.path().join("blocker");
    std::fs::write(&blocker, b"not a directory").unwrap();
    let settings = StemSettings {
        output_dir: blocker.join("sub").to_string_lossy().into_owned(),
        ..StemSettings::default()
    };
    let loader = four_stem_loader();

    let err = submit(&[song], &settings, &loader, &session()).unwrap_err();

    assert!(matches!(err, StemError::OutputNotWritable { .. }));
    assert!(loader.requested.borrow().is_empty());
}

#[test]
fn invalid_settings_are_rejected() {
    let fx = Fixture::new();
    let settings = StemSettings {
        quality: 9,
        ..fx.settings()
    };
    let err = submit(&[], &settings, &four_stem_loader(), &session()).unwrap_err();
    assert!(matches!(err, StemError::InvalidSettings(_)));
}

#[test]
fn midi_is_written_next_to_the_stem() {
    let fx = Fixture::new();
    let song = fx.input("beat.wav", &clicks(22_050, 3.0));
    let settings = StemSettings {
        stems: vec![StemKind::Drums],
        export_midi: true,
        ..fx.settings()
    };

    let summary = submit(&[song.clone()], &settings, &four_stem_loader(), &session()).unwrap();

    match summary.outcome(&song) {
        Some(FileOutcome::Processed { midi, .. }) => {
            assert_eq!(midi, &vec![fx.out().join("beat").join("beat_Drums.mid")]);
            assert!(midi[0].exists());
        }
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[test]
fn events_report_monotonic_progress_and_a_final_summary() {
    let fx = Fixture::new();
    let song = fx.input("song.wav", &sine(220.0, 1.0, 0.5));
    let seen: Arc<Mutex<Vec<PipelineEvent>>> = Arc::default();
    let sink = Arc::clone(&seen);
    let session = session().with_events(Arc::new(move |e: &PipelineEvent| {
        sink.lock().unwrap().push(e.clone());
    }));

    submit(&[song], &fx.settings(), &four_stem_loader(), &session).unwrap();

    let events = seen.lock().unwrap();
    let fractions: Vec<f32> = events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::Progress { file_fraction, .. } => Some(*file_fraction),
            _ => None,
        })
        .collect();
    assert!(fractions.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(fractions.last().copied(), Some(1.0));
    assert!(events
        .iter()
        .any(|e| matches!(e, PipelineEvent::FileFinished { .. })));
    assert!(matches!(
        events.last(),
        Some(PipelineEvent::BatchFinished(s)) if s.processed == 1
    ));
}

#[test]
fn vocal_first_separates_the_accompaniment_and_recovers_vocals_from_the_mix() {
    let fx = Fixture::new();
    let song = fx.input("song.wav", &sine(220.0, 1.0, 0.5));
    let loader = RecordingLoader::new("htdemucs", SIX_GAINS, 0);
    let settings = StemSettings {
        stems: vec![StemKind::Vocals, StemKind::Bass],
        vocal_first: true,
        export_accompaniment: true,
        ..fx.settings()
    };

    let summary = submit(&[song.clone()], &settings, &loader, &session()).unwrap();

    let Some(FileOutcome::Processed {
        stems,
        accompaniment: Some(acc),
        ..
    }) = summary.outcome(&song)
    else {
        panic!("unexpected outcome {:?}", summary.outcome(&song));
    };
    assert_eq!(stems.len(), 2);
    // Non-vocal gains of the six-stem layout sum to 1.4.
    assert!((peak_of(acc) - 0.7).abs() < 0.01);

    // Pre-pass on the mix, main pass on the accompaniment, vocals on the mix.
    let peaks = loader.input_peaks();
    assert_eq!(peaks.len(), 3, "{peaks:?}");
    assert!((peaks[0] - 0.5).abs() < 0.01);
    assert!((peaks[1] - 0.7).abs() < 0.01);
    assert!((peaks[2] - 0.5).abs() < 0.01);
}

#[test]
fn failed_vocal_first_pass_takes_vocals_from_the_main_result() {
    let fx = Fixture::new();
    let song = fx.input("song.wav", &sine(220.0, 1.0, 0.5));
    let loader = RecordingLoader::new("htdemucs", FOUR_GAINS, 1);
    let settings = StemSettings {
        stems: vec![StemKind::Vocals],
        vocal_first: true,
        ..fx.settings()
    };

    let summary = submit(&[song.clone()], &settings, &loader, &session()).unwrap();

    match summary.outcome(&song) {
        Some(FileOutcome::Processed {
            stems, skipped, accompaniment, ..
        }) => {
            assert_eq!(stems.len(), 1);
            assert!(skipped.is_empty());
            assert!(accompaniment.is_none());
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    // The failed pre-pass and the main pass on the original mix, nothing else.
    let peaks = loader.input_peaks();
    assert_eq!(peaks.len(), 2, "{peaks:?}");
    assert!(peaks.iter().all(|p| (p - 0.5).abs() < 0.01));
}

#[test]
fn long_input_is_chunked_and_stems_keep_the_input_length() {
    let fx = Fixture::new();
    let song = fx.input("long.wav", &sine(220.0, 1.0, 0.5));
    let config = PipelineConfig {
        chunk_threshold_secs: 0.5,
        chunk_secs: 0.25,
        retry_chunk_secs: 0.25,
        ..PipelineConfig::default()
    };
    let session = Session::new(Device::Cpu, config);

    let summary = submit(&[song.clone()], &fx.settings(), &four_stem_loader(), &session).unwrap();

    let Some(FileOutcome::Processed { stems, chunks, .. }) = summary.outcome(&song) else {
        panic!("unexpected outcome {:?}", summary.outcome(&song));
    };
    assert_eq!(*chunks, 4);
    assert_eq!(stems.len(), 4);
    for stem in stems {
        let audio = read_audio(stem).unwrap();
        assert_eq!(audio.samples.len() / audio.channels as usize, SR as usize);
    }
}
