use std::{path::PathBuf, process, sync::Arc};

use clap::{Parser, Subcommand};
use stem_weaver::{
    analyze,
    model::{registry, selector},
    submit, DevicePreference, FileOutcome, ModelVariant, PipelineConfig, PipelineEvent,
    ProcessLoader, Session, StemKind, StemSettings,
};

#[derive(Parser)]
#[command(name = "stem-weaver")]
#[command(about = "AI-powered audio stem separation tool", long_about = None)]
#[command(version)]
struct Cli {
    /// Pipeline configuration (JSON); defaults plus STEM_WEAVER_* overrides otherwise.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Separate one or more files into stems
    Split {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        #[arg(short, long, default_value = ".")]
        output: String,

        #[arg(short, long, value_enum, default_value_t = ModelVariant::Balanced)]
        model: ModelVariant,

        /// 1 (fastest) to 5 (cleanest)
        #[arg(long, default_value_t = 3, value_parser = clap::value_parser!(u8).range(1..=5))]
        quality: u8,

        #[arg(long, value_enum, value_delimiter = ',', default_values_t = StemKind::BASE)]
        stems: Vec<StemKind>,

        #[arg(long)]
        vocal_first: bool,

        #[arg(long)]
        export_accompaniment: bool,

        #[arg(long)]
        denoise: bool,

        #[arg(long, default_value_t = 0.08)]
        denoise_level: f32,

        #[arg(long)]
        midi: bool,

        #[arg(long, value_enum, default_value_t = DevicePreference::Cpu)]
        device: DevicePreference,

        /// Read all separation settings from a JSON file instead of flags
        #[arg(long)]
        settings: Option<PathBuf>,

        #[arg(short, long)]
        quiet: bool,
    },

    /// Analyze a track and recommend a model
    Analyze {
        input: PathBuf,

        /// Print the analysis as JSON
        #[arg(long)]
        json: bool,
    },

    /// List model variants and registry models
    Models,
}

fn main() {
    let cli = Cli::parse();

    let quiet = matches!(cli.command, Commands::Split { quiet: true, .. });
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if quiet { "warn" } else { "info" }),
    )
    .init();

    let result = load_config(cli.config.as_ref()).and_then(|config| match cli.command {
        Commands::Split {
            inputs,
            output,
            model,
            quality,
            stems,
            vocal_first,
            export_accompaniment,
            denoise,
            denoise_level,
            midi,
            device,
            settings,
            quiet,
        } => {
            let settings = match settings {
                Some(path) => StemSettings::from_json_file(&path)?,
                None => StemSettings {
                    model,
                    quality,
                    stems,
                    vocal_first,
                    export_accompaniment,
                    denoise,
                    denoise_level,
                    export_midi: midi,
                    device,
                    output_dir: output,
                },
            };
            handle_split(inputs, settings, config, quiet)
        }
        Commands::Analyze { input, json } => handle_analyze(input, &config, json),
        Commands::Models => handle_models(),
    });

    match result {
        Ok(()) => process::exit(0),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<PipelineConfig, Box<dyn std::error::Error>> {
    Ok(match path {
        Some(p) => PipelineConfig::from_json_file(p)?,
        None => PipelineConfig::from_env(),
    })
}

fn handle_split(
    inputs: Vec<PathBuf>,
    settings: StemSettings,
    config: PipelineConfig,
    quiet: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(missing) = inputs.iter().find(|p| !p.exists()) {
        return Err(format!("Input file not found: {}", missing.display()).into());
    }

    if !quiet {
        eprintln!("🎵 Stem Weaver");
        eprintln!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        eprintln!("Files:   {}", inputs.len());
        eprintln!("Output:  {}", settings.output_dir);
        eprintln!("Model:   {:?} ({})", settings.model, settings.model.description());
        eprintln!("Quality: {}/5", settings.quality);
        eprintln!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        eprintln!();
    }

    let loader = ProcessLoader::new(&config);
    let events: Option<stem_weaver::EventCallback> = if quiet {
        None
    } else {
        Some(Arc::new(print_event))
    };
    let session = Session::resolve(settings.device, &loader, config, events);

    let summary = submit(&inputs, &settings, &loader, &session)?;

    if quiet {
        for report in &summary.files {
            if let FileOutcome::Processed { stems, midi, accompaniment, .. } = &report.outcome {
                for p in stems.iter().chain(midi).chain(accompaniment) {
                    println!("{}", p.display());
                }
            }
        }
    } else {
        eprintln!();
        eprintln!(
            "✅ Done: {} processed, {} failed, {} not processed",
            summary.processed, summary.failed, summary.not_processed
        );
    }

    if summary.processed == 0 && summary.failed > 0 {
        return Err("no file was processed".into());
    }
    Ok(())
}

fn print_event(event: &PipelineEvent) {
    match event {
        PipelineEvent::Progress {
            file_index,
            file_count,
            file_fraction,
            overall,
        } => {
            eprint!(
                "\r🔄 File {}/{}: {:>3.0}% (overall {:>3.0}%)",
                file_index + 1,
                file_count,
                file_fraction * 100.0,
                overall * 100.0
            );
            if *file_fraction >= 1.0 {
                eprintln!();
            }
        }
        PipelineEvent::FileFinished { path, outcome } => match outcome {
            FileOutcome::Processed { stems, skipped, .. } => {
                eprintln!(
                    "\n💾 {}: {} stems written, {} skipped",
                    path.display(),
                    stems.len(),
                    skipped.len()
                );
            }
            FileOutcome::Failed { reason, .. } => {
                eprintln!("\n❌ {}: {reason}", path.display());
            }
            FileOutcome::NotProcessed => {
                eprintln!("\n⏭  {}: not processed", path.display());
            }
        },
        // Log lines already go through env_logger.
        PipelineEvent::Log { .. } | PipelineEvent::BatchFinished(_) => {}
    }
}

fn handle_analyze(
    input: PathBuf,
    config: &PipelineConfig,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let a = analyze(&input, config)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&a)?);
        return Ok(());
    }

    eprintln!("🔎 {}", input.display());
    eprintln!("  Duration: {:.1}s", a.duration_secs);
    eprintln!();
    eprintln!("  [FREQUENCY ANALYSIS]");
    eprintln!("  Bass (20-250 Hz):    {:.1}%", a.bass_pct);
    eprintln!("  Mids (250-4000 Hz):  {:.1}%", a.mid_pct);
    eprintln!("  Highs (4000+ Hz):    {:.1}%", a.high_pct);
    eprintln!();
    eprintln!("  [DETECTED CONTENT]");
    eprintln!("  Onsets: {}, tempo: {:.0} BPM", a.onset_count, a.tempo_bpm);
    let detected: Vec<&str> = a.detected.iter().map(|s| s.label()).collect();
    eprintln!(
        "  Suggested stems: {}",
        if detected.is_empty() { "All".into() } else { detected.join(", ") }
    );
    eprintln!();
    eprintln!("  [BEST AI MODEL FOR THIS TRACK]");
    eprintln!("  {:?}: {}", a.recommended, a.reason);
    if a.vocal_first {
        eprintln!("  Vocal-first separation is recommended for cleaner instruments");
    }
    Ok(())
}

fn handle_models() -> Result<(), Box<dyn std::error::Error>> {
    eprintln!("📋 Model Variants");
    eprintln!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    for variant in ModelVariant::ALL {
        let plan = selector::plan_for(variant);
        eprintln!(
            "  • {:<10} {} [{}]",
            format!("{variant:?}"),
            variant.description(),
            plan.candidates.join(" → ")
        );
    }

    let reg = registry::registry()?;
    eprintln!();
    eprintln!("📦 Registry");
    for entry in &reg.models {
        let marker = if entry.name == reg.default { " (default)" } else { "" };
        let segment = entry
            .segment_secs
            .map(|s| format!(", {s:.1}s segments"))
            .unwrap_or_default();
        eprintln!("  • {}{}: {}{segment}", entry.name, marker, entry.stems.join(", "));
    }
    eprintln!();
    eprintln!("Use --model <variant> to choose a variant");
    Ok(())
}
