use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use autodub::{
    audio::{ClipLayout, DurationProbe, FfprobeProbe, WavProbe},
    config::{Config, ProbeKind},
    generate::GenerationEngine,
    ledger::Ledger,
    reconcile::Reconciler,
    srt::Subtitle,
    stretch::{FfmpegStretcher, SpeedAdjuster},
    tts::CommandSynthesizer,
};

fn main() -> ExitCode {
    let config = Config::parse();

    // Set up logging
    let filter = if config.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to create Tokio runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<()> {
    if !config.tasks.exists() {
        anyhow::bail!("Task ledger does not exist: {}", config.tasks.display());
    }

    let mut ledger = Ledger::load(&config.tasks)
        .with_context(|| format!("Failed to load task ledger {}", config.tasks.display()))?;
    info!("Loaded {} line tasks", ledger.len());

    if ledger.is_empty() {
        warn!("Task ledger is empty, nothing to dub");
        return Ok(());
    }

    let layout = ClipLayout::new(config.tmp_dir(), config.segs_dir());
    layout.create_dirs()?;

    let probe: Arc<dyn DurationProbe> = match config.probe {
        ProbeKind::Wav => Arc::new(WavProbe),
        ProbeKind::Ffprobe => Arc::new(FfprobeProbe::new(&config.ffprobe)),
    };

    // Step 1: Synthesize raw clips for every line
    let synthesizer = Arc::new(CommandSynthesizer::new(
        &config.tts_command,
        config.tts_args.clone(),
        config.tts_stateful,
    ));
    let engine = GenerationEngine::new(synthesizer, Arc::clone(&probe), config.generation_settings());

    let progress = create_progress_bar("Synthesizing");
    engine
        .run(&mut ledger, &config.refers_dir(), &layout, Some(&progress))
        .await
        .context("Failed to generate speech")?;
    progress.finish();
    // Release the backend before the long reconciliation pass
    drop(engine);
    info!("Speech generation completed");

    // Step 2: Fit clips onto the timeline chunk by chunk
    let settings = config.reconcile_settings();
    let stretcher = FfmpegStretcher::new(&config.ffmpeg);
    let adjuster = SpeedAdjuster::new(&stretcher, probe.as_ref(), settings.thresholds);
    let reconciler = Reconciler::new(adjuster, &layout, settings);

    let progress = create_progress_bar("Fitting chunks");
    let reports = reconciler
        .run(&mut ledger, Some(&progress))
        .context("Failed to reconcile audio timeline")?;
    progress.finish();

    let truncated = reports.iter().filter(|r| r.truncated.is_some()).count();
    let above = reports
        .iter()
        .filter(|r| r.plan.factor > settings.accept)
        .count();
    info!(
        "Reconciled {} chunks ({} above speed {}, {} truncated)",
        reports.len(),
        above,
        settings.accept,
        truncated
    );

    // Step 3: Persist results
    ledger
        .save(&config.tasks)
        .with_context(|| format!("Failed to save task ledger {}", config.tasks.display()))?;
    info!("Saved task ledger to {}", config.tasks.display());

    if let Some(ref srt_path) = config.srt_output {
        let subtitle = Subtitle::from_ledger(&ledger);
        subtitle.to_file(srt_path)?;
        info!("Wrote {} dubbed subtitles to {}", subtitle.len(), srt_path.display());
    }

    info!("Done!");
    Ok(())
}

fn create_progress_bar(message: &str) -> ProgressBar {
    let pb = ProgressBar::new(0);
    if let Ok(style) = ProgressStyle::default_bar().template("{msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len}") {
        pb.set_style(style.progress_chars("█░"));
    }
    pb.set_message(message.to_string());
    pb
}
