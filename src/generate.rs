//! Synthesis of raw speech clips for every line of the ledger.
//!
//! The first few lines run one at a time so a backend that loads its model
//! lazily does so exactly once, and so an initialization failure shows up on
//! a known line. Everything after that goes through a bounded worker pool.
//! Workers only return `(number, real_dur)`; the ledger is updated here, by a
//! single reducer, in whatever order the workers finish.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use indicatif::ProgressBar;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::audio::{ClipLayout, DurationProbe};
use crate::config::GenerationSettings;
use crate::error::{DubError, Result};
use crate::ledger::Ledger;
use crate::tts::Synthesizer;

struct LineJob {
    number: u32,
    segments: Vec<String>,
    reference_text: Option<String>,
}

/// Everything a worker needs, shared read-only across the pool
struct JobContext {
    synthesizer: Arc<dyn Synthesizer>,
    probe: Arc<dyn DurationProbe>,
    refers_dir: PathBuf,
    layout: ClipLayout,
}

fn synthesize_line(ctx: &JobContext, job: &LineJob) -> Result<(u32, f64)> {
    let failure = |segment: usize, reason: String| DubError::SynthesisFailure {
        number: job.number,
        segment,
        reason,
    };

    let reference = ctx.refers_dir.join(format!("{}.wav", job.number));
    if !reference.exists() {
        return Err(failure(
            0,
            format!("reference audio not found: {}", reference.display()),
        ));
    }

    let mut real_dur = 0.0;
    for (segment, text) in job.segments.iter().enumerate() {
        let output = ctx.layout.raw_clip(job.number, segment);
        let transcript = job.reference_text.as_deref();
        if !ctx
            .synthesizer
            .synthesize_with_transcript(text, &reference, transcript, &output)
        {
            return Err(failure(segment, "backend reported failure".into()));
        }
        let secs = ctx
            .probe
            .duration(&output)
            .map_err(|e| failure(segment, format!("{:#}", e)))?;
        debug!("Line {} segment {}: {:.2}s", job.number, segment, secs);
        real_dur += secs;
    }
    Ok((job.number, real_dur))
}

fn worker_error(e: impl std::fmt::Display) -> DubError {
    DubError::Worker(e.to_string())
}

/// Drives the synthesis backend over the whole ledger
pub struct GenerationEngine {
    synthesizer: Arc<dyn Synthesizer>,
    probe: Arc<dyn DurationProbe>,
    settings: GenerationSettings,
}

impl GenerationEngine {
    pub fn new(
        synthesizer: Arc<dyn Synthesizer>,
        probe: Arc<dyn DurationProbe>,
        settings: GenerationSettings,
    ) -> Self {
        Self {
            synthesizer,
            probe,
            settings,
        }
    }

    /// Workers used after warm-up; stateful backends always get one
    pub fn pool_width(&self) -> usize {
        if self.settings.serialize_backend || self.synthesizer.is_stateful() {
            1
        } else {
            self.settings.max_workers.max(1)
        }
    }

    /// Synthesize every segment of every line and record `real_dur`.
    ///
    /// The first failure aborts the run; pending lines are cancelled and the
    /// failing line's duration is never written.
    pub async fn run(
        &self,
        ledger: &mut Ledger,
        refers_dir: &Path,
        layout: &ClipLayout,
        progress: Option<&ProgressBar>,
    ) -> Result<()> {
        ledger.reset_real_durs();
        let total = ledger.len();
        if let Some(pb) = progress {
            pb.set_length(total as u64);
        }

        let ctx = Arc::new(JobContext {
            synthesizer: Arc::clone(&self.synthesizer),
            probe: Arc::clone(&self.probe),
            refers_dir: refers_dir.to_path_buf(),
            layout: layout.clone(),
        });

        let mut jobs = ledger
            .tasks()
            .iter()
            .map(|t| LineJob {
                number: t.number,
                segments: t.segments.clone(),
                reference_text: t.reference_text().map(str::to_owned),
            })
            .collect::<Vec<_>>()
            .into_iter();

        let warmup = self.settings.warmup_size.min(total);
        let mut completed = 0;

        for job in jobs.by_ref().take(warmup) {
            let ctx = Arc::clone(&ctx);
            let (number, real_dur) = tokio::task::spawn_blocking(move || synthesize_line(&ctx, &job))
                .await
                .map_err(worker_error)??;
            ledger.set_real_dur(number, real_dur)?;
            completed += 1;
            report(progress, completed, total);
        }

        let remaining: Vec<LineJob> = jobs.collect();
        if remaining.is_empty() {
            return Ok(());
        }

        let width = self.pool_width();
        info!(
            "Warm-up done, synthesizing {} remaining lines with {} workers",
            remaining.len(),
            width
        );

        let permits = Arc::new(Semaphore::new(width));
        let mut workers = JoinSet::new();
        for job in remaining {
            let ctx = Arc::clone(&ctx);
            let permits = Arc::clone(&permits);
            workers.spawn(async move {
                let _permit = permits.acquire_owned().await.map_err(worker_error)?;
                tokio::task::spawn_blocking(move || synthesize_line(&ctx, &job))
                    .await
                    .map_err(worker_error)?
            });
        }

        while let Some(joined) = workers.join_next().await {
            match joined.map_err(worker_error).and_then(|outcome| outcome) {
                Ok((number, real_dur)) => {
                    ledger.set_real_dur(number, real_dur)?;
                    completed += 1;
                    report(progress, completed, total);
                }
                Err(e) => {
                    workers.abort_all();
                    return Err(e);
                }
            }
        }

        Ok(())
    }
}

fn report(progress: Option<&ProgressBar>, completed: usize, total: usize) {
    match progress {
        Some(pb) => pb.set_position(completed as u64),
        None => debug!("Progress: {}/{}", completed, total),
    }
}
