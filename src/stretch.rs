use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::Context;
use tracing::{debug, info, warn};

use crate::audio::{trim_wav, DurationProbe};
use crate::config::Thresholds;
use crate::error::{DubError, Result};

/// Changes the tempo of a clip without changing its pitch
pub trait TimeStretcher: Send + Sync {
    /// Write `input` played `factor` times faster to `output`
    fn stretch(&self, input: &Path, output: &Path, factor: f64) -> anyhow::Result<()>;
}

// ffmpeg rejects a single atempo stage outside this range
const ATEMPO_MIN: f64 = 0.5;
const ATEMPO_MAX: f64 = 2.0;

/// Build an `atempo` filter chain whose stages multiply to `factor`
pub fn atempo_chain(factor: f64) -> anyhow::Result<String> {
    if !factor.is_finite() || factor <= 0.0 {
        anyhow::bail!("speed factor must be positive and finite, got {}", factor);
    }

    let mut stages = Vec::new();
    let mut remaining = factor;
    while remaining > ATEMPO_MAX {
        stages.push(ATEMPO_MAX);
        remaining /= ATEMPO_MAX;
    }
    while remaining < ATEMPO_MIN {
        stages.push(ATEMPO_MIN);
        remaining /= ATEMPO_MIN;
    }
    stages.push(remaining);

    Ok(stages
        .iter()
        .map(|s| format!("atempo={}", s))
        .collect::<Vec<_>>()
        .join(","))
}

/// Time stretching through ffmpeg's `atempo` filter
#[derive(Debug, Clone)]
pub struct FfmpegStretcher {
    program: PathBuf,
}

impl FfmpegStretcher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for FfmpegStretcher {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl TimeStretcher for FfmpegStretcher {
    fn stretch(&self, input: &Path, output: &Path, factor: f64) -> anyhow::Result<()> {
        let output_status = Command::new(&self.program)
            .arg("-i")
            .arg(input)
            .args(["-filter:a", &atempo_chain(factor)?, "-y"])
            .arg(output)
            .output()
            .with_context(|| format!("Failed to run ffmpeg on {}", input.display()))?;

        if !output_status.status.success() {
            anyhow::bail!(
                "ffmpeg exited with {}: {}",
                output_status.status,
                String::from_utf8_lossy(&output_status.stderr).trim()
            );
        }
        Ok(())
    }
}

/// What the adjuster did to produce the output clip
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Adjustment {
    /// Factor was close enough to 1.0 that the input was copied
    Copied,
    Stretched,
    /// Stretched, then cut back to the expected duration
    Trimmed { expected: f64 },
}

/// Applies a speed factor to one clip and checks the result's duration
pub struct SpeedAdjuster<'a> {
    stretcher: &'a dyn TimeStretcher,
    probe: &'a dyn DurationProbe,
    thresholds: Thresholds,
}

impl<'a> SpeedAdjuster<'a> {
    pub fn new(
        stretcher: &'a dyn TimeStretcher,
        probe: &'a dyn DurationProbe,
        thresholds: Thresholds,
    ) -> Self {
        Self {
            stretcher,
            probe,
            thresholds,
        }
    }

    pub fn probe(&self) -> &'a dyn DurationProbe {
        self.probe
    }

    pub fn adjust(&self, input: &Path, output: &Path, factor: f64) -> Result<Adjustment> {
        let t = &self.thresholds;

        if !factor.is_finite() || factor <= 0.0 {
            return Err(DubError::StretchProcessFailure {
                input: input.to_path_buf(),
                output: output.to_path_buf(),
                factor,
                attempts: 0,
                reason: "speed factor must be positive and finite".into(),
            });
        }

        if (factor - 1.0).abs() < t.unity_epsilon {
            std::fs::copy(input, output).map_err(|e| DubError::Audio {
                path: input.to_path_buf(),
                reason: format!("failed to copy to {}: {}", output.display(), e),
            })?;
            debug!("Copied {} unchanged (speed factor {})", input.display(), factor);
            return Ok(Adjustment::Copied);
        }

        let input_duration = self
            .probe
            .duration(input)
            .map_err(|e| DubError::audio(input, e))?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.stretcher.stretch(input, output, factor) {
                Ok(()) => break,
                Err(e) if attempt < t.stretch_attempts => {
                    warn!(
                        "Audio speed adjustment failed, retrying in {:?} ({}/{}): {:#}",
                        t.retry_backoff, attempt, t.stretch_attempts, e
                    );
                    std::thread::sleep(t.retry_backoff);
                }
                Err(e) => {
                    return Err(DubError::StretchProcessFailure {
                        input: input.to_path_buf(),
                        output: output.to_path_buf(),
                        factor,
                        attempts: attempt,
                        reason: format!("{:#}", e),
                    });
                }
            }
        }

        let output_duration = self
            .probe
            .duration(output)
            .map_err(|e| DubError::audio(output, e))?;
        let expected = input_duration / factor;
        let too_long = output_duration >= expected * t.abnormal_ratio;

        if too_long
            && input_duration < t.short_clip_secs
            && output_duration - expected <= t.short_clip_trim_secs
        {
            trim_wav(output, expected).map_err(|e| DubError::audio(output, e))?;
            info!("Trimmed {} to expected duration: {:.2}s", output.display(), expected);
            return Ok(Adjustment::Trimmed { expected });
        }

        if too_long {
            return Err(DubError::DurationAbnormal {
                input: input.to_path_buf(),
                output: output.to_path_buf(),
                factor,
                input_duration,
                output_duration,
                expected,
            });
        }

        Ok(Adjustment::Stretched)
    }
}
