use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

/// How clip durations are measured
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default)]
pub enum ProbeKind {
    #[default]
    /// Read the WAV header directly
    Wav,
    /// Ask ffprobe (works for any container)
    Ffprobe,
}

/// Empirically chosen limits for stretching and chunk fitting.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    /// Speed factors this close to 1.0 copy the clip instead of stretching
    pub unity_epsilon: f64,
    /// Output longer than `expected * abnormal_ratio` is abnormal
    pub abnormal_ratio: f64,
    /// Inputs shorter than this may be trimmed instead of rejected
    pub short_clip_secs: f64,
    /// Largest overshoot of a short clip that is trimmed away
    pub short_clip_trim_secs: f64,
    /// Total runs of the stretch utility before giving up
    pub stretch_attempts: u32,
    pub retry_backoff: Duration,
    /// Safety margin subtracted from the chunk budget when picking a factor
    pub speed_margin: f64,
    /// Largest chunk overrun that is fixed by truncating the last clip
    pub max_overrun: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            unity_epsilon: 0.001,
            abnormal_ratio: 1.02,
            short_clip_secs: 3.0,
            short_clip_trim_secs: 0.1,
            stretch_attempts: 2,
            retry_backoff: Duration::from_secs(1),
            speed_margin: 0.1,
            max_overrun: 0.6,
        }
    }
}

/// Knobs for the generation engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationSettings {
    /// Lines synthesized one at a time before the pool starts
    pub warmup_size: usize,
    pub max_workers: usize,
    /// Force a single worker regardless of `max_workers`
    pub serialize_backend: bool,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            warmup_size: 5,
            max_workers: 4,
            serialize_backend: false,
        }
    }
}

/// Knobs for chunk reconciliation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconcileSettings {
    /// Highest speed factor considered comfortable
    pub accept: f64,
    /// Lowest speed factor ever applied
    pub min_speed: f64,
    pub thresholds: Thresholds,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            accept: 1.2,
            min_speed: 1.0,
            thresholds: Thresholds::default(),
        }
    }
}

/// Parse a speed factor, which must be a positive finite number
fn positive_f64(value: &str) -> Result<f64, String> {
    let parsed: f64 = value
        .parse()
        .map_err(|e| format!("`{}` is not a number: {}", value, e))?;
    if !parsed.is_finite() || parsed <= 0.0 {
        return Err(format!("`{}` must be a positive number", value));
    }
    Ok(parsed)
}

#[derive(Parser, Debug)]
#[command(name = "autodub")]
#[command(version, about = "Synthesize dubbed speech per subtitle line and fit it onto the original timeline")]
pub struct Config {
    /// Task ledger (JSON array of line tasks); updated in place
    #[arg(value_name = "TASKS")]
    pub tasks: PathBuf,

    /// Directory holding reference clips named <number>.wav (default: <TASKS dir>/refers)
    #[arg(long, value_name = "DIR")]
    pub refers_dir: Option<PathBuf>,

    /// Directory for raw synthesized clips (default: <TASKS dir>/tmp)
    #[arg(long, value_name = "DIR")]
    pub tmp_dir: Option<PathBuf>,

    /// Directory for speed-adjusted clips (default: <TASKS dir>/segs)
    #[arg(long, value_name = "DIR")]
    pub segs_dir: Option<PathBuf>,

    /// Also write an SRT file of the dubbed timeline
    #[arg(long, value_name = "FILE")]
    pub srt_output: Option<PathBuf>,

    /// Text-to-speech program, run once per segment
    #[arg(long, env = "AUTODUB_TTS_COMMAND", value_name = "PROGRAM")]
    pub tts_command: PathBuf,

    /// Arguments for the TTS program; {text}, {reference}, {reference_text} and {output} are substituted
    #[arg(
        long = "tts-arg",
        value_name = "ARG",
        allow_hyphen_values = true,
        default_values_t = ["{text}".to_string(), "{reference}".to_string(), "{output}".to_string()]
    )]
    pub tts_args: Vec<String>,

    /// The TTS backend keeps state between calls and must not run concurrently
    #[arg(long, env = "AUTODUB_TTS_STATEFUL")]
    pub tts_stateful: bool,

    /// Lines synthesized sequentially before switching to the worker pool
    #[arg(long, default_value_t = 5)]
    pub warmup_size: usize,

    /// Worker pool width for synthesis
    #[arg(long, env = "AUTODUB_MAX_WORKERS", default_value_t = 4)]
    pub max_workers: usize,

    /// Run every synthesis on a single worker
    #[arg(long)]
    pub serialize_tts: bool,

    /// Highest comfortable speed factor
    #[arg(long, env = "AUTODUB_SPEED_ACCEPT", default_value_t = 1.2, value_parser = positive_f64)]
    pub speed_accept: f64,

    /// Lowest speed factor applied
    #[arg(long, env = "AUTODUB_SPEED_MIN", default_value_t = 1.0, value_parser = positive_f64)]
    pub speed_min: f64,

    /// Largest chunk overrun in seconds fixed by truncating the last clip
    #[arg(long, default_value_t = 0.6)]
    pub max_overrun: f64,

    /// Clips shorter than this (seconds) may be trimmed after stretching
    #[arg(long, default_value_t = 3.0)]
    pub short_clip_secs: f64,

    /// Largest stretch overshoot in seconds trimmed from a short clip
    #[arg(long, default_value_t = 0.1)]
    pub short_clip_trim: f64,

    /// Runs of the stretch utility before giving up
    #[arg(long, default_value_t = 2)]
    pub stretch_attempts: u32,

    /// Pause between stretch attempts, in milliseconds
    #[arg(long, value_name = "MS", default_value_t = 1000)]
    pub retry_backoff_ms: u64,

    /// Speed factors within this distance of 1.0 copy the clip unchanged
    #[arg(long, default_value_t = 0.001)]
    pub unity_epsilon: f64,

    /// Stretched output longer than expected times this ratio is abnormal
    #[arg(long, default_value_t = 1.02)]
    pub abnormal_ratio: f64,

    /// Seconds subtracted from a chunk's budget when picking its speed factor
    #[arg(long, default_value_t = 0.1)]
    pub speed_margin: f64,

    /// ffmpeg binary used for time stretching
    #[arg(long, value_name = "PATH", default_value = "ffmpeg")]
    pub ffmpeg: PathBuf,

    /// ffprobe binary used with --probe ffprobe
    #[arg(long, value_name = "PATH", default_value = "ffprobe")]
    pub ffprobe: PathBuf,

    /// How clip durations are measured
    #[arg(long, value_enum, default_value = "wav")]
    pub probe: ProbeKind,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

impl Config {
    fn base_dir(&self) -> PathBuf {
        self.tasks
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn refers_dir(&self) -> PathBuf {
        self.refers_dir
            .clone()
            .unwrap_or_else(|| self.base_dir().join("refers"))
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.tmp_dir.clone().unwrap_or_else(|| self.base_dir().join("tmp"))
    }

    pub fn segs_dir(&self) -> PathBuf {
        self.segs_dir.clone().unwrap_or_else(|| self.base_dir().join("segs"))
    }

    pub fn generation_settings(&self) -> GenerationSettings {
        GenerationSettings {
            warmup_size: self.warmup_size,
            max_workers: self.max_workers.max(1),
            serialize_backend: self.serialize_tts,
        }
    }

    pub fn reconcile_settings(&self) -> ReconcileSettings {
        ReconcileSettings {
            accept: self.speed_accept,
            min_speed: self.speed_min,
            thresholds: Thresholds {
                unity_epsilon: self.unity_epsilon,
                abnormal_ratio: self.abnormal_ratio,
                short_clip_secs: self.short_clip_secs,
                short_clip_trim_secs: self.short_clip_trim,
                stretch_attempts: self.stretch_attempts.max(1),
                retry_backoff: Duration::from_millis(self.retry_backoff_ms),
                speed_margin: self.speed_margin,
                max_overrun: self.max_overrun,
            },
        }
    }
}
