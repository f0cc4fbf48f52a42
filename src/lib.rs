pub mod audio;
pub mod config;
pub mod error;
pub mod generate;
pub mod ledger;
pub mod reconcile;
pub mod srt;
pub mod stretch;
pub mod tts;

pub use audio::{trim_wav, ClipLayout, DurationProbe, FfprobeProbe, WavProbe};
pub use config::{Config, GenerationSettings, ReconcileSettings, Thresholds};
pub use error::DubError;
pub use generate::GenerationEngine;
pub use ledger::{Chunk, Ledger, LineTask};
pub use reconcile::{plan_speed, ChunkReport, Reconciler, SpeedPlan, SpeedTier};
pub use srt::Subtitle;
pub use stretch::{Adjustment, FfmpegStretcher, SpeedAdjuster, TimeStretcher};
pub use tts::{CommandSynthesizer, Synthesizer};
