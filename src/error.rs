use std::path::PathBuf;

/// Errors raised while generating and fitting dubbed audio.
#[derive(Debug, thiserror::Error)]
pub enum DubError {
    #[error("Synthesis failed for line {number} segment {segment}: {reason}")]
    SynthesisFailure {
        number: u32,
        segment: usize,
        reason: String,
    },

    #[error(
        "Speed adjustment failed after {attempts} attempts: input={}, output={}, speed factor={factor}: {reason}",
        input.display(),
        output.display()
    )]
    StretchProcessFailure {
        input: PathBuf,
        output: PathBuf,
        factor: f64,
        attempts: u32,
        reason: String,
    },

    #[error(
        "Audio duration abnormal: input={}, output={}, speed factor={factor}, input duration={input_duration:.2}s, output duration={output_duration:.2}s, expected={expected:.2}s",
        input.display(),
        output.display()
    )]
    DurationAbnormal {
        input: PathBuf,
        output: PathBuf,
        factor: f64,
        input_duration: f64,
        output_duration: f64,
        expected: f64,
    },

    #[error(
        "Chunk {first} to {last} exceeds the chunk end time {target_end:.2}s with current time {reached:.2}s (overrun {overrun:.3}s)"
    )]
    ChunkOverrun {
        first: u32,
        last: u32,
        target_end: f64,
        reached: f64,
        overrun: f64,
    },

    #[error("Chunk {first} to {last} cannot be reconciled: {reason}")]
    InvalidChunk { first: u32, last: u32, reason: String },

    #[error("Invalid task ledger: {0}")]
    Ledger(String),

    #[error("Audio error for {}: {reason}", path.display())]
    Audio { path: PathBuf, reason: String },

    #[error("Generation worker failed: {0}")]
    Worker(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DubError {
    /// Wrap an adapter failure for a given file, keeping the whole context chain.
    pub(crate) fn audio(path: impl Into<PathBuf>, err: anyhow::Error) -> Self {
        Self::Audio {
            path: path.into(),
            reason: format!("{:#}", err),
        }
    }
}

pub type Result<T, E = DubError> = std::result::Result<T, E>;
