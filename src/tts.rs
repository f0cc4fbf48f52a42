use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, warn};

/// A text-to-speech backend that clones the voice of a reference clip.
///
/// One instance is shared by every generation worker, so implementations must
/// be callable from several threads at once unless they report themselves as
/// stateful, in which case the engine never runs two calls concurrently.
pub trait Synthesizer: Send + Sync {
    /// Speak `text` in the voice of `reference`, writing a WAV to `output`.
    /// Returns `false` when the backend could not produce the clip.
    fn synthesize(&self, text: &str, reference: &Path, output: &Path) -> bool;

    /// Like [`Synthesizer::synthesize`], also passing what is said in the
    /// reference clip. Backends that cannot use a transcript ignore it.
    fn synthesize_with_transcript(
        &self,
        text: &str,
        reference: &Path,
        transcript: Option<&str>,
        output: &Path,
    ) -> bool {
        let _ = transcript;
        self.synthesize(text, reference, output)
    }

    /// Whether the backend holds state that breaks under concurrent calls
    fn is_stateful(&self) -> bool {
        false
    }
}

/// Runs an external program once per segment.
///
/// Each argument template may contain `{text}`, `{reference}`,
/// `{reference_text}` and `{output}`, which are replaced before the program is
/// spawned. `{reference_text}` becomes empty when no transcript is known.
#[derive(Debug, Clone)]
pub struct CommandSynthesizer {
    program: PathBuf,
    args: Vec<String>,
    stateful: bool,
}

impl CommandSynthesizer {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, stateful: bool) -> Self {
        Self {
            program: program.into(),
            args,
            stateful,
        }
    }

    fn render_args(&self, text: &str, reference: &Path, transcript: Option<&str>, output: &Path) -> Vec<String> {
        let reference = reference.to_string_lossy();
        let output = output.to_string_lossy();
        let transcript = transcript.unwrap_or_default();
        self.args
            .iter()
            .map(|arg| {
                // {reference_text} first, so {reference} cannot eat its prefix
                arg.replace("{reference_text}", transcript)
                    .replace("{text}", text)
                    .replace("{reference}", &reference)
                    .replace("{output}", &output)
            })
            .collect()
    }
}

impl Synthesizer for CommandSynthesizer {
    fn synthesize(&self, text: &str, reference: &Path, output: &Path) -> bool {
        self.synthesize_with_transcript(text, reference, None, output)
    }

    fn synthesize_with_transcript(
        &self,
        text: &str,
        reference: &Path,
        transcript: Option<&str>,
        output: &Path,
    ) -> bool {
        let args = self.render_args(text, reference, transcript, output);
        debug!("Running {} {:?}", self.program.display(), args);

        let result = Command::new(&self.program).args(&args).output();
        match result {
            Ok(out) if out.status.success() => {
                if output.exists() {
                    true
                } else {
                    warn!(
                        "{} exited successfully but wrote no clip to {}",
                        self.program.display(),
                        output.display()
                    );
                    false
                }
            }
            Ok(out) => {
                warn!(
                    "{} failed with {}: {}",
                    self.program.display(),
                    out.status,
                    String::from_utf8_lossy(&out.stderr).trim()
                );
                false
            }
            Err(e) => {
                warn!("Failed to run {}: {}", self.program.display(), e);
                false
            }
        }
    }

    fn is_stateful(&self) -> bool {
        self.stateful
    }
}
