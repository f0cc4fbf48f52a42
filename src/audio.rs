use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use tracing::debug;

/// Where raw and speed-adjusted clips live, keyed by line number and segment index
#[derive(Debug, Clone)]
pub struct ClipLayout {
    tmp_dir: PathBuf,
    segs_dir: PathBuf,
}

impl ClipLayout {
    pub fn new(tmp_dir: impl Into<PathBuf>, segs_dir: impl Into<PathBuf>) -> Self {
        Self {
            tmp_dir: tmp_dir.into(),
            segs_dir: segs_dir.into(),
        }
    }

    pub fn create_dirs(&self) -> Result<()> {
        for dir in [&self.tmp_dir, &self.segs_dir] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory {}", dir.display()))?;
        }
        Ok(())
    }

    /// Synthesized clip before any speed change
    pub fn raw_clip(&self, number: u32, segment: usize) -> PathBuf {
        self.tmp_dir.join(format!("{}_{}_temp.wav", number, segment))
    }

    /// Clip after speed adjustment, ready for muxing
    pub fn final_clip(&self, number: u32, segment: usize) -> PathBuf {
        self.segs_dir.join(format!("{}_{}.wav", number, segment))
    }
}

/// Reports the playback length of an audio clip
pub trait DurationProbe: Send + Sync {
    /// Duration of the clip at `path` in seconds
    fn duration(&self, path: &Path) -> Result<f64>;
}

/// Reads the duration straight from a WAV header
#[derive(Debug, Clone, Copy, Default)]
pub struct WavProbe;

impl DurationProbe for WavProbe {
    fn duration(&self, path: &Path) -> Result<f64> {
        let reader = hound::WavReader::open(path)
            .with_context(|| format!("Failed to open WAV file {}", path.display()))?;
        let spec = reader.spec();
        Ok(reader.duration() as f64 / spec.sample_rate as f64)
    }
}

/// Asks `ffprobe` for the container duration, for clips that are not plain WAV
#[derive(Debug, Clone)]
pub struct FfprobeProbe {
    program: PathBuf,
}

impl FfprobeProbe {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for FfprobeProbe {
    fn default() -> Self {
        Self::new("ffprobe")
    }
}

impl DurationProbe for FfprobeProbe {
    fn duration(&self, path: &Path) -> Result<f64> {
        let output = Command::new(&self.program)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(path)
            .output()
            .with_context(|| format!("Failed to run ffprobe for {}", path.display()))?;

        if !output.status.success() {
            anyhow::bail!(
                "ffprobe failed for {}: {}",
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let duration_str = String::from_utf8_lossy(&output.stdout);
        duration_str
            .trim()
            .parse()
            .context("Failed to parse ffprobe duration as f64")
    }
}

/// Cut a WAV file in place so that it lasts `keep_secs` seconds.
/// Clips already shorter than that are left untouched.
pub fn trim_wav(path: &Path, keep_secs: f64) -> Result<()> {
    let mut reader = hound::WavReader::open(path)
        .with_context(|| format!("Failed to open WAV file {}", path.display()))?;
    let spec = reader.spec();

    let keep_frames = (keep_secs.max(0.0) * spec.sample_rate as f64).round() as u32;
    if keep_frames >= reader.duration() {
        return Ok(());
    }
    let keep_samples = keep_frames as usize * spec.channels as usize;

    let tmp_path = path.with_extension("trim.wav");
    {
        let mut writer = hound::WavWriter::create(&tmp_path, spec)
            .context("Failed to create trimmed WAV file")?;

        match spec.sample_format {
            hound::SampleFormat::Int => {
                for sample in reader.samples::<i32>().take(keep_samples) {
                    let value = sample.context("Failed to read sample")?;
                    writer.write_sample(value).context("Failed to write audio sample")?;
                }
            }
            hound::SampleFormat::Float => {
                for sample in reader.samples::<f32>().take(keep_samples) {
                    let value = sample.context("Failed to read sample")?;
                    writer.write_sample(value).context("Failed to write audio sample")?;
                }
            }
        }

        writer.finalize().context("Failed to finalize WAV file")?;
    }
    drop(reader);

    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("Failed to replace {} with trimmed clip", path.display()))?;
    debug!("Trimmed {} to {:.3}s", path.display(), keep_secs);
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::Path;

    pub const SAMPLE_RATE: u32 = 16000;

    /// Write a mono 16-bit WAV of silence lasting `secs`
    pub fn write_silence(path: &Path, secs: f64) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        let frames = (secs * SAMPLE_RATE as f64).round() as u32;
        for i in 0..frames {
            writer.write_sample(((i % 64) as i16) - 32).unwrap();
        }
        writer.finalize().unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::write_silence;
    use super::*;

    #[test]
    fn test_wav_probe_reports_duration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.wav");
        write_silence(&path, 2.5);

        let secs = WavProbe.duration(&path).unwrap();
        assert!((secs - 2.5).abs() < 1e-3);
    }

    #[test]
    fn test_wav_probe_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(WavProbe.duration(&dir.path().join("missing.wav")).is_err());
    }

    #[test]
    fn test_trim_wav_shortens_clip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.wav");
        write_silence(&path, 3.0);

        trim_wav(&path, 2.25).unwrap();
        assert!((WavProbe.duration(&path).unwrap() - 2.25).abs() < 1e-3);
        assert!(!dir.path().join("clip.trim.wav").exists());
    }

    #[test]
    fn test_trim_wav_never_extends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.wav");
        write_silence(&path, 1.0);

        trim_wav(&path, 4.0).unwrap();
        assert!((WavProbe.duration(&path).unwrap() - 1.0).abs() < 1e-3);
    }
}
