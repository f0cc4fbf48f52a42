use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};

use crate::ledger::Ledger;

/// Separator between seconds and milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MillisSeparator {
    /// `HH:MM:SS,mmm` as used in SRT files
    Comma,
    /// `HH:MM:SS.mmm` as used in task ledgers
    Dot,
}

impl MillisSeparator {
    fn as_char(self) -> char {
        match self {
            Self::Comma => ',',
            Self::Dot => '.',
        }
    }
}

/// Format seconds as `HH:MM:SS<sep>mmm`
pub fn format_timestamp(seconds: f64, sep: MillisSeparator) -> String {
    let total_ms = (seconds.max(0.0) * 1000.0).round() as u64;
    let ms = total_ms % 1000;
    let total_secs = total_ms / 1000;
    let secs = total_secs % 60;
    let total_mins = total_secs / 60;
    let mins = total_mins % 60;
    let hours = total_mins / 60;

    format!("{:02}:{:02}:{:02}{}{:03}", hours, mins, secs, sep.as_char(), ms)
}

/// Parse `HH:MM:SS.mmm` or `HH:MM:SS,mmm` into seconds
pub fn parse_timestamp(s: &str) -> Result<f64> {
    let s = s.trim();
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 3 {
        anyhow::bail!("Invalid timestamp format: {}", s);
    }

    let hours: f64 = parts[0].parse().context("Invalid hours")?;
    let mins: f64 = parts[1].parse().context("Invalid minutes")?;

    let sec_parts: Vec<&str> = parts[2].split(['.', ',']).collect();
    if sec_parts.len() != 2 {
        anyhow::bail!("Invalid timestamp format (missing milliseconds): {}", s);
    }

    let secs: f64 = sec_parts[0].parse().context("Invalid seconds")?;
    let ms: f64 = sec_parts[1].parse().context("Invalid milliseconds")?;

    Ok(hours * 3600.0 + mins * 60.0 + secs + ms / 1000.0)
}

/// A single subtitle entry
#[derive(Debug, Clone)]
pub struct SubtitleEntry {
    /// Start time in seconds
    pub start: f64,
    /// End time in seconds
    pub end: f64,
    pub text: String,
}

impl fmt::Display for SubtitleEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} --> {}",
            format_timestamp(self.start, MillisSeparator::Comma),
            format_timestamp(self.end, MillisSeparator::Comma)
        )?;
        writeln!(f, "{}", self.text)
    }
}

/// Subtitles for the dubbed track, one entry per synthesized segment
#[derive(Debug, Clone, Default)]
pub struct Subtitle {
    pub entries: Vec<SubtitleEntry>,
}

impl Subtitle {
    /// Build entries from every reconciled line of the ledger.
    /// Lines without `new_sub_times` are skipped.
    pub fn from_ledger(ledger: &Ledger) -> Self {
        let mut entries = Vec::new();
        for task in ledger.tasks() {
            let Some(times) = &task.new_sub_times else {
                continue;
            };
            for (text, [start, end]) in task.segments.iter().zip(times) {
                entries.push(SubtitleEntry {
                    start: *start,
                    end: *end,
                    text: text.clone(),
                });
            }
        }
        Self { entries }
    }

    /// Write subtitle to an SRT file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create SRT file {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        self.write_to(&mut writer)?;
        writer.flush()?;
        Ok(())
    }

    /// Write subtitle to a writer
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        for (i, entry) in self.entries.iter().enumerate() {
            writeln!(writer, "{}", i + 1)?;
            write!(writer, "{}", entry)?;
            writeln!(writer)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
