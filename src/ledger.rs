//! The task ledger: one row per subtitle line, partitioned into chunks by
//! `cut_off` markers.
//!
//! Rows are loaded from a JSON array, mutated in place by generation
//! (`real_dur`) and reconciliation (`new_sub_times`), then written back.
//! Columns the engine does not know about are carried through untouched.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::ops::Range;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{DubError, Result};

/// Extra column holding the original-language text spoken in the reference clip
pub const REFERENCE_TEXT_COLUMN: &str = "origin";

/// One synthesizable subtitle line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineTask {
    pub number: u32,
    /// Sub-segments synthesized one by one and played back to back
    #[serde(rename = "lines", alias = "segments")]
    pub segments: Vec<String>,
    /// Original start in seconds
    #[serde(with = "timestamp")]
    pub start_time: f64,
    /// Original end in seconds
    #[serde(with = "timestamp")]
    pub end_time: f64,
    #[serde(default)]
    pub tolerance: f64,
    #[serde(default)]
    pub gap: f64,
    /// Allotted budget including tolerance; computed on load when absent
    #[serde(default)]
    pub tol_dur: f64,
    #[serde(default, deserialize_with = "bool_or_int")]
    pub cut_off: bool,
    /// Summed raw (pre-stretch) duration of all segments
    #[serde(default)]
    pub real_dur: f64,
    /// `[start, end]` per segment on the dubbed timeline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_sub_times: Option<Vec<[f64; 2]>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LineTask {
    pub fn new(number: u32, segments: Vec<String>, start_time: f64, end_time: f64) -> Self {
        Self {
            number,
            segments,
            start_time,
            end_time,
            tolerance: 0.0,
            gap: 0.0,
            tol_dur: end_time - start_time,
            cut_off: false,
            real_dur: 0.0,
            new_sub_times: None,
            extra: Map::new(),
        }
    }

    /// Set tolerance and recompute `tol_dur` from it
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self.tol_dur = (self.end_time - self.start_time) + tolerance;
        self
    }

    pub fn with_gap(mut self, gap: f64) -> Self {
        self.gap = gap;
        self
    }

    pub fn with_cut_off(mut self) -> Self {
        self.cut_off = true;
        self
    }

    /// Transcript of the reference clip, if the ledger carries one
    pub fn reference_text(&self) -> Option<&str> {
        self.extra
            .get(REFERENCE_TEXT_COLUMN)
            .and_then(Value::as_str)
            .filter(|text| !text.trim().is_empty())
    }
}

/// A contiguous run of lines reconciled under a single speed factor
#[derive(Debug, Clone, Copy)]
pub struct Chunk<'a> {
    tasks: &'a [LineTask],
}

impl<'a> Chunk<'a> {
    pub fn tasks(&self) -> &'a [LineTask] {
        self.tasks
    }

    pub fn first(&self) -> &'a LineTask {
        &self.tasks[0]
    }

    pub fn last(&self) -> &'a LineTask {
        &self.tasks[self.tasks.len() - 1]
    }

    /// Start of the target window
    pub fn start(&self) -> f64 {
        self.first().start_time
    }

    /// End of the target window: the last line's end plus its tolerance
    pub fn target_end(&self) -> f64 {
        self.last().end_time + self.last().tolerance
    }
}

/// Ordered collection of line tasks
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    tasks: Vec<LineTask>,
}

impl Ledger {
    /// Validate rows and fill in missing `tol_dur` values
    pub fn new(mut tasks: Vec<LineTask>) -> Result<Self> {
        for pair in tasks.windows(2) {
            if pair[1].number <= pair[0].number {
                return Err(DubError::Ledger(format!(
                    "line numbers must be strictly increasing, found {} after {}",
                    pair[1].number, pair[0].number
                )));
            }
        }

        for task in &mut tasks {
            if task.segments.is_empty() {
                return Err(DubError::Ledger(format!("line {} has no segments", task.number)));
            }
            if task.tol_dur <= 0.0 {
                task.tol_dur = (task.end_time - task.start_time) + task.tolerance;
            }
        }

        if let Some(last) = tasks.last() {
            if !last.cut_off {
                return Err(DubError::Ledger(format!(
                    "last line {} is not marked cut_off, trailing lines belong to no chunk",
                    last.number
                )));
            }
        }

        Ok(Self { tasks })
    }

    /// Load a ledger from a JSON array of rows
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let tasks: Vec<LineTask> = serde_json::from_reader(BufReader::new(file))?;
        debug!("Loaded {} line tasks from {}", tasks.len(), path.display());
        Self::new(tasks)
    }

    /// Persist the ledger, replacing the file only once fully written
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut tmp_name = path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = std::path::PathBuf::from(tmp_name);

        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            serde_json::to_writer_pretty(&mut writer, &self.tasks)?;
            writer.flush()?;
        }
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    pub fn tasks(&self) -> &[LineTask] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn index_of(&self, number: u32) -> Result<usize> {
        self.tasks
            .binary_search_by_key(&number, |t| t.number)
            .map_err(|_| DubError::Ledger(format!("no line numbered {}", number)))
    }

    /// Record the synthesized duration of a line
    pub fn set_real_dur(&mut self, number: u32, real_dur: f64) -> Result<()> {
        let idx = self.index_of(number)?;
        self.tasks[idx].real_dur = real_dur;
        Ok(())
    }

    /// Forget durations from an earlier run
    pub fn reset_real_durs(&mut self) {
        for task in &mut self.tasks {
            task.real_dur = 0.0;
        }
    }

    /// Index ranges of every chunk, in ledger order
    pub fn chunk_ranges(&self) -> Vec<Range<usize>> {
        let mut ranges = Vec::new();
        let mut start = 0;
        for (i, task) in self.tasks.iter().enumerate() {
            if task.cut_off {
                ranges.push(start..i + 1);
                start = i + 1;
            }
        }
        ranges
    }

    pub fn chunk(&self, range: Range<usize>) -> Chunk<'_> {
        Chunk {
            tasks: &self.tasks[range],
        }
    }

    /// Write reconciled timelines for a whole chunk at once
    pub fn apply_sub_times(&mut self, range: Range<usize>, times: Vec<Vec<[f64; 2]>>) {
        for (task, t) in self.tasks[range].iter_mut().zip(times) {
            task.new_sub_times = Some(t);
        }
    }
}

/// Accepts `true`/`false` as well as spreadsheet-style `0`/`1`
fn bool_or_int<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
    }

    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => b,
        Flag::Int(i) => i != 0,
    })
}

mod timestamp {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::srt::{format_timestamp, parse_timestamp, MillisSeparator};

    pub fn serialize<S: Serializer>(seconds: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_timestamp(*seconds, MillisSeparator::Dot))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_timestamp(&raw).map_err(|e| D::Error::custom(format!("{:#}", e)))
    }
}
