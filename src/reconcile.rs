//! Fitting synthesized speech back onto the original timeline.
//!
//! Every chunk gets a single speed factor. Lines are then laid out back to
//! back from the chunk's start, with the original pauses scaled by the same
//! factor when the plan keeps them. A chunk that ends slightly late has its
//! last clip truncated; one that ends far too late fails the whole pass.

use indicatif::ProgressBar;
use tracing::{info, warn};

use crate::audio::{trim_wav, ClipLayout};
use crate::config::ReconcileSettings;
use crate::error::{DubError, Result};
use crate::ledger::{Chunk, Ledger};
use crate::stretch::SpeedAdjuster;

/// Which rule produced a chunk's speed factor, in order of preference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeedTier {
    /// Pauses kept, speed within the acceptable ceiling
    KeepGaps,
    /// Pauses dropped, speed within the acceptable ceiling
    DropGaps,
    /// Pauses kept, tolerance slack of every line used
    KeepGapsWithTolerance,
    /// Pauses dropped, no ceiling
    Uncapped,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeedPlan {
    /// Rounded to three decimals
    pub factor: f64,
    pub keep_gaps: bool,
    pub tier: SpeedTier,
}

fn round3(x: f64) -> f64 {
    (x * 1000.0).round() / 1000.0
}

/// Pick the speed factor and gap policy for a chunk
pub fn plan_speed(chunk: Chunk<'_>, settings: &ReconcileSettings) -> Result<SpeedPlan> {
    let tasks = chunk.tasks();
    let last = chunk.last();
    let margin = settings.thresholds.speed_margin;
    let accept = settings.accept;

    let chunk_durs: f64 = tasks.iter().map(|t| t.real_dur).sum();
    let tol_durs: f64 = tasks.iter().map(|t| t.tol_dur).sum();
    let durations = tol_durs - last.tolerance;
    let all_gaps: f64 = tasks.iter().map(|t| t.gap).sum::<f64>() - last.gap;

    let invalid = |reason: String| DubError::InvalidChunk {
        first: chunk.first().number,
        last: last.number,
        reason,
    };

    if chunk_durs <= 0.0 {
        return Err(invalid("no synthesized audio in chunk".into()));
    }

    let (speech, budget, keep_gaps, tier) = if (chunk_durs + all_gaps) / accept < durations {
        (chunk_durs + all_gaps, durations, true, SpeedTier::KeepGaps)
    } else if chunk_durs / accept < durations {
        (chunk_durs, durations, false, SpeedTier::DropGaps)
    } else if (chunk_durs + all_gaps) / accept < tol_durs {
        (chunk_durs + all_gaps, tol_durs, true, SpeedTier::KeepGapsWithTolerance)
    } else {
        (chunk_durs, tol_durs, false, SpeedTier::Uncapped)
    };

    let divisor = budget - margin;
    if divisor <= 0.0 {
        return Err(invalid(format!(
            "budget {:.3}s leaves no room after the {:.3}s safety margin",
            budget, margin
        )));
    }

    let factor = round3((speech / divisor).max(settings.min_speed));
    if !factor.is_finite() || factor <= 0.0 {
        return Err(invalid(format!(
            "speed factor {} is not positive ({:.3}s of speech over {:.3}s)",
            factor, speech, divisor
        )));
    }

    Ok(SpeedPlan {
        factor,
        keep_gaps,
        tier,
    })
}

/// Outcome of one reconciled chunk
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkReport {
    pub first: u32,
    pub last: u32,
    pub plan: SpeedPlan,
    /// End of the chunk on the new timeline
    pub end_time: f64,
    /// Seconds cut from the last clip to stay within budget
    pub truncated: Option<f64>,
}

struct ChunkTimeline {
    report: ChunkReport,
    sub_times: Vec<Vec<[f64; 2]>>,
}

/// Walks the ledger chunk by chunk, stretching clips and writing new timestamps
pub struct Reconciler<'a> {
    adjuster: SpeedAdjuster<'a>,
    layout: &'a ClipLayout,
    settings: ReconcileSettings,
}

impl<'a> Reconciler<'a> {
    pub fn new(adjuster: SpeedAdjuster<'a>, layout: &'a ClipLayout, settings: ReconcileSettings) -> Self {
        Self {
            adjuster,
            layout,
            settings,
        }
    }

    /// Reconcile every chunk in ledger order. The first failing chunk aborts
    /// the pass; chunks before it keep their results in the ledger.
    pub fn run(&self, ledger: &mut Ledger, progress: Option<&ProgressBar>) -> Result<Vec<ChunkReport>> {
        let ranges = ledger.chunk_ranges();
        if let Some(pb) = progress {
            pb.set_length(ranges.len() as u64);
        }

        let mut reports = Vec::with_capacity(ranges.len());
        for range in ranges {
            let timeline = self.reconcile_chunk(ledger.chunk(range.clone()))?;
            ledger.apply_sub_times(range, timeline.sub_times);
            reports.push(timeline.report);
            if let Some(pb) = progress {
                pb.inc(1);
            }
        }
        Ok(reports)
    }

    fn reconcile_chunk(&self, chunk: Chunk<'_>) -> Result<ChunkTimeline> {
        let plan = plan_speed(chunk, &self.settings)?;
        let (first, last) = (chunk.first().number, chunk.last().number);
        let probe = self.adjuster.probe();

        let mut cur_time = chunk.start();
        let mut sub_times = Vec::with_capacity(chunk.tasks().len());

        for (i, task) in chunk.tasks().iter().enumerate() {
            if i > 0 && plan.keep_gaps {
                cur_time += chunk.tasks()[i - 1].gap / plan.factor;
            }

            let mut line_times = Vec::with_capacity(task.segments.len());
            for segment in 0..task.segments.len() {
                let raw = self.layout.raw_clip(task.number, segment);
                let adjusted = self.layout.final_clip(task.number, segment);
                self.adjuster.adjust(&raw, &adjusted, plan.factor)?;

                let duration = probe
                    .duration(&adjusted)
                    .map_err(|e| DubError::audio(&adjusted, e))?;
                line_times.push([cur_time, cur_time + duration]);
                cur_time += duration;
            }
            sub_times.push(line_times);
        }

        if plan.factor <= self.settings.accept {
            info!("Processed chunk {} to {} with speed factor {}", first, last, plan.factor);
        } else {
            warn!(
                "Processed chunk {} to {} with speed factor {} (above {})",
                first, last, plan.factor, self.settings.accept
            );
        }

        let target_end = chunk.target_end();
        let mut truncated = None;
        let mut end_time = cur_time;

        if cur_time > target_end {
            let overrun = cur_time - target_end;
            if overrun > self.settings.thresholds.max_overrun {
                return Err(DubError::ChunkOverrun {
                    first,
                    last,
                    target_end,
                    reached: cur_time,
                    overrun,
                });
            }

            warn!(
                "Chunk {} to {} exceeds by {:.3}s, truncating last audio",
                first, last, overrun
            );
            let last_task = chunk.last();
            let last_file = self.layout.final_clip(last_task.number, last_task.segments.len() - 1);
            let duration = probe
                .duration(&last_file)
                .map_err(|e| DubError::audio(&last_file, e))?;
            if duration < overrun {
                warn!(
                    "Last clip {} is only {:.3}s, dropping it still leaves chunk {} to {} past {:.3}s",
                    last_file.display(),
                    duration,
                    first,
                    last,
                    target_end
                );
            }
            trim_wav(&last_file, duration - overrun).map_err(|e| DubError::audio(&last_file, e))?;

            if let Some(last_span) = sub_times.last_mut().and_then(|t| t.last_mut()) {
                last_span[0] = last_span[0].min(target_end);
                last_span[1] = target_end;
            }
            truncated = Some(overrun);
            end_time = target_end;
        }

        Ok(ChunkTimeline {
            report: ChunkReport {
                first,
                last,
                plan,
                end_time,
                truncated,
            },
            sub_times,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use super::*;
    use crate::audio::test_support::write_silence;
    use crate::audio::{DurationProbe, WavProbe};
    use crate::config::Thresholds;
    use crate::ledger::LineTask;
    use crate::stretch::test_support::FakeStretcher;

    fn settings(accept: f64, min_speed: f64) -> ReconcileSettings {
        ReconcileSettings {
            accept,
            min_speed,
            thresholds: Thresholds {
                retry_backoff: Duration::ZERO,
                ..Thresholds::default()
            },
        }
    }

    fn line(number: u32, start: f64, end: f64, real_dur: f64) -> LineTask {
        let mut task = LineTask::new(number, vec![format!("line {}", number)], start, end);
        task.real_dur = real_dur;
        task
    }

    /// Two lines of 2s each; the second has 0.5s tolerance. `durations` is 4.0
    /// and `tol_durs` 4.5.
    fn pair(real_dur: f64, gap: f64) -> Ledger {
        Ledger::new(vec![
            line(1, 0.0, 2.0, real_dur / 2.0).with_gap(gap),
            line(2, 2.0 + gap, 4.0 + gap, real_dur / 2.0)
                .with_tolerance(0.5)
                .with_gap(9.0)
                .with_cut_off(),
        ])
        .unwrap()
    }

    fn plan(ledger: &Ledger, accept: f64, min_speed: f64) -> SpeedPlan {
        plan_speed(ledger.chunk(0..ledger.len()), &settings(accept, min_speed)).unwrap()
    }

    /// Write raw clips matching each line's real_dur, split evenly across segments
    fn write_raw_clips(ledger: &Ledger, layout: &ClipLayout) {
        for task in ledger.tasks() {
            let per_segment = task.real_dur / task.segments.len() as f64;
            for segment in 0..task.segments.len() {
                write_silence(&layout.raw_clip(task.number, segment), per_segment);
            }
        }
    }

    fn layout_in(dir: &Path) -> ClipLayout {
        let layout = ClipLayout::new(dir.join("tmp"), dir.join("segs"));
        layout.create_dirs().unwrap();
        layout
    }

    #[test]
    fn test_tier_one_wins_when_it_fits() {
        // Tier 2 would also fit; tier 1 must still be chosen, floored at min_speed
        let p = plan(&pair(3.0, 0.5), 1.2, 1.0);
        assert_eq!(p.tier, SpeedTier::KeepGaps);
        assert!(p.keep_gaps);
        assert_eq!(p.factor, 1.0);

        let p = plan(&pair(3.0, 0.5), 1.2, 0.5);
        assert_eq!(p.factor, 0.897);
    }

    #[test]
    fn test_tier_two_drops_gaps() {
        let p = plan(&pair(4.5, 0.5), 1.2, 1.0);
        assert_eq!(p.tier, SpeedTier::DropGaps);
        assert!(!p.keep_gaps);
        assert_eq!(p.factor, 1.154);
    }

    #[test]
    fn test_tier_three_uses_tolerance() {
        let p = plan(&pair(5.0, 0.3), 1.2, 1.0);
        assert_eq!(p.tier, SpeedTier::KeepGapsWithTolerance);
        assert!(p.keep_gaps);
        assert_eq!(p.factor, 1.205);
    }

    #[test]
    fn test_tier_four_is_uncapped() {
        let p = plan(&pair(6.0, 0.3), 1.2, 1.0);
        assert_eq!(p.tier, SpeedTier::Uncapped);
        assert!(!p.keep_gaps);
        assert_eq!(p.factor, 1.364);
    }

    #[test]
    fn test_tier_four_is_floored_at_min_speed() {
        // 2.5 / 4.4 would slow the chunk down
        let p = plan(&pair(2.5, 0.0), 0.5, 1.0);
        assert_eq!(p.tier, SpeedTier::Uncapped);
        assert!(!p.keep_gaps);
        assert_eq!(p.factor, 1.0);

        let p = plan(&pair(2.5, 0.0), 0.5, 0.2);
        assert_eq!(p.factor, 0.568);
    }

    #[test]
    fn test_factor_rounding_to_zero_is_invalid() {
        let ledger = Ledger::new(vec![line(1, 0.0, 100.0, 0.02).with_cut_off()]).unwrap();
        let err = plan_speed(ledger.chunk(0..1), &settings(1.2, 0.0)).unwrap_err();
        assert!(matches!(err, DubError::InvalidChunk { first: 1, last: 1, .. }));
    }

    #[test]
    fn test_factor_never_below_min_speed() {
        for real in [0.5, 1.0, 3.0, 4.5, 5.0, 6.0, 12.0] {
            for gap in [0.0, 0.3, 1.5] {
                let p = plan(&pair(real, gap), 1.2, 1.1);
                assert!(p.factor >= 1.1, "real={real} gap={gap} factor={}", p.factor);
            }
        }
    }

    #[test]
    fn test_silent_chunk_is_invalid() {
        let ledger = pair(0.0, 0.2);
        let err = plan_speed(ledger.chunk(0..2), &settings(1.2, 1.0)).unwrap_err();
        assert!(matches!(err, DubError::InvalidChunk { first: 1, last: 2, .. }));
    }

    #[test]
    fn test_budget_inside_margin_is_invalid() {
        let ledger = Ledger::new(vec![line(1, 0.0, 0.05, 1.0).with_cut_off()]).unwrap();
        let err = plan_speed(ledger.chunk(0..1), &settings(1.2, 1.0)).unwrap_err();
        assert!(matches!(err, DubError::InvalidChunk { .. }));
    }

    /// Two lines, 0.1s apart, real durations 2.0s and 2.5s, accept 1.2, min 0.5
    fn reference_ledger() -> Ledger {
        let mut first = LineTask::new(1, vec!["first".into()], 0.0, 1.9).with_gap(0.1);
        first.real_dur = 2.0;
        let mut second = LineTask::new(2, vec!["second".into()], 2.0, 4.0)
            .with_tolerance(0.2)
            .with_cut_off();
        second.real_dur = 2.5;
        Ledger::new(vec![first, second]).unwrap()
    }

    #[test]
    fn test_reference_plan() {
        // chunk_durs 4.5, all_gaps 0.1, durations 3.9: (4.5 + 0.1) / 1.2 < 3.9
        let p = plan(&reference_ledger(), 1.2, 0.5);
        assert_eq!(p.tier, SpeedTier::KeepGaps);
        assert_eq!(p.factor, round3(4.6 / 3.8));
        assert_eq!(p.factor, 1.211);
    }

    #[test]
    fn test_reconcile_keeps_scaled_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout_in(dir.path());
        let mut ledger = reference_ledger();
        write_raw_clips(&ledger, &layout);

        let stretcher = FakeStretcher::exact();
        let adjuster = SpeedAdjuster::new(&stretcher, &WavProbe, settings(1.2, 0.5).thresholds);
        let reconciler = Reconciler::new(adjuster, &layout, settings(1.2, 0.5));
        let reports = reconciler.run(&mut ledger, None).unwrap();

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].truncated, None);

        let first = ledger.tasks()[0].new_sub_times.clone().unwrap();
        let second = ledger.tasks()[1].new_sub_times.clone().unwrap();
        assert_eq!(first[0][0], 0.0);
        assert!((first[0][1] - 2.0 / 1.211).abs() < 1e-3);
        assert!((second[0][0] - first[0][1] - 0.1 / 1.211).abs() < 1e-9);
        assert!(second[0][1] <= 4.2);
        assert!((reports[0].end_time - second[0][1]).abs() < 1e-9);
        assert!(layout.final_clip(2, 0).exists());
    }

    #[test]
    fn test_dropped_gaps_and_multiple_segments() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout_in(dir.path());

        let mut first = LineTask::new(1, vec!["a".into(), "b".into()], 10.0, 12.0).with_gap(0.5);
        first.real_dur = 2.2;
        let mut second = LineTask::new(2, vec!["c".into()], 12.5, 14.0)
            .with_tolerance(0.5)
            .with_cut_off();
        second.real_dur = 1.9;
        let mut ledger = Ledger::new(vec![first, second]).unwrap();
        write_raw_clips(&ledger, &layout);

        let stretcher = FakeStretcher::exact();
        let adjuster = SpeedAdjuster::new(&stretcher, &WavProbe, settings(1.2, 1.0).thresholds);
        let reconciler = Reconciler::new(adjuster, &layout, settings(1.2, 1.0));
        let reports = reconciler.run(&mut ledger, None).unwrap();
        assert_eq!(reports[0].plan.tier, SpeedTier::DropGaps);

        let first = ledger.tasks()[0].new_sub_times.clone().unwrap();
        let second = ledger.tasks()[1].new_sub_times.clone().unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0][0], 10.0);
        assert_eq!(first[1][0], first[0][1]);
        assert_eq!(second[0][0], first[1][1]);
        assert!(second[0][1] <= 14.5);
    }

    #[test]
    fn test_small_overrun_truncates_last_clip() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout_in(dir.path());

        // Budget of 3.5s granted against a window ending at 3.0s: overrun ~0.4s
        let mut task = line(1, 0.0, 3.0, 4.0).with_cut_off();
        task.tol_dur = 3.5;
        let mut ledger = Ledger::new(vec![task]).unwrap();
        write_raw_clips(&ledger, &layout);

        let stretcher = FakeStretcher::exact();
        let adjuster = SpeedAdjuster::new(&stretcher, &WavProbe, settings(1.2, 1.0).thresholds);
        let reconciler = Reconciler::new(adjuster, &layout, settings(1.2, 1.0));
        let reports = reconciler.run(&mut ledger, None).unwrap();

        let overrun = reports[0].truncated.unwrap();
        assert!((overrun - 0.4).abs() < 0.01, "overrun {overrun}");
        assert_eq!(reports[0].end_time, 3.0);
        assert_eq!(ledger.tasks()[0].new_sub_times.clone().unwrap(), vec![[0.0, 3.0]]);
        assert!((WavProbe.duration(&layout.final_clip(1, 0)).unwrap() - 3.0).abs() < 1e-3);
    }

    #[test]
    fn test_overrun_longer_than_last_clip() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout_in(dir.path());

        let mut task = LineTask::new(1, vec!["long".into(), "tail".into()], 0.0, 3.0).with_cut_off();
        task.real_dur = 4.0;
        task.tol_dur = 3.5;
        let mut ledger = Ledger::new(vec![task]).unwrap();
        write_silence(&layout.raw_clip(1, 0), 3.9);
        write_silence(&layout.raw_clip(1, 1), 0.1);

        let stretcher = FakeStretcher::exact();
        let adjuster = SpeedAdjuster::new(&stretcher, &WavProbe, settings(1.2, 1.0).thresholds);
        let reconciler = Reconciler::new(adjuster, &layout, settings(1.2, 1.0));
        let reports = reconciler.run(&mut ledger, None).unwrap();

        // 3.9 / 1.176 + 0.1 / 1.176 ends ~0.4s late; the 0.085s tail cannot absorb it
        assert_eq!(reports[0].plan.factor, 1.176);
        let overrun = reports[0].truncated.unwrap();
        assert!((overrun - 0.401).abs() < 0.01, "overrun {overrun}");
        assert_eq!(reports[0].end_time, 3.0);

        let times = ledger.tasks()[0].new_sub_times.clone().unwrap();
        assert_eq!(times[1], [3.0, 3.0]);
        assert!(times[0][1] > 3.0);
        assert_eq!(WavProbe.duration(&layout.final_clip(1, 1)).unwrap(), 0.0);
    }

    #[test]
    fn test_large_overrun_fails_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout_in(dir.path());

        let mut task = line(1, 0.0, 3.0, 4.8).with_cut_off();
        task.tol_dur = 4.1;
        let mut ledger = Ledger::new(vec![task]).unwrap();
        write_raw_clips(&ledger, &layout);

        let stretcher = FakeStretcher::exact();
        let adjuster = SpeedAdjuster::new(&stretcher, &WavProbe, settings(1.2, 1.0).thresholds);
        let reconciler = Reconciler::new(adjuster, &layout, settings(1.2, 1.0));
        let err = reconciler.run(&mut ledger, None).unwrap_err();

        match err {
            DubError::ChunkOverrun { first, last, target_end, overrun, .. } => {
                assert_eq!((first, last), (1, 1));
                assert_eq!(target_end, 3.0);
                assert!((overrun - 1.0).abs() < 1e-3);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(ledger.tasks()[0].new_sub_times.is_none());
    }

    #[test]
    fn test_chunks_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout_in(dir.path());

        let mut ledger = Ledger::new(vec![
            line(1, 0.0, 2.0, 1.5).with_tolerance(0.2).with_cut_off(),
            line(2, 5.0, 7.0, 2.3).with_tolerance(0.2).with_cut_off(),
        ])
        .unwrap();
        write_raw_clips(&ledger, &layout);

        let stretcher = FakeStretcher::exact();
        let adjuster = SpeedAdjuster::new(&stretcher, &WavProbe, settings(1.2, 1.0).thresholds);
        let reconciler = Reconciler::new(adjuster, &layout, settings(1.2, 1.0));
        let progress = ProgressBar::hidden();
        let reports = reconciler.run(&mut ledger, Some(&progress)).unwrap();

        assert_eq!(reports.len(), 2);
        assert_eq!(progress.position(), 2);
        // Slow chunk stays at unity and is copied as is
        assert_eq!(reports[0].plan.factor, 1.0);
        assert_eq!(stretcher.calls(), 1);
        let second = ledger.tasks()[1].new_sub_times.clone().unwrap();
        assert_eq!(second[0][0], 5.0);
        assert!(second[0][1] <= 7.2);
    }
}
