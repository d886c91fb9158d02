use crate::domain::models::{TimerInterval, MAX_INTERVAL_SECONDS};
use chrono::{DateTime, Utc};
use serde::Serialize;

pub const MERGE_TOLERANCE_MS: i64 = 1_000;

pub fn elapsed_seconds(start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
    (end - start).num_milliseconds().max(0) / 1_000
}

pub fn create_interval(start: DateTime<Utc>, end: DateTime<Utc>) -> TimerInterval {
    TimerInterval {
        start,
        end: end.max(start),
        duration_seconds: elapsed_seconds(start, end),
    }
}

pub fn is_plausible(seconds: i64) -> bool {
    (0..=MAX_INTERVAL_SECONDS).contains(&seconds)
}

pub fn total_seconds(intervals: &[TimerInterval]) -> i64 {
    intervals
        .iter()
        .map(|interval| interval.duration_seconds)
        .fold(0_i64, i64::saturating_add)
}

/// Sorts by start and folds together intervals that overlap or sit within
/// [`MERGE_TOLERANCE_MS`] of each other. Durations of the output are recomputed
/// from the merged spans, so merging an already merged list is a no-op.
pub fn merge_intervals(intervals: &[TimerInterval]) -> Vec<TimerInterval> {
    let mut sorted = intervals.to_vec();
    sorted.sort_by(|left, right| left.start.cmp(&right.start));

    let mut merged: Vec<TimerInterval> = Vec::with_capacity(sorted.len());
    for interval in sorted {
        match merged.last_mut() {
            Some(current)
                if (interval.start - current.end).num_milliseconds() <= MERGE_TOLERANCE_MS =>
            {
                if interval.end > current.end {
                    current.end = interval.end;
                }
                current.duration_seconds = elapsed_seconds(current.start, current.end);
            }
            _ => merged.push(create_interval(interval.start, interval.end)),
        }
    }
    merged
}

pub fn implausible_intervals(intervals: &[TimerInterval]) -> Vec<&TimerInterval> {
    intervals
        .iter()
        .filter(|interval| !is_plausible(interval.duration_seconds))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntervalStats {
    pub count: usize,
    pub total_seconds: i64,
    pub average_seconds: f64,
    pub longest_seconds: i64,
    pub shortest_seconds: i64,
}

/// Statistics over the raw (non-merged) session list.
pub fn interval_stats(intervals: &[TimerInterval]) -> Option<IntervalStats> {
    let longest_seconds = intervals.iter().map(|i| i.duration_seconds).max()?;
    let shortest_seconds = intervals.iter().map(|i| i.duration_seconds).min()?;
    let total = total_seconds(intervals);
    Some(IntervalStats {
        count: intervals.len(),
        total_seconds: total,
        average_seconds: total as f64 / intervals.len() as f64,
        longest_seconds,
        shortest_seconds,
    })
}
