//! Transition counting and time-sliced activity aggregation.

use crate::sample_view::SampleView;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionSummary {
    /// Number of adjacent sample pairs whose state differs.
    pub transitions: u32,
    /// State of the last sample; 0 for an empty view.
    pub ending_state: u8,
}

/// Count state changes across the view.
pub fn count_transitions(view: &SampleView) -> TransitionSummary {
    if view.is_empty() {
        return TransitionSummary {
            transitions: 0,
            ending_state: 0,
        };
    }

    let mut transitions = 0u32;
    let mut last = view.bit(0);
    for i in 1..view.len() {
        let state = view.bit(i);
        if state != last {
            transitions += 1;
            last = state;
        }
    }

    TransitionSummary {
        transitions,
        ending_state: last,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SliceParams {
    pub slice_count: usize,
    /// Device sample rate in S/s.
    pub sample_rate: f64,
    /// Activity normalization window in seconds.
    pub time_window: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SliceMetrics {
    pub transitions: Vec<u32>,
    /// Normalized activity per slice, clamped to 0..=100.
    pub activity: Vec<f64>,
}

/// Partition the view into `slice_count` contiguous runs of ⌊N/S⌋ samples
/// (the trailing slice absorbs the remainder) and compute per-slice
/// transition counts and activity levels.
pub fn analyze_slices(view: &SampleView, params: &SliceParams) -> SliceMetrics {
    assert!(params.slice_count > 0, "slice count must be positive");

    let total = view.len();
    let per_slice = total / params.slice_count;

    let mut transitions = Vec::with_capacity(params.slice_count);
    let mut activity = Vec::with_capacity(params.slice_count);

    for slice in 0..params.slice_count {
        let start = slice * per_slice;
        let end = if slice == params.slice_count - 1 {
            total
        } else {
            start + per_slice
        };

        let summary = count_transitions(&view.window(start..end));
        transitions.push(summary.transitions);
        activity.push(activity_level(
            summary.transitions,
            end - start,
            params.sample_rate,
            params.time_window,
        ));
    }

    SliceMetrics {
        transitions,
        activity,
    }
}

/// `min(100, 1000 * transitions / (slice_len * sample_rate * time_window))`.
///
/// This exact normalization is part of the export contract; replays of the
/// same capture must reproduce it bit-for-bit.
pub fn activity_level(transitions: u32, slice_len: usize, sample_rate: f64, time_window: f64) -> f64 {
    let max_possible = slice_len as f64 * sample_rate * time_window;
    if max_possible <= 0.0 {
        return 0.0;
    }
    (f64::from(transitions) / max_possible * 1000.0).min(100.0)
}
