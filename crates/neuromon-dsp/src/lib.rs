//! Bit-plane signal analysis over packed logic-analyzer captures.
//!
//! A capture arrives as `depth` 32-bit words, bit `c` of word `k` holding
//! the state of channel `c` at sample `k`. [`SampleView`] exposes one
//! channel of that buffer without copying; the analysis functions consume
//! views and produce per-channel metrics: transition counts
//! ([`count_transitions`]), time-sliced activity ([`analyze_slices`]),
//! instantaneous-phase statistics ([`PhaseAnalyzer`]) and frequency-band
//! magnitudes ([`BandAnalyzer`]).

pub mod activity;
pub mod bands;
pub mod phase;
pub mod sample_view;

pub use activity::{analyze_slices, count_transitions, SliceMetrics, SliceParams, TransitionSummary};
pub use bands::{BandAnalyzer, BAND_COUNT, FREQUENCY_BANDS};
pub use phase::{PhaseAnalyzer, PhaseStats, PHASE_WINDOW};
pub use sample_view::SampleView;
