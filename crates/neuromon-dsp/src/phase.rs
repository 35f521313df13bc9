//! Instantaneous-phase statistics via the analytic signal.
//!
//! For a view with at least [`PHASE_WINDOW`] samples: take the trailing
//! window as a 0/1 signal, remove the mean, apply a Hamming window,
//! transform, build the analytic spectrum (double the positive bins, zero
//! the negative ones, DC and Nyquist untouched), inverse-transform, and
//! read the argument of every analytic sample. Shorter views fall back to
//! duty-cycle statistics; the fallback is part of the contract.

use std::f64::consts::{PI, TAU};
use std::sync::Arc;

use num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use crate::sample_view::SampleView;

/// Analysis window length in samples. Power of two.
pub const PHASE_WINDOW: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseStats {
    /// Circular mean of the instantaneous phase, in (-pi, pi] for the
    /// analytic path; `duty * 2pi` for the fallback.
    pub mean_phase: f64,
    /// Dispersion of the phase increments, normalized into 0..=1.
    pub variance: f64,
}

impl PhaseStats {
    pub const ZERO: PhaseStats = PhaseStats {
        mean_phase: 0.0,
        variance: 0.0,
    };
}

/// Reusable phase estimator. Plans both transforms and precomputes the
/// window once; one instance serves every channel of a worker.
pub struct PhaseAnalyzer {
    fft: Arc<dyn Fft<f64>>,
    ifft: Arc<dyn Fft<f64>>,
    hamming: Vec<f64>,
}

impl Default for PhaseAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseAnalyzer {
    pub fn new() -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(PHASE_WINDOW);
        let ifft = planner.plan_fft_inverse(PHASE_WINDOW);

        let denom = (PHASE_WINDOW - 1) as f64;
        let hamming = (0..PHASE_WINDOW)
            .map(|i| 0.54 - 0.46 * (TAU * i as f64 / denom).cos())
            .collect();

        Self { fft, ifft, hamming }
    }

    /// Phase statistics for one channel of a capture.
    pub fn analyze(&self, view: &SampleView) -> PhaseStats {
        if view.len() >= PHASE_WINDOW {
            self.analytic_phase(&view.tail(PHASE_WINDOW))
        } else {
            duty_cycle_stats(view)
        }
    }

    fn analytic_phase(&self, window: &SampleView) -> PhaseStats {
        debug_assert_eq!(window.len(), PHASE_WINDOW);

        let n = PHASE_WINDOW;
        let mean = window.count_high() as f64 / n as f64;

        let mut buf: Vec<Complex<f64>> = (0..n)
            .map(|i| Complex::new((window.bit(i) as f64 - mean) * self.hamming[i], 0.0))
            .collect();

        self.fft.process(&mut buf);

        // Analytic spectrum: bins 1..n/2-1 doubled, n/2+1.. zeroed, DC and
        // Nyquist untouched.
        for bin in buf.iter_mut().take(n / 2).skip(1) {
            *bin *= 2.0;
        }
        for bin in buf.iter_mut().skip(n / 2 + 1) {
            *bin = Complex::new(0.0, 0.0);
        }

        self.ifft.process(&mut buf);
        let scale = 1.0 / n as f64;
        for c in buf.iter_mut() {
            *c *= scale;
        }

        let phases: Vec<f64> = buf.iter().map(|c| c.im.atan2(c.re)).collect();

        let mut sin_sum = 0.0;
        let mut cos_sum = 0.0;
        for &p in &phases {
            sin_sum += p.sin();
            cos_sum += p.cos();
        }
        let mean_phase = sin_sum.atan2(cos_sum);

        // Adjacent phase increments reduced modulo 2pi. The dispersion of
        // the increment sequence is what the variance normalizes; a pure
        // tone has constant increments and variance near zero.
        let increments: Vec<f64> = phases.windows(2).map(|w| (w[1] - w[0]).rem_euclid(TAU)).collect();
        let mu = increments.iter().sum::<f64>() / increments.len() as f64;
        let spread =
            increments.iter().map(|d| (d - mu) * (d - mu)).sum::<f64>() / increments.len() as f64;

        PhaseStats {
            mean_phase,
            variance: (spread / (PI * PI)).clamp(0.0, 1.0),
        }
    }
}

/// Duty-cycle fallback for views shorter than the analysis window.
fn duty_cycle_stats(view: &SampleView) -> PhaseStats {
    if view.is_empty() {
        return PhaseStats::ZERO;
    }
    let duty = view.count_high() as f64 / view.len() as f64;
    PhaseStats {
        mean_phase: duty * TAU,
        variance: duty * (1.0 - duty),
    }
}
