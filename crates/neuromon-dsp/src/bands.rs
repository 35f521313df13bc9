//! Frequency-band magnitudes for the probe channels.
//!
//! Trailing 2048 samples, Hann window, forward FFT, then the one-sided
//! magnitude spectrum averaged over twelve fixed bands. Bands that start
//! above Nyquist stay zero; band edges are clamped to Nyquist.

use std::f64::consts::TAU;
use std::sync::Arc;

use num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use crate::sample_view::SampleView;

pub const BAND_COUNT: usize = 12;

/// Band edges in Hz, lowest first.
pub const FREQUENCY_BANDS: [(f64, f64); BAND_COUNT] = [
    (0.0, 100.0),
    (500.0, 600.0),
    (2_000.0, 6_000.0),
    (10_000.0, 50_000.0),
    (100_000.0, 200_000.0),
    (500_000.0, 600_000.0),
    (800_000.0, 1_200_000.0),
    (10_000_000.0, 50_000_000.0),
    (100_000_000.0, 200_000_000.0),
    (500_000_000.0, 600_000_000.0),
    (800_000_000.0, 1_200_000_000.0),
    (1_940_000_000.0, 5_310_000_000.0),
];

const WINDOW: usize = 2048;

pub struct BandAnalyzer {
    fft: Arc<dyn Fft<f64>>,
    hann: Vec<f64>,
}

impl Default for BandAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl BandAnalyzer {
    pub fn new() -> Self {
        let fft = FftPlanner::new().plan_fft_forward(WINDOW);
        let denom = (WINDOW - 1) as f64;
        let hann = (0..WINDOW)
            .map(|i| 0.5 * (1.0 - (TAU * i as f64 / denom).cos()))
            .collect();
        Self { fft, hann }
    }

    /// Band-averaged magnitudes, or `None` when the view is shorter than
    /// the analysis window.
    pub fn analyze(&self, view: &SampleView, sample_rate: f64) -> Option<[f64; BAND_COUNT]> {
        if view.len() < WINDOW || sample_rate <= 0.0 {
            return None;
        }

        let window = view.tail(WINDOW);
        let mut buf: Vec<Complex<f64>> = (0..WINDOW)
            .map(|i| Complex::new(window.bit(i) as f64 * self.hann[i], 0.0))
            .collect();
        self.fft.process(&mut buf);

        let magnitudes: Vec<f64> = buf.iter().take(WINDOW / 2 + 1).map(|c| c.norm()).collect();
        let nyquist = sample_rate / 2.0;
        let df = sample_rate / WINDOW as f64;

        let mut bands = [0.0; BAND_COUNT];
        for (band, &(lo, hi)) in FREQUENCY_BANDS.iter().enumerate() {
            if lo > nyquist {
                continue;
            }
            let hi = hi.min(nyquist);
            let start_bin = ((lo / df) as usize).max(1);
            let end_bin = ((hi / df) as usize).min(magnitudes.len() - 1);
            if end_bin < start_bin {
                continue;
            }
            let span = &magnitudes[start_bin..=end_bin];
            bands[band] = span.iter().sum::<f64>() / span.len() as f64;
        }

        Some(bands)
    }
}
