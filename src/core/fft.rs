//! Per-scale real FFT wrapper and cartesian/polar conversion utilities.
//!
//! Wraps a planned `realfft` forward/inverse pair with split re/im outputs,
//! plus the log-magnitude inverse transform used for cepstral analysis. All
//! plans and scratch buffers are allocated at construction; the transforms
//! themselves are allocation-free and deterministic.

use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use rustfft::num_complex::Complex;
use std::sync::Arc;

/// Magnitude floor used before taking logarithms in cepstral analysis.
const CEPSTRAL_LOG_FLOOR: f64 = 1e-20;

/// A planned real-input FFT of one fixed size.
///
/// Forward: `size` real samples in, `size/2 + 1` split re/im bins out.
/// Inverse: unnormalised, so `inverse(forward(x)) == x * size`.
pub struct Fft {
    size: usize,
    r2c: Arc<dyn RealToComplex<f64>>,
    c2r: Arc<dyn ComplexToReal<f64>>,
    time_scratch: Vec<f64>,
    spectrum_scratch: Vec<Complex<f64>>,
    r2c_scratch: Vec<Complex<f64>>,
    c2r_scratch: Vec<Complex<f64>>,
}

impl std::fmt::Debug for Fft {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fft").field("size", &self.size).finish()
    }
}

impl Fft {
    /// Plans forward and inverse transforms of the given size.
    pub fn new(size: usize) -> Self {
        let mut planner = RealFftPlanner::<f64>::new();
        let r2c = planner.plan_fft_forward(size);
        let c2r = planner.plan_fft_inverse(size);
        let r2c_scratch = vec![Complex::new(0.0, 0.0); r2c.get_scratch_len()];
        let c2r_scratch = vec![Complex::new(0.0, 0.0); c2r.get_scratch_len()];
        Self {
            size,
            r2c,
            c2r,
            time_scratch: vec![0.0; size],
            spectrum_scratch: vec![Complex::new(0.0, 0.0); size / 2 + 1],
            r2c_scratch,
            c2r_scratch,
        }
    }

    /// Returns the transform size.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Forward transform: `time` (length `size`) to split `re`/`im`
    /// (length `size/2 + 1` each). `time` is left untouched.
    pub fn forward(&mut self, time: &[f64], re: &mut [f64], im: &mut [f64]) {
        self.time_scratch.copy_from_slice(&time[..self.size]);
        // realfft mutates its input; the scratch copy keeps the caller's frame.
        let _ = self.r2c.process_with_scratch(
            &mut self.time_scratch,
            &mut self.spectrum_scratch,
            &mut self.r2c_scratch,
        );
        for (i, c) in self.spectrum_scratch.iter().enumerate() {
            re[i] = c.re;
            im[i] = c.im;
        }
    }

    /// Inverse transform: split `re`/`im` to `time` (length `size`),
    /// unnormalised. The DC and Nyquist imaginary parts are forced to zero,
    /// as required of the spectrum of a real signal.
    pub fn inverse(&mut self, re: &[f64], im: &[f64], time: &mut [f64]) {
        let bins = self.size / 2 + 1;
        for i in 0..bins {
            self.spectrum_scratch[i] = Complex::new(re[i], im[i]);
        }
        self.spectrum_scratch[0].im = 0.0;
        self.spectrum_scratch[bins - 1].im = 0.0;
        let _ = self.c2r.process_with_scratch(
            &mut self.spectrum_scratch,
            &mut time[..self.size],
            &mut self.c2r_scratch,
        );
    }

    /// Log-magnitude inverse transform: `mag` (length `size/2 + 1`) to the
    /// real cepstrum `ceps` (length `size`), unnormalised.
    pub fn inverse_cepstral(&mut self, mag: &[f64], ceps: &mut [f64]) {
        let bins = self.size / 2 + 1;
        for i in 0..bins {
            self.spectrum_scratch[i] = Complex::new(mag[i].max(CEPSTRAL_LOG_FLOOR).ln(), 0.0);
        }
        let _ = self.c2r.process_with_scratch(
            &mut self.spectrum_scratch,
            &mut ceps[..self.size],
            &mut self.c2r_scratch,
        );
    }
}

/// Bin ranges for a cartesian-to-polar conversion.
///
/// Magnitudes are often needed over a wider range than phases (classification
/// and formant analysis want the full spectrum; resynthesis only needs phase
/// in the active band).
#[derive(Debug, Clone, Copy)]
pub struct ToPolarSpec {
    pub mag_from_bin: usize,
    pub mag_bin_count: usize,
    pub polar_from_bin: usize,
    pub polar_bin_count: usize,
}

/// Converts split re/im to magnitude and phase over the ranges in `spec`.
pub fn convert_to_polar(
    mag: &mut [f64],
    phase: &mut [f64],
    re: &[f64],
    im: &[f64],
    spec: &ToPolarSpec,
) {
    for i in spec.mag_from_bin..spec.mag_from_bin + spec.mag_bin_count {
        mag[i] = (re[i] * re[i] + im[i] * im[i]).sqrt();
    }
    for i in spec.polar_from_bin..spec.polar_from_bin + spec.polar_bin_count {
        phase[i] = im[i].atan2(re[i]);
    }
}

/// Converts magnitude and phase back to split re/im over `[from, from + count)`.
pub fn convert_to_cartesian(
    re: &mut [f64],
    im: &mut [f64],
    mag: &[f64],
    phase: &[f64],
    from: usize,
    count: usize,
) {
    for i in from..from + count {
        re[i] = mag[i] * phase[i].cos();
        im[i] = mag[i] * phase[i].sin();
    }
}

/// Returns the bin index nearest to `freq` Hz at the given FFT size.
#[inline]
pub fn bin_for_frequency(freq: f64, fft_size: usize, sample_rate: f64) -> usize {
    (freq * fft_size as f64 / sample_rate).round() as usize
}

/// Returns the centre frequency in Hz of `bin` at the given FFT size.
#[inline]
pub fn frequency_for_bin(bin: usize, fft_size: usize, sample_rate: f64) -> f64 {
    bin as f64 * sample_rate / fft_size as f64
}
