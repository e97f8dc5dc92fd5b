//! Per-frame output-hop calculation.

use log::warn;

/// Computes the output hop for each processed frame from the live ratios.
///
/// The engine aims for a fixed output hop and derives the input hop from it,
/// so this calculator's single-frame entry point is a direct ratio mapping.
#[derive(Debug)]
pub struct StretchCalculator {
    sample_rate: f64,
}

impl StretchCalculator {
    pub fn new(sample_rate: f64) -> Self {
        Self { sample_rate }
    }

    /// Returns the output hop for one frame.
    ///
    /// `effective_pitch_ratio` is the resampler-compensated `1 / pitch_scale`;
    /// the combined stretch applied by resynthesis alone is
    /// `time_ratio / effective_pitch_ratio`.
    #[allow(clippy::too_many_arguments)]
    pub fn calculate_single(
        &self,
        time_ratio: f64,
        effective_pitch_ratio: f64,
        _df: f64,
        inhop: usize,
        _analysis_window_size: usize,
        _synthesis_window_size: usize,
        _realtime: bool,
    ) -> usize {
        if effective_pitch_ratio <= 0.0 || time_ratio <= 0.0 {
            warn!(
                "StretchCalculator::calculate_single: degenerate ratios {} / {}",
                time_ratio, effective_pitch_ratio
            );
            return 1;
        }
        let outhop = (inhop as f64 * time_ratio / effective_pitch_ratio).round();
        outhop.max(1.0) as usize
    }

    /// Returns the sample rate the calculator was built for.
    #[inline]
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Clears accumulated state. The single-frame path is stateless; this
    /// exists for lifecycle symmetry with the rest of the engine.
    pub fn reset(&mut self) {}
}
