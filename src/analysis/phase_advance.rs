//! Guided per-bin phase advance for one STFT scale across all channels.
//!
//! Implements the classic vocoder advance (expected per-bin phase increment,
//! wrapped deviation, instantaneous frequency, synthesis-hop scaling) with
//! identity phase locking: non-peak bins inherit their nearest peak's phase
//! rotation so that vertical phase coherence survives the stretch. Guidance
//! can request a verbatim phase copy over a band (transparent resynthesis at
//! unity, phase restart on transients) and cross-channel locking.

use crate::analysis::guide::Guidance;
use crate::core::fft::bin_for_frequency;

const TWO_PI: f64 = 2.0 * std::f64::consts::PI;
/// Minimum magnitude for a bin to count as a spectral peak.
const PEAK_MAGNITUDE_FLOOR: f64 = 1e-8;

/// Construction parameters for [`GuidedPhaseAdvance`].
#[derive(Debug, Clone, Copy)]
pub struct GuidedParameters {
    pub fft_size: usize,
    pub sample_rate: f64,
    pub channels: usize,
}

/// Phase advance state for one scale, shared across channels.
///
/// Holds each channel's previous analysis phase and the rotation channel 0
/// applied this frame (for cross-channel locking). All buffers are allocated
/// at construction.
#[derive(Debug)]
pub struct GuidedPhaseAdvance {
    parameters: GuidedParameters,
    bin_count: usize,
    prev_phase: Vec<Vec<f64>>,
    have_prev: Vec<bool>,
    ch0_rotation: Vec<f64>,
    peaks: Vec<usize>,
}

impl GuidedPhaseAdvance {
    pub fn new(parameters: GuidedParameters) -> Self {
        let bin_count = parameters.fft_size / 2 + 1;
        Self {
            parameters,
            bin_count,
            prev_phase: (0..parameters.channels).map(|_| vec![0.0; bin_count]).collect(),
            have_prev: vec![false; parameters.channels],
            ch0_rotation: vec![0.0; bin_count],
            peaks: Vec::with_capacity(bin_count / 4),
        }
    }

    /// Forgets all phase history.
    pub fn reset(&mut self) {
        for p in &mut self.prev_phase {
            p.fill(0.0);
        }
        self.have_prev.fill(false);
        self.ch0_rotation.fill(0.0);
        self.peaks.clear();
    }

    /// Advances one channel's phases for this scale.
    ///
    /// `advanced` holds the previous frame's synthesis phase on entry (the
    /// accumulator) and the new synthesis phase on return. Channels must be
    /// advanced in index order within a frame: channel 0 records the rotation
    /// that later channels copy when `guidance.channel_lock` is set.
    #[allow(clippy::too_many_arguments)]
    pub fn advance_channel(
        &mut self,
        channel: usize,
        advanced: &mut [f64],
        mag: &[f64],
        phase: &[f64],
        prev_mag: &[f64],
        guidance: &Guidance,
        prev_inhop: usize,
        prev_outhop: usize,
    ) {
        let bins = self.bin_count;
        let fft_size = self.parameters.fft_size as f64;
        let inhop = prev_inhop.max(1) as f64;
        let ratio = prev_outhop as f64 / inhop;
        let first_frame = !self.have_prev[channel];

        let (reset_lo, reset_hi) = if guidance.phase_reset.present {
            (
                bin_for_frequency(
                    guidance.phase_reset.f0,
                    self.parameters.fft_size,
                    self.parameters.sample_rate,
                ),
                bin_for_frequency(
                    guidance.phase_reset.f1,
                    self.parameters.fft_size,
                    self.parameters.sample_rate,
                )
                .min(bins - 1),
            )
        } else {
            (1, 0)
        };
        let in_reset = |i: usize| guidance.phase_reset.present && i >= reset_lo && i <= reset_hi;

        let prev = &self.prev_phase[channel];
        for i in 0..bins {
            if first_frame || in_reset(i) {
                advanced[i] = phase[i];
            } else {
                let omega = TWO_PI * i as f64 * inhop / fft_size;
                let deviation = princarg(phase[i] - prev[i] - omega);
                advanced[i] = princarg(advanced[i] + (omega + deviation) * ratio);
            }
        }

        // Identity phase locking: troughs take their nearest peak's rotation,
        // keeping the analysis phase offset. Peaks are found on the larger of
        // the current and previous magnitude so assignments stay stable
        // across frames.
        if !first_frame && bins >= 3 {
            self.peaks.clear();
            for i in 1..bins - 1 {
                let m = mag[i].max(prev_mag[i]);
                if m > PEAK_MAGNITUDE_FLOOR
                    && m > mag[i - 1].max(prev_mag[i - 1])
                    && m > mag[i + 1].max(prev_mag[i + 1])
                {
                    self.peaks.push(i);
                }
            }
            if !self.peaks.is_empty() {
                let mut peak_idx = 0;
                for i in 0..bins {
                    // Walk to the peak nearest this bin; peaks are ascending.
                    while peak_idx + 1 < self.peaks.len()
                        && self.peaks[peak_idx + 1].abs_diff(i) < self.peaks[peak_idx].abs_diff(i)
                    {
                        peak_idx += 1;
                    }
                    let p = self.peaks[peak_idx];
                    if p == i || in_reset(i) || in_reset(p) {
                        continue;
                    }
                    advanced[i] = princarg(advanced[p] + phase[i] - phase[p]);
                }
            }
        }

        if channel == 0 {
            for i in 0..bins {
                self.ch0_rotation[i] = advanced[i] - phase[i];
            }
        } else if guidance.channel_lock {
            // Tighter channel lock: every channel takes channel 0's rotation,
            // preserving inter-channel phase structure.
            for i in 0..bins {
                advanced[i] = princarg(phase[i] + self.ch0_rotation[i]);
            }
        }

        self.prev_phase[channel].copy_from_slice(&phase[..bins]);
        self.have_prev[channel] = true;
    }
}

/// Wraps an angle to (-pi, pi].
#[inline]
pub fn princarg(angle: f64) -> f64 {
    let wrapped = angle.rem_euclid(TWO_PI);
    if wrapped > std::f64::consts::PI {
        wrapped - TWO_PI
    } else {
        wrapped
    }
}
