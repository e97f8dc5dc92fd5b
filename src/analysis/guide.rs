//! Per-frame frequency-band guidance.
//!
//! The guide owns the engine's fixed multi-resolution configuration (which FFT
//! scales exist, which bin ranges each may touch) and, once per channel per
//! frame, decides which bands are active, whether a kick transient is present
//! or imminent, and whether phases should be reset or locked across channels.

use crate::analysis::classify::Segmentation;
use crate::core::fft::bin_for_frequency;

/// Maximum number of simultaneously active FFT bands.
pub const MAX_FFT_BANDS: usize = 3;

/// Crossover between the longest scale and the classification scale.
const LOW_CROSSOVER_HZ: f64 = 600.0;
/// Crossover between the classification scale and the shortest scale.
const HIGH_CROSSOVER_HZ: f64 = 4000.0;
/// Output hop above which the shortest scale loses adequate overlap.
const SHORT_SCALE_OUTHOP_LIMIT: usize = 256;
/// Kick band edges in Hz.
const KICK_F0_HZ: f64 = 40.0;
const KICK_F1_HZ: f64 = 240.0;
/// Low-band energy rise factor that registers an onset.
const KICK_RISE: f64 = 2.0;
/// Absolute low-band energy floor below which onsets are ignored.
const KICK_ENERGY_FLOOR: f64 = 1e-6;
/// Consecutive unity frames before resynthesis goes transparent (offline).
const UNITY_RESET_FRAMES_OFFLINE: usize = 1;
/// Realtime waits longer, in case the ratio is merely passing through 1.
const UNITY_RESET_FRAMES_REALTIME: usize = 3;

/// One active FFT band: resynthesise `[f0, f1)` Hz from scale `fft_size`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FftBand {
    pub fft_size: usize,
    pub f0: f64,
    pub f1: f64,
}

/// A flag over a frequency band.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BandFlag {
    pub present: bool,
    pub f0: f64,
    pub f1: f64,
}

/// Per-channel, per-frame guidance for phase advance and resynthesis.
#[derive(Debug, Clone, Default)]
pub struct Guidance {
    pub fft_bands: [FftBand; MAX_FFT_BANDS],
    pub band_count: usize,
    pub kick: BandFlag,
    pub pre_kick: BandFlag,
    pub phase_reset: BandFlag,
    pub channel_lock: bool,
}

impl Guidance {
    /// The bands active this frame, ordered low to high.
    #[inline]
    pub fn active_bands(&self) -> &[FftBand] {
        &self.fft_bands[..self.band_count]
    }
}

/// Bin extremes one scale may touch across every guidance the guide can emit.
#[derive(Debug, Clone, Copy)]
pub struct BandLimits {
    pub fft_size: usize,
    pub f0: f64,
    pub f1: f64,
    pub b0min: usize,
    pub b1max: usize,
}

/// The fixed multi-resolution configuration, immutable after construction.
#[derive(Debug, Clone)]
pub struct GuideConfiguration {
    pub fft_band_limits: Vec<BandLimits>,
    pub longest_fft_size: usize,
    pub classification_fft_size: usize,
}

impl GuideConfiguration {
    /// Returns the limits entry for the given scale.
    pub fn band_for(&self, fft_size: usize) -> Option<&BandLimits> {
        self.fft_band_limits.iter().find(|b| b.fft_size == fft_size)
    }
}

/// Construction parameters for [`Guide`].
#[derive(Debug, Clone, Copy)]
pub struct GuideParameters {
    pub sample_rate: f64,
}

/// Frame-by-frame band and transient guidance. Stateless apart from its
/// configuration, so one instance serves every channel.
#[derive(Debug)]
pub struct Guide {
    parameters: GuideParameters,
    configuration: GuideConfiguration,
}

impl Guide {
    pub fn new(parameters: GuideParameters) -> Self {
        let nyquist = parameters.sample_rate / 2.0;
        let low = LOW_CROSSOVER_HZ.min(nyquist);
        let high = HIGH_CROSSOVER_HZ.min(nyquist);

        let mut limits = Vec::new();
        limits.push(BandLimits {
            fft_size: 4096,
            f0: 0.0,
            f1: low,
            b0min: 0,
            b1max: (bin_for_frequency(low, 4096, parameters.sample_rate) + 4).min(2048),
        });
        // The middle scale absorbs the top band whenever the short scale is
        // dropped, so its upper limit is Nyquist.
        limits.push(BandLimits {
            fft_size: 2048,
            f0: low,
            f1: high,
            b0min: bin_for_frequency(low / 2.0, 2048, parameters.sample_rate),
            b1max: 1024,
        });
        if high < nyquist {
            limits.push(BandLimits {
                fft_size: 1024,
                f0: high,
                f1: nyquist,
                b0min: bin_for_frequency(high / 2.0, 1024, parameters.sample_rate),
                b1max: 512,
            });
        }

        let configuration = GuideConfiguration {
            fft_band_limits: limits,
            longest_fft_size: 4096,
            classification_fft_size: 2048,
        };
        Self {
            parameters,
            configuration,
        }
    }

    /// The configuration is fixed for the lifetime of the guide.
    #[inline]
    pub fn configuration(&self) -> &GuideConfiguration {
        &self.configuration
    }

    /// Computes guidance for one channel's frame.
    ///
    /// `mag`/`prev_mag` are the classification-scale magnitudes of the current
    /// and previous frame (scaled by 1/fft_size); `readahead_mag` is the
    /// unscaled one-hop-ahead magnitude row. The three segmentations are
    /// previous / current / readahead.
    #[allow(clippy::too_many_arguments)]
    pub fn update_guidance(
        &self,
        ratio: f64,
        prev_outhop: usize,
        mag: &[f64],
        prev_mag: &[f64],
        readahead_mag: &[f64],
        segmentation: &Segmentation,
        prev_segmentation: &Segmentation,
        next_segmentation: &Segmentation,
        mean_mag: f64,
        unity_count: usize,
        realtime: bool,
        channels_together: bool,
        guidance: &mut Guidance,
    ) {
        let nyquist = self.parameters.sample_rate / 2.0;

        // Active bands. Above the hop limit the shortest scale's overlap is
        // inadequate, so its band folds into the classification scale.
        let drop_short = prev_outhop > SHORT_SCALE_OUTHOP_LIMIT;
        let mut count = 0;
        for limit in &self.configuration.fft_band_limits {
            if limit.f1 <= limit.f0 {
                continue;
            }
            let mut band = FftBand {
                fft_size: limit.fft_size,
                f0: limit.f0,
                f1: limit.f1,
            };
            if limit.fft_size == 1024 && drop_short {
                continue;
            }
            if limit.fft_size == 2048
                && (drop_short || self.configuration.fft_band_limits.len() == 2)
            {
                band.f1 = nyquist;
            }
            guidance.fft_bands[count] = band;
            count += 1;
        }
        guidance.band_count = count;

        // Kick / pre-kick onsets from low-band energy rise. The readahead row
        // is unscaled; bring it into the same scale as `mag` first.
        let classify = self.configuration.classification_fft_size;
        let b0 = bin_for_frequency(KICK_F0_HZ, classify, self.parameters.sample_rate);
        let b1 = bin_for_frequency(KICK_F1_HZ, classify, self.parameters.sample_rate);
        let e_now = band_mean(mag, b0, b1);
        let e_prev = band_mean(prev_mag, b0, b1);
        let e_next = band_mean(readahead_mag, b0, b1) / classify as f64;
        // Quiet passages must not register onsets: gate on the overall level.
        let floor = KICK_ENERGY_FLOOR.max(mean_mag * 0.25);

        let kick_present = e_now > KICK_RISE * e_prev
            && e_now > floor
            && segmentation.percussive_below >= KICK_F0_HZ;
        let pre_kick_present = !kick_present
            && e_next > KICK_RISE * e_now
            && e_next > floor
            && next_segmentation.percussive_below >= KICK_F0_HZ;

        guidance.kick = BandFlag {
            present: kick_present,
            f0: KICK_F0_HZ,
            f1: KICK_F1_HZ.min(nyquist),
        };
        guidance.pre_kick = BandFlag {
            present: pre_kick_present,
            f0: KICK_F0_HZ,
            f1: KICK_F1_HZ.min(nyquist),
        };

        // Phase reset: transparent resynthesis at unity, phase restart on a
        // fresh kick onset.
        let unity_threshold = if realtime {
            UNITY_RESET_FRAMES_REALTIME
        } else {
            UNITY_RESET_FRAMES_OFFLINE
        };
        if unity_count >= unity_threshold && (ratio - 1.0).abs() < 1e-6 {
            guidance.phase_reset = BandFlag {
                present: true,
                f0: 0.0,
                f1: nyquist,
            };
        } else if kick_present && prev_segmentation.percussive_below < KICK_F0_HZ {
            guidance.phase_reset = BandFlag {
                present: true,
                f0: KICK_F0_HZ,
                f1: KICK_F1_HZ.min(nyquist),
            };
        } else {
            guidance.phase_reset = BandFlag::default();
        }

        guidance.channel_lock = channels_together;
    }
}

/// Mean of `mag[b0..=b1]`, clamped to the slice.
fn band_mean(mag: &[f64], b0: usize, b1: usize) -> f64 {
    let b1 = b1.min(mag.len().saturating_sub(1));
    if b0 > b1 {
        return 0.0;
    }
    let sum: f64 = mag[b0..=b1].iter().sum();
    sum / (b1 - b0 + 1) as f64
}
