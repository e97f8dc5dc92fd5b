//! Engine options and construction parameters.

use std::ops::{BitOr, BitOrAssign};

/// Engine option flags.
///
/// Options are fixed at construction, except the formant bits which
/// [`crate::Stretcher::set_formant_option`] may replace at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Options(u32);

impl Options {
    /// Offline study-then-process operation (default).
    pub const NONE: Options = Options(0);
    /// Realtime operation: bounded-latency streaming, no study pass.
    pub const REALTIME: Options = Options(1 << 0);
    /// Formants move with the pitch (default; this is the zero value).
    pub const FORMANT_SHIFTED: Options = Options(0);
    /// Formants are held at their original frequencies while pitch shifts.
    pub const FORMANT_PRESERVED: Options = Options(1 << 1);
    /// Use the high-quality resampler kernel for pitch shifting.
    pub const PITCH_HIGH_QUALITY: Options = Options(1 << 2);
    /// Keep the resampler engaged across ratio changes for consistency.
    pub const PITCH_HIGH_CONSISTENCY: Options = Options(1 << 3);
    /// Lock phase decisions across channels to preserve the stereo image.
    pub const CHANNELS_TOGETHER: Options = Options(1 << 4);

    /// The bits [`crate::Stretcher::set_formant_option`] may replace.
    pub const FORMANT_MASK: Options = Options(1 << 1);

    /// Returns true when every bit of `other` is set in `self`.
    #[inline]
    pub fn contains(self, other: Options) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns the raw bit representation.
    #[inline]
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Rebuilds options from raw bits.
    #[inline]
    pub fn from_bits(bits: u32) -> Options {
        Options(bits)
    }
}

impl BitOr for Options {
    type Output = Options;
    #[inline]
    fn bitor(self, rhs: Options) -> Options {
        Options(self.0 | rhs.0)
    }
}

impl BitOrAssign for Options {
    #[inline]
    fn bitor_assign(&mut self, rhs: Options) {
        self.0 |= rhs.0;
    }
}

/// Construction parameters for [`crate::Stretcher`].
#[derive(Debug, Clone, Copy)]
pub struct StretcherParams {
    /// Sample rate in Hz.
    pub sample_rate: f64,
    /// Number of channels.
    pub channels: usize,
    /// Option flags.
    pub options: Options,
}

impl StretcherParams {
    /// Creates parameters with the given sample rate, one channel, offline
    /// operation.
    pub fn new(sample_rate: f64) -> Self {
        Self {
            sample_rate,
            channels: 1,
            options: Options::NONE,
        }
    }

    /// Sets the channel count.
    pub fn with_channels(mut self, channels: usize) -> Self {
        self.channels = channels;
        self
    }

    /// Sets the option flags.
    pub fn with_options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_combine_and_query() {
        let o = Options::REALTIME | Options::FORMANT_PRESERVED;
        assert!(o.contains(Options::REALTIME));
        assert!(o.contains(Options::FORMANT_PRESERVED));
        assert!(!o.contains(Options::CHANNELS_TOGETHER));
        // The empty mask is contained in everything.
        assert!(o.contains(Options::FORMANT_SHIFTED));
    }

    #[test]
    fn options_round_trip_bits() {
        let o = Options::PITCH_HIGH_QUALITY | Options::PITCH_HIGH_CONSISTENCY;
        assert_eq!(Options::from_bits(o.bits()), o);
    }

    #[test]
    fn params_builder() {
        let p = StretcherParams::new(48000.0)
            .with_channels(2)
            .with_options(Options::REALTIME);
        assert_eq!(p.sample_rate, 48000.0);
        assert_eq!(p.channels, 2);
        assert!(p.options.contains(Options::REALTIME));
    }
}
