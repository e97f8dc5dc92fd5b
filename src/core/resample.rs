//! Streaming sample-rate conversion via cubic and windowed-sinc interpolation.
//!
//! Unlike a one-shot converter, this resampler is fed bounded chunks and keeps
//! per-channel interpolation history between calls, so it can run on the audio
//! path with no allocation after construction.

use log::warn;

/// Default number of sinc lobes for the high-quality kernel.
const SINC_LOBES: usize = 8;
/// Kaiser window beta for the sinc kernel (~60 dB stopband).
const SINC_KAISER_BETA: f64 = 6.0;
/// Per-call ratio slew when the ratio mostly stays fixed.
const SMOOTH_STEP_FIXED: f64 = 0.02;
/// Per-call ratio slew when the ratio changes often (finer steps).
const SMOOTH_STEP_CHANGING: f64 = 0.005;

/// Interpolation quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
    /// 4-point Hermite interpolation.
    FastestTolerable,
    /// 8-lobe Kaiser-windowed sinc interpolation.
    Best,
}

/// How often the conversion ratio is expected to change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dynamism {
    RatioMostlyFixed,
    RatioOftenChanging,
}

/// How a changed ratio is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RatioChange {
    /// Slew toward the new ratio over successive calls.
    Smooth,
    /// Apply the new ratio immediately.
    Sudden,
}

/// Construction parameters for [`Resampler`].
#[derive(Debug, Clone, Copy)]
pub struct ResamplerParameters {
    pub quality: Quality,
    pub dynamism: Dynamism,
    pub ratio_change: RatioChange,
    pub initial_sample_rate: f64,
    /// Largest per-call input count the caller will supply.
    pub max_buffer_size: usize,
}

#[derive(Debug)]
struct ChannelState {
    /// Pending input: interpolation history plus not-yet-consumed samples.
    pending: Vec<f32>,
    /// Fractional read index into `pending`.
    pos: f64,
    /// Ratio currently applied (after slewing). Zero until the first call.
    applied_ratio: f64,
}

/// Streaming multi-channel resampler.
///
/// Every channel is fed identical sample counts with the same ratio, so the
/// per-channel state machines stay in lockstep and per-call output counts are
/// identical across channels.
#[derive(Debug)]
pub struct Resampler {
    parameters: ResamplerParameters,
    channels: usize,
    state: Vec<ChannelState>,
    kernel_left: usize,
    kernel_right: usize,
}

impl Resampler {
    /// Creates a resampler for `channels` channels.
    pub fn new(parameters: ResamplerParameters, channels: usize) -> Self {
        let (kernel_left, kernel_right) = match parameters.quality {
            Quality::FastestTolerable => (1, 2),
            Quality::Best => (SINC_LOBES - 1, SINC_LOBES),
        };
        let capacity = parameters.max_buffer_size * 2 + kernel_left + kernel_right;
        let state = (0..channels)
            .map(|_| ChannelState {
                pending: Vec::with_capacity(capacity),
                pos: 0.0,
                applied_ratio: 0.0,
            })
            .collect();
        Self {
            parameters,
            channels,
            state,
            kernel_left,
            kernel_right,
        }
    }

    /// Returns the channel count this resampler was built for.
    #[inline]
    pub fn channel_count(&self) -> usize {
        self.channels
    }

    /// Reports the ratio that will actually be applied for a requested ratio.
    ///
    /// This implementation honours ratios exactly; the hook exists so that
    /// fixed-ratio variants can report their quantised ratio.
    #[inline]
    pub fn effective_ratio(&self, ratio: f64) -> f64 {
        ratio
    }

    /// Clears interpolation history and read positions.
    pub fn reset(&mut self) {
        for st in &mut self.state {
            st.pending.clear();
            st.pos = 0.0;
            st.applied_ratio = 0.0;
        }
    }

    /// Resamples one channel's chunk, appending `input` to that channel's
    /// pending window and producing as many output samples as the window
    /// (and `output.len()`) allows.
    ///
    /// Returns the number of samples written. Counts are identical across
    /// channels fed identical input lengths.
    pub fn resample_channel(
        &mut self,
        channel: usize,
        output: &mut [f32],
        input: &[f32],
        ratio: f64,
        final_pass: bool,
    ) -> usize {
        let quality = self.parameters.quality;
        let slew = match (self.parameters.ratio_change, self.parameters.dynamism) {
            (RatioChange::Sudden, _) => f64::INFINITY,
            (RatioChange::Smooth, Dynamism::RatioMostlyFixed) => SMOOTH_STEP_FIXED,
            (RatioChange::Smooth, Dynamism::RatioOftenChanging) => SMOOTH_STEP_CHANGING,
        };
        let st = &mut self.state[channel];

        let applied = if st.applied_ratio <= 0.0 {
            ratio
        } else {
            st.applied_ratio + (ratio - st.applied_ratio).clamp(-slew, slew)
        };
        st.applied_ratio = applied;

        let space = st.pending.capacity() - st.pending.len();
        if input.len() > space {
            warn!(
                "Resampler::resample_channel: pending window full, dropping {} samples",
                input.len() - space
            );
        }
        let take = input.len().min(space);
        st.pending.extend_from_slice(&input[..take]);

        let limit = if final_pass {
            st.pending.len() as f64
        } else {
            (st.pending.len() as f64 - self.kernel_right as f64).max(0.0)
        };

        let step = 1.0 / applied;
        let mut produced = 0;
        while produced < output.len() && st.pos < limit {
            output[produced] = match quality {
                Quality::FastestTolerable => interpolate_hermite(&st.pending, st.pos),
                Quality::Best => interpolate_sinc(&st.pending, st.pos, SINC_LOBES),
            };
            st.pos += step;
            produced += 1;
        }

        // Retire history no interpolation kernel can reach any more.
        let keep_from = (st.pos.floor().max(0.0) as usize).saturating_sub(self.kernel_left);
        if keep_from > 0 {
            let len = st.pending.len();
            let keep_from = keep_from.min(len);
            st.pending.copy_within(keep_from..len, 0);
            st.pending.truncate(len - keep_from);
            st.pos -= keep_from as f64;
        }

        produced
    }

    /// Resamples all channels at once: the array-of-channels form of
    /// [`Resampler::resample_channel`].
    ///
    /// Returns the per-channel number of samples written.
    pub fn resample(
        &mut self,
        outputs: &mut [&mut [f32]],
        out_capacity: usize,
        inputs: &[&[f32]],
        in_count: usize,
        ratio: f64,
        final_pass: bool,
    ) -> usize {
        let mut written = 0;
        for c in 0..self.channels {
            let out_len = out_capacity.min(outputs[c].len());
            let out = &mut outputs[c][..out_len];
            let n = self.resample_channel(c, out, &inputs[c][..in_count], ratio, final_pass);
            if c == 0 {
                written = n;
            } else if n != written {
                warn!(
                    "Resampler::resample: channel output imbalance: {} vs {}",
                    written, n
                );
                written = written.min(n);
            }
        }
        written
    }
}

/// 4-point Hermite interpolation at fractional index `pos`, clamping at the
/// edges of `data`.
fn interpolate_hermite(data: &[f32], pos: f64) -> f32 {
    if data.is_empty() {
        return 0.0;
    }
    let idx = pos.floor().max(0.0) as usize;
    let frac = (pos - idx as f64) as f32;
    let last = data.len() - 1;

    let s0 = data[idx.saturating_sub(1)];
    let s1 = data[idx.min(last)];
    let s2 = data[(idx + 1).min(last)];
    let s3 = data[(idx + 2).min(last)];

    let c0 = s1;
    let c1 = 0.5 * (s2 - s0);
    let c2 = s0 - 2.5 * s1 + 2.0 * s2 - 0.5 * s3;
    let c3 = 0.5 * (s3 - s0) + 1.5 * (s1 - s2);

    ((c3 * frac + c2) * frac + c1) * frac + c0
}

/// Kaiser-windowed sinc interpolation at fractional index `pos`, clamping at
/// the edges of `data`.
fn interpolate_sinc(data: &[f32], pos: f64, lobes: usize) -> f32 {
    if data.is_empty() {
        return 0.0;
    }
    let center = pos.floor().max(0.0) as isize;
    let frac = pos - center as f64;
    let bessel_beta = bessel_i0(SINC_KAISER_BETA);

    let mut sample = 0.0f64;
    let mut weight_sum = 0.0f64;
    let start = -(lobes as isize) + 1;
    let end = lobes as isize + 1;
    for j in start..end {
        let idx = (center + j).clamp(0, data.len() as isize - 1) as usize;
        let x = frac - j as f64;
        let sinc_val = if x.abs() < 1e-10 {
            1.0
        } else {
            let pi_x = std::f64::consts::PI * x;
            pi_x.sin() / pi_x
        };
        let t = (j as f64 - frac) / lobes as f64;
        let window = if t.abs() <= 1.0 {
            bessel_i0(SINC_KAISER_BETA * (1.0 - t * t).max(0.0).sqrt()) / bessel_beta
        } else {
            0.0
        };
        let w = sinc_val * window;
        sample += data[idx] as f64 * w;
        weight_sum += w;
    }

    if weight_sum.abs() > 1e-10 {
        sample /= weight_sum;
    }
    sample as f32
}

/// Modified Bessel function of the first kind, order zero, via power series.
fn bessel_i0(x: f64) -> f64 {
    let mut sum = 1.0f64;
    let mut term = 1.0f64;
    let half_x = x * 0.5;
    for k in 1..=25 {
        term *= (half_x / k as f64) * (half_x / k as f64);
        sum += term;
        if term < sum * 1e-16 {
            break;
        }
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make(quality: Quality, ratio_change: RatioChange) -> Resampler {
        Resampler::new(
            ResamplerParameters {
                quality,
                dynamism: Dynamism::RatioMostlyFixed,
                ratio_change,
                initial_sample_rate: 48000.0,
                max_buffer_size: 1024,
            },
            1,
        )
    }

    #[test]
    fn unity_ratio_reproduces_input() {
        let mut rs = make(Quality::FastestTolerable, RatioChange::Sudden);
        let input: Vec<f32> = (0..256).map(|i| (i as f32 * 0.1).sin()).collect();
        let mut output = vec![0.0f32; 512];
        let n = rs.resample_channel(0, &mut output, &input, 1.0, true);
        assert_eq!(n, 256);
        // Interior samples match; the first few pass through the edge clamp.
        for i in 4..252 {
            assert!(
                (output[i] - input[i]).abs() < 1e-3,
                "sample {}: {} vs {}",
                i,
                output[i],
                input[i]
            );
        }
    }

    #[test]
    fn half_ratio_halves_output_count() {
        let mut rs = make(Quality::FastestTolerable, RatioChange::Sudden);
        let input = vec![0.5f32; 1000];
        let mut output = vec![0.0f32; 1000];
        let n = rs.resample_channel(0, &mut output, &input, 0.5, true);
        assert!((n as i64 - 500).unsigned_abs() <= 2, "got {}", n);
    }

    #[test]
    fn double_ratio_streams_across_calls() {
        let mut rs = make(Quality::FastestTolerable, RatioChange::Sudden);
        let input: Vec<f32> = (0..2048).map(|i| (i as f32 * 0.01).sin()).collect();
        let mut total = 0usize;
        let mut output = vec![0.0f32; 4096];
        for chunk in input.chunks(256) {
            total += rs.resample_channel(0, &mut output, chunk, 2.0, false);
        }
        total += rs.resample_channel(0, &mut output, &[], 2.0, true);
        assert!(
            (total as i64 - 4096).unsigned_abs() <= 32,
            "total {} not near 4096",
            total
        );
    }

    #[test]
    fn channels_stay_in_lockstep() {
        let mut rs = Resampler::new(
            ResamplerParameters {
                quality: Quality::Best,
                dynamism: Dynamism::RatioMostlyFixed,
                ratio_change: RatioChange::Sudden,
                initial_sample_rate: 48000.0,
                max_buffer_size: 512,
            },
            2,
        );
        let left = vec![0.25f32; 512];
        let right = vec![-0.25f32; 512];
        let mut out_l = vec![0.0f32; 1024];
        let mut out_r = vec![0.0f32; 1024];
        let n = {
            let mut outs: [&mut [f32]; 2] = [&mut out_l, &mut out_r];
            rs.resample(&mut outs, 1024, &[&left, &right], 512, 1.25, false)
        };
        let n2 = {
            let mut outs: [&mut [f32]; 2] = [&mut out_l, &mut out_r];
            rs.resample(&mut outs, 1024, &[&left, &right], 512, 1.25, false)
        };
        assert!(n > 0 && n2 > 0);
    }

    #[test]
    fn smooth_ratio_change_slews() {
        let mut rs = make(Quality::FastestTolerable, RatioChange::Smooth);
        let input = vec![0.0f32; 256];
        let mut output = vec![0.0f32; 1024];
        rs.resample_channel(0, &mut output, &input, 1.0, false);
        rs.resample_channel(0, &mut output, &input, 2.0, false);
        let applied = rs.state[0].applied_ratio;
        assert!(
            applied < 1.1,
            "applied ratio {} should move only one slew step",
            applied
        );
    }

    #[test]
    fn reset_clears_state() {
        let mut rs = make(Quality::FastestTolerable, RatioChange::Sudden);
        let input = vec![1.0f32; 128];
        let mut output = vec![0.0f32; 256];
        rs.resample_channel(0, &mut output, &input, 1.0, false);
        rs.reset();
        assert_eq!(rs.state[0].pending.len(), 0);
        assert_eq!(rs.state[0].pos, 0.0);
    }

    #[test]
    fn effective_ratio_is_identity() {
        let rs = make(Quality::Best, RatioChange::Sudden);
        assert_eq!(rs.effective_ratio(0.75), 0.75);
    }
}
