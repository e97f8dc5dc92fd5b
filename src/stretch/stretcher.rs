//! The multi-resolution time-stretch / pitch-shift engine.
//!
//! One `Stretcher` drives the whole per-frame pipeline: ingest into per-channel
//! rings, multi-scale windowed analysis with a one-hop classification
//! readahead, guidance, cross-channel guided phase advance, optional formant
//! preservation, pre-kick magnitude deferral, per-scale resynthesis with
//! overlap-add mixdown, optional resampling for pitch, and emission with
//! offline start-skip and target-duration bookkeeping.
//!
//! Live ratios are atomics: a control thread may store them while the audio
//! thread reads. The audio path (`process`, `retrieve`, `available`,
//! `samples_required`) takes no locks and allocates only in the logged
//! defensive-regrowth path of `process`.

use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use atomic_float::AtomicF64;
use log::{debug, trace, warn};

use crate::analysis::calculator::StretchCalculator;
use crate::analysis::classify::{ClassifierParameters, SegmenterParameters};
use crate::analysis::guide::{Guide, GuideConfiguration, GuideParameters};
use crate::core::fft::{
    bin_for_frequency, convert_to_cartesian, convert_to_polar, ToPolarSpec,
};
use crate::core::resample::{
    Dynamism, Quality, RatioChange, Resampler, ResamplerParameters,
};
use crate::core::window::fft_shift;
use crate::error::StretchError;
use crate::stretch::channel::{ChannelData, ScaleData};
use crate::stretch::params::{Options, StretcherParams};

/// Highest frequency the classifier looks at.
const MAX_CLASSIFIER_FREQUENCY_HZ: f64 = 16000.0;
/// Minimum same-class bin run for a segmentation boundary.
const SEGMENTER_MIN_RUN: usize = 4;
/// Input ring size in multiples of the longest FFT.
const IN_RING_FACTOR: usize = 2;
/// Output ring size in multiples of the longest FFT.
const OUT_RING_FACTOR: usize = 16;
/// Cepstral lifter cutoff is `sample_rate / CEPSTRAL_CUTOFF_DIVISOR` bins.
const CEPSTRAL_CUTOFF_DIVISOR: f64 = 650.0;
/// Formant correction applies below this frequency.
const FORMANT_TOP_HZ: f64 = 10000.0;
/// Largest magnitude ratio the formant correction may apply.
const FORMANT_MAX_RATIO: f64 = 60.0;
/// Spectral-envelope ceiling.
const ENVELOPE_CLAMP: f64 = 1e10;
/// Effective ratios this close to 1 count as unity.
const UNITY_EPSILON: f64 = 1e-7;
/// Input hop bounds; extremes are clamped and logged, not rejected.
const MIN_INHOP: f64 = 1.0;
const MAX_INHOP: f64 = 1024.0;

/// Engine lifecycle stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessMode {
    JustCreated,
    Studying,
    Processing,
    Finished,
}

/// Realtime-capable multi-resolution time stretcher and pitch shifter.
pub struct Stretcher {
    sample_rate: f64,
    channels: usize,
    options: AtomicU32,
    time_ratio: AtomicF64,
    pitch_scale: AtomicF64,
    formant_scale: AtomicF64,
    inhop: AtomicUsize,

    guide: Guide,
    configuration: GuideConfiguration,
    channel_data: Vec<ChannelData>,
    scale_data: BTreeMap<usize, ScaleData>,
    calculator: StretchCalculator,
    resampler: Option<Resampler>,

    prev_inhop: usize,
    prev_outhop: usize,
    unity_count: usize,
    start_skip: usize,
    study_input_duration: usize,
    supplied_input_duration: usize,
    total_target_duration: usize,
    consumed_input_duration: usize,
    last_key_frame_surpassed: usize,
    total_output_duration: usize,
    key_frame_map: BTreeMap<usize, usize>,
    mode: ProcessMode,
}

impl std::fmt::Debug for Stretcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stretcher")
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels)
            .field("time_ratio", &self.time_ratio.load(Ordering::Relaxed))
            .field("pitch_scale", &self.pitch_scale.load(Ordering::Relaxed))
            .field("inhop", &self.inhop.load(Ordering::Relaxed))
            .field("mode", &self.mode)
            .finish()
    }
}

impl Stretcher {
    /// Creates a stretcher with the given parameters and initial ratios.
    ///
    /// All buffers for every channel and scale are allocated here; the audio
    /// path never reallocates them.
    pub fn new(
        params: StretcherParams,
        initial_time_ratio: f64,
        initial_pitch_scale: f64,
    ) -> Result<Self, StretchError> {
        if params.channels == 0 {
            return Err(StretchError::InvalidChannelCount(params.channels));
        }
        if !(params.sample_rate > 0.0) {
            return Err(StretchError::InvalidSampleRate(params.sample_rate as u32));
        }
        if !(initial_time_ratio > 0.0) || !initial_time_ratio.is_finite() {
            return Err(StretchError::InvalidRatio(format!(
                "time ratio {}",
                initial_time_ratio
            )));
        }
        if !(initial_pitch_scale > 0.0) || !initial_pitch_scale.is_finite() {
            return Err(StretchError::InvalidRatio(format!(
                "pitch scale {}",
                initial_pitch_scale
            )));
        }

        debug!(
            "Stretcher::new: rate {}, options {:#x}",
            params.sample_rate,
            params.options.bits()
        );
        debug!(
            "Stretcher::new: initial time ratio {}, pitch scale {}",
            initial_time_ratio, initial_pitch_scale
        );
        if !cfg!(target_has_atomic = "64") {
            warn!("Stretcher::new: platform lacks lock-free 64-bit atomics; ratio updates may not be realtime safe");
        }

        let guide = Guide::new(GuideParameters {
            sample_rate: params.sample_rate,
        });
        let configuration = guide.configuration().clone();
        let longest = configuration.longest_fft_size;
        let classify = configuration.classification_fft_size;

        let max_classifier_frequency =
            MAX_CLASSIFIER_FREQUENCY_HZ.min(params.sample_rate / 2.0);
        let classification_bins =
            (classify as f64 * max_classifier_frequency / params.sample_rate).floor() as usize;

        let classifier_parameters = ClassifierParameters::new(classification_bins);
        let segmenter_parameters = SegmenterParameters {
            fft_size: classify,
            bin_count: classification_bins,
            sample_rate: params.sample_rate,
            min_run_length: SEGMENTER_MIN_RUN,
        };

        let channel_data = (0..params.channels)
            .map(|_| {
                ChannelData::new(
                    &configuration,
                    classifier_parameters,
                    segmenter_parameters,
                    longest * IN_RING_FACTOR,
                    longest * OUT_RING_FACTOR,
                )
            })
            .collect();

        let mut scale_data = BTreeMap::new();
        for band in &configuration.fft_band_limits {
            scale_data.insert(
                band.fft_size,
                ScaleData::new(band.fft_size, params.sample_rate, params.channels),
            );
        }

        let realtime = params.options.contains(Options::REALTIME);
        // In offline mode the resampler is created lazily on the first
        // process call, and only if the pitch ratio is not 1.
        let resampler = if realtime {
            Some(build_resampler(params.options, params.sample_rate, longest, params.channels))
        } else {
            None
        };

        let mut stretcher = Self {
            sample_rate: params.sample_rate,
            channels: params.channels,
            options: AtomicU32::new(params.options.bits()),
            time_ratio: AtomicF64::new(initial_time_ratio),
            pitch_scale: AtomicF64::new(initial_pitch_scale),
            formant_scale: AtomicF64::new(0.0),
            inhop: AtomicUsize::new(1),
            guide,
            configuration,
            channel_data,
            scale_data,
            calculator: StretchCalculator::new(params.sample_rate),
            resampler,
            prev_inhop: 1,
            prev_outhop: 1,
            unity_count: 0,
            start_skip: 0,
            study_input_duration: 0,
            supplied_input_duration: 0,
            total_target_duration: 0,
            consumed_input_duration: 0,
            last_key_frame_surpassed: 0,
            total_output_duration: 0,
            key_frame_map: BTreeMap::new(),
            mode: ProcessMode::JustCreated,
        };

        stretcher.calculate_hop();
        stretcher.prev_inhop = stretcher.inhop.load(Ordering::Relaxed);
        stretcher.prev_outhop =
            (stretcher.prev_inhop as f64 * stretcher.effective_ratio()).round() as usize;

        Ok(stretcher)
    }

    /// Returns the current option flags.
    #[inline]
    pub fn options(&self) -> Options {
        Options::from_bits(self.options.load(Ordering::Relaxed))
    }

    #[inline]
    fn is_realtime(&self) -> bool {
        self.options().contains(Options::REALTIME)
    }

    /// Returns the current time ratio.
    #[inline]
    pub fn time_ratio(&self) -> f64 {
        self.time_ratio.load(Ordering::Relaxed)
    }

    /// Returns the current pitch scale.
    #[inline]
    pub fn pitch_scale(&self) -> f64 {
        self.pitch_scale.load(Ordering::Relaxed)
    }

    /// Returns the current formant scale (0 means automatic).
    #[inline]
    pub fn formant_scale(&self) -> f64 {
        self.formant_scale.load(Ordering::Relaxed)
    }

    /// Returns the channel count.
    #[inline]
    pub fn channel_count(&self) -> usize {
        self.channels
    }

    /// The pitch ratio the resampler will actually apply.
    fn effective_pitch_ratio(&self) -> f64 {
        let ratio = 1.0 / self.pitch_scale.load(Ordering::Relaxed);
        match &self.resampler {
            Some(r) => r.effective_ratio(ratio),
            None => ratio,
        }
    }

    /// The combined stretch resynthesis must deliver before resampling.
    fn effective_ratio(&self) -> f64 {
        self.time_ratio.load(Ordering::Relaxed) / self.effective_pitch_ratio()
    }

    /// Sets the time ratio. Realtime mode accepts this at any point; offline
    /// mode only before study/process has begun.
    pub fn set_time_ratio(&self, ratio: f64) {
        if !self.is_realtime()
            && (self.mode == ProcessMode::Studying || self.mode == ProcessMode::Processing)
        {
            warn!("Stretcher::set_time_ratio: cannot set time ratio while studying or processing in offline mode");
            return;
        }
        if !(ratio > 0.0) || !ratio.is_finite() {
            warn!("Stretcher::set_time_ratio: ignoring invalid ratio {}", ratio);
            return;
        }
        if ratio == self.time_ratio.load(Ordering::Relaxed) {
            return;
        }
        self.time_ratio.store(ratio, Ordering::Relaxed);
        self.calculate_hop();
    }

    /// Sets the pitch scale. Realtime mode accepts this at any point; offline
    /// mode only before study/process has begun.
    pub fn set_pitch_scale(&self, scale: f64) {
        if !self.is_realtime()
            && (self.mode == ProcessMode::Studying || self.mode == ProcessMode::Processing)
        {
            warn!("Stretcher::set_pitch_scale: cannot set pitch scale while studying or processing in offline mode");
            return;
        }
        if !(scale > 0.0) || !scale.is_finite() {
            warn!("Stretcher::set_pitch_scale: ignoring invalid scale {}", scale);
            return;
        }
        if scale == self.pitch_scale.load(Ordering::Relaxed) {
            return;
        }
        self.pitch_scale.store(scale, Ordering::Relaxed);
        self.calculate_hop();
    }

    /// Sets the formant scale. Zero selects the automatic value
    /// `1 / pitch_scale`.
    pub fn set_formant_scale(&self, scale: f64) {
        if !self.is_realtime()
            && (self.mode == ProcessMode::Studying || self.mode == ProcessMode::Processing)
        {
            warn!("Stretcher::set_formant_scale: cannot set formant scale while studying or processing in offline mode");
            return;
        }
        if !(scale >= 0.0) || !scale.is_finite() {
            warn!("Stretcher::set_formant_scale: ignoring invalid scale {}", scale);
            return;
        }
        self.formant_scale.store(scale, Ordering::Relaxed);
    }

    /// Replaces the formant bits of the option mask.
    pub fn set_formant_option(&self, options: Options) {
        let mask = Options::FORMANT_MASK.bits();
        let mut bits = self.options.load(Ordering::Relaxed);
        bits &= !mask;
        bits |= options.bits() & mask;
        self.options.store(bits, Ordering::Relaxed);
    }

    /// Pitch option changes after construction are not supported.
    pub fn set_pitch_option(&self, _options: Options) {
        warn!("Stretcher::set_pitch_option: option change after construction is not supported");
    }

    /// Installs a key-frame map (offline only, before processing starts).
    ///
    /// Keys are input sample positions, values the output positions they must
    /// map to.
    pub fn set_key_frame_map(&mut self, mapping: BTreeMap<usize, usize>) {
        if self.is_realtime() {
            warn!("Stretcher::set_key_frame_map: cannot specify key frame map in realtime mode");
            return;
        }
        if self.mode == ProcessMode::Processing || self.mode == ProcessMode::Finished {
            warn!("Stretcher::set_key_frame_map: cannot specify key frame map after process() has begun");
            return;
        }
        self.key_frame_map = mapping;
    }

    /// Declares the total input duration ahead of processing (offline).
    pub fn set_expected_input_duration(&mut self, samples: usize) {
        self.supplied_input_duration = samples;
    }

    /// Grows the input rings to hold `longest + n` samples, so `process`
    /// never has to resize them on the audio path.
    pub fn set_max_process_size(&mut self, n: usize) {
        let old_size = self.channel_data[0].inbuf.size();
        let new_size = self.configuration.longest_fft_size + n;
        if new_size > old_size {
            debug!("set_max_process_size: resizing from {} to {}", old_size, new_size);
            for cd in &mut self.channel_data {
                cd.inbuf = cd.inbuf.resized(new_size);
            }
        } else {
            debug!(
                "set_max_process_size: nothing to be done, new size {} <= {}",
                new_size, old_size
            );
        }
    }

    /// Offline mode: pads the start internally, so no caller pad is needed.
    /// Realtime mode: callers get best results feeding this much silence
    /// first.
    pub fn preferred_start_pad(&self) -> usize {
        if self.is_realtime() {
            self.configuration.longest_fft_size / 2
        } else {
            0
        }
    }

    /// Samples of output to discard before the stream proper begins
    /// (realtime only; offline output is already trimmed).
    pub fn start_delay(&self) -> usize {
        if self.is_realtime() {
            let factor = 0.5 / self.pitch_scale.load(Ordering::Relaxed);
            (self.configuration.longest_fft_size as f64 * factor).ceil() as usize
        } else {
            0
        }
    }

    /// Returns the engine to its just-constructed state.
    pub fn reset(&mut self) {
        self.calculator.reset();
        if let Some(resampler) = &mut self.resampler {
            resampler.reset();
        }
        for scale in self.scale_data.values_mut() {
            scale.guided.reset();
        }
        for cd in &mut self.channel_data {
            cd.reset();
        }

        self.prev_inhop = self.inhop.load(Ordering::Relaxed);
        self.prev_outhop = (self.prev_inhop as f64 * self.effective_ratio()).round() as usize;
        self.unity_count = 0;
        self.start_skip = 0;
        self.study_input_duration = 0;
        self.supplied_input_duration = 0;
        self.total_target_duration = 0;
        self.consumed_input_duration = 0;
        self.last_key_frame_surpassed = 0;
        self.total_output_duration = 0;
        self.key_frame_map.clear();
        self.mode = ProcessMode::JustCreated;
    }

    /// Offline study pass: counts input duration. No DSP runs.
    pub fn study(&mut self, input: &[&[f32]], _final_chunk: bool) {
        if self.is_realtime() {
            warn!("Stretcher::study: not meaningful in realtime mode");
            return;
        }
        if self.mode == ProcessMode::Processing || self.mode == ProcessMode::Finished {
            warn!("Stretcher::study: cannot study after processing");
            return;
        }
        if self.mode == ProcessMode::JustCreated {
            self.study_input_duration = 0;
        }
        self.mode = ProcessMode::Studying;
        self.study_input_duration += input.iter().map(|c| c.len()).min().unwrap_or(0);
    }

    /// Feeds `input` (one slice per channel) and runs the processing loop.
    ///
    /// Pass `final_chunk = true` with the last block (an empty block is fine);
    /// afterwards the engine drains and [`Stretcher::available`] eventually
    /// reports -1.
    pub fn process(&mut self, input: &[&[f32]], final_chunk: bool) {
        if self.mode == ProcessMode::Finished {
            warn!("Stretcher::process: cannot process again after final chunk");
            return;
        }
        if input.len() != self.channels {
            warn!(
                "Stretcher::process: expected {} channels, got {}",
                self.channels,
                input.len()
            );
            return;
        }
        let samples = input.iter().map(|c| c.len()).min().unwrap_or(0);

        if !self.is_realtime() {
            if self.mode == ProcessMode::Studying {
                self.total_target_duration = (self.study_input_duration as f64
                    * self.time_ratio.load(Ordering::Relaxed))
                .round() as usize;
                debug!(
                    "study duration {} gives target duration {}",
                    self.study_input_duration, self.total_target_duration
                );
            } else if self.mode == ProcessMode::JustCreated && self.supplied_input_duration != 0 {
                self.total_target_duration = (self.supplied_input_duration as f64
                    * self.time_ratio.load(Ordering::Relaxed))
                .round() as usize;
                debug!(
                    "supplied duration {} gives target duration {}",
                    self.supplied_input_duration, self.total_target_duration
                );
            }

            // Checked on every process round; must follow the overall target
            // calculation (which uses the global time ratio) and precede any
            // other use of the ratio.
            if !self.key_frame_map.is_empty() {
                self.update_ratio_from_map();
            }

            if self.mode == ProcessMode::JustCreated || self.mode == ProcessMode::Studying {
                let pitch_scale = self.pitch_scale.load(Ordering::Relaxed);
                if pitch_scale != 1.0 && self.resampler.is_none() {
                    self.resampler = Some(build_resampler(
                        self.options(),
                        self.sample_rate,
                        self.configuration.longest_fft_size,
                        self.channels,
                    ));
                }

                // Prefill to half the longest frame. Realtime mode skips this:
                // better to start with a swoosh than add latency.
                let pad = self.configuration.longest_fft_size / 2;
                debug!("offline mode: prefilling with {}", pad);
                for cd in &mut self.channel_data {
                    cd.inbuf.zero(pad);
                }
                // By the time this is skipped the stream may have been
                // resampled as well as stretched.
                self.start_skip = (pad as f64 / pitch_scale).round() as usize;
                debug!("start skip is {}", self.start_skip);
            }
        }

        self.mode = if final_chunk {
            ProcessMode::Finished
        } else {
            ProcessMode::Processing
        };

        let write_space = self.channel_data[0].inbuf.write_space();
        if samples > write_space {
            warn!(
                "Stretcher::process: forced to increase input buffer size; write space {} < samples {}. Call set_max_process_size before going live",
                write_space, samples
            );
            let new_size = self.channel_data[0].inbuf.size() - write_space + samples;
            for cd in &mut self.channel_data {
                cd.inbuf = cd.inbuf.resized(new_size);
            }
        }

        for (c, cd) in self.channel_data.iter_mut().enumerate() {
            cd.inbuf.write(&input[c][..samples]);
        }

        self.consume();
    }

    /// Samples ready to retrieve, or -1 once the stream has finished and
    /// drained.
    pub fn available(&self) -> isize {
        let av = self.channel_data[0].outbuf.read_space() as isize;
        if av == 0 && self.mode == ProcessMode::Finished {
            -1
        } else {
            av
        }
    }

    /// Reads up to the shortest output slice's worth of samples per channel.
    ///
    /// Returns the count actually delivered on every channel.
    pub fn retrieve(&mut self, output: &mut [&mut [f32]]) -> usize {
        let mut got = output.iter().map(|c| c.len()).min().unwrap_or(0);
        for (c, cd) in self.channel_data.iter_mut().enumerate() {
            if c >= output.len() {
                break;
            }
            let here = cd.outbuf.read(&mut output[c][..got]);
            if here < got {
                if c > 0 {
                    warn!("Stretcher::retrieve: channel imbalance detected");
                }
                got = here;
            }
        }
        got
    }

    /// Samples of input needed before any output can be produced: zero when
    /// output is already waiting, otherwise the shortfall against the longest
    /// analysis frame.
    pub fn samples_required(&self) -> usize {
        if self.available() != 0 {
            return 0;
        }
        let longest = self.configuration.longest_fft_size;
        let read_space = self.channel_data[0].inbuf.read_space();
        longest.saturating_sub(read_space)
    }

    /// Recomputes the input hop from the current ratios.
    ///
    /// Aims for an output hop of 256 at ratios near 1, dropping toward 128
    /// far below 1 and rising toward 512 far above. An output hop above 256
    /// starves the shortest FFT of overlap (the guide drops it), and 512 is
    /// the ceiling the window shapes allow.
    fn calculate_hop(&self) {
        let ratio = self.effective_ratio();

        let mut proposed_outhop = 256.0;
        if ratio > 1.5 {
            proposed_outhop = 2f64.powf(8.0 + 2.0 * (ratio - 0.5).log10());
        } else if ratio < 1.0 {
            proposed_outhop = 2f64.powf(8.0 + 2.0 * ratio.log10());
        }
        proposed_outhop = proposed_outhop.clamp(128.0, 512.0);
        debug!("calculate_hop: ratio {} proposed outhop {}", ratio, proposed_outhop);

        let mut inhop = proposed_outhop / ratio;
        if inhop < MIN_INHOP {
            warn!(
                "calculate_hop: extreme ratio {} yields ideal inhop {} < 1, results may be suspect",
                ratio, inhop
            );
            inhop = MIN_INHOP;
        }
        if inhop > MAX_INHOP {
            warn!(
                "calculate_hop: extreme ratio {} yields ideal inhop {} > 1024, results may be suspect",
                ratio, inhop
            );
            inhop = MAX_INHOP;
        }

        self.inhop.store(inhop.floor() as usize, Ordering::Relaxed);
        debug!(
            "calculate_hop: inhop {} mean outhop {}",
            self.inhop.load(Ordering::Relaxed),
            self.inhop.load(Ordering::Relaxed) as f64 * ratio
        );
    }

    /// Re-derives the time ratio from the key-frame map once the consumed
    /// input duration passes each key frame.
    fn update_ratio_from_map(&mut self) {
        if self.key_frame_map.is_empty() {
            return;
        }

        if self.consumed_input_duration == 0 {
            let mut entries = self.key_frame_map.iter();
            if let Some((&k0, &v0)) = entries.next() {
                let initial_ratio = if k0 > 0 {
                    Some(v0 as f64 / k0 as f64)
                } else {
                    // A leading 0 -> 0 entry carries no slope of its own; the
                    // initial ratio is the slope to the next key frame.
                    entries.next().map(|(&k1, &v1)| {
                        let to_output = if v1 > v0 { v1 - v0 } else { 1 };
                        to_output as f64 / (k1 - k0) as f64
                    })
                };
                if let Some(ratio) = initial_ratio {
                    debug!("initial key-frame entry {} -> {} giving ratio {}", k0, v0, ratio);
                    self.time_ratio.store(ratio, Ordering::Relaxed);
                    self.calculate_hop();
                }
            }
            self.last_key_frame_surpassed = 0;
            return;
        }

        let i0 = match self
            .key_frame_map
            .range((Excluded(self.last_key_frame_surpassed), Unbounded))
            .next()
        {
            Some((&k, &v)) => (k, v),
            None => return,
        };

        if self.consumed_input_duration < i0.0 {
            return;
        }
        debug!(
            "input duration {} surpasses pending key frame {}",
            self.consumed_input_duration, i0.0
        );

        let (key_frame_at_input, key_frame_at_output) = match self
            .key_frame_map
            .range((Excluded(self.consumed_input_duration), Unbounded))
            .next()
        {
            Some((&k, &v)) => (k, v),
            None => (self.study_input_duration, self.total_target_duration),
        };
        debug!(
            "current input/output {} / {}, next key frame {} / {}",
            self.consumed_input_duration,
            self.total_output_duration,
            key_frame_at_input,
            key_frame_at_output
        );

        let ratio = if key_frame_at_input > i0.0 {
            let to_input = key_frame_at_input - i0.0;
            let to_output = if key_frame_at_output > i0.1 {
                key_frame_at_output - i0.1
            } else {
                debug!(
                    "previous target key frame {} overruns next key frame {}",
                    i0.1, key_frame_at_output
                );
                1
            };
            to_output as f64 / to_input as f64
        } else {
            debug!(
                "source key frame {} overruns following key frame {}",
                i0.0, key_frame_at_input
            );
            1.0
        };
        debug!("new ratio {}", ratio);

        self.time_ratio.store(ratio, Ordering::Relaxed);
        self.calculate_hop();
        self.last_key_frame_surpassed = i0.0;
    }

    /// The STFT driver: processes frames while there is room in the output
    /// ring and material (or drainable state) in the input ring.
    fn consume(&mut self) {
        let longest = self.configuration.longest_fft_size;
        let channels = self.channels;
        let inhop = self.inhop.load(Ordering::Relaxed);
        let pitch_scale = self.pitch_scale.load(Ordering::Relaxed);
        let time_ratio = self.time_ratio.load(Ordering::Relaxed);
        let effective_pitch_ratio = self.effective_pitch_ratio();

        let mut outhop = self.calculator.calculate_single(
            time_ratio,
            effective_pitch_ratio,
            1.0,
            inhop,
            longest,
            longest,
            true,
        );
        if outhop > longest {
            warn!("Stretcher::consume: clamping outhop {} to {}", outhop, longest);
            outhop = longest;
        }

        // prev_inhop/prev_outhop are the hops of the last frame actually
        // processed, not of the last consume() call: phase advance must use
        // the distances the streams moved since that frame.
        if inhop != self.prev_inhop {
            trace!("change in inhop: {} -> {}", self.prev_inhop, inhop);
        }
        if outhop != self.prev_outhop {
            trace!("change in outhop: {} -> {}", self.prev_outhop, outhop);
        }

        let resampling = self.resampler.is_some()
            && (pitch_scale != 1.0 || self.options().contains(Options::PITCH_HIGH_CONSISTENCY));

        loop {
            if self.channel_data[0].outbuf.write_space() < outhop {
                break;
            }

            let read_space = self.channel_data[0].inbuf.read_space();
            if read_space < longest {
                if self.mode == ProcessMode::Finished {
                    if read_space == 0 {
                        let fill = self.channel_data[0]
                            .scales
                            .get(&longest)
                            .map(|s| s.accumulator_fill)
                            .unwrap_or(0);
                        if fill == 0 {
                            break;
                        }
                        debug!(
                            "finished reading input, but {} samples remain in the accumulator",
                            fill
                        );
                    }
                } else {
                    // Await more input.
                    break;
                }
            }

            // Analysis, for every channel.
            for c in 0..channels {
                self.analyse_channel(c, inhop);
            }

            // Phase update, synchronised across channels for each scale.
            {
                let Self {
                    scale_data,
                    channel_data,
                    prev_inhop,
                    prev_outhop,
                    ..
                } = self;
                for (&fft_size, sd) in scale_data.iter_mut() {
                    for (c, cd) in channel_data.iter_mut().enumerate() {
                        if let Some(scale) = cd.scales.get_mut(&fft_size) {
                            sd.guided.advance_channel(
                                c,
                                &mut scale.advanced_phase,
                                &scale.mag,
                                &scale.phase,
                                &scale.prev_mag,
                                &cd.guidance,
                                *prev_inhop,
                                *prev_outhop,
                            );
                        }
                    }
                }
            }

            for c in 0..channels {
                self.adjust_pre_kick(c);
            }

            // Resynthesis.
            for c in 0..channels {
                self.synthesise_channel(c, outhop, read_space == 0);
            }

            // Resample.
            let mut resampled_count = 0;
            if resampling {
                let final_pass = self.mode == ProcessMode::Finished && read_space < inhop;
                let Self {
                    resampler,
                    channel_data,
                    ..
                } = self;
                if let Some(resampler) = resampler.as_mut() {
                    for (c, cd) in channel_data.iter_mut().enumerate() {
                        resampled_count = resampler.resample_channel(
                            c,
                            &mut cd.resampled,
                            &cd.mixdown[..outhop],
                            1.0 / pitch_scale,
                            final_pass,
                        );
                    }
                }
            }

            // Emit.
            let mut write_count = if resampling { resampled_count } else { outhop };
            if !self.is_realtime()
                && self.total_target_duration > 0
                && self.total_output_duration + write_count > self.total_target_duration
            {
                let reduced = self.total_target_duration - self.total_output_duration;
                debug!(
                    "write count would take output beyond target {}; reducing {} to {}",
                    self.total_target_duration, write_count, reduced
                );
                write_count = reduced;
            }

            let mut advance_count = inhop;
            if advance_count > read_space {
                // Expected only while draining.
                if self.mode != ProcessMode::Finished {
                    warn!(
                        "Stretcher::consume: read space {} < inhop {} before processing finished",
                        read_space, inhop
                    );
                }
                advance_count = read_space;
            }

            for cd in &mut self.channel_data {
                if resampling {
                    cd.outbuf.write(&cd.resampled[..write_count]);
                } else {
                    cd.outbuf.write(&cd.mixdown[..write_count]);
                }
                cd.inbuf.skip(advance_count);
            }

            self.consumed_input_duration += advance_count;
            self.total_output_duration += write_count;

            if self.start_skip > 0 {
                let read_space = self.channel_data[0].outbuf.read_space();
                let to_skip = self.start_skip.min(read_space);
                for cd in &mut self.channel_data {
                    cd.outbuf.skip(to_skip);
                }
                self.start_skip -= to_skip;
                self.total_output_duration = read_space - to_skip;
            }

            self.prev_inhop = inhop;
            self.prev_outhop = outhop;
        }
    }

    /// Runs the analysis half of the pipeline for one channel.
    fn analyse_channel(&mut self, c: usize, inhop: usize) {
        let prev_outhop = self.prev_outhop;
        let prev_inhop = self.prev_inhop;
        let ratio = self.effective_ratio();
        let realtime = self.is_realtime();
        let options = self.options();
        let pitch_scale = self.pitch_scale.load(Ordering::Relaxed);
        let formant_scale = self.formant_scale.load(Ordering::Relaxed);
        let sample_rate = self.sample_rate;

        let Self {
            channel_data,
            scale_data,
            guide,
            configuration,
            unity_count,
            ..
        } = self;
        let cd = &mut channel_data[c];
        let longest = configuration.longest_fft_size;
        let classify = configuration.classification_fft_size;

        // One unwindowed frame at the longest scale, zero-padded if the ring
        // runs short (draining).
        let read_space = cd.inbuf.read_space().min(longest);
        cd.inbuf.peek(&mut cd.raw[..read_space]);
        for i in 0..read_space {
            cd.frame[i] = cd.raw[i] as f64;
        }
        cd.frame[read_space..longest].fill(0.0);

        // Populate the shorter scales from the centre, windowing as we copy.
        // The classification scale has readahead and is handled below.
        for (&fft_size, scale) in cd.scales.iter_mut() {
            if fft_size == classify || fft_size == longest {
                continue;
            }
            let offset = (longest - fft_size) / 2;
            if let Some(sd) = scale_data.get(&fft_size) {
                sd.analysis_window
                    .cut(&cd.frame[offset..], &mut scale.time_domain);
            }
        }

        // The classification scale's readahead is one hop further along the
        // unwindowed frame.
        let classify_offset = (longest - classify) / 2;
        if let Some(sd) = scale_data.get(&classify) {
            sd.analysis_window.cut(
                &cd.frame[classify_offset + inhop..],
                &mut cd.readahead.time_domain,
            );
        }

        // If the hop changed since the previous frame the stored readahead no
        // longer lines up and the classification scale must be populated
        // directly as well.
        let have_valid_readahead = cd.have_readahead && inhop == prev_inhop;
        if !have_valid_readahead {
            if let (Some(sd), Some(scale)) =
                (scale_data.get(&classify), cd.scales.get_mut(&classify))
            {
                sd.analysis_window
                    .cut(&cd.frame[classify_offset..], &mut scale.time_domain);
            }
        }

        // Finally window the longest scale.
        if let (Some(sd), Some(scale)) = (scale_data.get(&longest), cd.scales.get_mut(&longest)) {
            sd.analysis_window.cut(&cd.frame, &mut scale.time_domain);
        }

        // Promote the previous readahead to the current classification frame,
        // then compute the new readahead spectrum in its place.
        if have_valid_readahead {
            if let Some(scale) = cd.scales.get_mut(&classify) {
                scale.mag.copy_from_slice(&cd.readahead.mag);
                scale.phase.copy_from_slice(&cd.readahead.phase);
            }
        }

        if let (Some(sd), Some(scale)) = (scale_data.get_mut(&classify), cd.scales.get_mut(&classify))
        {
            fft_shift(&mut cd.readahead.time_domain);
            sd.fft
                .forward(&cd.readahead.time_domain, &mut scale.real, &mut scale.imag);
            if let Some(band) = configuration.band_for(classify) {
                let spec = ToPolarSpec {
                    mag_from_bin: 0,
                    mag_bin_count: classify / 2 + 1,
                    polar_from_bin: band.b0min,
                    polar_bin_count: band.b1max - band.b0min + 1,
                };
                convert_to_polar(
                    &mut cd.readahead.mag,
                    &mut cd.readahead.phase,
                    &scale.real,
                    &scale.imag,
                    &spec,
                );
                for value in scale.mag.iter_mut() {
                    *value /= classify as f64;
                }
            }
        }
        cd.have_readahead = true;

        // Forward transforms for the remaining scales (and the classification
        // scale itself when the readahead could not be promoted).
        for (&fft_size, scale) in cd.scales.iter_mut() {
            if fft_size == classify && have_valid_readahead {
                continue;
            }
            if let Some(sd) = scale_data.get_mut(&fft_size) {
                fft_shift(&mut scale.time_domain);
                sd.fft
                    .forward(&scale.time_domain, &mut scale.real, &mut scale.imag);
                if let Some(band) = configuration.band_for(fft_size) {
                    // The classification scale needs full-range magnitudes
                    // for classification and formant analysis; other scales
                    // only need their own band.
                    let spec = if fft_size == classify {
                        ToPolarSpec {
                            mag_from_bin: 0,
                            mag_bin_count: classify / 2 + 1,
                            polar_from_bin: band.b0min,
                            polar_bin_count: band.b1max - band.b0min + 1,
                        }
                    } else {
                        ToPolarSpec {
                            mag_from_bin: band.b0min,
                            mag_bin_count: band.b1max - band.b0min + 1,
                            polar_from_bin: band.b0min,
                            polar_bin_count: band.b1max - band.b0min + 1,
                        }
                    };
                    convert_to_polar(
                        &mut scale.mag,
                        &mut scale.phase,
                        &scale.real,
                        &scale.imag,
                        &spec,
                    );
                    for value in
                        scale.mag[spec.mag_from_bin..spec.mag_from_bin + spec.mag_bin_count]
                            .iter_mut()
                    {
                        *value /= fft_size as f64;
                    }
                }
            }
        }

        if options.contains(Options::FORMANT_PRESERVED) {
            analyse_formant(cd, scale_data, sample_rate);
            adjust_formant(cd, configuration, sample_rate, pitch_scale, formant_scale);
        }

        // Classify the readahead, rotate the segmentation history, and ask
        // the guide for this channel's frame guidance.
        cd.classification.copy_from_slice(&cd.next_classification);
        cd.classifier
            .classify(&cd.readahead.mag, &mut cd.next_classification);

        cd.prev_segmentation = cd.segmentation;
        cd.segmentation = cd.next_segmentation;
        cd.next_segmentation = cd.segmenter.segment(&cd.next_classification);

        if (ratio - 1.0).abs() < UNITY_EPSILON {
            *unity_count += 1;
        } else {
            *unity_count = 0;
        }

        if let Some(scale) = cd.scales.get(&classify) {
            let bins = classify / 2;
            let mean_mag = scale.mag[1..=bins].iter().sum::<f64>() / bins as f64;
            guide.update_guidance(
                ratio,
                prev_outhop,
                &scale.mag,
                &scale.prev_mag,
                &cd.readahead.mag,
                &cd.segmentation,
                &cd.prev_segmentation,
                &cd.next_segmentation,
                mean_mag,
                *unity_count,
                realtime,
                options.contains(Options::CHANNELS_TOGETHER),
                &mut cd.guidance,
            );
        }
    }

    /// Defers magnitude gain one hop ahead of a detected kick and restores it
    /// when the kick lands.
    fn adjust_pre_kick(&mut self, c: usize) {
        let sample_rate = self.sample_rate;
        let cd = &mut self.channel_data[c];
        if cd.guidance.band_count == 0 {
            return;
        }
        let fft_size = cd.guidance.fft_bands[0].fft_size;
        // Both branches read the pre-kick band edges: the pre-kick window
        // defines the band that gets masked and later unmasked.
        let from = bin_for_frequency(cd.guidance.pre_kick.f0, fft_size, sample_rate);
        let to = bin_for_frequency(cd.guidance.pre_kick.f1, fft_size, sample_rate);

        if cd.guidance.pre_kick.present {
            if let Some(scale) = cd.scales.get_mut(&fft_size) {
                for i in from..=to.min(scale.buf_size - 1) {
                    let diff = scale.mag[i] - scale.prev_mag[i];
                    if diff > 0.0 {
                        scale.pending_kick[i] = diff;
                        scale.mag[i] -= diff;
                    }
                }
            }
        } else if cd.guidance.kick.present {
            if let Some(scale) = cd.scales.get_mut(&fft_size) {
                for i in from..=to.min(scale.buf_size - 1) {
                    scale.mag[i] += scale.pending_kick[i];
                    scale.pending_kick[i] = 0.0;
                }
            }
        }
    }

    /// Runs the resynthesis half of the pipeline for one channel.
    fn synthesise_channel(&mut self, c: usize, outhop: usize, draining: bool) {
        let sample_rate = self.sample_rate;
        let Self {
            channel_data,
            scale_data,
            configuration,
            ..
        } = self;
        let cd = &mut channel_data[c];
        let longest = configuration.longest_fft_size;

        for band_index in 0..cd.guidance.band_count {
            let band = cd.guidance.fft_bands[band_index];
            let (scale, sd) = match (
                cd.scales.get_mut(&band.fft_size),
                scale_data.get_mut(&band.fft_size),
            ) {
                (Some(scale), Some(sd)) => (scale, sd),
                _ => continue,
            };

            // Keep this frame's magnitudes for the next frame's deltas,
            // before the band filter touches them.
            scale.prev_mag.copy_from_slice(&scale.mag);

            let winscale = outhop as f64 / sd.window_scale_factor;

            // The band filter is applied naively in the frequency domain;
            // the shorter resynthesis window limits the aliasing. Each scale
            // is resynthesised alone and then summed, which keeps the gain
            // bookkeeping simple when the output hop varies. An even band
            // edge is nudged odd to keep the boundary bin's phase
            // relationship intact.
            let low_bin = bin_for_frequency(band.f0, band.fft_size, sample_rate);
            let mut high_bin = bin_for_frequency(band.f1, band.fft_size, sample_rate);
            if high_bin % 2 == 0 && high_bin > 0 {
                high_bin -= 1;
            }
            let high_bin = high_bin.min(scale.buf_size - 1);
            if low_bin >= high_bin {
                continue;
            }

            scale.real[..low_bin].fill(0.0);
            scale.imag[..low_bin].fill(0.0);
            for value in scale.mag[low_bin..high_bin].iter_mut() {
                *value *= winscale;
            }
            convert_to_cartesian(
                &mut scale.real,
                &mut scale.imag,
                &scale.mag,
                &scale.advanced_phase,
                low_bin,
                high_bin - low_bin,
            );
            scale.real[high_bin..].fill(0.0);
            scale.imag[high_bin..].fill(0.0);

            sd.fft
                .inverse(&scale.real, &scale.imag, &mut scale.time_domain);
            fft_shift(&mut scale.time_domain);

            // The synthesis window may be shorter than the analysis window,
            // so cut from the middle of the frame; the accumulator always
            // spans the longest scale, so the target needs its own offset.
            let synthesis_size = sd.synthesis_window.size();
            let from_offset = (band.fft_size - synthesis_size) / 2;
            let to_offset = (longest - synthesis_size) / 2;
            sd.synthesis_window.cut_and_add(
                &scale.time_domain[from_offset..],
                &mut scale.accumulator[to_offset..],
            );
        }

        // Mix this channel down and slide the accumulators along.
        let emit = outhop.min(cd.mixdown.len());
        cd.mixdown[..emit].fill(0.0);
        for scale in cd.scales.values_mut() {
            for i in 0..emit.min(scale.accumulator.len()) {
                cd.mixdown[i] += scale.accumulator[i] as f32;
            }

            let len = scale.accumulator.len();
            let shift = outhop.min(len);
            scale.accumulator.copy_within(shift.., 0);
            scale.accumulator[len - shift..].fill(0.0);

            if draining {
                if scale.accumulator_fill > outhop {
                    let new_fill = scale.accumulator_fill - outhop;
                    trace!(
                        "draining: reducing accumulator fill {} to {}",
                        scale.accumulator_fill,
                        new_fill
                    );
                    scale.accumulator_fill = new_fill;
                } else {
                    scale.accumulator_fill = 0;
                }
            } else {
                scale.accumulator_fill = scale.accumulator.len();
            }
        }
    }
}

/// Builds the resampler configured for the engine's options: quality from
/// PitchHighQuality, dynamism and ratio-change behaviour from
/// PitchHighConsistency and realtime operation.
fn build_resampler(
    options: Options,
    sample_rate: f64,
    longest_fft_size: usize,
    channels: usize,
) -> Resampler {
    let quality = if options.contains(Options::PITCH_HIGH_QUALITY) {
        Quality::Best
    } else {
        Quality::FastestTolerable
    };
    let (dynamism, ratio_change) = if options.contains(Options::REALTIME) {
        if options.contains(Options::PITCH_HIGH_CONSISTENCY) {
            (Dynamism::RatioOftenChanging, RatioChange::Smooth)
        } else {
            (Dynamism::RatioMostlyFixed, RatioChange::Smooth)
        }
    } else {
        (Dynamism::RatioMostlyFixed, RatioChange::Sudden)
    };
    Resampler::new(
        ResamplerParameters {
            quality,
            dynamism,
            ratio_change,
            initial_sample_rate: sample_rate,
            max_buffer_size: longest_fft_size,
        },
        channels,
    )
}

/// Estimates the smoothed spectral envelope of the classification scale via
/// low-time liftering of the real cepstrum.
fn analyse_formant(
    cd: &mut ChannelData,
    scale_data: &mut BTreeMap<usize, ScaleData>,
    sample_rate: f64,
) {
    let fft_size = cd.formant.fft_size;
    let bin_count = fft_size / 2 + 1;
    let (scale, sd) = match (cd.scales.get(&fft_size), scale_data.get_mut(&fft_size)) {
        (Some(scale), Some(sd)) => (scale, sd),
        _ => return,
    };
    let f = &mut cd.formant;

    sd.fft.inverse_cepstral(&scale.mag, &mut f.cepstra);

    let mut cutoff = (sample_rate / CEPSTRAL_CUTOFF_DIVISOR).floor() as usize;
    if cutoff < 1 {
        cutoff = 1;
    }
    let cutoff = cutoff.min(fft_size);

    // Endpoint halving preserves the even-symmetry boundary of the real
    // cepstrum; the order matters when cutoff == 1.
    f.cepstra[0] /= 2.0;
    f.cepstra[cutoff - 1] /= 2.0;
    for value in f.cepstra[cutoff..].iter_mut() {
        *value = 0.0;
    }
    for value in f.cepstra[..cutoff].iter_mut() {
        *value /= fft_size as f64;
    }

    sd.fft.forward(&f.cepstra, &mut f.envelope, &mut f.spare);

    for value in f.envelope[..bin_count].iter_mut() {
        let e = value.exp();
        *value = (e * e).min(ENVELOPE_CLAMP);
    }
}

/// Rescales magnitudes on every scale so the spectral envelope stays at the
/// formant-scale frequency while the harmonics move with the pitch.
fn adjust_formant(
    cd: &mut ChannelData,
    configuration: &GuideConfiguration,
    sample_rate: f64,
    pitch_scale: f64,
    formant_scale: f64,
) {
    let formant_fft_size = cd.formant.fft_size;
    for (&fft_size, scale) in cd.scales.iter_mut() {
        let high_bin = (fft_size as f64 * FORMANT_TOP_HZ / sample_rate).floor() as usize;
        let target_factor = formant_fft_size as f64 / fft_size as f64;
        let effective_formant_scale = if formant_scale == 0.0 {
            1.0 / pitch_scale
        } else {
            formant_scale
        };
        let source_factor = target_factor / effective_formant_scale;

        if let Some(band) = configuration.band_for(fft_size) {
            for i in band.b0min..band.b1max.min(high_bin) {
                let source = cd.formant.envelope_at(i as f64 * source_factor);
                let target = cd.formant.envelope_at(i as f64 * target_factor);
                if target > 0.0 {
                    let ratio =
                        (source / target).clamp(1.0 / FORMANT_MAX_RATIO, FORMANT_MAX_RATIO);
                    scale.mag[i] *= ratio;
                }
            }
        }
    }
}
