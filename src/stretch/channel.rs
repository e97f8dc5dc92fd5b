//! Per-channel and per-scale engine state.
//!
//! A [`ChannelData`] owns everything one channel needs across frames: its
//! input/output rings, one [`ChannelScaleData`] per FFT scale, the
//! classification readahead, segmentation history, guidance, formant
//! workspace, and the mixdown/resample staging buffers. [`ScaleData`] is the
//! per-scale machinery shared by all channels: the FFT, windows, and the
//! guided phase advance. Everything is allocated at construction.

use std::collections::BTreeMap;

use crate::analysis::classify::{
    BinClass, BinClassifier, BinSegmenter, ClassifierParameters, Segmentation,
    SegmenterParameters,
};
use crate::analysis::guide::{GuideConfiguration, Guidance};
use crate::analysis::phase_advance::{GuidedParameters, GuidedPhaseAdvance};
use crate::core::fft::Fft;
use crate::core::ring_buffer::RingBuffer;
use crate::core::window::{Window, WindowShape};

/// Scales larger than this use a half-length Hann synthesis window; smaller
/// scales use full-length sine analysis/synthesis pairs.
const LONG_SCALE_THRESHOLD: usize = 2048;

/// Per-channel, per-scale working buffers.
#[derive(Debug)]
pub struct ChannelScaleData {
    pub fft_size: usize,
    /// Number of spectrum bins: `fft_size / 2 + 1`.
    pub buf_size: usize,
    pub time_domain: Vec<f64>,
    pub real: Vec<f64>,
    pub imag: Vec<f64>,
    pub mag: Vec<f64>,
    pub phase: Vec<f64>,
    /// Magnitudes emitted by the previous frame's resynthesis at this scale.
    pub prev_mag: Vec<f64>,
    pub advanced_phase: Vec<f64>,
    /// Magnitude gain deferred until the next kick arrives.
    pub pending_kick: Vec<f64>,
    /// Overlap-add accumulator, always the length of the longest scale.
    pub accumulator: Vec<f64>,
    /// Positions at or beyond this index are zero.
    pub accumulator_fill: usize,
}

impl ChannelScaleData {
    pub fn new(fft_size: usize, longest_fft_size: usize) -> Self {
        let buf_size = fft_size / 2 + 1;
        Self {
            fft_size,
            buf_size,
            time_domain: vec![0.0; fft_size],
            real: vec![0.0; buf_size],
            imag: vec![0.0; buf_size],
            mag: vec![0.0; buf_size],
            phase: vec![0.0; buf_size],
            prev_mag: vec![0.0; buf_size],
            advanced_phase: vec![0.0; buf_size],
            pending_kick: vec![0.0; buf_size],
            accumulator: vec![0.0; longest_fft_size],
            accumulator_fill: 0,
        }
    }

    pub fn reset(&mut self) {
        self.time_domain.fill(0.0);
        self.real.fill(0.0);
        self.imag.fill(0.0);
        self.mag.fill(0.0);
        self.phase.fill(0.0);
        self.prev_mag.fill(0.0);
        self.advanced_phase.fill(0.0);
        self.pending_kick.fill(0.0);
        self.accumulator.fill(0.0);
        self.accumulator_fill = 0;
    }
}

/// One-hop readahead of the classification scale.
#[derive(Debug)]
pub struct ClassificationReadahead {
    pub time_domain: Vec<f64>,
    /// Unscaled magnitudes of the next frame.
    pub mag: Vec<f64>,
    pub phase: Vec<f64>,
}

impl ClassificationReadahead {
    pub fn new(fft_size: usize) -> Self {
        let buf_size = fft_size / 2 + 1;
        Self {
            time_domain: vec![0.0; fft_size],
            mag: vec![0.0; buf_size],
            phase: vec![0.0; buf_size],
        }
    }

    pub fn reset(&mut self) {
        self.time_domain.fill(0.0);
        self.mag.fill(0.0);
        self.phase.fill(0.0);
    }
}

/// Cepstral formant-envelope workspace on the classification scale.
#[derive(Debug)]
pub struct FormantData {
    pub fft_size: usize,
    pub cepstra: Vec<f64>,
    pub envelope: Vec<f64>,
    pub spare: Vec<f64>,
}

impl FormantData {
    pub fn new(fft_size: usize) -> Self {
        let buf_size = fft_size / 2 + 1;
        Self {
            fft_size,
            cepstra: vec![0.0; fft_size],
            envelope: vec![0.0; buf_size],
            spare: vec![0.0; buf_size],
        }
    }

    /// Samples the envelope at a fractional bin with linear interpolation,
    /// clamping beyond the ends.
    pub fn envelope_at(&self, bin: f64) -> f64 {
        let last = self.envelope.len() - 1;
        if bin <= 0.0 {
            return self.envelope[0];
        }
        let lower = bin.floor() as usize;
        if lower >= last {
            return self.envelope[last];
        }
        let frac = bin - lower as f64;
        self.envelope[lower] * (1.0 - frac) + self.envelope[lower + 1] * frac
    }

    pub fn reset(&mut self) {
        self.cepstra.fill(0.0);
        self.envelope.fill(0.0);
        self.spare.fill(0.0);
    }
}

/// All per-channel state.
#[derive(Debug)]
pub struct ChannelData {
    pub inbuf: RingBuffer<f32>,
    pub outbuf: RingBuffer<f32>,
    /// f32 peek staging for the longest frame.
    pub raw: Vec<f32>,
    /// The unwindowed longest frame, widened for processing.
    pub frame: Vec<f64>,
    pub scales: BTreeMap<usize, ChannelScaleData>,
    pub readahead: ClassificationReadahead,
    pub have_readahead: bool,
    pub classifier: BinClassifier,
    pub segmenter: BinSegmenter,
    pub classification: Vec<BinClass>,
    pub next_classification: Vec<BinClass>,
    pub segmentation: Segmentation,
    pub prev_segmentation: Segmentation,
    pub next_segmentation: Segmentation,
    pub guidance: Guidance,
    pub formant: FormantData,
    pub mixdown: Vec<f32>,
    pub resampled: Vec<f32>,
}

impl ChannelData {
    pub fn new(
        configuration: &GuideConfiguration,
        classifier_parameters: ClassifierParameters,
        segmenter_parameters: SegmenterParameters,
        in_ring_size: usize,
        out_ring_size: usize,
    ) -> Self {
        let longest = configuration.longest_fft_size;
        let classify = configuration.classification_fft_size;
        let classified_bins = classifier_parameters.bin_count;

        let mut scales = BTreeMap::new();
        for band in &configuration.fft_band_limits {
            scales.insert(
                band.fft_size,
                ChannelScaleData::new(band.fft_size, longest),
            );
        }

        Self {
            inbuf: RingBuffer::with_capacity(in_ring_size),
            outbuf: RingBuffer::with_capacity(out_ring_size),
            raw: vec![0.0; longest],
            frame: vec![0.0; longest],
            scales,
            readahead: ClassificationReadahead::new(classify),
            have_readahead: false,
            classifier: BinClassifier::new(classifier_parameters),
            segmenter: BinSegmenter::new(segmenter_parameters),
            classification: vec![BinClass::default(); classified_bins],
            next_classification: vec![BinClass::default(); classified_bins],
            segmentation: Segmentation::default(),
            prev_segmentation: Segmentation::default(),
            next_segmentation: Segmentation::default(),
            guidance: Guidance::default(),
            formant: FormantData::new(classify),
            mixdown: vec![0.0; longest],
            resampled: vec![0.0; longest * 2],
        }
    }

    pub fn reset(&mut self) {
        self.inbuf.clear();
        self.outbuf.clear();
        self.raw.fill(0.0);
        self.frame.fill(0.0);
        for scale in self.scales.values_mut() {
            scale.reset();
        }
        self.readahead.reset();
        self.have_readahead = false;
        self.classifier.reset();
        self.classification.fill(BinClass::default());
        self.next_classification.fill(BinClass::default());
        self.segmentation = Segmentation::default();
        self.prev_segmentation = Segmentation::default();
        self.next_segmentation = Segmentation::default();
        self.guidance = Guidance::default();
        self.formant.reset();
        self.mixdown.fill(0.0);
        self.resampled.fill(0.0);
    }
}

/// Per-scale machinery shared across channels: FFT, windows, phase advance.
#[derive(Debug)]
pub struct ScaleData {
    pub fft_size: usize,
    pub fft: Fft,
    pub analysis_window: Window,
    pub synthesis_window: Window,
    /// Sum of the analysis/synthesis window product over the synthesis
    /// window, used to normalise overlap-add gain.
    pub window_scale_factor: f64,
    pub guided: GuidedPhaseAdvance,
}

impl ScaleData {
    pub fn new(fft_size: usize, sample_rate: f64, channels: usize) -> Self {
        let analysis_shape = if fft_size > LONG_SCALE_THRESHOLD {
            WindowShape::Hann
        } else {
            WindowShape::Sine
        };
        let synthesis_shape = analysis_shape;
        let synthesis_length = if fft_size > LONG_SCALE_THRESHOLD {
            fft_size / 2
        } else {
            fft_size
        };

        let analysis_window = Window::new(analysis_shape, fft_size);
        let synthesis_window = Window::new(synthesis_shape, synthesis_length);

        let offset = (fft_size - synthesis_length) / 2;
        let mut window_scale_factor = 0.0;
        for i in 0..synthesis_length {
            window_scale_factor +=
                analysis_window.value_at(offset + i) * synthesis_window.value_at(i);
        }

        Self {
            fft_size,
            fft: Fft::new(fft_size),
            analysis_window,
            synthesis_window,
            window_scale_factor,
            guided: GuidedPhaseAdvance::new(GuidedParameters {
                fft_size,
                sample_rate,
                channels,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::guide::{Guide, GuideParameters};

    fn configuration() -> GuideConfiguration {
        Guide::new(GuideParameters {
            sample_rate: 48000.0,
        })
        .configuration()
        .clone()
    }

    fn channel() -> ChannelData {
        let config = configuration();
        let classify = config.classification_fft_size;
        ChannelData::new(
            &config,
            ClassifierParameters::new(classify / 2 + 1),
            SegmenterParameters {
                fft_size: classify,
                bin_count: classify / 2 + 1,
                sample_rate: 48000.0,
                min_run_length: 4,
            },
            8192,
            65536,
        )
    }

    #[test]
    fn channel_allocates_every_scale() {
        let cd = channel();
        assert_eq!(cd.scales.len(), 3);
        for (&fft_size, scale) in &cd.scales {
            assert_eq!(scale.fft_size, fft_size);
            assert_eq!(scale.buf_size, fft_size / 2 + 1);
            assert_eq!(scale.accumulator.len(), 4096);
            assert_eq!(scale.accumulator_fill, 0);
        }
    }

    #[test]
    fn reset_clears_state() {
        let mut cd = channel();
        cd.inbuf.write(&[1.0; 32]);
        cd.have_readahead = true;
        if let Some(scale) = cd.scales.get_mut(&4096) {
            scale.accumulator_fill = 100;
            scale.accumulator[5] = 3.0;
        }
        cd.reset();
        assert!(cd.inbuf.is_empty());
        assert!(!cd.have_readahead);
        let scale = &cd.scales[&4096];
        assert_eq!(scale.accumulator_fill, 0);
        assert_eq!(scale.accumulator[5], 0.0);
    }

    #[test]
    fn envelope_interpolates_linearly() {
        let mut f = FormantData::new(8);
        f.envelope.copy_from_slice(&[1.0, 2.0, 4.0, 4.0, 4.0]);
        assert_eq!(f.envelope_at(-1.0), 1.0);
        assert!((f.envelope_at(0.5) - 1.5).abs() < 1e-12);
        assert!((f.envelope_at(1.25) - 2.5).abs() < 1e-12);
        assert_eq!(f.envelope_at(100.0), 4.0);
    }

    #[test]
    fn scale_windows_match_length_rules() {
        let long = ScaleData::new(4096, 48000.0, 1);
        assert_eq!(long.analysis_window.size(), 4096);
        assert_eq!(long.synthesis_window.size(), 2048);
        assert_eq!(long.analysis_window.shape(), WindowShape::Hann);

        let short = ScaleData::new(1024, 48000.0, 1);
        assert_eq!(short.synthesis_window.size(), 1024);
        assert_eq!(short.analysis_window.shape(), WindowShape::Sine);
        assert!(short.window_scale_factor > 0.0);
    }
}
