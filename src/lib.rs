#![forbid(unsafe_code)]
//! Realtime-capable audio time stretching and pitch shifting.
//!
//! `pitchstretch` changes the duration of a multi-channel PCM stream by a
//! time ratio and its pitch by an independent pitch scale, preserving
//! perceptual timbre. The core is a multi-resolution short-time Fourier
//! pipeline: several FFT scales are analysed in parallel each frame, a
//! per-bin classifier and guide steer an adaptive phase advance and transient
//! handling, and the scales are resynthesised, summed, and (when pitch
//! shifting) resampled.
//!
//! Two modes of operation:
//!
//! - **Realtime** ([`Options::REALTIME`]): bounded work per call, no
//!   allocation on the audio path, ratios adjustable mid-stream. A fixed
//!   start delay applies ([`Stretcher::start_delay`]).
//! - **Offline** (default): optionally study the input first, then process;
//!   output is trimmed to the exact target duration and a key-frame map can
//!   vary the ratio over time.
//!
//! # Example
//!
//! ```no_run
//! use pitchstretch::{Stretcher, StretcherParams};
//!
//! // 1 second of 440 Hz sine at 48 kHz, stretched to twice the length.
//! let input: Vec<f32> = (0..48000)
//!     .map(|i| (2.0 * std::f32::consts::PI * 440.0 * i as f32 / 48000.0).sin())
//!     .collect();
//!
//! let mut stretcher =
//!     Stretcher::new(StretcherParams::new(48000.0), 2.0, 1.0).unwrap();
//! stretcher.set_expected_input_duration(input.len());
//! stretcher.process(&[&input], true);
//!
//! let mut output = vec![0.0f32; 96000];
//! let mut done = 0;
//! while stretcher.available() > 0 {
//!     let mut slices = [&mut output[done..]];
//!     done += stretcher.retrieve(&mut slices);
//! }
//! ```

pub mod analysis;
pub mod core;
pub mod error;
pub mod stretch;

pub use crate::error::StretchError;
pub use crate::stretch::params::{Options, StretcherParams};
pub use crate::stretch::stretcher::Stretcher;
