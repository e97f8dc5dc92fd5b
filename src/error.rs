//! Error types for the pitchstretch crate.

use std::fmt;

/// Errors that can occur when constructing or configuring a stretcher.
///
/// The audio path itself never returns errors: invalid control calls are
/// dropped with a log message and numeric degeneracies are clamped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StretchError {
    /// Invalid channel count (must be at least 1).
    InvalidChannelCount(usize),
    /// Invalid sample rate (must be positive).
    InvalidSampleRate(u32),
    /// Invalid time ratio or pitch scale.
    InvalidRatio(String),
}

impl fmt::Display for StretchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StretchError::InvalidChannelCount(n) => {
                write!(f, "invalid channel count: {}", n)
            }
            StretchError::InvalidSampleRate(rate) => {
                write!(f, "invalid sample rate: {}", rate)
            }
            StretchError::InvalidRatio(msg) => write!(f, "invalid ratio: {}", msg),
        }
    }
}

impl std::error::Error for StretchError {}
