//! Spectral analysis collaborators: classification, segmentation, band
//! guidance, guided phase advance, and the stretch-rate calculator.

pub mod calculator;
pub mod classify;
pub mod guide;
pub mod phase_advance;
