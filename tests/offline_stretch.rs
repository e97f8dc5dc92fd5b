mod common;

use std::collections::BTreeMap;

use common::{best_correlation, drive_offline, rms, rms_frequency, sine, white_noise};
use pitchstretch::{Stretcher, StretcherParams};

const SAMPLE_RATE: u32 = 48000;

#[test]
fn identity_preserves_length_and_waveform() {
    let input = sine(440.0, SAMPLE_RATE, SAMPLE_RATE as usize);

    let mut stretcher =
        Stretcher::new(StretcherParams::new(SAMPLE_RATE as f64), 1.0, 1.0).unwrap();
    stretcher.set_expected_input_duration(input.len());

    let output = drive_offline(&mut stretcher, &[input.clone()], 4096);
    assert_eq!(output[0].len(), input.len());
    assert_eq!(stretcher.available(), -1);

    let correlation = best_correlation(&input, &output[0], 256);
    assert!(
        correlation >= 0.999,
        "identity correlation {} below 0.999",
        correlation
    );

    let input_rms = rms(&input);
    let output_rms = rms(&output[0]);
    assert!(
        (output_rms - input_rms).abs() < input_rms * 0.05,
        "RMS drifted: input {}, output {}",
        input_rms,
        output_rms
    );
}

#[test]
fn double_stretch_doubles_noise_burst() {
    let input = white_noise(SAMPLE_RATE as usize, 0x5eed);

    let mut stretcher =
        Stretcher::new(StretcherParams::new(SAMPLE_RATE as f64), 2.0, 1.0).unwrap();
    stretcher.set_expected_input_duration(input.len());

    let output = drive_offline(&mut stretcher, &[input.clone()], 4096);
    let expected = input.len() * 2;
    assert!(
        (output[0].len() as i64 - expected as i64).unsigned_abs() <= 1,
        "output length {} not within 1 of {}",
        output[0].len(),
        expected
    );

    // Time stretching must not recolour the noise: compare second spectral
    // moments over the steady middle of each signal.
    let mid_in = &input[8192..input.len() - 8192];
    let mid_out = &output[0][16384..output[0].len() - 16384];
    let f_in = rms_frequency(mid_in, SAMPLE_RATE);
    let f_out = rms_frequency(mid_out, SAMPLE_RATE);
    assert!(
        (f_out - f_in).abs() / f_in < 0.05,
        "spectral balance moved: {} -> {}",
        f_in,
        f_out
    );
}

#[test]
fn stereo_identity_keeps_channels_aligned() {
    let left = sine(440.0, SAMPLE_RATE, SAMPLE_RATE as usize / 2);
    let right = sine(880.0, SAMPLE_RATE, SAMPLE_RATE as usize / 2);

    let mut stretcher = Stretcher::new(
        StretcherParams::new(SAMPLE_RATE as f64).with_channels(2),
        1.0,
        1.0,
    )
    .unwrap();
    stretcher.set_expected_input_duration(left.len());

    let output = drive_offline(&mut stretcher, &[left.clone(), right.clone()], 4096);
    assert_eq!(output[0].len(), left.len());
    assert_eq!(output[1].len(), right.len());

    assert!(best_correlation(&left, &output[0], 256) >= 0.99);
    assert!(best_correlation(&right, &output[1], 256) >= 0.99);
}

#[test]
fn key_frame_map_varies_ratio_over_time() {
    // 2 s input, first second stretched 2x, second second left alone;
    // the global ratio of 1.5 sets the overall target duration.
    let n = 2 * SAMPLE_RATE as usize;
    let half = n / 2;
    let input = sine(330.0, SAMPLE_RATE, n);

    let mut stretcher =
        Stretcher::new(StretcherParams::new(SAMPLE_RATE as f64), 1.5, 1.0).unwrap();
    let mut map = BTreeMap::new();
    map.insert(0usize, 0usize);
    map.insert(half, 2 * half);
    map.insert(n, 2 * half + half);
    stretcher.set_key_frame_map(map);
    stretcher.set_expected_input_duration(n);

    let output = drive_offline(&mut stretcher, &[input], 4096);
    let expected = 2 * half + half;
    assert!(
        (output[0].len() as i64 - expected as i64).unsigned_abs() <= 1,
        "output length {} not within 1 of {}",
        output[0].len(),
        expected
    );
}

#[test]
fn reset_gives_bitwise_identical_runs() {
    let input = white_noise(20000, 0xfeedbeef);

    let mut stretcher =
        Stretcher::new(StretcherParams::new(SAMPLE_RATE as f64), 1.3, 1.0).unwrap();
    stretcher.set_expected_input_duration(input.len());
    let first = drive_offline(&mut stretcher, &[input.clone()], 4096);

    stretcher.reset();
    stretcher.set_expected_input_duration(input.len());
    let second = drive_offline(&mut stretcher, &[input.clone()], 4096);

    assert_eq!(first[0].len(), second[0].len());
    for (i, (a, b)) in first[0].iter().zip(second[0].iter()).enumerate() {
        assert!(a == b, "sample {} differs after reset: {} vs {}", i, a, b);
    }
}
