#![allow(dead_code)]

use std::f32::consts::PI;

use pitchstretch::Stretcher;

/// Generates a mono sine wave.
pub fn sine(freq: f32, sample_rate: u32, num_samples: usize) -> Vec<f32> {
    (0..num_samples)
        .map(|i| (2.0 * PI * freq * i as f32 / sample_rate as f32).sin())
        .collect()
}

/// Deterministic white noise via xorshift, in [-1, 1).
pub fn white_noise(num_samples: usize, seed: u64) -> Vec<f32> {
    let mut state = seed.max(1);
    (0..num_samples)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 40) as f32 / 8388608.0 - 1.0
        })
        .collect()
}

/// Synthesizes an /a/-like vowel: a harmonic series shaped by resonances at
/// 730, 1090, and 2440 Hz.
pub fn vowel(f0: f32, sample_rate: u32, num_samples: usize) -> Vec<f32> {
    let formants = [(730.0f32, 90.0f32), (1090.0, 110.0), (2440.0, 140.0)];
    let mut out = vec![0.0f32; num_samples];
    let nyquist = sample_rate as f32 / 2.0;
    let mut k = 1;
    while k as f32 * f0 < nyquist * 0.9 && k < 256 {
        let f = k as f32 * f0;
        let mut amp = 0.0f32;
        for &(centre, bandwidth) in &formants {
            amp += 1.0 / (1.0 + ((f - centre) / bandwidth).powi(2));
        }
        amp /= 1.0 + f / 3000.0;
        for (i, sample) in out.iter_mut().enumerate() {
            *sample += amp * (2.0 * PI * f * i as f32 / sample_rate as f32).sin();
        }
        k += 1;
    }
    let peak = out.iter().fold(0.0f32, |a, &b| a.max(b.abs()));
    if peak > 0.0 {
        for sample in &mut out {
            *sample *= 0.8 / peak;
        }
    }
    out
}

/// RMS of a signal.
pub fn rms(signal: &[f32]) -> f32 {
    if signal.is_empty() {
        return 0.0;
    }
    (signal.iter().map(|x| x * x).sum::<f32>() / signal.len() as f32).sqrt()
}

/// Spectral energy at a single frequency via direct projection.
pub fn spectral_energy_at_freq(signal: &[f32], sample_rate: u32, target_freq: f32) -> f32 {
    let n = signal.len();
    if n == 0 {
        return 0.0;
    }
    let two_pi = 2.0 * PI;
    let mut real = 0.0f64;
    let mut imag = 0.0f64;
    for (i, &s) in signal.iter().enumerate() {
        let angle = two_pi * target_freq * i as f32 / sample_rate as f32;
        real += s as f64 * angle.cos() as f64;
        imag += s as f64 * angle.sin() as f64;
    }
    ((real * real + imag * imag) / n as f64).sqrt() as f32
}

/// The frequency in `[f_lo, f_hi]` (stepped) with the most energy.
pub fn dominant_frequency(
    signal: &[f32],
    sample_rate: u32,
    f_lo: f32,
    f_hi: f32,
    step: f32,
) -> f32 {
    let mut best_freq = f_lo;
    let mut best_energy = -1.0f32;
    let mut f = f_lo;
    while f <= f_hi {
        let e = spectral_energy_at_freq(signal, sample_rate, f);
        if e > best_energy {
            best_energy = e;
            best_freq = f;
        }
        f += step;
    }
    best_freq
}

/// RMS frequency of a signal (the second spectral moment), a cheap stand-in
/// for the spectral centroid when comparing broadband content.
pub fn rms_frequency(signal: &[f32], sample_rate: u32) -> f64 {
    if signal.len() < 2 {
        return 0.0;
    }
    let mut diff_power = 0.0f64;
    let mut power = 0.0f64;
    for i in 1..signal.len() {
        let d = (signal[i] - signal[i - 1]) as f64;
        diff_power += d * d;
        power += (signal[i] as f64) * (signal[i] as f64);
    }
    if power < 1e-20 {
        return 0.0;
    }
    sample_rate as f64 / (2.0 * std::f64::consts::PI) * (diff_power / power).sqrt()
}

/// Best normalized cross-correlation between `reference` and `test`,
/// searching lags in `[-max_lag, max_lag]` (test shifted against reference).
pub fn best_correlation(reference: &[f32], test: &[f32], max_lag: isize) -> f64 {
    let mut best = -1.0f64;
    let mut lag = -max_lag;
    while lag <= max_lag {
        let mut dot = 0.0f64;
        let mut ref_sq = 0.0f64;
        let mut test_sq = 0.0f64;
        for i in 0..reference.len() {
            let j = i as isize + lag;
            if j < 0 || j >= test.len() as isize {
                continue;
            }
            let r = reference[i] as f64;
            let t = test[j as usize] as f64;
            dot += r * t;
            ref_sq += r * r;
            test_sq += t * t;
        }
        if ref_sq > 0.0 && test_sq > 0.0 {
            best = best.max(dot / (ref_sq.sqrt() * test_sq.sqrt()));
        }
        lag += 16;
    }
    best
}

/// Smoothed spectral-envelope peak in `[f_lo, f_hi]`: energies on a 10 Hz
/// grid, moving-averaged over +-150 Hz, argmax.
pub fn smoothed_peak_frequency(signal: &[f32], sample_rate: u32, f_lo: f32, f_hi: f32) -> f64 {
    let step = 10.0f32;
    let count = ((f_hi - f_lo) / step) as usize + 1;
    let energies: Vec<f64> = (0..count)
        .map(|i| spectral_energy_at_freq(signal, sample_rate, f_lo + i as f32 * step) as f64)
        .collect();

    let half = 15usize; // +-150 Hz
    let mut best_freq = f_lo as f64;
    let mut best = -1.0f64;
    for i in 0..count {
        let lo = i.saturating_sub(half);
        let hi = (i + half + 1).min(count);
        let mean = energies[lo..hi].iter().sum::<f64>() / (hi - lo) as f64;
        if mean > best {
            best = mean;
            best_freq = (f_lo + i as f32 * step) as f64;
        }
    }
    best_freq
}

/// Feeds a full multi-channel input through an offline stretcher in chunks,
/// retrieving between chunks, and returns each channel's complete output.
pub fn drive_offline(stretcher: &mut Stretcher, input: &[Vec<f32>], chunk: usize) -> Vec<Vec<f32>> {
    let channels = input.len();
    let total = input.iter().map(|c| c.len()).min().unwrap_or(0);
    let mut outputs: Vec<Vec<f32>> = vec![Vec::new(); channels];

    stretcher.set_max_process_size(chunk);

    let mut pos = 0;
    while pos < total {
        let end = (pos + chunk).min(total);
        let block: Vec<&[f32]> = input.iter().map(|c| &c[pos..end]).collect();
        stretcher.process(&block, end == total);
        drain(stretcher, &mut outputs);
        pos = end;
    }
    drain(stretcher, &mut outputs);
    outputs
}

/// Retrieves everything currently available.
pub fn drain(stretcher: &mut Stretcher, outputs: &mut [Vec<f32>]) {
    loop {
        let available = stretcher.available();
        if available <= 0 {
            break;
        }
        let take = (available as usize).min(4096);
        let mut bufs: Vec<Vec<f32>> = vec![vec![0.0f32; take]; outputs.len()];
        let got = {
            let mut refs: Vec<&mut [f32]> = bufs.iter_mut().map(|b| &mut b[..]).collect();
            stretcher.retrieve(&mut refs)
        };
        if got == 0 {
            break;
        }
        for (c, buf) in bufs.iter().enumerate() {
            outputs[c].extend_from_slice(&buf[..got]);
        }
    }
}
