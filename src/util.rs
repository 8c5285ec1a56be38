//! Signal probes used by the test suites to judge processed audio.

use realfft::num_complex::Complex;

use crate::phase::{self, Phase};
use crate::transform::{self, Transforms};

/// Generate a sine wave at the given frequency, sample rate, amplitude and
/// duration.
///
/// The oscillator runs on the same 16-bit turn-fraction phase the synthesis
/// engine uses, so the tone never drifts; its frequency is quantised to
/// `sample_rate / 0x10000` steps (0.73 Hz at 48 kHz).
pub fn generate_sine_wave(frequency: f32, sample_rate: f32, amplitude: f32, duration: f32) -> Vec<f32> {
    let frame_count = (sample_rate * duration) as usize;
    let step = phase::from_radians(2.0 * std::f32::consts::PI * frequency / sample_rate);

    let mut oscillator: Phase = 0;
    (0..frame_count)
        .map(|_| {
            let sample = amplitude * phase::to_complex(oscillator).im;
            oscillator = oscillator.wrapping_add(step);
            sample
        })
        .collect()
}

/// Frequency of the strongest spectral bin, in Hz.
pub fn compute_dominant_frequency(signal: &[f32], sample_rate: f32) -> f32 {
    if signal.len() < 2 {
        return 0.0;
    }

    let log2_length = signal.len().next_power_of_two().trailing_zeros() as usize;
    let length = 1usize << log2_length;

    let mut transforms = Transforms::new();
    transforms.prepare(log2_length);

    let mut time = vec![0.0; length];
    time[..signal.len()].copy_from_slice(signal);
    let mut spectrum = vec![Complex::default(); transform::bin_count(log2_length)];
    let bins = spectrum.len();
    transforms.forward(log2_length, &mut time, length, &mut spectrum, bins, 1);

    let peak = spectrum
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.norm_sqr().total_cmp(&b.1.norm_sqr()))
        .map_or(0, |(bin, _)| bin);
    peak as f32 * sample_rate / length as f32
}

/// Amplitude of a steady tone, estimated from its power.
pub fn compute_magnitude(signal: &[f32]) -> f32 {
    if signal.is_empty() {
        return 0.0;
    }
    let power = signal.iter().map(|&s| s as f64 * s as f64).sum::<f64>() / signal.len() as f64;
    (2.0 * power).sqrt() as f32
}
