//! Precomputed analysis and synthesis windows.
//!
//! The analysis window is a periodic Hann over the full transform length. The
//! synthesis window covers the central two synthesis hops of the transform and
//! is compensated so that the overlap-add of analysis * synthesis across
//! consecutive synthesis hops sums to exactly one, with the unnormalised
//! inverse FFT's gain folded in. That makes unity-speed playback an exact
//! identity rather than an approximation that depends on the window shape.

use std::f64::consts::PI;

/// Periodic Hann window of the transform length: first element is zero, the
/// peak value of one sits at the transform centre.
pub fn analysis_window(log2_transform_length: usize) -> Vec<f32> {
    let n = 1usize << log2_transform_length;
    (0..n)
        .map(|k| {
            let s = (PI * k as f64 / n as f64).sin();
            (s * s) as f32
        })
        .collect()
}

/// Synthesis window spanning the two synthesis hops at the transform centre.
///
/// `w_s[j] = sin^2(PI*j/2H) / (N * w_a[3H + j])`: the Hann factor gives the
/// constant overlap-add at hop stride, the division cancels the analysis
/// window over its well-conditioned central region, and `1/N` undoes the
/// inverse transform's scaling.
pub fn synthesis_window(analysis: &[f32], log2_synthesis_hop: usize) -> Vec<f32> {
    let hop = 1usize << log2_synthesis_hop;
    let n = analysis.len();
    assert_eq!(n, 8 * hop, "synthesis window expects an 8x oversampled analysis window");

    (0..2 * hop)
        .map(|j| {
            let s = (PI * j as f64 / (2 * hop) as f64).sin();
            (s * s / (n as f64 * analysis[3 * hop + j] as f64)) as f32
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_analysis_window_bounds() {
        for log2_n in [8, 10, 12] {
            let n = 1usize << log2_n;
            let window = analysis_window(log2_n);
            assert_eq!(window.len(), n);
            assert_eq!(window[0], 0.0, "first element must be zero");
            assert!((window[n / 2] - 1.0).abs() < 1e-6, "centre must be one");
            assert!(
                (window[1] - window[n - 1]).abs() < 1e-6,
                "periodic window must be symmetric about its centre"
            );
        }
    }

    #[test]
    fn test_overlap_add_is_unity() {
        for log2_hop in [5, 7, 9] {
            let hop = 1usize << log2_hop;
            let n = 8 * hop;
            let analysis = analysis_window(log2_hop + 3);
            let synthesis = synthesis_window(&analysis, log2_hop);
            assert_eq!(synthesis.len(), 2 * hop);

            // The product of the two windows, overlap-added at hop stride and
            // scaled back up by the transform length, must be one everywhere.
            for j in 0..hop {
                let sum = analysis[3 * hop + j] * synthesis[j]
                    + analysis[4 * hop + j] * synthesis[hop + j];
                assert!(
                    (sum * n as f32 - 1.0).abs() < 1e-5,
                    "log2_hop={}, j={}: overlap-add sum = {}",
                    log2_hop,
                    j,
                    sum * n as f32
                );
            }
        }
    }

    #[test]
    fn test_synthesis_window_is_well_conditioned() {
        // The compensation divides by the analysis window over [3H, 5H) where
        // it stays above sin^2(3*PI/8); the synthesis window must stay bounded.
        let analysis = analysis_window(9);
        let synthesis = synthesis_window(&analysis, 6);
        let n = analysis.len() as f32;
        for (j, &w) in synthesis.iter().enumerate() {
            assert!(w >= 0.0 && w * n <= 1.2, "j={}: w*n = {}", j, w * n);
        }
    }
}
