//! Real FFT / inverse FFT at power-of-two lengths.
//!
//! Thin multichannel wrapper over `realfft` plans. Plans and scratch buffers
//! are created by `prepare()` at construction time; the forward and inverse
//! passes never allocate.

use std::sync::Arc;

use realfft::num_complex::Complex;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};

/// Number of complex bins of a real FFT of length `2^log2_length`.
pub fn bin_count(log2_length: usize) -> usize {
    (1 << (log2_length - 1)) + 1
}

struct Plan {
    forward: Arc<dyn RealToComplex<f32>>,
    inverse: Arc<dyn ComplexToReal<f32>>,
}

/// Plan table indexed by log2 transform length.
pub struct Transforms {
    plans: Vec<Option<Plan>>,
    scratch_forward: Vec<Complex<f32>>,
    scratch_inverse: Vec<Complex<f32>>,
}

impl Transforms {
    pub fn new() -> Self {
        Self { plans: Vec::new(), scratch_forward: Vec::new(), scratch_inverse: Vec::new() }
    }

    /// Plan transforms of length `2^log2_length` and reserve scratch for them.
    pub fn prepare(&mut self, log2_length: usize) {
        if self.plans.len() <= log2_length {
            self.plans.resize_with(log2_length + 1, || None);
        }
        if self.plans[log2_length].is_none() {
            let mut planner = RealFftPlanner::<f32>::new();
            let forward = planner.plan_fft_forward(1 << log2_length);
            let inverse = planner.plan_fft_inverse(1 << log2_length);
            if self.scratch_forward.len() < forward.get_scratch_len() {
                self.scratch_forward.resize(forward.get_scratch_len(), Complex::default());
            }
            if self.scratch_inverse.len() < inverse.get_scratch_len() {
                self.scratch_inverse.resize(inverse.get_scratch_len(), Complex::default());
            }
            self.plans[log2_length] = Some(Plan { forward, inverse });
        }
    }

    /// Forward real FFT, channel by channel. `time` is destroyed.
    pub fn forward(
        &mut self,
        log2_length: usize,
        time: &mut [f32],
        time_stride: usize,
        freq: &mut [Complex<f32>],
        freq_stride: usize,
        channel_count: usize,
    ) {
        let n = 1 << log2_length;
        let bins = bin_count(log2_length);
        let plan = self.plans[log2_length].as_ref().expect("transform length was not prepared");
        for c in 0..channel_count {
            plan.forward
                .process_with_scratch(
                    &mut time[c * time_stride..c * time_stride + n],
                    &mut freq[c * freq_stride..c * freq_stride + bins],
                    &mut self.scratch_forward,
                )
                .expect("failed forward FFT pass");
        }
    }

    /// Inverse real FFT, channel by channel. `freq` is destroyed. The DC and
    /// Nyquist bins must have zero imaginary parts.
    pub fn inverse(
        &mut self,
        log2_length: usize,
        time: &mut [f32],
        time_stride: usize,
        freq: &mut [Complex<f32>],
        freq_stride: usize,
        channel_count: usize,
    ) {
        let n = 1 << log2_length;
        let bins = bin_count(log2_length);
        let plan = self.plans[log2_length].as_ref().expect("transform length was not prepared");
        for c in 0..channel_count {
            plan.inverse
                .process_with_scratch(
                    &mut freq[c * freq_stride..c * freq_stride + bins],
                    &mut time[c * time_stride..c * time_stride + n],
                    &mut self.scratch_inverse,
                )
                .expect("failed inverse FFT pass");
        }
    }

    /// True once `prepare()` has run for this length.
    pub fn prepared(&self, log2_length: usize) -> bool {
        self.plans.get(log2_length).is_some_and(Option::is_some)
    }
}

impl Default for Transforms {
    fn default() -> Self {
        Self::new()
    }
}
