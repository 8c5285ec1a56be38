//! Linear-interpolating, ramped-ratio resampling between the caller's sample
//! rates and the phase vocoder's internal rate.
//!
//! Two directions share one inner-loop shape: input resampling scatters
//! external frames into the padded internal buffer (additive, scaled by the
//! instantaneous ratio so energy is preserved), output resampling gathers from
//! the internal buffer into the external buffer. The ratio may ramp linearly
//! across a segment so that consecutive grains with different pitch settings
//! join without a step.

use crate::diagnostics::LOG_TARGET;
use crate::{ResampleMode, SampleRates};

/// Silence padding on both sides of the internal buffer so interpolation taps
/// never read out of bounds.
pub const PADDING: usize = 32;

/// Interpolation kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kernel {
    Nearest,
    Bilinear,
}

/// The internal buffer, at the phase vocoder's sample rate. Channel-major with
/// [`PADDING`] silent frames on both sides of every channel.
pub struct Internal {
    data: Vec<f32>,
    max_frame_count: usize,
    channel_count: usize,
    /// Frames of the currently active segment, `<= max_frame_count`.
    pub frame_count: usize,
    /// Fractional read/write position carried across segments.
    pub offset: f64,
}

impl Internal {
    pub fn new(max_frame_count: usize, channel_count: usize) -> Self {
        Self {
            data: vec![0.0; (max_frame_count + 2 * PADDING) * channel_count],
            max_frame_count,
            channel_count,
            frame_count: max_frame_count,
            offset: 0.0,
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    /// Rows per channel including both pads.
    pub fn channel_stride(&self) -> usize {
        self.max_frame_count + 2 * PADDING
    }

    /// The active frames of one channel, pads excluded.
    pub fn unpadded(&self, channel: usize) -> &[f32] {
        let start = channel * self.channel_stride() + PADDING;
        &self.data[start..start + self.frame_count]
    }

    pub fn unpadded_mut(&mut self, channel: usize) -> &mut [f32] {
        let stride = self.channel_stride();
        let start = channel * stride + PADDING;
        &mut self.data[start..start + self.frame_count]
    }

    pub fn zero(&mut self) {
        self.data.fill(0.0);
    }

    /// View for windowing: a slice starting at the first unpadded frame of
    /// channel 0, paired with the padded stride, so that
    /// `slice[c * stride + row]` addresses row `row` of channel `c`.
    pub(crate) fn frames(&self) -> (&[f32], usize) {
        (&self.data[PADDING..], self.channel_stride())
    }

    pub(crate) fn padded(&self, channel: usize) -> &[f32] {
        let stride = self.channel_stride();
        &self.data[channel * stride..(channel + 1) * stride]
    }

    pub(crate) fn padded_mut(&mut self, channel: usize) -> &mut [f32] {
        let stride = self.channel_stride();
        &mut self.data[channel * stride..(channel + 1) * stride]
    }
}

/// External-buffer mute bounds: rows outside `[unmuted_begin, unmuted_end)`
/// contribute nothing on the way in and receive zero on the way out.
#[derive(Debug, Clone, Copy)]
pub struct Bounds {
    pub unmuted_begin: usize,
    pub unmuted_end: usize,
}

impl Bounds {
    pub fn all() -> Self {
        Self { unmuted_begin: 0, unmuted_end: usize::MAX }
    }

    pub fn muted(mute_head: usize, mute_tail: usize, frame_count: usize) -> Self {
        let head = mute_head.min(frame_count);
        let tail = mute_tail.min(frame_count);
        Self { unmuted_begin: head, unmuted_end: frame_count.saturating_sub(tail) }
    }

    fn clamp(self, frame_count: usize) -> Self {
        let begin = self.unmuted_begin.min(frame_count);
        Self { unmuted_begin: begin, unmuted_end: self.unmuted_end.clamp(begin, frame_count) }
    }
}

/// One side of a grain's resampling, configured by [`Operations::setup`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Operation {
    pub active: bool,
    pub ratio: f64,
}

impl Default for Operation {
    fn default() -> Self {
        Self { active: false, ratio: 1.0 }
    }
}

/// Per-grain resampler configuration for both directions.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Operations {
    pub input: Operation,
    pub output: Operation,
}

impl Operations {
    /// Choose which side resamples for the given pitch and sample rates, and
    /// return the residual rate ratio that the synthesis timing absorbs.
    pub fn setup(&mut self, sample_rates: SampleRates, pitch: f64, mode: ResampleMode) -> f64 {
        let resample_ratio = pitch * sample_rates.input as f64 / sample_rates.output as f64;
        self.input = Operation { active: true, ratio: 1.0 / resample_ratio };
        self.output = Operation { active: true, ratio: resample_ratio };

        match mode {
            ResampleMode::ForceOut => self.input.active = false,
            ResampleMode::ForceIn => self.output.active = false,
            _ if resample_ratio == 1.0 => {
                self.input.active = false;
                self.output.active = false;
            }
            ResampleMode::AutoIn => self.output.active = false,
            ResampleMode::AutoOut => self.input.active = false,
            ResampleMode::AutoInOut => {
                if resample_ratio > 1.0 {
                    self.output.active = false;
                } else {
                    self.input.active = false;
                }
            }
        }

        if !self.input.active {
            self.input.ratio = 1.0;
        }

        let rate_ratio = sample_rates.input as f64 / sample_rates.output as f64;
        if self.output.active {
            rate_ratio / self.output.ratio
        } else {
            self.output.ratio = 1.0;
            rate_ratio
        }
    }
}

struct Geometry {
    active_frame_count: usize,
    ratio_end: f64,
    truncated: bool,
}

/// External frame count that covers the internal segment at the mean ratio,
/// with optional end alignment so the segment lands exactly on its boundary.
fn geometry(
    internal: &Internal,
    capacity: usize,
    ratio_begin: f64,
    ratio_end: f64,
    align_end: bool,
) -> Geometry {
    let span = internal.frame_count as f64 - internal.offset;
    let ideal = (2.0 * span / (ratio_begin + ratio_end)).round().max(0.0) as usize;

    let truncated = ideal > capacity;
    let active_frame_count = ideal.min(capacity);

    let mut ratio_end = ratio_end;
    if active_frame_count > 0 && align_end {
        let mean_ratio = span / active_frame_count as f64;
        ratio_end = 2.0 * mean_ratio - ratio_begin;
        debug_assert!(ratio_end > 0.0);
    }

    Geometry { active_frame_count, ratio_end, truncated }
}

/// Store the residual position for the next segment; a residual beyond
/// tolerance means the ratios and frame counts disagreed, so reset rather than
/// let the error compound.
fn finish(internal: &mut Internal, x: f64, ratio_end: f64, align_end: bool, truncated: bool) {
    internal.offset = x - PADDING as f64 - internal.frame_count as f64;

    let tolerance = if align_end { 1e-2 } else { ratio_end.abs() * 1.1 };
    if internal.offset.abs() > tolerance {
        if !truncated {
            crate::diagnostics::permit_alloc(|| {
                log::warn!(
                    target: LOG_TARGET,
                    "resample landed badly: residual offset {:.4}",
                    internal.offset
                );
            });
        }
        internal.offset = 0.0;
    }
}

/// Resample external frames into the internal buffer (additive scatter). The
/// internal buffer is zeroed first; muted rows contribute nothing. Returns the
/// number of external frames consumed.
#[allow(clippy::too_many_arguments)]
pub fn resample_in(
    kernel: Kernel,
    internal: &mut Internal,
    src: &[f32],
    src_stride: usize,
    frame_count: usize,
    bounds: Bounds,
    ratio_begin: f64,
    ratio_end: f64,
) -> usize {
    let geometry = geometry(internal, frame_count, ratio_begin, ratio_end, false);
    let active = geometry.active_frame_count;

    internal.zero();

    if active == 0 {
        return 0;
    }

    let bounds = bounds.clamp(active);
    let ratio_gradient = (geometry.ratio_end - ratio_begin) / active as f64;
    let channel_count = internal.channel_count;

    let mut x = PADDING as f64 + internal.offset;
    let mut ratio = ratio_begin + 0.5 * ratio_gradient;
    let mut row = 0usize;
    while row < active {
        if row >= bounds.unmuted_begin && row < bounds.unmuted_end {
            let gain = ratio as f32;
            match kernel {
                Kernel::Nearest => {
                    let integer = (x + 0.5) as usize;
                    for c in 0..channel_count {
                        let value = src[row + c * src_stride] * gain;
                        internal.padded_mut(c)[integer] += value;
                    }
                }
                Kernel::Bilinear => {
                    let integer = x as usize;
                    let fraction = (x - integer as f64) as f32;
                    for c in 0..channel_count {
                        let value = src[row + c * src_stride] * gain;
                        let column = internal.padded_mut(c);
                        column[integer + 1] += value * fraction;
                        column[integer] += value * (1.0 - fraction);
                    }
                }
            }
        }
        x += ratio;
        ratio += ratio_gradient;
        row += 1;
    }

    finish(internal, x, geometry.ratio_end, false, geometry.truncated);
    active
}

/// Resample the internal buffer into external frames (gather). Muted rows are
/// written as zero. Returns the number of external frames produced.
#[allow(clippy::too_many_arguments)]
pub fn resample_out(
    kernel: Kernel,
    internal: &mut Internal,
    dst: &mut [f32],
    dst_stride: usize,
    capacity: usize,
    bounds: Bounds,
    ratio_begin: f64,
    ratio_end: f64,
    align_end: bool,
) -> usize {
    let geometry = geometry(internal, capacity, ratio_begin, ratio_end, align_end);
    let active = geometry.active_frame_count;

    if active == 0 {
        return 0;
    }

    let bounds = bounds.clamp(active);
    let ratio_gradient = (geometry.ratio_end - ratio_begin) / active as f64;
    let channel_count = internal.channel_count;

    let mut x = PADDING as f64 + internal.offset;
    let mut ratio = ratio_begin + 0.5 * ratio_gradient;
    for row in 0..active {
        if row >= bounds.unmuted_begin && row < bounds.unmuted_end {
            match kernel {
                Kernel::Nearest => {
                    let integer = (x + 0.5) as usize;
                    for c in 0..channel_count {
                        dst[row + c * dst_stride] = internal.padded(c)[integer];
                    }
                }
                Kernel::Bilinear => {
                    let integer = x as usize;
                    let fraction = (x - integer as f64) as f32;
                    for c in 0..channel_count {
                        let column = internal.padded(c);
                        dst[row + c * dst_stride] =
                            column[integer + 1] * fraction + column[integer] * (1.0 - fraction);
                    }
                }
            }
        } else {
            for c in 0..channel_count {
                dst[row + c * dst_stride] = 0.0;
            }
        }
        x += ratio;
        ratio += ratio_gradient;
    }

    finish(internal, x, geometry.ratio_end, align_end, geometry.truncated);
    active
}
