//! Overlap-add synthesis and the output resampler.
//!
//! Each grain owns a [`Segment`] covering the synthesis hop that starts one
//! hop after its centre. A grain's windowed inverse transform spans two hops
//! around its centre, so the second half starts the segment of ring slot 1
//! and the first half completes the segment of ring slot 2. By the time a
//! grain reaches slot 3 its segment is fully overlap-added and the slot-2
//! segment behind it is complete too, which is what lap padding reads from.

use crate::grains::Grains;
use crate::resample::{self, Bounds, Internal, Kernel, Operation, PADDING};
use crate::window;

/// One synthesis hop of overlap-added output at the internal rate, padded for
/// the output resampler's interpolation taps.
pub struct Segment {
    pub internal: Internal,
}

impl Segment {
    pub fn new(log2_synthesis_hop: usize, channel_count: usize) -> Self {
        Self { internal: Internal::new(1 << log2_synthesis_hop, channel_count) }
    }

    /// Copy the head of `current` into the tail padding of `trailing`, so that
    /// resampling `trailing` may read past its end even though the frames
    /// after it have not been emitted yet.
    pub fn lap_padding(trailing: &mut Segment, current: &Segment) {
        let frame_count = trailing.internal.frame_count;
        for c in 0..trailing.internal.channel_count() {
            let head: &[f32] = &current.internal.padded(c)[PADDING..PADDING + PADDING];
            let tail_padding_start = PADDING + frame_count;
            trailing.internal.padded_mut(c)[tail_padding_start..tail_padding_start + PADDING]
                .copy_from_slice(head);
        }
    }

    /// Resample this segment to the output rate, ramping the ratio from the
    /// chunk's first frame to its last. `offset` carries the fractional
    /// output position across segments so the emitted stream is continuous.
    #[allow(clippy::too_many_arguments)]
    pub fn resample(
        &mut self,
        offset: &mut f64,
        op_begin: Operation,
        op_end: Operation,
        dst: &mut [f32],
        dst_stride: usize,
        capacity: usize,
    ) -> usize {
        self.internal.offset = *offset;
        let frame_count = resample::resample_out(
            Kernel::Bilinear,
            &mut self.internal,
            dst,
            dst_stride,
            capacity,
            Bounds::all(),
            op_begin.ratio,
            op_end.ratio,
            true,
        );
        *offset = self.internal.offset;
        frame_count
    }
}

/// Synthesis-side scratch owned by the stretcher.
pub struct Output {
    pub synthesis_window: Vec<f32>,
    /// Inverse-transform scratch, transform length per channel.
    pub inverse_transformed: Vec<f32>,
    /// Emitted frames at the output rate, `max_output_frame_count` per channel.
    pub buffer_resampled: Vec<f32>,
    pub max_output_frame_count: usize,
    pub resample_offset: f64,
    log2_synthesis_hop: usize,
    channel_count: usize,
}

impl Output {
    pub fn new(
        log2_synthesis_hop: usize,
        channel_count: usize,
        max_output_frame_count: usize,
        analysis_window: &[f32],
    ) -> Self {
        let transform_length = 8 << log2_synthesis_hop;
        Self {
            synthesis_window: window::synthesis_window(analysis_window, log2_synthesis_hop),
            inverse_transformed: vec![0.0; transform_length * channel_count],
            buffer_resampled: vec![0.0; max_output_frame_count * channel_count],
            max_output_frame_count,
            resample_offset: 0.0,
            log2_synthesis_hop,
            channel_count,
        }
    }

    /// Window the freshly synthesised grain and overlap-add it into the ring:
    /// the first half window completes slot 2's segment, the second half
    /// starts slot 1's. An invalid grain contributes silence.
    pub fn apply_synthesis_window(&self, grains: &mut Grains) {
        let hop = 1usize << self.log2_synthesis_hop;
        let transform_length = 8 * hop;
        let valid = grains[0].valid();

        let slots = grains.as_mut_slice();
        let (front, back) = slots.split_at_mut(2);
        let slot1 = &mut front[1];
        let slot2 = &mut back[0];

        for c in 0..self.channel_count {
            let time = &self.inverse_transformed[c * transform_length..][3 * hop..5 * hop];

            let starting = slot1.segment.internal.unpadded_mut(c);
            if valid {
                for j in 0..hop {
                    starting[j] = time[hop + j] * self.synthesis_window[hop + j];
                }
            } else {
                starting.fill(0.0);
            }

            if valid {
                let completing = slot2.segment.internal.unpadded_mut(c);
                for j in 0..hop {
                    completing[j] += time[j] * self.synthesis_window[j];
                }
            }
        }
    }
}
