//! Per-grain state: request, timing, spectra, phase, partials and the
//! resampled input.

use realfft::num_complex::Complex;

use crate::diagnostics::{permit_alloc, Instrumentation, LOG_TARGET};
use crate::output::Segment;
use crate::partials::Partial;
use crate::phase::Phase;
use crate::resample::{self, Bounds, Internal, Kernel, Operations};
use crate::transform;
use crate::{InputChunk, Request, SampleRates};

/// Analysis timing of one grain, in internal (post input-resample) frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct Analysis {
    /// Accumulated difference between the ideal fractional hop and the
    /// rounded hops actually taken.
    pub position_error: f64,
    pub hop_ideal: f64,
    pub speed: f64,
    /// Rounded hop since the previous grain; negative when playing backwards.
    pub hop: i64,
}

pub struct Grain {
    pub log2_transform_length: usize,
    pub request: Request,
    pub request_hop: f64,
    pub continuous: bool,
    /// `1` or `-1` when this grain forwards its spectrum without phase
    /// rotation, `0` otherwise.
    pub passthrough: i64,
    pub valid_bin_count: usize,

    pub resample_operations: Operations,
    pub input_chunk: InputChunk,
    pub analysis: Analysis,
    input_resample_offset: f64,

    /// Spectrum, `bin_count` bins per channel, channel-major.
    pub transformed: Vec<Complex<f32>>,
    pub phase: Vec<Phase>,
    pub energy: Vec<f32>,
    pub rotation: Vec<Phase>,
    pub delta: Vec<Phase>,
    pub partials: Vec<Partial>,

    pub input_resampled: Internal,
    pub segment: Segment,

    /// Copy of this grain's input for the overlap check; populated only with
    /// instrumentation enabled.
    input_copy: Vec<f32>,
}

impl Grain {
    /// `heavy` allocates the spectral analysis buffers. Only two ring slots
    /// ever hold live analysis state; the ring keeps the heavy buffers on
    /// those slots by swapping at rotation, so the other slots skip the
    /// allocation entirely.
    pub fn new(log2_synthesis_hop: usize, channel_count: usize, heavy: bool) -> Self {
        let log2_transform_length = log2_synthesis_hop + 3;
        let bins = transform::bin_count(log2_transform_length);

        Self {
            log2_transform_length,
            request: Request::default(),
            request_hop: 0.0,
            continuous: false,
            passthrough: 0,
            valid_bin_count: 0,
            resample_operations: Operations::default(),
            input_chunk: InputChunk::default(),
            analysis: Analysis::default(),
            input_resample_offset: 0.0,
            transformed: vec![Complex::default(); bins * channel_count],
            phase: if heavy { vec![0; bins] } else { Vec::new() },
            energy: if heavy { vec![0.0; bins] } else { Vec::new() },
            rotation: if heavy { vec![0; bins] } else { Vec::new() },
            delta: vec![0; bins],
            partials: if heavy { Vec::with_capacity(bins) } else { Vec::new() },
            input_resampled: Internal::new(1 << log2_transform_length, channel_count),
            segment: Segment::new(log2_synthesis_hop, channel_count),
            input_copy: Vec::new(),
        }
    }

    pub fn valid(&self) -> bool {
        !self.request.position.is_nan()
    }

    pub fn reverse(&self) -> bool {
        self.analysis.hop < 0
    }

    pub fn bin_count(&self) -> usize {
        transform::bin_count(self.log2_transform_length)
    }

    pub fn channel_count(&self) -> usize {
        self.input_resampled.channel_count()
    }

    /// Copy the request, derive the grain's timing from the previous grain
    /// and compute the input chunk the caller must supply.
    pub fn specify(
        &mut self,
        request: &Request,
        previous: &Grain,
        sample_rates: SampleRates,
        log2_synthesis_hop: usize,
        buffer_start_position: f64,
        instrumentation: &Instrumentation,
    ) -> InputChunk {
        self.request = *request;
        if !(request.pitch > 0.0) {
            log::error!(target: LOG_TARGET, "specify_grain: pitch must be positive, got {}", request.pitch);
            panic!("specify_grain: pitch must be positive, got {}", request.pitch);
        }

        let unit_hop = (1u64 << log2_synthesis_hop) as f64
            * self.resample_operations.setup(sample_rates, request.pitch, request.resample_mode);

        self.request_hop = request.position - previous.request.position;

        if instrumentation.enabled
            && !request.reset
            && !request.speed.is_nan()
            && !self.request_hop.is_nan()
            && (request.speed * unit_hop - self.request_hop).abs() > 1.0
        {
            permit_alloc(|| {
                log::warn!(
                    target: LOG_TARGET,
                    "specify_grain: speed={} implies a hop of {} frames but position advanced by {} since the previous grain",
                    request.speed,
                    request.speed * unit_hop,
                    self.request_hop,
                );
            });
        }

        if self.request_hop.is_nan() || request.reset {
            self.request_hop = request.speed * unit_hop;
        }

        self.analysis.hop_ideal = self.request_hop * self.resample_operations.input.ratio;

        self.continuous = !request.reset && !previous.request.position.is_nan();
        if self.continuous {
            self.analysis.position_error = previous.analysis.position_error - self.analysis.hop_ideal;
            self.analysis.hop = (-self.analysis.position_error).round() as i64;
            self.analysis.position_error += self.analysis.hop as f64;
        } else {
            self.analysis.hop = self.analysis.hop_ideal.round() as i64;
            self.analysis.position_error = request.position.round() - request.position;
        }

        self.analysis.speed = self.analysis.hop_ideal / (1u64 << log2_synthesis_hop) as f64;

        self.passthrough =
            if self.analysis.speed.abs() == 1.0 { self.analysis.speed as i64 } else { 0 };
        if self.continuous && self.passthrough != previous.passthrough {
            self.passthrough = 0;
        }

        self.log2_transform_length = log2_synthesis_hop + 3;
        self.input_resampled.frame_count = 1 << self.log2_transform_length;

        let mut half = (self.input_resampled.frame_count / 2) as i64;
        if self.resample_operations.input.ratio != 1.0 {
            half = (half as f64 / self.resample_operations.input.ratio).round() as i64 + 1;
        }

        self.input_chunk = InputChunk { begin: -half, end: half };

        if request.position.is_nan() {
            return InputChunk::default();
        }

        let offset = (request.position - buffer_start_position).round() as i64;
        self.input_chunk.begin += offset;
        self.input_chunk.end += offset;

        // Sub-frame alignment of the resampled window: honours the request's
        // fractional position and the carried rounding error.
        self.input_resample_offset = (self.input_chunk.begin as f64
            - (request.position - buffer_start_position))
            * self.resample_operations.input.ratio
            + (self.input_resampled.frame_count / 2) as f64
            - self.analysis.position_error;

        self.input_chunk
    }

    /// Resample the caller's frames into the grain's padded internal buffer,
    /// zero-filling mute regions. Only meaningful when the input side is
    /// active; otherwise the caller's buffer is windowed directly.
    pub fn resample_input(&mut self, src: &[f32], channel_stride: usize, mute_head: usize, mute_tail: usize) {
        let frame_count = self.input_chunk.frame_count();
        self.input_resampled.offset = self.input_resample_offset;
        let ratio = self.resample_operations.input.ratio;
        resample::resample_in(
            Kernel::Bilinear,
            &mut self.input_resampled,
            src,
            channel_stride,
            frame_count,
            Bounds::muted(mute_head, mute_tail, frame_count),
            ratio,
            ratio,
        );
    }

    /// Diagnostic harness for callers: consecutive grains' input chunks
    /// overlap, and the overlapping frames must agree. Also traps NaN input,
    /// which the pipeline cannot recover from.
    pub fn overlap_check(
        &mut self,
        data: Option<&[f32]>,
        channel_stride: usize,
        mute_head: usize,
        mute_tail: usize,
        previous: &Grain,
    ) {
        let frame_count = self.input_chunk.frame_count();
        let channel_count = self.channel_count();

        permit_alloc(|| self.input_copy.resize(frame_count * channel_count, 0.0));

        for c in 0..channel_count {
            for row in 0..frame_count {
                let muted = row < mute_head || row >= frame_count - mute_tail;
                let value = if muted {
                    0.0
                } else {
                    data.map_or(0.0, |d| d[c * channel_stride + row])
                };
                if value.is_nan() {
                    log::error!(target: LOG_TARGET, "NaN detected in input audio");
                    panic!("NaN detected in input audio");
                }
                self.input_copy[c * frame_count + row] = value;
            }
        }

        let overlap_begin = self.input_chunk.begin.max(previous.input_chunk.begin);
        let overlap_end = self.input_chunk.end.min(previous.input_chunk.end);
        let overlap = overlap_end - overlap_begin;
        let previous_frames = previous.input_chunk.frame_count();

        if overlap > 0 && !previous.input_copy.is_empty() {
            let ours = (overlap_begin - self.input_chunk.begin) as usize;
            let theirs = (overlap_begin - previous.input_chunk.begin) as usize;
            for c in 0..channel_count {
                let a = &self.input_copy[c * frame_count + ours..][..overlap as usize];
                let b = &previous.input_copy[c * previous_frames + theirs..][..overlap as usize];
                if a != b {
                    permit_alloc(|| {
                        log::warn!(
                            target: LOG_TARGET,
                            "unexpected input: {} overlapping frames of this grain's input differ from the previous grain's",
                            overlap,
                        );
                    });
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ResampleMode;

    const RATES: SampleRates = SampleRates { input: 48000, output: 48000 };
    const LOG2_HOP: usize = 9;

    fn request(position: f64) -> Request {
        Request { position, speed: 1.0, ..Request::default() }
    }

    fn specify(grain: &mut Grain, previous: &Grain, request: &Request) -> InputChunk {
        grain.specify(request, previous, RATES, LOG2_HOP, 0.0, &Instrumentation::new())
    }

    #[test]
    fn test_first_grain_centres_chunk() {
        let mut grain = Grain::new(LOG2_HOP, 1, true);
        let previous = Grain::new(LOG2_HOP, 1, true);

        let chunk = specify(&mut grain, &previous, &request(1000.0));
        assert_eq!(chunk, InputChunk { begin: 1000 - 2048, end: 1000 + 2048 });
        assert!(!grain.continuous, "first grain has no valid previous");
        assert_eq!(grain.analysis.hop, 512);
        assert_eq!(grain.analysis.position_error, 0.0);
        assert_eq!(grain.passthrough, 1);
    }

    #[test]
    fn test_invalid_request_returns_empty_chunk() {
        let mut grain = Grain::new(LOG2_HOP, 1, true);
        let previous = Grain::new(LOG2_HOP, 1, true);

        let chunk = specify(&mut grain, &previous, &request(f64::NAN));
        assert_eq!(chunk.frame_count(), 0);
        assert!(!grain.valid());
    }

    #[test]
    #[should_panic(expected = "pitch must be positive")]
    fn test_non_positive_pitch_panics() {
        let mut grain = Grain::new(LOG2_HOP, 1, true);
        let previous = Grain::new(LOG2_HOP, 1, true);
        let bad = Request { pitch: -1.0, ..request(0.0) };
        specify(&mut grain, &previous, &bad);
    }

    #[test]
    fn test_position_error_carries_across_grains() {
        let mut a = Grain::new(LOG2_HOP, 1, true);
        let mut b = Grain::new(LOG2_HOP, 1, true);
        let fresh = Grain::new(LOG2_HOP, 1, true);

        // Fractional hops: rounded analysis hops must keep the accumulated
        // error within half a frame of the true positions.
        let speed = 0.7;
        let mut position = 100.0;
        specify(&mut a, &fresh, &Request { speed, ..request(position) });
        // Sum only the continuous hops: the first grain's hop is seeded from
        // the speed, not from a position delta.
        let mut hops = 0;
        for _ in 0..10 {
            position += speed * 512.0;
            specify(&mut b, &a, &Request { speed, ..request(position) });
            assert!(b.continuous);
            assert!(b.analysis.position_error.abs() <= 0.5);
            hops += b.analysis.hop;
            std::mem::swap(&mut a, &mut b);
        }
        let ideal = position - 100.0 + a.analysis.position_error;
        assert!(
            (hops as f64 - ideal).abs() <= 1.0,
            "rounded hops {} drifted from ideal advance {}",
            hops,
            ideal
        );
    }

    #[test]
    fn test_reset_falls_back_to_speed_hop() {
        let mut a = Grain::new(LOG2_HOP, 1, true);
        let mut b = Grain::new(LOG2_HOP, 1, true);
        let fresh = Grain::new(LOG2_HOP, 1, true);

        specify(&mut a, &fresh, &request(0.0));
        // A reset ignores the position delta (here a wild seek) and uses the
        // requested speed instead.
        let seek = Request { reset: true, speed: 1.0, ..request(100_000.0) };
        specify(&mut b, &a, &seek);
        assert!(!b.continuous);
        assert_eq!(b.request_hop, 512.0);
        assert_eq!(b.analysis.hop, 512);
    }

    #[test]
    fn test_passthrough_disarms_on_speed_change() {
        let mut a = Grain::new(LOG2_HOP, 1, true);
        let mut b = Grain::new(LOG2_HOP, 1, true);
        let fresh = Grain::new(LOG2_HOP, 1, true);

        specify(&mut a, &fresh, &request(0.0));
        assert_eq!(a.passthrough, 1);

        // Slowing down leaves passthrough; returning to unity mid-stream does
        // not re-arm it, phase continuity wins.
        specify(&mut b, &a, &Request { speed: 0.5, ..request(256.0) });
        assert_eq!(b.passthrough, 0);
        specify(&mut a, &b, &Request { speed: 1.0, ..request(768.0) });
        assert_eq!(a.passthrough, 0);
    }

    #[test]
    fn test_input_resampler_widens_chunk() {
        let mut grain = Grain::new(LOG2_HOP, 1, true);
        let previous = Grain::new(LOG2_HOP, 1, true);

        // Pitch 2 through the input side reads twice the window.
        let up = Request { pitch: 2.0, resample_mode: ResampleMode::AutoInOut, ..request(10_000.0) };
        let chunk = specify(&mut grain, &previous, &up);
        assert_eq!(chunk.frame_count(), 2 * (2 * 2048 + 1));
        assert!(grain.resample_operations.input.active);
        // The analysis runs at half speed; the output side stays passive.
        assert!((grain.analysis.speed - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_buffer_start_shifts_chunk_not_alignment() {
        let mut at_origin = Grain::new(LOG2_HOP, 1, true);
        let mut offset_buffer = Grain::new(LOG2_HOP, 1, true);
        let fresh = Grain::new(LOG2_HOP, 1, true);

        // A fractional position and an active input resampler, addressed once
        // from the track origin and once from a buffer starting 300 frames in.
        let up = Request { pitch: 2.0, resample_mode: ResampleMode::AutoInOut, ..request(10_000.25) };
        let chunk0 = at_origin.specify(&up, &fresh, RATES, LOG2_HOP, 0.0, &Instrumentation::new());
        let chunk1 =
            offset_buffer.specify(&up, &fresh, RATES, LOG2_HOP, 300.0, &Instrumentation::new());

        // The buffer origin only relabels the chunk coordinates; the grain's
        // timing and sub-frame resample alignment must not move.
        assert_eq!(chunk1.begin, chunk0.begin - 300);
        assert_eq!(chunk1.end, chunk0.end - 300);
        assert_eq!(offset_buffer.analysis.hop, at_origin.analysis.hop);
        assert_eq!(offset_buffer.analysis.position_error, at_origin.analysis.position_error);
        assert_eq!(offset_buffer.input_resample_offset, at_origin.input_resample_offset);

        // Feed the same track audio, a slow ramp, through the offset buffer.
        // Bilinear resampling reproduces a ramp exactly, so every internal
        // sample must land on the track value its position implies.
        let track = |frame: f64| (frame * 1e-3 - 6.0) as f32;
        let frame_count = chunk1.frame_count();
        let src: Vec<f32> =
            (0..frame_count).map(|row| track((chunk1.begin + 300 + row as i64) as f64)).collect();
        offset_buffer.resample_input(&src, frame_count, 0, 0);

        let n = 1usize << offset_buffer.log2_transform_length;
        let ratio = offset_buffer.resample_operations.input.ratio;
        let offset = offset_buffer.input_resample_offset;
        let internal = offset_buffer.input_resampled.unpadded(0);
        for j in 4..n - 4 {
            let source = (chunk1.begin + 300) as f64 + (j as f64 - offset) / ratio;
            let want = track(source);
            assert!(
                (internal[j] - want).abs() < 1e-3,
                "internal sample {}: {} vs track value {}",
                j,
                internal[j],
                want
            );
        }
    }

    #[test]
    fn test_reverse_hop() {
        let mut a = Grain::new(LOG2_HOP, 1, true);
        let mut b = Grain::new(LOG2_HOP, 1, true);
        let fresh = Grain::new(LOG2_HOP, 1, true);

        specify(&mut a, &fresh, &Request { speed: -1.0, ..request(10_000.0) });
        specify(&mut b, &a, &Request { speed: -1.0, ..request(10_000.0 - 512.0) });
        assert!(b.reverse());
        assert_eq!(b.analysis.hop, -512);
        assert_eq!(b.passthrough, -1);
    }
}
