//! The stretcher: grain state machine and orchestration.

use anyhow::{bail, Result};
use realfft::num_complex::Complex;

use crate::diagnostics::{self, Instrumentation, ANALYSE, LOG_TARGET, SPECIFY, SYNTHESISE};
use crate::grains::Grains;
use crate::input::Input;
use crate::output::{Output, Segment};
use crate::timing::Timing;
use crate::transform::{self, Transforms};
use crate::{phase, InputChunk, OutputChunk, Request, SampleRates};

/// Granular time-stretcher and pitch-shifter.
///
/// Drive it in a strict cycle: [`specify_grain`](Self::specify_grain) returns
/// the input frames the grain needs, [`analyse_grain`](Self::analyse_grain)
/// consumes them, [`synthesise_grain`](Self::synthesise_grain) emits the
/// grain's output chunk. One instance is single-threaded; separate instances
/// are independent.
pub struct Stretcher {
    timing: Timing,
    instrumentation: Instrumentation,
    transforms: Transforms,
    input: Input,
    grains: Grains,
    output: Output,
    /// Per-bin rotation phasors, scratch for the synthesis pass.
    phasors: Vec<Complex<f32>>,
    channel_count: usize,
}

impl Stretcher {
    /// Name of this implementation.
    pub fn edition() -> &'static str {
        "Basic"
    }

    /// Release version string.
    pub fn version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    /// Create a stretcher. All allocation happens here.
    ///
    /// `log2_synthesis_hop_adjust` must be -1, 0 or +1: -1 doubles the
    /// granular frequency (lower latency, may help weak transients), +1
    /// halves it (may benefit dense tones). Non-zero values are likely to
    /// degrade quality; most callers should pass 0.
    pub fn new(
        sample_rates: SampleRates,
        channel_count: usize,
        log2_synthesis_hop_adjust: i32,
    ) -> Result<Self> {
        if channel_count == 0 {
            bail!("channel count must be at least 1");
        }
        let timing = Timing::new(sample_rates, log2_synthesis_hop_adjust)?;

        let mut transforms = Transforms::new();
        transforms.prepare(timing.log2_transform_length());

        let input = Input::new(timing.log2_synthesis_hop, channel_count);
        let grains = Grains::new(timing.log2_synthesis_hop, channel_count);
        let output = Output::new(
            timing.log2_synthesis_hop,
            channel_count,
            timing.max_output_frame_count(),
            &input.analysis_window,
        );
        let phasors = vec![Complex::default(); transform::bin_count(timing.log2_transform_length())];

        Ok(Self { timing, instrumentation: Instrumentation::new(), transforms, input, grains, output, phasors, channel_count })
    }

    /// Enable verbose per-grain logging and the input overlap check.
    pub fn enable_instrumentation(&mut self, enable: bool) {
        self.instrumentation.enabled = enable;
    }

    pub fn sample_rates(&self) -> SampleRates {
        self.timing.sample_rates
    }

    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    /// Largest number of frames [`specify_grain`](Self::specify_grain) may
    /// ever request; size input staging buffers with this.
    pub fn max_input_frame_count(&self) -> usize {
        self.timing.max_input_frame_count()
    }

    /// Walk `request.position` back by a few grains so the pipeline is full
    /// before the first audible output.
    pub fn preroll(&self, request: &mut Request) {
        self.timing.preroll(request);
    }

    /// Advance `request.position` by one grain at `request.speed`.
    pub fn next(&self, request: &mut Request) {
        self.timing.next(request);
    }

    /// True when every grain in the pipeline is invalid (flushed).
    pub fn is_flushed(&self) -> bool {
        self.grains.flushed()
    }

    /// Rotate the grain ring, adopt the request and return the input chunk
    /// the caller must supply to [`analyse_grain`](Self::analyse_grain).
    pub fn specify_grain(&mut self, request: &Request, buffer_start_position: f64) -> InputChunk {
        self.instrumentation.begin_call(SPECIFY);

        diagnostics::assert_no_alloc(|| {
            self.grains.rotate();
            let (current, rest) = self.grains.as_mut_slice().split_at_mut(1);
            current[0].specify(
                request,
                &rest[0],
                self.timing.sample_rates,
                self.timing.log2_synthesis_hop,
                buffer_start_position,
                &self.instrumentation,
            )
        })
    }

    /// Analyse the grain: resample and window the caller's frames, transform
    /// them and extract energy, phase and partials.
    ///
    /// `data` spans the chunk returned by the preceding
    /// [`specify_grain`](Self::specify_grain) call, channel `c` starting at
    /// `data[c * channel_stride]`; `None` means an all-mute grain. Frames
    /// within `mute_head` of the start or `mute_tail` of the end are treated
    /// as silence and never read.
    pub fn analyse_grain(
        &mut self,
        data: Option<&[f32]>,
        channel_stride: usize,
        mute_head: usize,
        mute_tail: usize,
    ) {
        self.instrumentation.begin_call(ANALYSE);

        if self.instrumentation.enabled {
            if self.instrumentation.take_setup_log() {
                log::debug!(
                    target: LOG_TARGET,
                    "stretcher: sample_rates=[{}, {}] channel_count={} synthesis_hop={}",
                    self.timing.sample_rates.input,
                    self.timing.sample_rates.output,
                    self.channel_count,
                    self.timing.synthesis_hop(),
                );
            }
            let request = &self.grains[0].request;
            log::debug!(
                target: LOG_TARGET,
                "analyse_grain: position={} speed={} pitch={} reset={} mute={}:{}",
                request.position,
                request.speed,
                request.pitch,
                request.reset,
                mute_head,
                mute_tail,
            );
        }

        diagnostics::assert_no_alloc(|| self.analyse(data, channel_stride, mute_head, mute_tail));
    }

    fn analyse(&mut self, data: Option<&[f32]>, channel_stride: usize, mute_head: usize, mute_tail: usize) {
        let (current, rest) = self.grains.as_mut_slice().split_at_mut(1);
        let grain = &mut current[0];
        let previous = &rest[0];

        grain.valid_bin_count = 0;
        if !grain.valid() {
            return;
        }

        let frame_count = grain.input_chunk.frame_count();
        let mut mute_head = mute_head;
        let mut mute_tail = mute_tail;
        if data.is_none() {
            mute_head = frame_count;
            mute_tail = 0;
        }
        mute_head = mute_head.min(frame_count);
        mute_tail = mute_tail.min(frame_count);

        if self.instrumentation.enabled {
            grain.overlap_check(data, channel_stride, mute_head, mute_tail, previous);
        }

        let src = data.unwrap_or(&[]);
        let log2_transform_length = if grain.resample_operations.input.active {
            grain.resample_input(src, channel_stride, mute_head, mute_tail);
            let (frames, stride) = grain.input_resampled.frames();
            self.input.apply_analysis_window(frames, stride, 0, 0)
        } else {
            self.input.apply_analysis_window(src, channel_stride, mute_head, mute_tail)
        };
        grain.log2_transform_length = log2_transform_length;

        let n = 1usize << log2_transform_length;
        let bins = transform::bin_count(log2_transform_length);
        self.transforms.forward(
            log2_transform_length,
            &mut self.input.windowed_input,
            n,
            &mut grain.transformed,
            bins,
            self.channel_count,
        );

        // Bins that the output resampler would fold back as aliases carry no
        // usable signal; discard them before they smear into the synthesis.
        let top = bins - 1;
        grain.valid_bin_count = (((top as f64 / grain.resample_operations.output.ratio).ceil()
            as usize)
            .min(top))
            + 1;
        for c in 0..self.channel_count {
            grain.transformed[c * bins + grain.valid_bin_count..(c + 1) * bins].fill(Complex::default());
        }

        for k in 0..grain.valid_bin_count {
            let mut x = Complex::default();
            for c in 0..self.channel_count {
                x += grain.transformed[c * bins + k];
            }
            grain.energy[k] = x.norm_sqr();
            grain.phase[k] = phase::from_radians(x.arg());
        }
        grain.energy[grain.valid_bin_count..].fill(0.0);
        grain.phase[grain.valid_bin_count..].fill(0);

        crate::partials::enumerate(&mut grain.partials, grain.valid_bin_count, &grain.energy);

        if grain.continuous {
            crate::partials::suppress_transient_partials(
                &mut grain.partials,
                &grain.energy,
                &previous.energy,
            );
        }
    }

    /// Synthesise the grain and emit the next output chunk.
    ///
    /// The chunk lags the specified grain by two grains: the overlap-add
    /// tails of a hop are complete only once the two following grains have
    /// been synthesised.
    pub fn synthesise_grain(&mut self) -> OutputChunk<'_> {
        self.instrumentation.begin_call(SYNTHESISE);

        let frame_count = diagnostics::assert_no_alloc(|| self.synthesise());

        if self.instrumentation.enabled {
            log::debug!(target: LOG_TARGET, "synthesise_grain: emitting {} frames", frame_count);
        }

        OutputChunk {
            data: &self.output.buffer_resampled,
            frame_count,
            channel_stride: self.output.max_output_frame_count,
            request: [&self.grains[2].request, &self.grains[1].request],
        }
    }

    fn synthesise(&mut self) -> usize {
        {
            let (current, rest) = self.grains.as_mut_slice().split_at_mut(1);
            let grain = &mut current[0];
            let previous = &rest[0];

            if grain.valid() {
                let valid = grain.valid_bin_count;

                if grain.passthrough != 0 {
                    debug_assert!(grain.analysis.speed == grain.passthrough as f64);
                    grain.rotation[..valid].fill(0);
                    grain.delta[..valid].fill(0);
                } else if grain.continuous {
                    phase::propagate(
                        &mut grain.rotation,
                        &mut grain.delta,
                        &grain.partials,
                        &grain.phase,
                        &previous.phase,
                        &previous.rotation,
                        valid,
                        grain.analysis.hop,
                        self.timing.log2_synthesis_hop,
                        grain.log2_transform_length,
                    );
                } else {
                    // Discontinuity: let the transform's own phases through.
                    grain.rotation[..valid].fill(0);
                    grain.delta[..valid].fill(0);
                }
                grain.rotation[valid..].fill(0);

                let bins = grain.bin_count();
                let rotate = grain.passthrough == 0;
                if rotate {
                    for k in 0..valid {
                        self.phasors[k] = phase::to_complex(grain.rotation[k]);
                    }
                }
                let reverse = grain.reverse();
                if rotate || reverse {
                    for c in 0..self.channel_count {
                        let column = &mut grain.transformed[c * bins..c * bins + valid];
                        for (k, x) in column.iter_mut().enumerate() {
                            if reverse {
                                *x = x.conj();
                            }
                            if rotate {
                                *x *= self.phasors[k];
                            }
                        }
                    }
                }

                // The inverse transform requires real DC and Nyquist bins.
                for c in 0..self.channel_count {
                    grain.transformed[c * bins].im = 0.0;
                    grain.transformed[c * bins + bins - 1].im = 0.0;
                }

                let n = 1usize << grain.log2_transform_length;
                self.transforms.inverse(
                    grain.log2_transform_length,
                    &mut self.output.inverse_transformed,
                    n,
                    &mut grain.transformed,
                    bins,
                    self.channel_count,
                );
            }
        }

        self.output.apply_synthesis_window(&mut self.grains);

        let slots = self.grains.as_mut_slice();
        let (front, back) = slots.split_at_mut(3);
        Segment::lap_padding(&mut back[0].segment, &front[2].segment);

        back[0].segment.resample(
            &mut self.output.resample_offset,
            front[2].resample_operations.output,
            front[1].resample_operations.output,
            &mut self.output.buffer_resampled,
            self.output.max_output_frame_count,
            self.output.max_output_frame_count,
        )
    }
}
