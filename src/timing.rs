//! Grain timing: synthesis hop derivation, worst-case frame counts, preroll
//! and constant-speed request advancement.

use anyhow::{bail, Result};

use crate::resample::Operations;
use crate::{Request, SampleRates};

/// Grains in flight. Output emission trails grain specification by two grains,
/// so preroll walks the start position back by `GRAIN_COUNT - 1` hops.
pub const GRAIN_COUNT: usize = 4;

/// Largest supported resampling ratio on either side, two octaves. Buffer
/// sizing assumes `pitch * rates.input / rates.output` and its inverse stay
/// within this.
pub const MAX_RESAMPLE_RATIO: f64 = 4.0;

#[derive(Debug, Clone, Copy)]
pub struct Timing {
    pub sample_rates: SampleRates,
    pub log2_synthesis_hop: usize,
}

impl Timing {
    pub fn new(sample_rates: SampleRates, log2_synthesis_hop_adjust: i32) -> Result<Self> {
        if !(-1..=1).contains(&log2_synthesis_hop_adjust) {
            bail!(
                "log2_synthesis_hop_adjust must be -1, 0 or +1, got {}",
                log2_synthesis_hop_adjust
            );
        }
        if sample_rates.input == 0 || sample_rates.output == 0 {
            bail!("sample rates must be positive");
        }

        // Around 10 ms of synthesis hop: 512 frames at 48 kHz, halving or
        // doubling with the adjust parameter.
        let rate = sample_rates.input.max(sample_rates.output) as f64;
        let log2_synthesis_hop = rate.log2().round() as i32 - 7 + log2_synthesis_hop_adjust;
        if log2_synthesis_hop < 2 {
            bail!("sample rates too low for granular processing");
        }

        Ok(Self { sample_rates, log2_synthesis_hop: log2_synthesis_hop as usize })
    }

    pub fn synthesis_hop(&self) -> usize {
        1 << self.log2_synthesis_hop
    }

    pub fn log2_transform_length(&self) -> usize {
        self.log2_synthesis_hop + 3
    }

    /// Input-frame advance of one grain at unity speed, for the request's
    /// pitch and resample routing.
    pub fn unit_hop(&self, pitch: f64, mode: crate::ResampleMode) -> f64 {
        let mut operations = Operations::default();
        let multiplier = operations.setup(self.sample_rates, pitch, mode);
        self.synthesis_hop() as f64 * multiplier
    }

    /// Walk `request.position` back so the pipeline is full before the first
    /// audible output frame.
    pub fn preroll(&self, request: &mut Request) {
        let hop = self.unit_hop(request.pitch, request.resample_mode);
        request.position -= request.speed * hop * (GRAIN_COUNT - 1) as f64;
    }

    /// Advance `request.position` by one grain at `request.speed`.
    pub fn next(&self, request: &mut Request) {
        request.position += request.speed * self.unit_hop(request.pitch, request.resample_mode);
    }

    /// Worst-case frames any grain may request at any supported speed and
    /// pitch.
    pub fn max_input_frame_count(&self) -> usize {
        let n = 1usize << self.log2_transform_length();
        let rate_ratio = self.sample_rates.input as f64 / self.sample_rates.output as f64;
        let worst = (MAX_RESAMPLE_RATIO * rate_ratio).max(1.0);
        2 * (((n / 2) as f64 * worst).round() as usize + 1)
    }

    /// Worst-case frames any grain may emit.
    pub fn max_output_frame_count(&self) -> usize {
        let rate_ratio = self.sample_rates.output as f64 / self.sample_rates.input as f64;
        let worst = (MAX_RESAMPLE_RATIO * rate_ratio).max(1.0);
        (self.synthesis_hop() as f64 * worst).ceil() as usize + 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ResampleMode;

    fn timing(input: u32, output: u32) -> Timing {
        Timing::new(SampleRates { input, output }, 0).unwrap()
    }

    #[test]
    fn test_hop_derivation() {
        assert_eq!(timing(48000, 48000).synthesis_hop(), 512);
        assert_eq!(timing(44100, 44100).synthesis_hop(), 256);
        assert_eq!(timing(8000, 8000).synthesis_hop(), 64);
        assert_eq!(timing(192000, 192000).synthesis_hop(), 2048);
        // The faster of the two rates decides.
        assert_eq!(timing(44100, 96000).synthesis_hop(), timing(96000, 96000).synthesis_hop());
    }

    #[test]
    fn test_hop_adjust() {
        let rates = SampleRates { input: 48000, output: 48000 };
        assert_eq!(Timing::new(rates, -1).unwrap().synthesis_hop(), 256);
        assert_eq!(Timing::new(rates, 1).unwrap().synthesis_hop(), 1024);
        assert!(Timing::new(rates, 2).is_err());
        assert!(Timing::new(rates, -3).is_err());
    }

    #[test]
    fn test_max_input_frame_count_covers_transform() {
        for (input, output) in [(8000, 8000), (44100, 48000), (48000, 44100), (192000, 8000)] {
            let timing = timing(input, output);
            assert!(
                timing.max_input_frame_count() >= 8 * timing.synthesis_hop(),
                "rates {}/{}: {} < {}",
                input,
                output,
                timing.max_input_frame_count(),
                8 * timing.synthesis_hop()
            );
        }
    }

    #[test]
    fn test_next_advances_one_hop() {
        let timing = timing(48000, 48000);
        let mut request = Request { position: 100.0, speed: 1.0, ..Request::default() };
        timing.next(&mut request);
        assert_eq!(request.position, 100.0 + 512.0);

        request.speed = -2.0;
        timing.next(&mut request);
        assert_eq!(request.position, 100.0 + 512.0 - 2.0 * 512.0);
    }

    #[test]
    fn test_next_accounts_for_pitch_routing() {
        let timing = timing(48000, 48000);
        // Pitch through the output side shortens the input hop by the pitch
        // factor; through the input side it leaves the hop unchanged.
        let mut request = Request {
            position: 0.0,
            speed: 1.0,
            pitch: 2.0,
            resample_mode: ResampleMode::ForceOut,
            ..Request::default()
        };
        timing.next(&mut request);
        assert_eq!(request.position, 256.0);

        request.position = 0.0;
        request.resample_mode = ResampleMode::ForceIn;
        timing.next(&mut request);
        assert_eq!(request.position, 512.0);
    }

    #[test]
    fn test_preroll_walks_back_ring_depth() {
        let timing = timing(48000, 48000);
        let mut request = Request { position: 0.0, speed: 1.0, ..Request::default() };
        timing.preroll(&mut request);
        assert_eq!(request.position, -3.0 * 512.0);

        let mut request = Request { position: 0.0, speed: -1.0, ..Request::default() };
        timing.preroll(&mut request);
        assert_eq!(request.position, 3.0 * 512.0);
    }
}
