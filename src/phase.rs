//! Fixed-point phase arithmetic and horizontal phase propagation.

use std::f32::consts::PI;

use realfft::num_complex::Complex;

use crate::partials::Partial;

/// Phase as a signed 16-bit fraction of a full turn: 0x10000 (one wrap of the
/// integer) corresponds to 2*PI radians. Additions and subtractions wrap
/// naturally, so accumulated phase never grows without bound the way radian
/// `f32` phase does.
pub type Phase = i16;

const TURN: i64 = 0x10000;

/// Convert radians to a turn fraction, rounding to the nearest step.
pub fn from_radians(radians: f32) -> Phase {
    let turns = radians * (TURN as f32 / (2.0 * PI));
    (turns.round() as i64) as Phase
}

/// Unit phasor for a turn fraction: `exp(i * PI * phi / 0x8000)`.
pub fn to_complex(phi: Phase) -> Complex<f32> {
    let radians = phi as f32 * (PI / 0x8000 as f32);
    Complex::new(radians.cos(), radians.sin())
}

/// Wrap an integer number of phase steps onto the principal branch.
#[inline]
fn wrap(steps: i64) -> Phase {
    steps as Phase
}

/// Phase advance of bin `k` over `hop` samples at transform length `2^log2_n`,
/// wrapped.
#[inline]
fn advance(k: usize, hop: i64, log2_n: usize) -> Phase {
    wrap(k as i64 * (TURN >> log2_n) * hop)
}

/// Horizontal phase propagation for one grain.
///
/// For every partial, the peak bin's analysis phase is reconciled against the
/// previous grain: the principal deviation `delta` from the bin's nominal
/// advance over the analysis hop gives the true instantaneous frequency, which
/// is then projected over the synthesis hop. The resulting rotation is shared
/// by every bin in the partial's band so that the band moves as one
/// (horizontal phase locking). Bins outside every band keep rotation zero and
/// the transform's own phase passes through, which is what re-seeds
/// transients.
///
/// `rotation` accumulates across grains via `prev_rotation`; at exactly unity
/// analysis speed the increment cancels and rotation stays identically zero.
#[allow(clippy::too_many_arguments)]
pub fn propagate(
    rotation: &mut [Phase],
    delta: &mut [Phase],
    partials: &[Partial],
    phase: &[Phase],
    prev_phase: &[Phase],
    prev_rotation: &[Phase],
    valid_bin_count: usize,
    analysis_hop: i64,
    log2_synthesis_hop: usize,
    log2_transform_length: usize,
) {
    rotation[..valid_bin_count].fill(0);
    delta[..valid_bin_count].fill(0);

    let synthesis_hop = 1i64 << log2_synthesis_hop;

    for partial in partials {
        let k = partial.peak;
        if k >= valid_bin_count {
            break;
        }

        let measured = phase[k].wrapping_sub(prev_phase[k]);
        let expected = advance(k, analysis_hop, log2_transform_length);
        let peak_delta = measured.wrapping_sub(expected);

        // Deviation from the bin frequency, rescaled from the analysis hop to
        // the synthesis hop. A zero hop means the grain re-reads the same
        // input window and the deviation carries no frequency information.
        let deviation = if analysis_hop == 0 {
            0
        } else {
            let steps = peak_delta as f64 * synthesis_hop as f64 / analysis_hop as f64;
            wrap(steps.round() as i64)
        };

        let increment = advance(k, synthesis_hop, log2_transform_length).wrapping_add(deviation);
        let peak_rotation = prev_rotation[k].wrapping_add(increment).wrapping_sub(measured);

        let end = partial.end.min(valid_bin_count);
        rotation[partial.begin..end].fill(peak_rotation);
        delta[partial.begin..end].fill(peak_delta);
    }
}
