//! Peak detection over spectral energy and transient suppression.

/// Energy growth ratio above which a partial's band is treated as a transient
/// (about 6 dB per band). Transient bands are dropped from the partial list so
/// their bins are not phase-locked to history.
pub const TRANSIENT_ENERGY_RATIO: f32 = 4.0;

/// A local maximum of per-bin energy together with the half-open band of bins
/// whose phase is locked to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partial {
    pub peak: usize,
    pub begin: usize,
    pub end: usize,
}

/// Find all local maxima of `energy[0..valid_bin_count)` and assign each the
/// band delimited by the midpoints to its neighbouring maxima. On a tie the
/// lower bin wins. `partials` is reused without reallocating.
pub fn enumerate(partials: &mut Vec<Partial>, valid_bin_count: usize, energy: &[f32]) {
    partials.clear();

    for k in 0..valid_bin_count {
        let rising = k == 0 || energy[k] > energy[k - 1];
        let falling = k + 1 >= valid_bin_count || energy[k] >= energy[k + 1];
        if rising && falling {
            partials.push(Partial { peak: k, begin: 0, end: valid_bin_count });
        }
    }

    for i in 1..partials.len() {
        let midpoint = (partials[i - 1].peak + partials[i].peak + 1) / 2;
        partials[i - 1].end = midpoint;
        partials[i].begin = midpoint;
    }
}

/// Remove partials whose band energy has grown by more than
/// [`TRANSIENT_ENERGY_RATIO`] since the previous grain at the same bins.
pub fn suppress_transient_partials(
    partials: &mut Vec<Partial>,
    energy: &[f32],
    previous_energy: &[f32],
) {
    partials.retain(|partial| {
        let band = partial.begin..partial.end;
        let total: f32 = energy[band.clone()].iter().sum();
        let previous: f32 = previous_energy[band].iter().sum();
        total <= previous * TRANSIENT_ENERGY_RATIO
    });
}
