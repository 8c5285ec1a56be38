//! Windowed analysis input.

use crate::window;

/// Analysis-side scratch: the windowed input frames handed to the forward
/// transform.
pub struct Input {
    pub analysis_window: Vec<f32>,
    /// Transform length per channel, channel-major.
    pub windowed_input: Vec<f32>,
    log2_transform_length: usize,
    channel_count: usize,
}

impl Input {
    pub fn new(log2_synthesis_hop: usize, channel_count: usize) -> Self {
        let log2_transform_length = log2_synthesis_hop + 3;
        let analysis_window = window::analysis_window(log2_transform_length);
        Self {
            windowed_input: vec![0.0; analysis_window.len() * channel_count],
            analysis_window,
            log2_transform_length,
            channel_count,
        }
    }

    /// Multiply the source frames by the analysis window into the transform
    /// scratch, forcing mute regions to zero. The source must span the full
    /// transform length; muted rows are never read. Returns the effective
    /// transform length as a log2.
    pub fn apply_analysis_window(
        &mut self,
        src: &[f32],
        src_stride: usize,
        mute_head: usize,
        mute_tail: usize,
    ) -> usize {
        let n = 1usize << self.log2_transform_length;
        let unmuted_end = n - mute_tail.min(n);

        for c in 0..self.channel_count {
            let windowed = &mut self.windowed_input[c * n..(c + 1) * n];
            windowed[..mute_head.min(n)].fill(0.0);
            windowed[unmuted_end..].fill(0.0);
            for row in mute_head.min(n)..unmuted_end {
                windowed[row] = src[c * src_stride + row] * self.analysis_window[row];
            }
        }

        self.log2_transform_length
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_is_applied() {
        let mut input = Input::new(2, 1); // transform length 32
        let src = vec![2.0f32; 32];
        let log2 = input.apply_analysis_window(&src, 32, 0, 0);
        assert_eq!(log2, 5);
        for (row, &v) in input.windowed_input.iter().enumerate() {
            assert_eq!(v, 2.0 * input.analysis_window[row], "row {}", row);
        }
    }

    #[test]
    fn test_mute_regions_are_zeroed() {
        let mut input = Input::new(2, 2);
        let src = vec![1.0f32; 64];
        input.apply_analysis_window(&src, 32, 4, 8);
        for c in 0..2 {
            let windowed = &input.windowed_input[c * 32..(c + 1) * 32];
            assert!(windowed[..4].iter().all(|&v| v == 0.0));
            assert!(windowed[24..].iter().all(|&v| v == 0.0));
            // Interior rows carry the window (which is itself zero at row 0
            // only).
            assert!(windowed[4..24].iter().any(|&v| v != 0.0));
        }
    }

    #[test]
    fn test_full_mute_never_reads_source() {
        let mut input = Input::new(2, 1);
        // An empty source is fine when every row is muted.
        input.apply_analysis_window(&[], 0, 32, 0);
        assert!(input.windowed_input.iter().all(|&v| v == 0.0));
    }
}
