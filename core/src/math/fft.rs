use crate::prelude::Sample;
use ndarray::ArrayView1;
use rustfft::{num_traits::Zero, Fft, FftPlanner};
use std::sync::Arc;

/// Wraps a planned `rustfft` transform so one plan can be shared by every
/// lane of a frame (and by every worker thread).
#[derive(Clone)]
pub struct FftHelper {
    fft: Arc<dyn Fft<f32>>,
    size: usize,
}

impl FftHelper {
    pub fn new(size: usize) -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(size);
        Self { fft, size }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Applies `window` to `input`, zero-pads to the transform size and
    /// returns the forward transform.
    pub fn forward_windowed(&self, input: ArrayView1<Sample>, window: &[f32]) -> Vec<Sample> {
        let mut buffer = vec![Sample::zero(); self.size];
        for ((slot, &value), &weight) in buffer.iter_mut().zip(input.iter()).zip(window) {
            *slot = value * weight;
        }
        self.forward_in_place(&mut buffer);
        buffer
    }

    pub fn forward_in_place(&self, buffer: &mut [Sample]) {
        let mut scratch = vec![Sample::zero(); self.fft.get_inplace_scratch_len()];
        self.fft.process_with_scratch(buffer, &mut scratch);
    }
}

/// Moves the zero-frequency bin to the centre (`len / 2`).
pub fn fft_shift<T>(data: &mut [T]) {
    let half = data.len() / 2;
    data.rotate_right(half);
}

/// Signed frequency index of a shifted bin.
pub fn shifted_index(bin: usize, len: usize) -> isize {
    bin as isize - (len / 2) as isize
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    #[test]
    fn fft_helper_zero_pads_to_plan_size() {
        let helper = FftHelper::new(8);
        let input = arr1(&[Sample::new(1.0, 0.0), Sample::new(0.0, 0.0)]);
        let output = helper.forward_windowed(input.view(), &[1.0, 1.0]);
        assert_eq!(output.len(), 8);
        assert!(output.iter().all(|c| (c.norm() - 1.0).abs() < 1e-6));
    }

    #[test]
    fn fft_shift_centres_dc() {
        let mut bins = vec![0, 1, 2, -2, -1];
        fft_shift(&mut bins);
        assert_eq!(bins, vec![-2, -1, 0, 1, 2]);
        assert_eq!(shifted_index(2, 5), 0);

        let mut even = vec![0, 1, 2, 3];
        fft_shift(&mut even);
        assert_eq!(even, vec![2, 3, 0, 1]);
        assert_eq!(shifted_index(2, 4), 0);
    }
}
