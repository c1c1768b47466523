//! Dimension-checked sample containers passed between stages.
//!
//! Every container is built against an explicit expected shape so that a
//! geometry mismatch surfaces at construction instead of deep inside a
//! transform.

use crate::prelude::{Sample, StageError, StageResult};
use ndarray::{Array3, ArrayView2, ArrayView3, ArrayViewMut3, Axis};
use serde::{Deserialize, Serialize};

/// Shape of an [`IqCube`]: receive channels x chirps x fast-time samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CubeShape {
    pub channels: usize,
    pub chirps: usize,
    pub samples: usize,
}

impl CubeShape {
    pub fn new(channels: usize, chirps: usize, samples: usize) -> Self {
        Self {
            channels,
            chirps,
            samples,
        }
    }

    pub fn dims(&self) -> (usize, usize, usize) {
        (self.channels, self.chirps, self.samples)
    }

    pub fn len(&self) -> usize {
        self.channels * self.chirps * self.samples
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Complex samples indexed `[rx channel][chirp][sample]` for one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct IqCube {
    data: Array3<Sample>,
    frame_index: u32,
    timestamp: f64,
}

impl IqCube {
    pub fn new(
        data: Array3<Sample>,
        expected: CubeShape,
        frame_index: u32,
        timestamp: f64,
    ) -> StageResult<Self> {
        if data.dim() != expected.dims() {
            return Err(StageError::Dimension(format!(
                "IQ cube is {:?}, geometry expects {:?}",
                data.dim(),
                expected.dims()
            )));
        }
        Ok(Self {
            data,
            frame_index,
            timestamp,
        })
    }

    pub fn zeros(shape: CubeShape, frame_index: u32, timestamp: f64) -> Self {
        Self {
            data: Array3::zeros(shape.dims()),
            frame_index,
            timestamp,
        }
    }

    pub fn shape(&self) -> CubeShape {
        let (channels, chirps, samples) = self.data.dim();
        CubeShape::new(channels, chirps, samples)
    }

    pub fn frame_index(&self) -> u32 {
        self.frame_index
    }

    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    pub fn data(&self) -> ArrayView3<'_, Sample> {
        self.data.view()
    }

    pub fn data_mut(&mut self) -> ArrayViewMut3<'_, Sample> {
        self.data.view_mut()
    }

    pub fn channel(&self, channel: usize) -> ArrayView2<'_, Sample> {
        self.data.index_axis(Axis(0), channel)
    }
}

/// Per-channel range-Doppler spectra indexed `[channel][range bin][Doppler bin]`.
///
/// Channels are `slot * n_rx + rx`, one per receive channel and transmit
/// slot of the multiplexing period. The Doppler axis is shifted so the
/// centre bin is zero velocity.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeDopplerMap {
    data: Array3<Sample>,
    n_rx: usize,
    n_slots: usize,
    frame_index: u32,
    timestamp: f64,
}

impl RangeDopplerMap {
    pub fn new(
        data: Array3<Sample>,
        n_rx: usize,
        n_slots: usize,
        frame_index: u32,
        timestamp: f64,
    ) -> StageResult<Self> {
        if data.len_of(Axis(0)) != n_rx * n_slots {
            return Err(StageError::Dimension(format!(
                "range-Doppler map has {} channels, expected {} rx x {} slots",
                data.len_of(Axis(0)),
                n_rx,
                n_slots
            )));
        }
        Ok(Self {
            data,
            n_rx,
            n_slots,
            frame_index,
            timestamp,
        })
    }

    pub fn channel_index(&self, slot: usize, rx: usize) -> usize {
        slot * self.n_rx + rx
    }

    pub fn n_rx(&self) -> usize {
        self.n_rx
    }

    pub fn n_slots(&self) -> usize {
        self.n_slots
    }

    pub fn range_bins(&self) -> usize {
        self.data.len_of(Axis(1))
    }

    pub fn doppler_bins(&self) -> usize {
        self.data.len_of(Axis(2))
    }

    pub fn frame_index(&self) -> u32 {
        self.frame_index
    }

    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    pub fn data(&self) -> ArrayView3<'_, Sample> {
        self.data.view()
    }

    pub fn data_mut(&mut self) -> ArrayViewMut3<'_, Sample> {
        self.data.view_mut()
    }
}
