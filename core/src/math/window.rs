use serde::{Deserialize, Serialize};
use std::f32::consts::PI;

/// Taper applied before a transform to trade main-lobe width for sidelobe
/// level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    Rectangular,
    #[default]
    Hann,
    Hamming,
    Blackman,
}

impl WindowKind {
    /// Symmetric window of `len` points, scaled so its mean (coherent gain)
    /// is one and peak amplitudes stay comparable across window choices.
    pub fn coefficients(self, len: usize) -> Vec<f32> {
        if len <= 1 {
            return vec![1.0; len];
        }
        let denom = (len - 1) as f32;
        let raw: Vec<f32> = (0..len)
            .map(|n| {
                let x = 2.0 * PI * n as f32 / denom;
                match self {
                    WindowKind::Rectangular => 1.0,
                    WindowKind::Hann => 0.5 - 0.5 * x.cos(),
                    WindowKind::Hamming => 0.54 - 0.46 * x.cos(),
                    WindowKind::Blackman => 0.42 - 0.5 * x.cos() + 0.08 * (2.0 * x).cos(),
                }
            })
            .collect();
        let gain = raw.iter().sum::<f32>() / len as f32;
        if gain <= f32::EPSILON {
            return vec![1.0; len];
        }
        raw.into_iter().map(|w| w / gain).collect()
    }
}
