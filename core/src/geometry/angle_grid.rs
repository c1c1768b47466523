use crate::math::fft::shifted_index;
use serde::{Deserialize, Serialize};

/// Angular search grid in direction-cosine space shared by every
/// angle-estimation strategy.
///
/// Bin `a` of `azimuth_bins` maps to `u = (a - N/2) / (N d)` where `d` is the
/// element spacing in wavelengths, matching the bins of a shifted spatial
/// FFT. Elevation works the same way on `v`. Angle index is
/// `elevation_bin * azimuth_bins + azimuth_bin`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AngleGrid {
    pub azimuth_bins: usize,
    pub elevation_bins: usize,
    pub spacing: f32,
}

impl AngleGrid {
    pub fn new(azimuth_bins: usize, elevation_bins: usize, spacing: f32) -> Self {
        Self {
            azimuth_bins,
            elevation_bins,
            spacing,
        }
    }

    pub fn len(&self) -> usize {
        self.azimuth_bins * self.elevation_bins
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn index(&self, azimuth_bin: usize, elevation_bin: usize) -> usize {
        elevation_bin * self.azimuth_bins + azimuth_bin
    }

    pub fn bins(&self, index: usize) -> (usize, usize) {
        (index % self.azimuth_bins, index / self.azimuth_bins)
    }

    /// Direction cosines `(u, v)` of a grid point.
    pub fn direction(&self, index: usize) -> (f32, f32) {
        let (a, e) = self.bins(index);
        let u = shifted_index(a, self.azimuth_bins) as f32 / (self.azimuth_bins as f32 * self.spacing);
        let v = if self.elevation_bins > 1 {
            shifted_index(e, self.elevation_bins) as f32
                / (self.elevation_bins as f32 * self.spacing)
        } else {
            0.0
        };
        (u, v)
    }

    /// Whether the grid point corresponds to a real propagation direction.
    pub fn is_visible(&self, index: usize) -> bool {
        let (u, v) = self.direction(index);
        u * u + v * v <= 1.0 + 1e-6
    }

    /// `(azimuth, elevation)` in degrees for a grid point, clamped to the
    /// visible region.
    pub fn angles_deg(&self, index: usize) -> (f32, f32) {
        let (u, v) = self.direction(index);
        let elevation = v.clamp(-1.0, 1.0).asin();
        let cos_el = elevation.cos().max(f32::EPSILON);
        let azimuth = (u / cos_el).clamp(-1.0, 1.0).asin();
        (azimuth.to_degrees(), elevation.to_degrees())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn centre_bin_is_boresight() {
        let grid = AngleGrid::new(64, 1, 0.5);
        let (az, el) = grid.angles_deg(grid.index(32, 0));
        assert!(az.abs() < 1e-6 && el.abs() < 1e-6);
    }

    #[test]
    fn half_wavelength_grid_spans_visible_space() {
        let grid = AngleGrid::new(16, 1, 0.5);
        assert!((grid.direction(0).0 + 1.0).abs() < 1e-6);
        assert!(grid.is_visible(0));
        let (az, _) = grid.angles_deg(0);
        assert!((az + 90.0).abs() < 1e-3);
    }

    #[test]
    fn dense_spacing_has_invisible_bins() {
        let grid = AngleGrid::new(16, 1, 0.25);
        assert!(grid.is_visible(8));
        // u = -2 at the first bin of a quarter-wavelength grid.
        assert!(!grid.is_visible(0));
        let sparse = AngleGrid::new(16, 4, 0.5);
        // u = -1, v = -1 lies outside the unit circle.
        assert!(!sparse.is_visible(sparse.index(0, 0)));
    }

    #[test]
    fn index_round_trips_bins() {
        let grid = AngleGrid::new(8, 4, 0.5);
        assert_eq!(grid.bins(grid.index(5, 3)), (5, 3));
    }
}
