mod common;

use common::*;
use pomaarcore::config::{CfarDimensions, PipelineConfig};
use pomaarcore::geometry::ArrayGeometry;
use pomaarcore::interface::calibration::CalibrationMatrix;
use pomaarcore::math::window::WindowKind;
use pomaarcore::processing::{
    CalibrationEngine, CfarDetector, FrameIngestor, RangeDopplerProcessor, VirtualArrayBeamformer,
};
use pomaarcore::synth::Scene;
use pomaarcore::ProcessingStage;
use std::sync::Arc;

const TARGET_PFA: f64 = 1e-2;

fn noise_config(dimensions: CfarDimensions) -> PipelineConfig {
    let mut config = PipelineConfig::new(ArrayGeometry::dual_polarized_linear(4));
    config.radar.samples_per_chirp = 64;
    config.radar.chirps_per_frame = 64;
    config.beamforming.azimuth_bins = 16;
    config.cfar.dimensions = dimensions;
    config.cfar.target_pfa = TARGET_PFA;
    config.cfar.max_hits = 100_000;
    config
}

/// Fraction of scanned cells flagged over `frames` noise-only frames.
fn hit_rate(config: &PipelineConfig, seed: u64, frames: u32) -> f64 {
    let calibration = Arc::new(CalibrationMatrix::identity(&config.geometry));
    let ingestor = FrameIngestor::new(config).unwrap();
    let calibrate = CalibrationEngine::new(config, calibration).unwrap();
    let range_doppler = RangeDopplerProcessor::new(config).unwrap();
    let beamformer = VirtualArrayBeamformer::new(config).unwrap();
    let cfar = CfarDetector::new(config).unwrap();
    let mut scenes = generator(
        config,
        Scene {
            targets: Vec::new(),
            seed,
            ..Scene::default()
        },
    );

    let (mut hits, mut cells) = (0usize, 0usize);
    for index in 0..frames {
        let cube = ingestor.execute(scenes.frame(index).unwrap()).unwrap();
        let map = range_doppler.execute(calibrate.execute(cube).unwrap()).unwrap();
        let out = cfar.execute(beamformer.execute(map).unwrap()).unwrap();
        assert!(out.map.overflow.is_none());
        hits += out.map.hit_count();
        cells += out.map.mask.len();
    }
    hits as f64 / cells as f64
}

fn assert_near_target(rate: f64, mode: &str) {
    assert!(
        (0.6 * TARGET_PFA..=1.5 * TARGET_PFA).contains(&rate),
        "{} rate {:.4e} against {:.0e}",
        mode,
        rate,
        TARGET_PFA
    );
}

#[test]
fn range_profile_noise_meets_target_rate() {
    init_logging();
    let mut config = noise_config(CfarDimensions::Range);
    config.range_doppler.range_window = WindowKind::Rectangular;
    config.range_doppler.doppler_window = WindowKind::Rectangular;
    assert_near_target(hit_rate(&config, 41, 10), "range");
}

#[test]
fn range_doppler_noise_meets_target_rate() {
    let config = noise_config(CfarDimensions::RangeDoppler);
    assert_near_target(hit_rate(&config, 42, 10), "range-Doppler");
}

#[test]
fn angle_spectrum_noise_meets_target_rate() {
    let mut config = noise_config(CfarDimensions::RangeDopplerAngle);
    config.cfar.training_cells = 2;
    config.cfar.guard_cells = 1;
    assert_near_target(hit_rate(&config, 43, 4), "range-Doppler-angle");
}
