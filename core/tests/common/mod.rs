#![allow(dead_code)]

use pomaarcore::config::PipelineConfig;
use pomaarcore::geometry::ArrayGeometry;
use pomaarcore::interface::calibration::CalibrationMatrix;
use pomaarcore::synth::{Scattering, Scene, SceneGenerator, Target};
use pomaarcore::Pipeline;
use std::sync::Arc;

pub const TARGET_RANGE: f32 = 20.0;
pub const TARGET_VELOCITY: f32 = 5.0;
pub const TARGET_AZIMUTH: f32 = 10.0;

/// Dual-polarized four-element array, TDM, Hann windows, Pfa 1e-6.
pub fn point_target_config() -> PipelineConfig {
    let mut config = PipelineConfig::new(ArrayGeometry::dual_polarized_linear(4));
    config.cfar.target_pfa = 1e-6;
    config.beamforming.azimuth_bins = 64;
    config
}

pub fn point_target_scene(seed: u64) -> Scene {
    Scene {
        targets: vec![Target {
            range_m: TARGET_RANGE,
            velocity_mps: TARGET_VELOCITY,
            azimuth_deg: TARGET_AZIMUTH,
            elevation_deg: 0.0,
            snr_db: 20.0,
            scattering: Scattering {
                hh: 1.0,
                hv: 0.1,
                vh: 0.1,
                vv: 1.0,
            },
        }],
        seed,
        ..Scene::default()
    }
}

pub fn pipeline(config: &PipelineConfig) -> Pipeline {
    let calibration = Arc::new(CalibrationMatrix::identity(&config.geometry));
    Pipeline::new(config.clone(), calibration).expect("valid pipeline")
}

pub fn generator(config: &PipelineConfig, scene: Scene) -> SceneGenerator {
    SceneGenerator::new(config, scene).expect("valid scene")
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
