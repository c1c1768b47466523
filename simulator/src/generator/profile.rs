use anyhow::Context;
use pomaarcore::config::PipelineConfig;
use pomaarcore::geometry::{ArrayGeometry, Polarization};
use pomaarcore::interface::calibration::CalibrationMatrix;
use pomaarcore::synth::{Scattering, Scene, SceneGenerator, Target};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

/// Named antenna layouts available to the generator and CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum GeometryPreset {
    /// Two H transmitters and four H receivers.
    UniformLinear,
    #[default]
    DualPolarized,
    InterleavedTwoChip,
    Cascade2d,
}

impl GeometryPreset {
    pub fn geometry(self) -> ArrayGeometry {
        match self {
            GeometryPreset::UniformLinear => ArrayGeometry::uniform_linear(2, 4, Polarization::H),
            GeometryPreset::DualPolarized => ArrayGeometry::dual_polarized_linear(4),
            GeometryPreset::InterleavedTwoChip => ArrayGeometry::interleaved_two_chip(),
            GeometryPreset::Cascade2d => ArrayGeometry::cascade_2d(),
        }
    }

    /// Pipeline defaults sized so the preset validates: chirps split evenly
    /// over the transmit slots and the angle grid covers the aperture.
    pub fn pipeline_config(self) -> PipelineConfig {
        let mut config = PipelineConfig::new(self.geometry());
        match self {
            GeometryPreset::UniformLinear
            | GeometryPreset::DualPolarized
            | GeometryPreset::InterleavedTwoChip => {}
            GeometryPreset::Cascade2d => {
                config.radar.chirps_per_frame = 96;
                config.beamforming.elevation_bins = 8;
            }
        }
        config
    }
}

/// Synthetic capture request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub frames: u32,
    /// Random targets added when the scene lists none.
    pub random_targets: usize,
    pub scene: Scene,
    pub description: Option<String>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            frames: 8,
            random_targets: 3,
            scene: Scene::default(),
            description: None,
        }
    }
}

impl GeneratorConfig {
    /// The configured scene, or seeded random targets inside the unambiguous
    /// range and velocity span of `config` when it lists none.
    pub fn resolved_scene(&self, config: &PipelineConfig) -> Scene {
        let mut scene = self.scene.clone();
        if !scene.targets.is_empty() {
            return scene;
        }
        let range_span = config.radar.range_per_bin(config.range_fft_size())
            * config.range_fft_size() as f64;
        let velocity_span = config
            .radar
            .velocity_per_bin(config.doppler_fft_size(), config.geometry.slot_count())
            * config.doppler_fft_size() as f64;
        let mut rng = StdRng::seed_from_u64(scene.seed.wrapping_add(1));
        scene.targets = (0..self.random_targets)
            .map(|_| Target {
                range_m: rng.gen_range(0.15..0.8) * range_span as f32,
                velocity_mps: rng.gen_range(-0.35..0.35) * velocity_span as f32,
                azimuth_deg: rng.gen_range(-40.0..40.0),
                elevation_deg: 0.0,
                snr_db: rng.gen_range(15.0..30.0),
                scattering: Scattering {
                    hh: 1.0,
                    hv: rng.gen_range(0.05..0.5),
                    vh: rng.gen_range(0.05..0.5),
                    vv: rng.gen_range(0.5..1.0),
                },
            })
            .collect();
        scene
    }
}

/// Files written by [`write_capture`].
#[derive(Debug, Clone)]
pub struct GeneratedCapture {
    pub capture: PathBuf,
    pub calibration: PathBuf,
    pub scene: Scene,
}

/// Renders `generator` into `<out_dir>/capture.pmar` plus an identity
/// calibration table and a scene description.
pub fn write_capture(
    config: &PipelineConfig,
    generator: &GeneratorConfig,
    out_dir: &Path,
) -> anyhow::Result<GeneratedCapture> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("creating output directory {}", out_dir.display()))?;
    let scene = generator.resolved_scene(config);

    let capture = out_dir.join("capture.pmar");
    let file = File::create(&capture)
        .with_context(|| format!("creating capture {}", capture.display()))?;
    let mut renderer =
        SceneGenerator::new(config, scene.clone()).context("preparing scene generator")?;
    renderer
        .write_capture(BufWriter::new(file), generator.frames)
        .with_context(|| format!("writing capture {}", capture.display()))?
        .into_inner()
        .map_err(|err| err.into_error())
        .context("flushing capture")?;

    let calibration = out_dir.join("calibration.json");
    CalibrationMatrix::identity(&config.geometry)
        .save(&calibration)
        .with_context(|| format!("writing calibration {}", calibration.display()))?;

    let scene_path = out_dir.join("scene.yaml");
    fs::write(&scene_path, serde_yaml::to_string(&scene)?)
        .with_context(|| format!("writing scene {}", scene_path.display()))?;

    Ok(GeneratedCapture {
        capture,
        calibration,
        scene,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pomaarcore::interface::capture::CaptureReader;

    #[test]
    fn every_preset_validates() {
        for preset in [
            GeometryPreset::UniformLinear,
            GeometryPreset::DualPolarized,
            GeometryPreset::InterleavedTwoChip,
            GeometryPreset::Cascade2d,
        ] {
            preset
                .pipeline_config()
                .validate()
                .unwrap_or_else(|err| panic!("{:?}: {}", preset, err));
        }
    }

    #[test]
    fn random_targets_fill_empty_scene() {
        let config = GeometryPreset::DualPolarized.pipeline_config();
        let generator = GeneratorConfig {
            random_targets: 4,
            ..Default::default()
        };
        let scene = generator.resolved_scene(&config);
        assert_eq!(scene.targets.len(), 4);
        assert_eq!(scene, generator.resolved_scene(&config));
    }

    #[test]
    fn capture_files_are_written() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = GeometryPreset::UniformLinear.pipeline_config();
        config.radar.samples_per_chirp = 32;
        config.radar.chirps_per_frame = 16;
        let generator = GeneratorConfig {
            frames: 2,
            ..Default::default()
        };
        let written = write_capture(&config, &generator, dir.path()).unwrap();

        let frames: Vec<_> = CaptureReader::open(&written.capture).unwrap().collect();
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(Result::is_ok));
        let calibration = CalibrationMatrix::load(&written.calibration).unwrap();
        assert_eq!(calibration.channel_count(), 4);
    }
}
