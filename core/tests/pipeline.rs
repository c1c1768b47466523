mod common;

use common::*;
use pomaarcore::config::AngleMethod;
use pomaarcore::geometry::{ArrayGeometry, Multiplexing, Polarization};
use pomaarcore::interface::capture::CaptureReader;
use pomaarcore::interface::detection::{CaptureReport, Detection};
use pomaarcore::synth::Scene;

fn assert_near_target(detection: &Detection) {
    assert!(
        (detection.range - TARGET_RANGE).abs() <= 0.5,
        "range {}",
        detection.range
    );
    assert!(
        (detection.velocity - TARGET_VELOCITY).abs() <= 0.8,
        "velocity {}",
        detection.velocity
    );
    assert!(
        (detection.azimuth - TARGET_AZIMUTH).abs() <= 2.5,
        "azimuth {}",
        detection.azimuth
    );
}

#[test]
fn point_target_yields_one_detection() {
    init_logging();
    let config = point_target_config();
    let pipeline = pipeline(&config);
    let frame = generator(&config, point_target_scene(11)).frame(0).unwrap();

    let report = pipeline.process_frame(frame).unwrap();
    assert_eq!(report.detections.len(), 1, "{:#?}", report.detections);
    let detection = &report.detections[0];
    assert_near_target(detection);
    let ratio = detection.polarimetric_ratio.expect("cross-polar channels present");
    assert!(ratio > 10.0, "ratio {}", ratio);
    assert!(detection.snr_db > 10.0);
    assert!(detection.confidence > 0.5);
}

#[test]
fn adaptive_angle_estimate_finds_the_target() {
    let mut config = point_target_config();
    config.beamforming.method = AngleMethod::Mvdr;
    let pipeline = pipeline(&config);
    let frame = generator(&config, point_target_scene(5)).frame(0).unwrap();

    let report = pipeline.process_frame(frame).unwrap();
    assert_eq!(report.detections.len(), 1, "{:#?}", report.detections);
    assert_near_target(&report.detections[0]);
}

#[test]
fn code_division_array_decodes_to_same_target() {
    let mut geometry = ArrayGeometry::uniform_linear(2, 4, Polarization::H);
    geometry.multiplexing = Multiplexing::CodeDivision;
    let mut config = point_target_config();
    config.geometry = geometry;
    let pipeline = pipeline(&config);
    let frame = generator(&config, point_target_scene(21)).frame(0).unwrap();

    let report = pipeline.process_frame(frame).unwrap();
    assert_eq!(report.detections.len(), 1, "{:#?}", report.detections);
    assert_near_target(&report.detections[0]);
    assert!(report.detections[0].polarimetric_ratio.is_none());
}

#[test]
fn reprocessing_a_frame_is_deterministic() {
    let config = point_target_config();
    let pipeline = pipeline(&config);
    let frame = generator(&config, point_target_scene(2)).frame(0).unwrap();

    let first = pipeline.process_frame(frame.clone()).unwrap();
    let second = pipeline.process_frame(frame).unwrap();
    assert_eq!(first, second);
}

#[test]
fn noise_only_frames_stay_quiet() {
    let config = point_target_config();
    let pipeline = pipeline(&config);
    let scene = Scene {
        seed: 99,
        ..Scene::default()
    };
    let frames = generator(&config, scene).frames(4).unwrap();
    let reports = pipeline.run(frames.into_iter().map(Ok)).unwrap();
    let total: usize = reports.iter().map(|r| r.detections.len()).sum();
    assert!(total <= 1, "{} false detections", total);
}

#[test]
fn capture_file_is_processed_end_to_end() {
    init_logging();
    let config = point_target_config();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scene.pmar");

    let file = std::fs::File::create(&path).unwrap();
    generator(&config, point_target_scene(8))
        .write_capture(file, 3)
        .unwrap();

    // Damage the second frame's payload so its checksum fails.
    let mut bytes = std::fs::read(&path).unwrap();
    let frame_len = (bytes.len() - 28) / 3;
    bytes[28 + frame_len + 40] ^= 0xFF;
    std::fs::write(&path, &bytes).unwrap();

    let reader = CaptureReader::open(&path).unwrap();
    assert_eq!(reader.header().shape, config.cube_shape());
    let pipeline = pipeline(&config);
    let frames = pipeline.run(reader).unwrap();

    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].frame_index, 0);
    assert_eq!(frames[1].frame_index, 2);
    for frame in &frames {
        assert_eq!(frame.detections.len(), 1);
        assert!((frame.detections[0].range - TARGET_RANGE).abs() <= 0.5);
    }
    let summary = pipeline.metrics();
    assert_eq!(summary.frames_processed, 2);
    assert_eq!(summary.frames_skipped, 1);

    let report = CaptureReport {
        capture: path.display().to_string(),
        frames,
        summary,
    };
    let out = dir.path().join("detections.json");
    report.write_json(&out).unwrap();
    let parsed: CaptureReport =
        serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
    assert_eq!(parsed.detection_count(), 2);
}
