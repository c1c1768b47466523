use crate::config::{AssemblerConfig, CfarDimensions, PipelineConfig, RadarParameters};
use crate::geometry::AngleGrid;
use crate::interface::detection::Detection;
use crate::math::stats::StatsHelper;
use crate::prelude::{ProcessingStage, StageResult};
use crate::processing::beamform::BeamformedFrame;
use crate::processing::cfar::{CfarFrame, CfarHit};
use crate::telemetry::log::LogManager;

/// Physical measurement of a single CFAR hit.
#[derive(Debug, Clone, Copy)]
struct Measurement {
    range: f32,
    velocity: f32,
    azimuth: f32,
    elevation: f32,
    amplitude: f32,
    polarimetric_ratio: Option<f32>,
    snr: f32,
}

/// Disjoint-set forest over hit indices.
struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(size: usize) -> Self {
        Self {
            parent: (0..size).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            // Lower index becomes the root so cluster order is stable.
            let (root, child) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[child] = root;
        }
    }
}

/// Groups neighbouring hits into targets and converts bins to physical
/// units.
pub struct DetectionAssembler {
    config: AssemblerConfig,
    radar: RadarParameters,
    n_slots: usize,
    logger: LogManager,
}

impl DetectionAssembler {
    pub fn new(config: &PipelineConfig) -> StageResult<Self> {
        Ok(Self {
            config: config.assembler.clone(),
            radar: config.radar.clone(),
            n_slots: config.geometry.slot_count(),
            logger: LogManager::for_stage("assembler"),
        })
    }

    /// Azimuth and elevation gaps are measured separately on the grid, so a
    /// row's last azimuth bin does not touch the next row's first.
    fn adjacent(&self, a: &CfarHit, b: &CfarHit, grid: &AngleGrid) -> bool {
        let (a_az, a_el) = grid.bins(a.angle);
        let (b_az, b_el) = grid.bins(b.angle);
        a.range.abs_diff(b.range) <= self.config.range_gap_bins
            && a.doppler.abs_diff(b.doppler) <= self.config.doppler_gap_bins
            && a_az.abs_diff(b_az) <= self.config.angle_gap_bins
            && a_el.abs_diff(b_el) <= self.config.angle_gap_bins
    }

    /// Connected components of the hit list, each in hit order.
    fn cluster(&self, hits: &[CfarHit], grid: &AngleGrid) -> Vec<Vec<usize>> {
        let mut sets = UnionFind::new(hits.len());
        for i in 0..hits.len() {
            for j in (i + 1)..hits.len() {
                if self.adjacent(&hits[i], &hits[j], grid) {
                    sets.union(i, j);
                }
            }
        }
        let mut clusters: Vec<Vec<usize>> = Vec::new();
        let mut slot_of_root = vec![usize::MAX; hits.len()];
        for i in 0..hits.len() {
            let root = sets.find(i);
            if slot_of_root[root] == usize::MAX {
                slot_of_root[root] = clusters.len();
                clusters.push(Vec::new());
            }
            clusters[slot_of_root[root]].push(i);
        }
        clusters
    }

    fn measure(&self, hit: &CfarHit, frame: &BeamformedFrame, dimensions: CfarDimensions) -> Measurement {
        let range_bins = frame.range_bins();
        let doppler_bins = frame.doppler_bins();
        let range_res = self.radar.range_per_bin(range_bins) as f32;
        let velocity_res = self.radar.velocity_per_bin(doppler_bins, self.n_slots) as f32;

        let angle = match dimensions {
            CfarDimensions::RangeDopplerAngle => hit.angle,
            CfarDimensions::Range | CfarDimensions::RangeDoppler => {
                frame.peak_angle(hit.range, hit.doppler)
            }
        };
        let (azimuth, elevation) = frame.grid.angles_deg(angle);
        let cell = [hit.range, hit.doppler];
        let channels = frame.virtual_channels.max(1) as f32;
        let cross = frame.cross_polar[cell];
        let polarimetric_ratio =
            (frame.has_cross_polar && cross > 0.0).then(|| frame.co_polar[cell] / cross);

        Measurement {
            range: hit.range as f32 * range_res,
            velocity: (hit.doppler as f32 - (doppler_bins / 2) as f32) * velocity_res,
            azimuth,
            elevation,
            amplitude: (frame.power[cell] / channels).sqrt(),
            polarimetric_ratio,
            snr: hit.snr,
        }
    }

    fn summarize(&self, members: &[Measurement], frame: &BeamformedFrame) -> Detection {
        let weights: Vec<f32> = members.iter().map(|m| m.snr).collect();
        let mean = |field: fn(&Measurement) -> f32| {
            let values: Vec<f32> = members.iter().map(field).collect();
            StatsHelper::weighted_mean(&values, &weights)
        };

        let range = mean(|m| m.range);
        let amplitude = mean(|m| m.amplitude);
        let (ratios, ratio_weights): (Vec<f32>, Vec<f32>) = members
            .iter()
            .filter_map(|m| m.polarimetric_ratio.map(|r| (r, m.snr)))
            .unzip();
        let polarimetric_ratio =
            (!ratios.is_empty()).then(|| StatsHelper::weighted_mean(&ratios, &ratio_weights));

        let peak_snr = weights.iter().copied().fold(0.0f32, f32::max);
        let snr_db = StatsHelper::to_db(peak_snr);
        let size = members.len();
        let confidence = 0.7 * (1.0 - (-snr_db / 10.0).exp())
            + 0.3 * (1.0 - (-(size as f32) / 3.0).exp());
        let rcs_dbsm = 20.0 * amplitude.max(f32::MIN_POSITIVE).log10()
            + 40.0 * range.max(1e-3).log10()
            + self.config.rcs_offset_db;

        Detection {
            timestamp: frame.timestamp,
            frame_index: frame.frame_index,
            range,
            velocity: mean(|m| m.velocity),
            azimuth: mean(|m| m.azimuth),
            elevation: mean(|m| m.elevation),
            amplitude,
            rcs_dbsm,
            polarimetric_ratio,
            snr_db,
            confidence: confidence.clamp(0.0, 1.0),
            cluster_size: size,
        }
    }
}

impl ProcessingStage for DetectionAssembler {
    type Input = CfarFrame;
    type Output = Vec<Detection>;

    fn name(&self) -> &'static str {
        "assembler"
    }

    fn execute(&self, input: CfarFrame) -> StageResult<Vec<Detection>> {
        let CfarFrame { map, frame } = input;
        let mut hits = map.hits;
        hits.sort_by_key(|h| (h.range, h.doppler, h.angle));

        let mut detections: Vec<Detection> = self
            .cluster(&hits, &frame.grid)
            .into_iter()
            .map(|members| {
                let measured: Vec<Measurement> = members
                    .iter()
                    .map(|&i| self.measure(&hits[i], &frame, map.dimensions))
                    .collect();
                self.summarize(&measured, &frame)
            })
            .filter(|d| d.confidence >= self.config.min_confidence)
            .collect();

        detections.sort_by(|a, b| {
            a.range
                .total_cmp(&b.range)
                .then(a.velocity.total_cmp(&b.velocity))
                .then(a.azimuth.total_cmp(&b.azimuth))
        });
        self.logger.detail(&format!(
            "frame {}: {} hits -> {} detections",
            frame.frame_index,
            hits.len(),
            detections.len()
        ));
        Ok(detections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{ArrayGeometry, Polarization};
    use crate::processing::cfar::CfarMap;
    use ndarray::{Array2, Array3};

    fn config() -> PipelineConfig {
        PipelineConfig::new(ArrayGeometry::dual_polarized_linear(4))
    }

    fn frame() -> BeamformedFrame {
        let mut frame = frame_on(AngleGrid::new(16, 1, 0.5));
        // Every cell peaks at azimuth bin 10.
        frame.spectra.slice_mut(ndarray::s![.., .., 10]).fill(1.0);
        frame
    }

    fn frame_on(grid: AngleGrid) -> BeamformedFrame {
        let (nr, nd) = (64, 32);
        BeamformedFrame {
            frame_index: 2,
            timestamp: 0.1,
            grid,
            spectra: Array3::zeros((nr, nd, grid.len())),
            power: Array2::from_elem((nr, nd), 16.0),
            co_polar: Array2::from_elem((nr, nd), 12.0),
            cross_polar: Array2::from_elem((nr, nd), 4.0),
            has_cross_polar: true,
            virtual_channels: 16,
            fallback_cells: 0,
        }
    }

    fn hit(range: usize, doppler: usize, snr: f32) -> CfarHit {
        CfarHit {
            range,
            doppler,
            angle: 0,
            power: snr,
            noise: 1.0,
            snr,
        }
    }

    fn cfar_frame(hits: Vec<CfarHit>) -> CfarFrame {
        let frame = frame();
        let dims = (frame.range_bins(), frame.doppler_bins(), 1);
        CfarFrame {
            map: CfarMap {
                dimensions: CfarDimensions::RangeDoppler,
                mask: Array3::from_elem(dims, false),
                snr: Array3::zeros(dims),
                hits,
                overflow: None,
            },
            frame,
        }
    }

    #[test]
    fn neighbouring_hits_form_one_target() {
        let assembler = DetectionAssembler::new(&config()).unwrap();
        let hits = vec![hit(20, 17, 100.0), hit(21, 17, 300.0), hit(22, 18, 100.0), hit(40, 10, 50.0)];
        let detections = assembler.execute(cfar_frame(hits)).unwrap();
        assert_eq!(detections.len(), 2);

        let near = &detections[0];
        let range_res = config().radar.range_per_bin(64) as f32;
        assert_eq!(near.cluster_size, 3);
        // SNR-weighted centroid: (20 + 3 * 21 + 22) / 5.
        assert!((near.range - 21.0 * range_res).abs() < 1e-4);
        assert!((near.snr_db - StatsHelper::to_db(300.0)).abs() < 1e-4);
        assert!((near.polarimetric_ratio.unwrap() - 3.0).abs() < 1e-6);
        assert!((near.amplitude - 1.0).abs() < 1e-6);
        assert!(near.velocity > 0.0);
        let (azimuth, _) = AngleGrid::new(16, 1, 0.5).angles_deg(10);
        assert!((near.azimuth - azimuth).abs() < 1e-4);
        assert!(detections[1].range > near.range);
    }

    fn angle_hits(grid: AngleGrid, cells: &[(usize, usize)]) -> CfarFrame {
        let frame = frame_on(grid);
        let dims = (frame.range_bins(), frame.doppler_bins(), grid.len());
        let hits = cells
            .iter()
            .map(|&(az, el)| CfarHit {
                angle: grid.index(az, el),
                ..hit(20, 17, 100.0)
            })
            .collect();
        CfarFrame {
            map: CfarMap {
                dimensions: CfarDimensions::RangeDopplerAngle,
                mask: Array3::from_elem(dims, false),
                snr: Array3::zeros(dims),
                hits,
                overflow: None,
            },
            frame,
        }
    }

    #[test]
    fn angle_adjacency_follows_grid_rows() {
        let assembler = DetectionAssembler::new(&config()).unwrap();
        let grid = AngleGrid::new(8, 4, 1.0);

        // Consecutive flat indices on different rows, far apart in azimuth.
        let row_ends = assembler.execute(angle_hits(grid, &[(7, 0), (0, 1)])).unwrap();
        assert_eq!(row_ends.len(), 2, "{:#?}", row_ends);

        // Same azimuth, neighbouring elevation rows.
        let stacked = assembler.execute(angle_hits(grid, &[(4, 1), (4, 2)])).unwrap();
        assert_eq!(stacked.len(), 1, "{:#?}", stacked);
        assert_eq!(stacked[0].cluster_size, 2);
    }

    #[test]
    fn chained_hits_merge_transitively() {
        let assembler = DetectionAssembler::new(&config()).unwrap();
        let hits = (0..6).map(|i| hit(10 + 2 * i, 5, 20.0)).collect();
        let detections = assembler.execute(cfar_frame(hits)).unwrap();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].cluster_size, 6);
    }

    #[test]
    fn confidence_grows_with_snr_and_size() {
        let assembler = DetectionAssembler::new(&config()).unwrap();
        let weak = assembler.execute(cfar_frame(vec![hit(10, 5, 2.0)])).unwrap();
        let strong = assembler
            .execute(cfar_frame(vec![hit(10, 5, 1e3), hit(11, 5, 1e3)]))
            .unwrap();
        assert!(weak[0].confidence < strong[0].confidence);
        let expected = 0.7 * (1.0 - (-3.0f32).exp()) + 0.3 * (1.0 - (-2.0f32 / 3.0).exp());
        assert!((strong[0].confidence - expected).abs() < 1e-5);
        assert!(strong[0].confidence <= 1.0 && weak[0].confidence >= 0.0);
    }

    #[test]
    fn min_confidence_filters_weak_targets() {
        let mut config = config();
        config.assembler.min_confidence = 0.5;
        let assembler = DetectionAssembler::new(&config).unwrap();
        let detections = assembler
            .execute(cfar_frame(vec![hit(10, 5, 1.5), hit(30, 5, 1e3)]))
            .unwrap();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].cluster_size, 1);
    }

    #[test]
    fn assembly_is_idempotent_and_order_free() {
        let assembler = DetectionAssembler::new(&config()).unwrap();
        let hits = vec![hit(40, 3, 9.0), hit(12, 20, 40.0), hit(13, 20, 10.0), hit(5, 30, 7.0)];
        let mut reversed = hits.clone();
        reversed.reverse();
        let first = assembler.execute(cfar_frame(hits.clone())).unwrap();
        let again = assembler.execute(cfar_frame(hits)).unwrap();
        let shuffled = assembler.execute(cfar_frame(reversed)).unwrap();
        assert_eq!(first, again);
        assert_eq!(first, shuffled);
        let ranges: Vec<f32> = first.iter().map(|d| d.range).collect();
        let mut sorted = ranges.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        assert_eq!(ranges, sorted);
    }

    #[test]
    fn single_polarization_has_no_ratio() {
        let assembler = DetectionAssembler::new(&PipelineConfig::new(ArrayGeometry::uniform_linear(
            2,
            4,
            Polarization::H,
        )))
        .unwrap();
        let mut input = cfar_frame(vec![hit(10, 5, 50.0)]);
        input.frame.has_cross_polar = false;
        input.frame.cross_polar.fill(0.0);
        let detections = assembler.execute(input).unwrap();
        assert!(detections[0].polarimetric_ratio.is_none());
    }
}
