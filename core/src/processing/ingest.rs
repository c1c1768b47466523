use crate::config::PipelineConfig;
use crate::cube::{CubeShape, IqCube};
use crate::interface::capture::{FrameMetadata, IqOrder, PackingFormat, RawFrame};
use crate::math::checksum::Crc32;
use crate::math::stats::StatsHelper;
use crate::prelude::{ParseError, ProcessingStage, Sample, StageError, StageResult};
use crate::telemetry::log::LogManager;
use ndarray::Array3;

/// Turns packed ADC payloads into complex IQ cubes in receive-element order.
///
/// Payload order is `[chirp][adc lane][sample]`, each sample two
/// `bits`-wide two's-complement words packed MSB-first. Values are scaled
/// to full scale, `v / 2^(bits - 1)`.
pub struct FrameIngestor {
    shape: CubeShape,
    packing: PackingFormat,
    lane_map: Vec<usize>,
    logger: LogManager,
}

impl FrameIngestor {
    pub fn new(config: &PipelineConfig) -> StageResult<Self> {
        config.radar.packing.validate()?;
        config.geometry.validate()?;
        Ok(Self {
            shape: config.cube_shape(),
            packing: config.radar.packing,
            lane_map: config.geometry.lane_map(),
            logger: LogManager::for_stage("ingest"),
        })
    }

    pub fn shape(&self) -> CubeShape {
        self.shape
    }

    pub fn packing(&self) -> PackingFormat {
        self.packing
    }

    fn full_scale(&self) -> f32 {
        (1u32 << (self.packing.bits - 1)) as f32
    }

    fn check_frame(&self, frame: &RawFrame) -> Result<(), ParseError> {
        let meta = frame.metadata();
        if meta.shape != self.shape {
            return Err(ParseError::Misaligned(format!(
                "frame {} is {:?}, geometry expects {:?}",
                meta.frame_index,
                meta.shape.dims(),
                self.shape.dims()
            )));
        }
        if meta.packing != self.packing {
            return Err(ParseError::Misaligned(format!(
                "frame {} packed as {} bits {:?}, expected {} bits {:?}",
                meta.frame_index,
                meta.packing.bits,
                meta.packing.iq_order,
                self.packing.bits,
                self.packing.iq_order
            )));
        }

        let expected = self.packing.payload_len(self.shape);
        let found = frame.payload().len();
        if found < expected {
            return Err(ParseError::Truncated { expected, found });
        }
        if found > expected {
            return Err(ParseError::Misaligned(format!(
                "payload is {} bytes, expected {}",
                found, expected
            )));
        }

        let computed = Crc32::checksum(frame.payload());
        if computed != frame.checksum() {
            return Err(ParseError::Corrupt {
                declared: frame.checksum(),
                computed,
            });
        }
        Ok(())
    }

    /// Quantizes and packs a cube into a frame (round to nearest, saturating).
    pub fn encode(&self, cube: &IqCube) -> StageResult<RawFrame> {
        if cube.shape() != self.shape {
            return Err(StageError::Dimension(format!(
                "cube is {:?}, geometry expects {:?}",
                cube.shape().dims(),
                self.shape.dims()
            )));
        }
        let bits = u32::from(self.packing.bits);
        let full = self.full_scale();
        let max = (1i32 << (bits - 1)) - 1;
        let min = -(1i32 << (bits - 1));
        let quantize = |x: f32| (x * full).round().clamp(min as f32, max as f32) as i32;

        let data = cube.data();
        let mut writer = BitWriter::with_capacity(self.packing.payload_len(self.shape));
        for chirp in 0..self.shape.chirps {
            for &rx in &self.lane_map {
                for sample in 0..self.shape.samples {
                    let value = data[[rx, chirp, sample]];
                    let (first, second) = match self.packing.iq_order {
                        IqOrder::InPhaseFirst => (value.re, value.im),
                        IqOrder::QuadratureFirst => (value.im, value.re),
                    };
                    writer.push(quantize(first) as u32, bits);
                    writer.push(quantize(second) as u32, bits);
                }
            }
        }

        let metadata = FrameMetadata {
            frame_index: cube.frame_index(),
            timestamp: cube.timestamp(),
            shape: self.shape,
            packing: self.packing,
        };
        Ok(RawFrame::new(metadata, writer.finish()))
    }
}

impl ProcessingStage for FrameIngestor {
    type Input = RawFrame;
    type Output = IqCube;

    fn name(&self) -> &'static str {
        "ingest"
    }

    fn execute(&self, frame: RawFrame) -> StageResult<IqCube> {
        self.check_frame(&frame)?;

        let bits = u32::from(self.packing.bits);
        let scale = 1.0 / self.full_scale();
        let mut reader = BitReader::new(frame.payload());
        let mut data = Array3::<Sample>::zeros(self.shape.dims());
        for chirp in 0..self.shape.chirps {
            for &rx in &self.lane_map {
                for sample in 0..self.shape.samples {
                    let first = sign_extend(reader.read(bits), bits) as f32 * scale;
                    let second = sign_extend(reader.read(bits), bits) as f32 * scale;
                    data[[rx, chirp, sample]] = match self.packing.iq_order {
                        IqOrder::InPhaseFirst => Sample::new(first, second),
                        IqOrder::QuadratureFirst => Sample::new(second, first),
                    };
                }
            }
        }

        let meta = frame.metadata();
        let rms = StatsHelper::complex_rms(data.iter());
        self.logger
            .detail(&format!("frame {} decoded, RMS {:.4}", meta.frame_index, rms));
        IqCube::new(data, self.shape, meta.frame_index, meta.timestamp)
    }
}

fn sign_extend(raw: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((raw << shift) as i32) >> shift
}

/// MSB-first bitstream reader over a validated payload.
struct BitReader<'a> {
    bytes: &'a [u8],
    next: usize,
    acc: u64,
    filled: u32,
}

impl<'a> BitReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            next: 0,
            acc: 0,
            filled: 0,
        }
    }

    fn read(&mut self, bits: u32) -> u32 {
        while self.filled < bits {
            let byte = self.bytes.get(self.next).copied().unwrap_or(0);
            self.acc = (self.acc << 8) | u64::from(byte);
            self.next += 1;
            self.filled += 8;
        }
        self.filled -= bits;
        let value = (self.acc >> self.filled) & ((1u64 << bits) - 1);
        self.acc &= (1u64 << self.filled) - 1;
        value as u32
    }
}

struct BitWriter {
    bytes: Vec<u8>,
    acc: u64,
    filled: u32,
}

impl BitWriter {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
            acc: 0,
            filled: 0,
        }
    }

    fn push(&mut self, value: u32, bits: u32) {
        self.acc = (self.acc << bits) | (u64::from(value) & ((1u64 << bits) - 1));
        self.filled += bits;
        while self.filled >= 8 {
            self.filled -= 8;
            self.bytes.push((self.acc >> self.filled) as u8);
        }
        self.acc &= (1u64 << self.filled) - 1;
    }

    /// Flushes the partial byte, zero-padded on the right.
    fn finish(mut self) -> Vec<u8> {
        if self.filled > 0 {
            self.bytes.push((self.acc << (8 - self.filled)) as u8);
        }
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{ArrayGeometry, Polarization};

    fn config(bits: u8) -> PipelineConfig {
        let mut config = PipelineConfig::new(ArrayGeometry::uniform_linear(1, 3, Polarization::H));
        config.radar.samples_per_chirp = 5;
        config.radar.chirps_per_frame = 2;
        config.radar.packing.bits = bits;
        config
    }

    fn on_grid_cube(config: &PipelineConfig) -> IqCube {
        let shape = config.cube_shape();
        let full = (1i32 << (config.radar.packing.bits - 1)) as f32;
        let data = Array3::from_shape_fn(shape.dims(), |(c, k, s)| {
            let i = (c as i32 * 7 + k as i32 * 3 + s as i32) % 9 - 4;
            let q = 3 - (c as i32 + 2 * s as i32) % 7;
            Sample::new(i as f32 / full, q as f32 / full)
        });
        IqCube::new(data, shape, 9, 0.5).unwrap()
    }

    #[test]
    fn packed_round_trip_is_lossless() {
        for bits in [4u8, 12, 16] {
            let config = config(bits);
            let ingestor = FrameIngestor::new(&config).unwrap();
            let cube = on_grid_cube(&config);
            let frame = ingestor.encode(&cube).unwrap();
            assert_eq!(frame.payload().len(), config.radar.packing.payload_len(config.cube_shape()));
            let decoded = ingestor.execute(frame).unwrap();
            assert_eq!(decoded, cube);
        }
    }

    #[test]
    fn bitstream_is_msb_first() {
        let mut writer = BitWriter::with_capacity(2);
        writer.push(0b101, 3);
        writer.push(0b1111_0000_1, 9);
        let bytes = writer.finish();
        assert_eq!(bytes, vec![0b1011_1110, 0b0001_0000]);
        let mut reader = BitReader::new(&bytes);
        assert_eq!(reader.read(3), 0b101);
        assert_eq!(reader.read(9), 0b1111_0000_1);
    }

    #[test]
    fn negative_values_sign_extend() {
        assert_eq!(sign_extend(0xFFF, 12), -1);
        assert_eq!(sign_extend(0x800, 12), -2048);
        assert_eq!(sign_extend(0x7FF, 12), 2047);
    }

    #[test]
    fn encode_saturates_out_of_range_samples() {
        let config = config(4);
        let ingestor = FrameIngestor::new(&config).unwrap();
        let mut cube = IqCube::zeros(config.cube_shape(), 0, 0.0);
        cube.data_mut()[[0, 0, 0]] = Sample::new(5.0, -5.0);
        let decoded = ingestor.execute(ingestor.encode(&cube).unwrap()).unwrap();
        assert_eq!(decoded.data()[[0, 0, 0]], Sample::new(7.0 / 8.0, -1.0));
    }

    #[test]
    fn lane_map_reorders_channels() {
        let mut config = config(12);
        config.geometry.adc_lane_map = Some(vec![2, 0, 1]);
        let ingestor = FrameIngestor::new(&config).unwrap();
        let plain = FrameIngestor::new(&self::config(12)).unwrap();
        let cube = on_grid_cube(&config);

        let frame = ingestor.encode(&cube).unwrap();
        let as_lanes = plain.execute(frame.clone()).unwrap();
        // Lane 0 carries receiver 2.
        assert_eq!(as_lanes.channel(0), cube.channel(2));
        assert_eq!(ingestor.execute(frame).unwrap(), cube);
    }

    #[test]
    fn damaged_payloads_are_parse_errors() {
        let config = config(12);
        let ingestor = FrameIngestor::new(&config).unwrap();
        let frame = ingestor.encode(&on_grid_cube(&config)).unwrap();
        let meta = *frame.metadata();

        let mut flipped = frame.payload().to_vec();
        flipped[3] ^= 0x10;
        let corrupt = RawFrame::with_checksum(meta, flipped, frame.checksum());
        assert!(matches!(
            ingestor.execute(corrupt),
            Err(StageError::Parse(ParseError::Corrupt { .. }))
        ));

        let short = RawFrame::new(meta, frame.payload()[..10].to_vec());
        assert!(matches!(
            ingestor.execute(short),
            Err(StageError::Parse(ParseError::Truncated { found: 10, .. }))
        ));

        let mut long = frame.payload().to_vec();
        long.push(0);
        assert!(matches!(
            ingestor.execute(RawFrame::new(meta, long)),
            Err(StageError::Parse(ParseError::Misaligned(_)))
        ));

        let mut other = meta;
        other.shape = CubeShape::new(4, 2, 5);
        let err = ingestor
            .execute(RawFrame::new(other, frame.payload().to_vec()))
            .unwrap_err();
        assert!(!err.is_fatal());
    }
}
