//! Binary capture container.
//!
//! Layout (little-endian):
//!
//! ```text
//! file header  "PMAR" | version u16 | bits u8 | iq order u8
//!              | channels u32 | chirps u32 | samples u32 | start time f64
//! frame        sync u32 (0x1ACFFC1D) | index u32 | timestamp f64
//!              | payload length u32 | payload | CRC-32 u32
//! ```

use crate::cube::CubeShape;
use crate::math::checksum::Crc32;
use crate::prelude::{ParseError, StageError, StageResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::Path;

pub const CAPTURE_MAGIC: [u8; 4] = *b"PMAR";
pub const CAPTURE_VERSION: u16 = 1;
pub const SYNC_MARKER: u32 = 0x1ACF_FC1D;

const FILE_HEADER_LEN: usize = 28;
const FRAME_HEADER_LEN: usize = 20;
const FRAME_TRAILER_LEN: usize = 4;

/// Order of the two components of each packed complex sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IqOrder {
    #[default]
    InPhaseFirst,
    QuadratureFirst,
}

impl IqOrder {
    fn code(self) -> u8 {
        match self {
            IqOrder::InPhaseFirst => 0,
            IqOrder::QuadratureFirst => 1,
        }
    }

    fn from_code(code: u8) -> Result<Self, ParseError> {
        match code {
            0 => Ok(IqOrder::InPhaseFirst),
            1 => Ok(IqOrder::QuadratureFirst),
            other => Err(ParseError::Header(format!("unknown IQ order {}", other))),
        }
    }
}

/// ADC sample packing: two's-complement values of `bits` width, packed
/// MSB-first into a continuous bitstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackingFormat {
    pub bits: u8,
    #[serde(default)]
    pub iq_order: IqOrder,
}

impl Default for PackingFormat {
    fn default() -> Self {
        Self {
            bits: 12,
            iq_order: IqOrder::InPhaseFirst,
        }
    }
}

impl PackingFormat {
    pub const MIN_BITS: u8 = 2;
    pub const MAX_BITS: u8 = 16;

    pub fn validate(&self) -> StageResult<()> {
        if !(Self::MIN_BITS..=Self::MAX_BITS).contains(&self.bits) {
            return Err(StageError::InvalidConfig(format!(
                "packing width must be {}..={} bits, got {}",
                Self::MIN_BITS,
                Self::MAX_BITS,
                self.bits
            )));
        }
        Ok(())
    }

    /// Payload bytes for a cube of `shape` (I and Q per sample).
    pub fn payload_len(&self, shape: CubeShape) -> usize {
        (shape.len() * 2 * self.bits as usize + 7) / 8
    }
}

/// Capture-wide header shared by every frame in the file.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CaptureHeader {
    pub version: u16,
    pub packing: PackingFormat,
    pub shape: CubeShape,
    pub start_timestamp: f64,
}

impl CaptureHeader {
    pub fn new(packing: PackingFormat, shape: CubeShape, start_timestamp: f64) -> Self {
        Self {
            version: CAPTURE_VERSION,
            packing,
            shape,
            start_timestamp,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FILE_HEADER_LEN);
        out.extend_from_slice(&CAPTURE_MAGIC);
        out.extend_from_slice(&self.version.to_le_bytes());
        out.push(self.packing.bits);
        out.push(self.packing.iq_order.code());
        out.extend_from_slice(&(self.shape.channels as u32).to_le_bytes());
        out.extend_from_slice(&(self.shape.chirps as u32).to_le_bytes());
        out.extend_from_slice(&(self.shape.samples as u32).to_le_bytes());
        out.extend_from_slice(&self.start_timestamp.to_le_bytes());
        out
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() < FILE_HEADER_LEN {
            return Err(ParseError::Truncated {
                expected: FILE_HEADER_LEN,
                found: bytes.len(),
            });
        }
        if bytes[..4] != CAPTURE_MAGIC {
            return Err(ParseError::Header("missing PMAR magic".into()));
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != CAPTURE_VERSION {
            return Err(ParseError::Header(format!(
                "unsupported capture version {}",
                version
            )));
        }
        let packing = PackingFormat {
            bits: bytes[6],
            iq_order: IqOrder::from_code(bytes[7])?,
        };
        if packing.validate().is_err() {
            return Err(ParseError::Header(format!(
                "unsupported packing width {}",
                packing.bits
            )));
        }
        let shape = CubeShape::new(
            read_u32(bytes, 8) as usize,
            read_u32(bytes, 12) as usize,
            read_u32(bytes, 16) as usize,
        );
        Ok(Self {
            version,
            packing,
            shape,
            start_timestamp: read_f64(bytes, 20),
        })
    }
}

/// Per-frame metadata.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameMetadata {
    pub frame_index: u32,
    pub timestamp: f64,
    pub shape: CubeShape,
    pub packing: PackingFormat,
}

/// One undecoded frame exactly as captured.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    metadata: FrameMetadata,
    payload: Vec<u8>,
    checksum: u32,
}

impl RawFrame {
    /// Builds a frame and computes its payload checksum.
    pub fn new(metadata: FrameMetadata, payload: Vec<u8>) -> Self {
        let checksum = Crc32::checksum(&payload);
        Self {
            metadata,
            payload,
            checksum,
        }
    }

    /// Builds a frame with the checksum declared by the capture.
    pub fn with_checksum(metadata: FrameMetadata, payload: Vec<u8>, checksum: u32) -> Self {
        Self {
            metadata,
            payload,
            checksum,
        }
    }

    pub fn metadata(&self) -> &FrameMetadata {
        &self.metadata
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn checksum(&self) -> u32 {
        self.checksum
    }
}

/// Splits a capture into frames, resynchronizing on the sync marker after
/// damaged regions.
pub struct CaptureReader {
    header: CaptureHeader,
    bytes: Vec<u8>,
    position: usize,
}

impl CaptureReader {
    pub fn open<P: AsRef<Path>>(path: P) -> StageResult<Self> {
        let bytes = fs::read(path.as_ref())?;
        Self::from_bytes(bytes)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> StageResult<Self> {
        let header = CaptureHeader::parse(&bytes)?;
        Ok(Self {
            header,
            bytes,
            position: FILE_HEADER_LEN,
        })
    }

    pub fn header(&self) -> &CaptureHeader {
        &self.header
    }

    fn find_sync(&self, from: usize) -> Option<usize> {
        let marker = SYNC_MARKER.to_le_bytes();
        self.bytes
            .get(from..)?
            .windows(4)
            .position(|w| w == marker)
            .map(|offset| from + offset)
    }

    fn next_frame(&mut self) -> Result<RawFrame, ParseError> {
        let start = self.position;
        let remaining = self.bytes.len() - start;

        if read_u32_checked(&self.bytes, start) != Some(SYNC_MARKER) {
            let next = self.find_sync(start + 1).unwrap_or(self.bytes.len());
            self.position = next;
            return Err(ParseError::Sync {
                offset: start as u64,
                skipped: next - start,
            });
        }
        if remaining < FRAME_HEADER_LEN {
            self.position = self.bytes.len();
            return Err(ParseError::Truncated {
                expected: FRAME_HEADER_LEN,
                found: remaining,
            });
        }

        let frame_index = read_u32(&self.bytes, start + 4);
        let timestamp = read_f64(&self.bytes, start + 8);
        let payload_len = read_u32(&self.bytes, start + 16) as usize;
        let total = FRAME_HEADER_LEN + payload_len + FRAME_TRAILER_LEN;
        if remaining < total {
            self.position = self.find_sync(start + 4).unwrap_or(self.bytes.len());
            return Err(ParseError::Truncated {
                expected: total,
                found: remaining,
            });
        }

        let payload_start = start + FRAME_HEADER_LEN;
        let payload = self.bytes[payload_start..payload_start + payload_len].to_vec();
        let checksum = read_u32(&self.bytes, payload_start + payload_len);
        self.position = start + total;

        let metadata = FrameMetadata {
            frame_index,
            timestamp,
            shape: self.header.shape,
            packing: self.header.packing,
        };
        Ok(RawFrame::with_checksum(metadata, payload, checksum))
    }
}

impl Iterator for CaptureReader {
    type Item = Result<RawFrame, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.bytes.len() {
            return None;
        }
        Some(self.next_frame())
    }
}

/// Writes a capture header followed by framed payloads.
pub struct CaptureWriter<W: Write> {
    writer: W,
    header: CaptureHeader,
}

impl<W: Write> CaptureWriter<W> {
    pub fn new(mut writer: W, header: CaptureHeader) -> StageResult<Self> {
        header.packing.validate()?;
        writer.write_all(&header.to_bytes())?;
        Ok(Self { writer, header })
    }

    pub fn write_frame(&mut self, frame: &RawFrame) -> StageResult<()> {
        let meta = frame.metadata();
        if meta.shape != self.header.shape || meta.packing != self.header.packing {
            return Err(StageError::Dimension(format!(
                "frame {} does not match the capture header",
                meta.frame_index
            )));
        }
        self.writer.write_all(&SYNC_MARKER.to_le_bytes())?;
        self.writer.write_all(&meta.frame_index.to_le_bytes())?;
        self.writer.write_all(&meta.timestamp.to_le_bytes())?;
        self.writer
            .write_all(&(frame.payload().len() as u32).to_le_bytes())?;
        self.writer.write_all(frame.payload())?;
        self.writer.write_all(&frame.checksum().to_le_bytes())?;
        Ok(())
    }

    pub fn into_inner(mut self) -> StageResult<W> {
        self.writer.flush()?;
        Ok(self.writer)
    }
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(word)
}

fn read_u32_checked(bytes: &[u8], at: usize) -> Option<u32> {
    (bytes.len() >= at + 4).then(|| read_u32(bytes, at))
}

fn read_f64(bytes: &[u8], at: usize) -> f64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[at..at + 8]);
    f64::from_le_bytes(word)
}
