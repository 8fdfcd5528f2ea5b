//! Pixel frame description, transfer-syntax decoders and min/max statistics
//! used by the decode task.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Description of one image frame, as sent by the caller and returned with the
/// computed statistics filled in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageFrame {
    pub rows: u32,
    pub columns: u32,
    pub bits_allocated: u16,
    /// 0 = unsigned, 1 = two's complement
    #[serde(default)]
    pub pixel_representation: u8,
    #[serde(default = "default_samples_per_pixel")]
    pub samples_per_pixel: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smallest_pixel_value: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub largest_pixel_value: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pixel_data_length: Option<usize>,
}

fn default_samples_per_pixel() -> u16 {
    1
}

/// Largest decoded frame the decode task will allocate
pub const MAX_FRAME_BYTES: usize = 1 << 30;

impl ImageFrame {
    pub fn pixels_per_plane(&self) -> Result<usize, PixelError> {
        (self.rows as usize)
            .checked_mul(self.columns as usize)
            .ok_or_else(|| self.too_large())
    }

    pub fn sample_count(&self) -> Result<usize, PixelError> {
        self.pixels_per_plane()?
            .checked_mul(self.samples_per_pixel as usize)
            .ok_or_else(|| self.too_large())
    }

    fn bytes_per_sample(&self) -> Result<usize, PixelError> {
        match self.bits_allocated {
            8 => Ok(1),
            16 => Ok(2),
            other => Err(PixelError::UnsupportedBitsAllocated(other)),
        }
    }

    /// Decoded byte length, bounded by [`MAX_FRAME_BYTES`]
    pub fn expected_length(&self) -> Result<usize, PixelError> {
        let bytes_per_sample = self.bytes_per_sample()?;
        self.sample_count()?
            .checked_mul(bytes_per_sample)
            .filter(|&len| len <= MAX_FRAME_BYTES)
            .ok_or_else(|| self.too_large())
    }

    fn too_large(&self) -> PixelError {
        PixelError::FrameTooLarge {
            rows: self.rows,
            columns: self.columns,
            samples_per_pixel: self.samples_per_pixel,
            bits_allocated: self.bits_allocated,
        }
    }

    pub fn is_signed(&self) -> bool {
        self.pixel_representation == 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PixelError {
    #[error("unsupported transfer syntax: {0}")]
    UnsupportedTransferSyntax(String),

    #[error("unsupported bits allocated: {0}")]
    UnsupportedBitsAllocated(u16),

    #[error("pixel data truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error(
        "frame of {rows}x{columns}x{samples_per_pixel} at {bits_allocated} bits exceeds {max} bytes",
        max = MAX_FRAME_BYTES
    )]
    FrameTooLarge {
        rows: u32,
        columns: u32,
        samples_per_pixel: u16,
        bits_allocated: u16,
    },

    #[error("invalid RLE data: {0}")]
    Rle(String),

    #[error("decoded frame has no pixel data")]
    EmptyPixelData,

    #[error("{field} declared as {declared} but frame contains {actual}")]
    StatisticMismatch {
        field: &'static str,
        declared: i32,
        actual: i32,
    },
}

/// Transfer syntaxes the decode task understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferSyntax {
    ImplicitVrLittleEndian,
    ExplicitVrLittleEndian,
    ExplicitVrBigEndian,
    RleLossless,
}

impl TransferSyntax {
    pub const ALL: [TransferSyntax; 4] = [
        TransferSyntax::ImplicitVrLittleEndian,
        TransferSyntax::ExplicitVrLittleEndian,
        TransferSyntax::ExplicitVrBigEndian,
        TransferSyntax::RleLossless,
    ];

    pub fn uid(self) -> &'static str {
        match self {
            TransferSyntax::ImplicitVrLittleEndian => "1.2.840.10008.1.2",
            TransferSyntax::ExplicitVrLittleEndian => "1.2.840.10008.1.2.1",
            TransferSyntax::ExplicitVrBigEndian => "1.2.840.10008.1.2.2",
            TransferSyntax::RleLossless => "1.2.840.10008.1.2.5",
        }
    }
}

/// Decoded samples, typed by bit depth and signedness
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PixelData {
    U8(Vec<u8>),
    I8(Vec<i8>),
    U16(Vec<u16>),
    I16(Vec<i16>),
}

impl PixelData {
    pub fn len(&self) -> usize {
        match self {
            PixelData::U8(v) => v.len(),
            PixelData::I8(v) => v.len(),
            PixelData::U16(v) => v.len(),
            PixelData::I16(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn min_max(&self) -> Option<(i32, i32)> {
        fn fold<T: Copy + Into<i32>>(values: &[T]) -> Option<(i32, i32)> {
            values.iter().fold(None, |acc, &v| {
                let v = v.into();
                Some(match acc {
                    None => (v, v),
                    Some((lo, hi)) => (lo.min(v), hi.max(v)),
                })
            })
        }

        match self {
            PixelData::U8(v) => fold(v),
            PixelData::I8(v) => fold(v),
            PixelData::U16(v) => fold(v),
            PixelData::I16(v) => fold(v),
        }
    }

    /// Native little-endian byte image of the samples
    pub fn into_le_bytes(self) -> Vec<u8> {
        match self {
            PixelData::U8(v) => v,
            PixelData::I8(v) => v.into_iter().map(|s| s as u8).collect(),
            PixelData::U16(v) => v.into_iter().flat_map(u16::to_le_bytes).collect(),
            PixelData::I16(v) => v.into_iter().flat_map(i16::to_le_bytes).collect(),
        }
    }
}

/// Decode an encoded frame into typed samples
pub fn decode_frame(
    frame: &ImageFrame,
    syntax: TransferSyntax,
    encoded: &[u8],
) -> Result<PixelData, PixelError> {
    match syntax {
        TransferSyntax::ImplicitVrLittleEndian | TransferSyntax::ExplicitVrLittleEndian => {
            samples_from_bytes(frame, encoded, Endian::Little)
        }
        TransferSyntax::ExplicitVrBigEndian => samples_from_bytes(frame, encoded, Endian::Big),
        TransferSyntax::RleLossless => {
            let native = decode_rle(frame, encoded)?;
            samples_from_bytes(frame, &native, Endian::Little)
        }
    }
}

#[derive(Clone, Copy)]
enum Endian {
    Little,
    Big,
}

fn samples_from_bytes(
    frame: &ImageFrame,
    bytes: &[u8],
    endian: Endian,
) -> Result<PixelData, PixelError> {
    let expected = frame.expected_length()?;
    if bytes.len() < expected {
        return Err(PixelError::Truncated {
            expected,
            actual: bytes.len(),
        });
    }
    // Trailing bytes are padding
    let bytes = &bytes[..expected];

    let data = match (frame.bits_allocated, frame.is_signed()) {
        (8, false) => PixelData::U8(bytes.to_vec()),
        (8, true) => PixelData::I8(bytes.iter().map(|&b| b as i8).collect()),
        (16, signed) => {
            let words = bytes.chunks_exact(2).map(|pair| {
                let pair = [pair[0], pair[1]];
                match endian {
                    Endian::Little => u16::from_le_bytes(pair),
                    Endian::Big => u16::from_be_bytes(pair),
                }
            });
            if signed {
                PixelData::I16(words.map(|w| w as i16).collect())
            } else {
                PixelData::U16(words.collect())
            }
        }
        (other, _) => return Err(PixelError::UnsupportedBitsAllocated(other)),
    };

    Ok(data)
}

const RLE_HEADER_LEN: usize = 64;
const RLE_MAX_SEGMENTS: usize = 15;
/// A two-byte PackBits run expands to at most 128 bytes
const RLE_MAX_EXPANSION: usize = 64;

/// Decode RLE Lossless into interleaved little-endian bytes
///
/// One segment per byte plane per sample, most significant plane first.
pub fn decode_rle(frame: &ImageFrame, encoded: &[u8]) -> Result<Vec<u8>, PixelError> {
    if encoded.len() < RLE_HEADER_LEN {
        return Err(PixelError::Rle(format!(
            "header needs {RLE_HEADER_LEN} bytes, got {}",
            encoded.len()
        )));
    }

    let read_u32 = |at: usize| {
        u32::from_le_bytes([encoded[at], encoded[at + 1], encoded[at + 2], encoded[at + 3]])
            as usize
    };

    let bytes_per_sample = frame.bytes_per_sample()?;
    let samples = frame.samples_per_pixel as usize;
    let expected_segments = bytes_per_sample * samples;
    let segment_count = read_u32(0);
    if segment_count != expected_segments || segment_count > RLE_MAX_SEGMENTS {
        return Err(PixelError::Rle(format!(
            "expected {expected_segments} segments, header declares {segment_count}"
        )));
    }

    let offsets: Vec<usize> = (0..segment_count).map(|i| read_u32(4 + i * 4)).collect();
    let plane_len = frame.pixels_per_plane()?;
    let output_len = frame.expected_length()?;

    let mut segments = Vec::with_capacity(segment_count);
    for (segment, &start) in offsets.iter().enumerate() {
        let end = offsets.get(segment + 1).copied().unwrap_or(encoded.len());
        if start < RLE_HEADER_LEN || start > end || end > encoded.len() {
            return Err(PixelError::Rle(format!(
                "segment {segment} has invalid bounds {start}..{end}"
            )));
        }
        let capacity = (end - start).saturating_mul(RLE_MAX_EXPANSION);
        if plane_len > capacity {
            return Err(PixelError::Rle(format!(
                "segment {segment} of {} bytes cannot expand to {plane_len}",
                end - start
            )));
        }
        segments.push(&encoded[start..end]);
    }

    let mut output = vec![0u8; output_len];
    for (segment, input) in segments.into_iter().enumerate() {
        let plane = unpack_bits(input, plane_len);
        if plane.len() < plane_len {
            return Err(PixelError::Rle(format!(
                "segment {segment} decoded to {} bytes, expected {plane_len}",
                plane.len()
            )));
        }

        let sample = segment / bytes_per_sample;
        let byte_in_sample = bytes_per_sample - 1 - segment % bytes_per_sample;
        for (pixel, &value) in plane.iter().enumerate() {
            output[(pixel * samples + sample) * bytes_per_sample + byte_in_sample] = value;
        }
    }

    Ok(output)
}

/// PackBits expansion, stopping once `limit` bytes are produced
fn unpack_bits(input: &[u8], limit: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(limit.min(input.len().saturating_mul(RLE_MAX_EXPANSION)));
    let mut pos = 0;

    while pos < input.len() && out.len() < limit {
        let header = input[pos] as i8;
        pos += 1;
        match header {
            0..=127 => {
                let count = header as usize + 1;
                let end = (pos + count).min(input.len());
                out.extend_from_slice(&input[pos..end]);
                pos = end;
            }
            -127..=-1 => {
                let Some(&value) = input.get(pos) else { break };
                pos += 1;
                let count = (1 - header as isize) as usize;
                out.extend(std::iter::repeat(value).take(count));
            }
            -128 => {}
        }
    }

    out.truncate(limit);
    out
}

/// Fill in (or check) the frame's smallest/largest pixel values
///
/// In strict mode a declared value that disagrees with the pixels is an
/// error; otherwise the computed value replaces it.
pub fn calculate_min_max(
    frame: &mut ImageFrame,
    pixels: &PixelData,
    strict: bool,
) -> Result<(), PixelError> {
    let (min, max) = pixels.min_max().ok_or(PixelError::EmptyPixelData)?;

    for (field, declared, actual) in [
        ("smallestPixelValue", frame.smallest_pixel_value, min),
        ("largestPixelValue", frame.largest_pixel_value, max),
    ] {
        match declared {
            Some(declared) if declared != actual && strict => {
                return Err(PixelError::StatisticMismatch {
                    field,
                    declared,
                    actual,
                });
            }
            Some(declared) if declared != actual => {
                warn!(field, declared, actual, "Declared pixel statistic is incorrect; using computed value");
            }
            _ => {}
        }
    }

    frame.smallest_pixel_value = Some(min);
    frame.largest_pixel_value = Some(max);
    Ok(())
}
