//! Per-chunk filters.
//!
//! Filters transform encoded chunk bytes on their way to and from the store.
//! [`Filter::Deflate`] is the lossless compressor; [`Filter::BitRound`] is
//! the lossy alternative, which rounds away low mantissa bits so that a
//! later stage (or the storage medium) sees more compressible data. The two
//! are mutually exclusive, and both require a chunked layout; the layout
//! planner enforces this before any container exists.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The number of explicit mantissa bits in an IEEE 754 `f32`.
const F32_MANTISSA_BITS: u32 = 23;

/// A filter error.
#[derive(Debug, Error)]
pub enum FilterError {
    /// An IO error from the compressor.
    #[error(transparent)]
    IOError(#[from] std::io::Error),
    /// An invalid filter parameter.
    #[error("invalid filter parameter: {0}")]
    InvalidParameter(String),
    /// Encoded bytes that are not a whole number of elements.
    #[error("encoded chunk of {0} bytes is not a whole number of f32 elements")]
    RaggedChunk(usize),
}

/// A chunk filter.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "lowercase")]
pub enum Filter {
    /// Lossless zlib compression at the given level (1-9).
    Deflate {
        /// The compression level.
        level: u32,
    },
    /// Lossy mantissa rounding keeping the given number of bits (0-23).
    BitRound {
        /// The number of mantissa bits kept.
        keep_bits: u32,
    },
}

impl Filter {
    /// Validate the filter parameters.
    ///
    /// # Errors
    /// Returns [`FilterError::InvalidParameter`] for an out-of-range level or
    /// bit count.
    pub fn validate(&self) -> Result<(), FilterError> {
        match self {
            Self::Deflate { level } => {
                if !(1..=9).contains(level) {
                    return Err(FilterError::InvalidParameter(format!(
                        "deflate level {level} is not in 1..=9"
                    )));
                }
            }
            Self::BitRound { keep_bits } => {
                if *keep_bits > F32_MANTISSA_BITS {
                    return Err(FilterError::InvalidParameter(format!(
                        "bitround keep_bits {keep_bits} is not in 0..=23"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Encode chunk bytes.
    ///
    /// # Errors
    /// Returns a [`FilterError`] if encoding fails.
    pub fn encode(&self, bytes: Vec<u8>) -> Result<Vec<u8>, FilterError> {
        match self {
            Self::Deflate { level } => {
                let mut encoder = flate2::write::ZlibEncoder::new(
                    Vec::new(),
                    flate2::Compression::new(*level),
                );
                encoder.write_all(&bytes)?;
                Ok(encoder.finish()?)
            }
            Self::BitRound { keep_bits } => bitround(bytes, *keep_bits),
        }
    }

    /// Decode chunk bytes.
    ///
    /// # Errors
    /// Returns a [`FilterError`] if the bytes are not valid for the filter.
    pub fn decode(&self, bytes: Vec<u8>) -> Result<Vec<u8>, FilterError> {
        match self {
            Self::Deflate { .. } => {
                let mut decoder = flate2::read::ZlibDecoder::new(bytes.as_slice());
                let mut out = Vec::new();
                decoder.read_to_end(&mut out)?;
                Ok(out)
            }
            // Rounding is not invertible; the stored bytes are the values.
            Self::BitRound { .. } => Ok(bytes),
        }
    }
}

/// Apply a filter chain to raw chunk bytes, first filter first.
///
/// # Errors
/// Returns a [`FilterError`] if any filter fails.
pub fn encode_chain(filters: &[Filter], mut bytes: Vec<u8>) -> Result<Vec<u8>, FilterError> {
    for filter in filters {
        bytes = filter.encode(bytes)?;
    }
    Ok(bytes)
}

/// Invert a filter chain on encoded chunk bytes, last filter first.
///
/// # Errors
/// Returns a [`FilterError`] if any filter fails.
pub fn decode_chain(filters: &[Filter], mut bytes: Vec<u8>) -> Result<Vec<u8>, FilterError> {
    for filter in filters.iter().rev() {
        bytes = filter.decode(bytes)?;
    }
    Ok(bytes)
}

/// Round the mantissa of each `f32` element to `keep_bits` bits, to nearest
/// even in the dropped bits.
fn bitround(bytes: Vec<u8>, keep_bits: u32) -> Result<Vec<u8>, FilterError> {
    if bytes.len() % size_of::<f32>() != 0 {
        return Err(FilterError::RaggedChunk(bytes.len()));
    }
    if keep_bits >= F32_MANTISSA_BITS {
        return Ok(bytes);
    }
    let mut elements: Vec<u32> = bytemuck::pod_collect_to_vec(&bytes);
    let drop_bits = F32_MANTISSA_BITS - keep_bits;
    for element in &mut elements {
        // Sign-magnitude layout: adding half of the dropped range to the bit
        // pattern rounds the magnitude to nearest, carrying into the exponent
        // when needed, then the mask truncates.
        *element = element.wrapping_add(1 << (drop_bits - 1)) & !((1 << drop_bits) - 1);
    }
    Ok(bytemuck::cast_slice(&elements).to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deflate_roundtrip_and_shrinks_constant_data() {
        let filter = Filter::Deflate { level: 5 };
        let raw: Vec<u8> = bytemuck::cast_slice(&vec![3.0f32; 1024]).to_vec();
        let encoded = filter.encode(raw.clone()).unwrap();
        assert!(encoded.len() < raw.len());
        assert_eq!(filter.decode(encoded).unwrap(), raw);
    }

    #[test]
    fn bitround_zeroes_low_mantissa_bits() {
        let filter = Filter::BitRound { keep_bits: 8 };
        let values = [1.0f32, std::f32::consts::PI, -7.333, 1234.5678];
        let raw: Vec<u8> = bytemuck::cast_slice(&values).to_vec();
        let rounded: Vec<f32> =
            bytemuck::pod_collect_to_vec(&filter.encode(raw).unwrap());
        for (value, rounded) in std::iter::zip(values, rounded) {
            let relative = ((rounded - value) / value).abs();
            assert!(relative < 1.0 / 255.0, "{value} -> {rounded}");
            assert_eq!(rounded.to_bits() & ((1 << 15) - 1), 0);
        }
    }

    #[test]
    fn bitround_is_exact_for_already_round_values() {
        let filter = Filter::BitRound { keep_bits: 8 };
        let values = [0.0f32, 1.0, 2.0, -4.0, 0.5];
        let raw: Vec<u8> = bytemuck::cast_slice(&values).to_vec();
        let rounded: Vec<f32> =
            bytemuck::pod_collect_to_vec(&filter.encode(raw).unwrap());
        assert_eq!(rounded.as_slice(), values.as_slice());
    }

    #[test]
    fn chain_order() {
        let filters = [
            Filter::BitRound { keep_bits: 10 },
            Filter::Deflate { level: 1 },
        ];
        let raw: Vec<u8> = bytemuck::cast_slice(&vec![2.5f32; 64]).to_vec();
        let encoded = encode_chain(&filters, raw.clone()).unwrap();
        let decoded = decode_chain(&filters, encoded).unwrap();
        assert_eq!(decoded, raw);
    }

    #[test]
    fn parameter_validation() {
        assert!(Filter::Deflate { level: 0 }.validate().is_err());
        assert!(Filter::Deflate { level: 10 }.validate().is_err());
        assert!(Filter::Deflate { level: 9 }.validate().is_ok());
        assert!(Filter::BitRound { keep_bits: 24 }.validate().is_err());
        assert!(Filter::BitRound { keep_bits: 23 }.validate().is_ok());
    }
}
