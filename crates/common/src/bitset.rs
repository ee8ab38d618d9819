//! # Rule-Bitset Codec
//!
//! Packs a set of rule indices over `[0, width)` into an LSB-first bitmap
//! (8 cells per byte, padded to whole bytes) and compresses it with zlib.
//! The packed layout is identical to one row of
//! [`matrix::BitMatrix`](crate::matrix::BitMatrix), so rehydrating a user row
//! is decompress-and-copy.

use crate::bits;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("rule index {index} out of range for width {width}")]
    IndexOutOfRange { index: u32, width: usize },
    #[error("corrupt bitset: {0}")]
    Stream(#[from] std::io::Error),
    #[error("corrupt bitset: expected {expected} bytes for width {width}, got {got}")]
    WrongLength {
        expected: usize,
        width: usize,
        got: usize,
    },
    #[error("invalid hex column: {0}")]
    BadHex(#[from] hex::FromHexError),
}

/// What shape `decode` should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeMode {
    Indices,
    Bitmap,
    Raw,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// Set indices, ascending.
    Indices(Vec<u32>),
    /// One bool per cell, length `width`.
    Bitmap(Vec<bool>),
    /// The packed bytes, length `⌈width/8⌉`.
    Raw(Vec<u8>),
}

impl Decoded {
    pub fn into_indices(self) -> Vec<u32> {
        match self {
            Decoded::Indices(v) => v,
            Decoded::Bitmap(b) => b
                .iter()
                .enumerate()
                .filter(|(_, &x)| x)
                .map(|(i, _)| i as u32)
                .collect(),
            Decoded::Raw(raw) => bits::iter_ones(&raw, raw.len() * 8).collect(),
        }
    }
}

/// Packs indices into an uncompressed padded bitmap.
pub fn pack(indices: &[u32], width: usize) -> Result<Vec<u8>, CodecError> {
    let mut row = vec![0u8; bits::packed_len(width)];
    for &i in indices {
        if i as usize >= width {
            return Err(CodecError::IndexOutOfRange { index: i, width });
        }
        bits::set(&mut row, i as usize);
    }
    Ok(row)
}

/// Packs and zlib-compresses an index set.
pub fn encode(indices: &[u32], width: usize) -> Result<Vec<u8>, CodecError> {
    let row = pack(indices, width)?;
    let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
    enc.write_all(&row)?;
    Ok(enc.finish()?)
}

/// Hex string of the compressed bitset, the on-disk column form.
pub fn encode_hex(indices: &[u32], width: usize) -> Result<String, CodecError> {
    Ok(hex::encode(encode(indices, width)?))
}

/// Decompresses and length-checks the packed bytes.
pub fn decompress(bytes: &[u8], width: usize) -> Result<Vec<u8>, CodecError> {
    let mut raw = Vec::with_capacity(bits::packed_len(width));
    ZlibDecoder::new(bytes).read_to_end(&mut raw)?;
    let expected = bits::packed_len(width);
    if raw.len() != expected {
        return Err(CodecError::WrongLength {
            expected,
            width,
            got: raw.len(),
        });
    }
    Ok(raw)
}

/// Inverse of [`encode`].
pub fn decode(bytes: &[u8], width: usize, mode: DecodeMode) -> Result<Decoded, CodecError> {
    let raw = decompress(bytes, width)?;
    Ok(match mode {
        DecodeMode::Raw => Decoded::Raw(raw),
        DecodeMode::Bitmap => Decoded::Bitmap((0..width).map(|i| bits::test(&raw, i)).collect()),
        DecodeMode::Indices => Decoded::Indices(bits::iter_ones(&raw, width).collect()),
    })
}

/// Inverse of [`encode_hex`].
pub fn decode_hex(column: &str, width: usize, mode: DecodeMode) -> Result<Decoded, CodecError> {
    decode(&hex::decode(column)?, width, mode)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(indices: &[u32], width: usize) {
        let encoded = encode(indices, width).unwrap();
        let mut sorted: Vec<u32> = indices.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        match decode(&encoded, width, DecodeMode::Indices).unwrap() {
            Decoded::Indices(back) => assert_eq!(back, sorted),
            other => panic!("expected indices, got {other:?}"),
        }
    }

    #[test]
    fn test_roundtrip_empty() {
        roundtrip(&[], 100);
        roundtrip(&[], 0);
    }

    #[test]
    fn test_roundtrip_full() {
        let all: Vec<u32> = (0..100).collect();
        roundtrip(&all, 100);
    }

    #[test]
    fn test_roundtrip_unsorted_with_duplicates() {
        roundtrip(&[9, 1, 1, 64, 9, 0], 65);
    }

    #[test]
    fn test_roundtrip_large_sparse() {
        // 50k-wide universe, every 7th index; compressed form must beat the
        // one-byte-per-cell strawman and decode exactly.
        let width = 50_000;
        let indices: Vec<u32> = (0..width as u32).step_by(7).collect();
        let encoded = encode(&indices, width).unwrap();
        assert!(encoded.len() < width);
        match decode(&encoded, width, DecodeMode::Indices).unwrap() {
            Decoded::Indices(back) => assert_eq!(back, indices),
            other => panic!("expected indices, got {other:?}"),
        }
    }

    #[test]
    fn test_bitmap_mode() {
        let encoded = encode(&[0, 3], 5).unwrap();
        match decode(&encoded, 5, DecodeMode::Bitmap).unwrap() {
            Decoded::Bitmap(b) => assert_eq!(b, vec![true, false, false, true, false]),
            other => panic!("expected bitmap, got {other:?}"),
        }
    }

    #[test]
    fn test_raw_mode_matches_row_layout() {
        let encoded = encode(&[0, 1, 8], 9).unwrap();
        match decode(&encoded, 9, DecodeMode::Raw).unwrap() {
            Decoded::Raw(raw) => assert_eq!(raw, vec![0b0000_0011, 0b0000_0001]),
            other => panic!("expected raw, got {other:?}"),
        }
    }

    #[test]
    fn test_out_of_range_index() {
        assert!(matches!(
            encode(&[10], 10),
            Err(CodecError::IndexOutOfRange { index: 10, width: 10 })
        ));
    }

    #[test]
    fn test_corrupt_stream() {
        assert!(decode(b"not zlib at all", 16, DecodeMode::Indices).is_err());
    }

    #[test]
    fn test_wrong_width() {
        let encoded = encode(&[1], 64).unwrap();
        assert!(matches!(
            decode(&encoded, 128, DecodeMode::Indices),
            Err(CodecError::WrongLength { .. })
        ));
    }

    #[test]
    fn test_hex_roundtrip() {
        let column = encode_hex(&[2, 5, 11], 12).unwrap();
        assert_eq!(
            decode_hex(&column, 12, DecodeMode::Indices)
                .unwrap()
                .into_indices(),
            vec![2, 5, 11]
        );
    }
}
