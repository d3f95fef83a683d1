//! Chunk codec: byte-level encoding of column chunk payloads.
//!
//! A stored chunk is one tag byte followed by the payload, so values are
//! self-describing and a vector can mix raw and compressed chunks. Row data
//! is fixed-width little-endian; LZ4 is the fast path for materialized
//! columns, raw is used where the backing bytes already live elsewhere
//! (file and blob slices).

use bytes::Bytes;

use crate::error::{CommonError, Result};

/// Compression applied to a chunk payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// Payload bytes stored as-is.
    Raw,
    /// LZ4 block compression with a length prefix.
    Lz4,
}

const TAG_RAW: u8 = 0;
const TAG_LZ4: u8 = 1;

impl Codec {
    fn tag(self) -> u8 {
        match self {
            Codec::Raw => TAG_RAW,
            Codec::Lz4 => TAG_LZ4,
        }
    }
}

/// Encode a run of i64 rows into a tagged chunk payload.
pub fn encode_i64(rows: &[i64], codec: Codec) -> Bytes {
    let mut le = Vec::with_capacity(rows.len() * 8);
    for v in rows {
        le.extend_from_slice(&v.to_le_bytes());
    }
    let mut out = Vec::with_capacity(le.len() + 1);
    out.push(codec.tag());
    match codec {
        Codec::Raw => out.extend_from_slice(&le),
        Codec::Lz4 => out.extend_from_slice(&lz4_flex::compress_prepend_size(&le)),
    }
    Bytes::from(out)
}

/// Decode a tagged chunk payload back into i64 rows.
pub fn decode_i64(payload: &[u8]) -> Result<Vec<i64>> {
    let (tag, body) = payload
        .split_first()
        .ok_or_else(|| CommonError::codec_error("empty chunk payload"))?;
    let le = match *tag {
        TAG_RAW => body.to_vec(),
        TAG_LZ4 => lz4_flex::decompress_size_prepended(body)
            .map_err(|e| CommonError::codec_error(format!("lz4 decompress failed: {}", e)))?,
        t => {
            return Err(CommonError::codec_error(format!(
                "unknown chunk codec tag {}",
                t
            )))
        }
    };
    if le.len() % 8 != 0 {
        return Err(CommonError::codec_error(format!(
            "chunk payload length {} is not row-aligned",
            le.len()
        )));
    }
    let mut rows = Vec::with_capacity(le.len() / 8);
    for w in le.chunks_exact(8) {
        let mut b = [0u8; 8];
        b.copy_from_slice(w);
        rows.push(i64::from_le_bytes(b));
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_round_trip() {
        let rows: Vec<i64> = vec![0, 1, -1, i64::MAX, i64::MIN, 42];
        let enc = encode_i64(&rows, Codec::Raw);
        assert_eq!(enc[0], TAG_RAW);
        assert_eq!(decode_i64(&enc).unwrap(), rows);
    }

    #[test]
    fn test_lz4_round_trip_and_shrink() {
        // Constant columns compress hard; that is the common analytics case.
        let rows: Vec<i64> = vec![7; 4096];
        let enc = encode_i64(&rows, Codec::Lz4);
        assert_eq!(enc[0], TAG_LZ4);
        assert!(enc.len() < rows.len() * 8 / 10);
        assert_eq!(decode_i64(&enc).unwrap(), rows);
    }

    #[test]
    fn test_bad_payloads_rejected() {
        assert!(decode_i64(&[]).is_err());
        assert!(decode_i64(&[9, 1, 2, 3]).is_err());
        // Raw body not a multiple of the row width.
        assert!(decode_i64(&[TAG_RAW, 1, 2, 3]).is_err());
    }
}
