//! Keys and chunk addressing.
//!
//! Every value in the store is addressed by an opaque byte key. Chunk keys
//! have a bit-exact layout because they cross the wire: byte 0 is the kind
//! tag, and all multi-byte fields are little-endian, cluster-wide.
//!
//! Layouts:
//! - column chunk:  `[DVEC, 0, vector-id u32, chunk-index u32]`
//! - legacy blob chunk: `[ARRAYLET_CHUNK, 0, chunk-index u32, base key bytes...]`
//! - named value:   `[USER, name bytes...]`

use serde::{Deserialize, Serialize};
use std::fmt;

use rill_common::{CommonError, Result};

use crate::cloud::NodeCtx;

/// Log2 of the chunk size in rows.
pub const LOG_CHK: u32 = 16;
/// Rows per chunk, except the final chunk which absorbs the remainder and
/// may hold up to `2 * CHUNK_SZ - 1` rows.
pub const CHUNK_SZ: u64 = 1 << LOG_CHK;

/// Kind tag for legacy blob-backed array chunks.
pub const ARRAYLET_CHUNK: u8 = 0;
/// Kind tag for column vector chunks.
pub const DVEC: u8 = 1;
/// Kind tag for user-named values (vector headers, blob names).
pub const USER: u8 = 32;

/// Identifier of a vector, embedded in its chunk keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VectorId(pub u32);

/// Opaque byte identifier for a stored value.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Key {
    bytes: Vec<u8>,
}

impl Key {
    /// Key of chunk `cidx` of the given vector.
    pub fn chunk(vec: VectorId, cidx: usize) -> Key {
        let mut bytes = Vec::with_capacity(10);
        bytes.push(DVEC);
        bytes.push(0);
        bytes.extend_from_slice(&vec.0.to_le_bytes());
        bytes.extend_from_slice(&(cidx as u32).to_le_bytes());
        Key { bytes }
    }

    /// Legacy chunk key: chunk `cidx` of the blob named by `base`.
    pub fn arraylet(base: &Key, cidx: usize) -> Key {
        let mut bytes = Vec::with_capacity(6 + base.bytes.len());
        bytes.push(ARRAYLET_CHUNK);
        bytes.push(0);
        bytes.extend_from_slice(&(cidx as u32).to_le_bytes());
        bytes.extend_from_slice(&base.bytes);
        Key { bytes }
    }

    /// Key for a user-named value.
    pub fn user<S: AsRef<[u8]>>(name: S) -> Key {
        let name = name.as_ref();
        let mut bytes = Vec::with_capacity(1 + name.len());
        bytes.push(USER);
        bytes.extend_from_slice(name);
        Key { bytes }
    }

    pub fn kind(&self) -> u8 {
        self.bytes[0]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Chunk index of a `DVEC` or `ARRAYLET_CHUNK` key.
    pub fn chunk_idx(&self) -> Result<usize> {
        let off = match self.kind() {
            DVEC => 6,
            ARRAYLET_CHUNK => 2,
            k => {
                return Err(CommonError::invalid_argument(format!(
                    "key kind {} has no chunk index",
                    k
                )))
            }
        };
        let raw: [u8; 4] = self.bytes[off..off + 4]
            .try_into()
            .map_err(|_| CommonError::invalid_argument("truncated chunk key"))?;
        Ok(u32::from_le_bytes(raw) as usize)
    }

    /// Name of a `USER` key, or the base name of an `ARRAYLET_CHUNK` key.
    pub fn user_name(&self) -> Result<&[u8]> {
        match self.kind() {
            USER => Ok(&self.bytes[1..]),
            ARRAYLET_CHUNK if self.bytes.len() > 6 && self.bytes[6] == USER => Ok(&self.bytes[7..]),
            _ => Err(CommonError::invalid_argument("key carries no name")),
        }
    }

    /// Byte offset into the backing blob addressed by a legacy chunk key.
    pub fn arraylet_offset(&self) -> Result<u64> {
        debug_assert_eq!(self.kind(), ARRAYLET_CHUNK);
        Ok((self.chunk_idx()? as u64) << LOG_CHK)
    }

    /// Node that owns this key's bytes, a fixed deterministic function of
    /// the key so every peer agrees without coordination. Chunk keys
    /// rotate by chunk index, which spreads aligned vectors evenly and
    /// co-locates chunk `i` of every vector; named keys hash.
    pub fn home_node(&self, cloud_size: usize) -> usize {
        match self.kind() {
            DVEC | ARRAYLET_CHUNK => match self.chunk_idx() {
                Ok(cidx) => cidx % cloud_size,
                Err(_) => (fnv1a64(&self.bytes) % cloud_size as u64) as usize,
            },
            _ => (fnv1a64(&self.bytes) % cloud_size as u64) as usize,
        }
    }

    /// True iff this key is homed on the calling node.
    pub fn home(&self, ctx: &NodeCtx) -> bool {
        self.home_node(ctx.cloud_size()) == ctx.idx()
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            DVEC => write!(
                f,
                "Key(dvec v{}c{})",
                u32::from_le_bytes(self.bytes[2..6].try_into().unwrap_or_default()),
                u32::from_le_bytes(self.bytes[6..10].try_into().unwrap_or_default()),
            ),
            ARRAYLET_CHUNK => write!(
                f,
                "Key(arraylet c{} of {})",
                u32::from_le_bytes(self.bytes[2..6].try_into().unwrap_or_default()),
                String::from_utf8_lossy(self.user_name().unwrap_or(b"?")),
            ),
            USER => write!(f, "Key({})", String::from_utf8_lossy(&self.bytes[1..])),
            k => write!(f, "Key(kind {} len {})", k, self.bytes.len()),
        }
    }
}

/// Row index to chunk index for a uniformly chunked vector. The clamp to
/// the final chunk realizes the fat-tail rule.
pub fn elem2chunk_idx(row: u64, nchunks: usize) -> usize {
    let cidx = (row >> LOG_CHK) as usize;
    cidx.min(nchunks - 1)
}

/// Chunk index to starting row for a uniformly chunked vector.
pub fn chunk2start_row(cidx: usize) -> u64 {
    (cidx as u64) << LOG_CHK
}

/// FNV-1a, 64 bit. Stable across platforms so chunk homing agrees
/// cluster-wide.
fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        h ^= b as u64;
        h = h.wrapping_mul(0x100_0000_01b3);
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_key_layout() {
        let k = Key::chunk(VectorId(0x01020304), 7);
        assert_eq!(k.kind(), DVEC);
        // Little-endian vector id then chunk index at fixed offsets.
        assert_eq!(&k.as_bytes()[2..6], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&k.as_bytes()[6..10], &[7, 0, 0, 0]);
        assert_eq!(k.chunk_idx().unwrap(), 7);
    }

    #[test]
    fn test_arraylet_key_carries_base_and_offset() {
        let base = Key::user("s3://bkt/data.bin");
        let k = Key::arraylet(&base, 3);
        assert_eq!(k.kind(), ARRAYLET_CHUNK);
        assert_eq!(k.chunk_idx().unwrap(), 3);
        assert_eq!(k.user_name().unwrap(), b"s3://bkt/data.bin");
        assert_eq!(k.arraylet_offset().unwrap(), 3 * CHUNK_SZ);
    }

    #[test]
    fn test_chunk_homes_rotate_evenly() {
        let mut counts = [0usize; 4];
        for c in 0..16 {
            let k = Key::chunk(VectorId(9), c);
            counts[k.home_node(4)] += 1;
        }
        assert_eq!(counts, [4, 4, 4, 4]);
        // Aligned vectors co-locate chunk i regardless of vector id.
        assert_eq!(
            Key::chunk(VectorId(1), 5).home_node(4),
            Key::chunk(VectorId(2), 5).home_node(4)
        );
    }

    #[test]
    fn test_named_key_homes_are_deterministic_and_in_range() {
        for name in ["a", "s3://bkt/obj", "another-name"] {
            let k = Key::user(name);
            let h = k.home_node(5);
            assert!(h < 5);
            assert_eq!(h, k.home_node(5));
        }
    }

    #[test]
    fn test_fat_tail_clamp() {
        // A vector of 5 chunks: rows past the uniform boundary of the last
        // chunk still map to it.
        assert_eq!(elem2chunk_idx(0, 5), 0);
        assert_eq!(elem2chunk_idx(CHUNK_SZ - 1, 5), 0);
        assert_eq!(elem2chunk_idx(CHUNK_SZ, 5), 1);
        assert_eq!(elem2chunk_idx(5 * CHUNK_SZ - 1, 5), 4);
        assert_eq!(elem2chunk_idx(6 * CHUNK_SZ - 1, 5), 4);
        assert_eq!(chunk2start_row(4), 4 * CHUNK_SZ);
    }

    #[test]
    fn test_non_chunk_key_has_no_index() {
        assert!(Key::user("plain").chunk_idx().is_err());
    }
}
