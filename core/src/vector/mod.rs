//! Column vectors: immutable logical columns partitioned into chunks.
//!
//! A vector is one of four kinds: a read-only local file, a read-only
//! object-store blob, a materialized read-only column, or an appendable
//! output assembled during a task. Chunks are uniformly sized in rows
//! except the final chunk, which absorbs the remainder (the fat tail) and
//! may hold up to `2 * CHUNK_SZ - 1` rows.

mod append;
mod blob_vec;
mod data_vec;
mod file_vec;

pub use append::AppendableVec;
pub use blob_vec::BlobVec;
pub use data_vec::DataVec;
pub use file_vec::FileVec;

use std::sync::Arc;

use rill_common::{CommonError, Result};

use crate::chunk::ChunkView;
use crate::key::Key;
use crate::store::KvStore;

/// A column vector handle. Clones are cheap and clones of an appendable
/// vector carry independent bookkeeping that is merged chunk-index-wise
/// when task results reduce.
#[derive(Debug, Clone)]
pub enum Vector {
    File(FileVec),
    Blob(BlobVec),
    Data(DataVec),
    Appendable(AppendableVec),
}

impl Vector {
    /// Total rows.
    pub fn length(&self) -> u64 {
        match self {
            Vector::File(v) => v.length(),
            Vector::Blob(v) => v.length(),
            Vector::Data(v) => v.length(),
            Vector::Appendable(v) => v.length(),
        }
    }

    pub fn nchunks(&self) -> usize {
        match self {
            Vector::File(v) => v.nchunks(),
            Vector::Blob(v) => v.nchunks(),
            Vector::Data(v) => v.nchunks(),
            Vector::Appendable(v) => v.nchunks(),
        }
    }

    /// Only appendable outputs accept writes.
    pub fn writable(&self) -> bool {
        matches!(self, Vector::Appendable(_))
    }

    /// True once the vector's metadata is published; appendable vectors
    /// become readable only after `close`.
    pub fn readable(&self) -> bool {
        !matches!(self, Vector::Appendable(_))
    }

    pub fn chunk2start_row(&self, cidx: usize) -> u64 {
        match self {
            Vector::File(v) => v.chunk2start_row(cidx),
            Vector::Blob(v) => v.chunk2start_row(cidx),
            Vector::Data(v) => v.chunk2start_row(cidx),
            Vector::Appendable(_) => 0,
        }
    }

    /// Rows in chunk `cidx`; the final chunk may exceed `CHUNK_SZ`.
    pub fn chunk_rows(&self, cidx: usize) -> u64 {
        match self {
            Vector::File(v) => v.chunk_rows(cidx),
            Vector::Blob(v) => v.chunk_rows(cidx),
            Vector::Data(v) => v.chunk_rows(cidx),
            Vector::Appendable(_) => 0,
        }
    }

    pub fn elem2chunk_idx(&self, row: u64) -> usize {
        match self {
            Vector::File(v) => v.elem2chunk_idx(row),
            Vector::Blob(v) => v.elem2chunk_idx(row),
            Vector::Data(v) => v.elem2chunk_idx(row),
            Vector::Appendable(_) => 0,
        }
    }

    pub fn chunk_key(&self, cidx: usize) -> Key {
        match self {
            Vector::File(v) => v.chunk_key(cidx),
            Vector::Blob(v) => v.chunk_key(cidx),
            Vector::Data(v) => v.chunk_key(cidx),
            Vector::Appendable(v) => v.chunk_key(cidx),
        }
    }

    /// Inverse of `chunk_key`.
    pub fn chunk_idx(&self, key: &Key) -> Result<usize> {
        key.chunk_idx()
    }

    /// Decode a view over chunk `cidx` starting at global row `start`.
    /// For an appendable vector this is a write-once builder.
    pub fn chunk_view(&self, start: u64, cidx: usize, store: &Arc<KvStore>) -> Result<ChunkView> {
        match self {
            Vector::File(v) => v.chunk_view(start, cidx, store),
            Vector::Blob(v) => v.chunk_view(start, cidx, store),
            Vector::Data(v) => v.chunk_view(start, cidx, store),
            Vector::Appendable(_) => Ok(ChunkView::new_chunk(start)),
        }
    }

    pub(crate) fn as_appendable_mut(&mut self) -> Option<&mut AppendableVec> {
        match self {
            Vector::Appendable(v) => Some(v),
            _ => None,
        }
    }

    pub(crate) fn into_appendable(self) -> Option<AppendableVec> {
        match self {
            Vector::Appendable(v) => Some(v),
            _ => None,
        }
    }

    /// Finalize an appendable vector into its read-only form in place.
    /// Read-only vectors are untouched.
    pub(crate) fn close_in_place(&mut self) -> Result<()> {
        if let Vector::Appendable(av) = self {
            *self = Vector::Data(av.clone().close()?);
        }
        Ok(())
    }
}

/// Check that a set of input vectors share chunk boundaries: same number of
/// chunks and the same starting row for every chunk. Appendable vectors are
/// outputs and exempt. Returns the index of the first readable vector,
/// which gates all addressing for the task.
pub fn check_compatible(vecs: &[Vector]) -> Result<usize> {
    let v0_idx = vecs
        .iter()
        .position(|v| v.readable())
        .ok_or_else(|| CommonError::invalid_argument("no readable input vector"))?;
    let v0 = &vecs[v0_idx];
    let nchunks = v0.nchunks();
    for v in vecs {
        if !v.readable() {
            continue;
        }
        if v.nchunks() != nchunks {
            return Err(CommonError::invalid_argument(format!(
                "vectors have different numbers of chunks, {} and {}",
                nchunks,
                v.nchunks()
            )));
        }
        for i in 0..nchunks {
            if v.chunk2start_row(i) != v0.chunk2start_row(i) {
                return Err(CommonError::invalid_argument(format!(
                    "vector chunks have different numbers of rows at chunk {}: {} and {}",
                    i,
                    v0.chunk2start_row(i),
                    v.chunk2start_row(i)
                )));
            }
        }
    }
    Ok(v0_idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::CHUNK_SZ;

    #[test]
    fn test_check_compatible_accepts_aligned_and_appendable() {
        let store = KvStore::new();
        let a = DataVec::from_i64s(&store, &vec![1i64; 3 * CHUNK_SZ as usize]).unwrap();
        let b = DataVec::from_i64s(&store, &vec![2i64; 3 * CHUNK_SZ as usize]).unwrap();
        let out = AppendableVec::new(&store);
        let vecs = vec![
            Vector::Data(a),
            Vector::Data(b),
            Vector::Appendable(out),
        ];
        assert_eq!(check_compatible(&vecs).unwrap(), 0);
    }

    #[test]
    fn test_check_compatible_rejects_chunk_count_mismatch() {
        let store = KvStore::new();
        let a = DataVec::from_i64s(&store, &vec![1i64; 3 * CHUNK_SZ as usize]).unwrap();
        let b = DataVec::from_i64s(&store, &vec![1i64; 5 * CHUNK_SZ as usize]).unwrap();
        let err = check_compatible(&[Vector::Data(a), Vector::Data(b)]).unwrap_err();
        assert!(matches!(err, CommonError::InvalidArgument { .. }));
    }

    #[test]
    fn test_check_compatible_requires_a_readable_vector() {
        let store = KvStore::new();
        let out = AppendableVec::new(&store);
        assert!(check_compatible(&[Vector::Appendable(out)]).is_err());
    }
}
