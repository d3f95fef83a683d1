//! Materialized read-only vectors.
//!
//! A data vector's chunks are published i64 columns in the store. Chunk
//! boundaries are carried as a start-row table (`espc`), so the usual
//! uniform shift math and the variable row counts produced by appendable
//! outputs are both served; row-to-chunk lookup is a binary search over
//! the table.

use std::sync::Arc;

use rill_common::{codec, Codec, CommonError, Result};

use crate::chunk::ChunkView;
use crate::key::{Key, VectorId, CHUNK_SZ, LOG_CHK};
use crate::store::KvStore;
use crate::value::Value;

#[derive(Debug, Clone)]
pub struct DataVec {
    id: VectorId,
    /// Start row of each chunk plus a trailing total-row sentinel;
    /// `espc.len() == nchunks + 1`.
    espc: Arc<Vec<u64>>,
}

impl DataVec {
    pub(crate) fn from_parts(id: VectorId, espc: Vec<u64>) -> DataVec {
        debug_assert!(espc.len() >= 2);
        debug_assert!(espc.windows(2).all(|w| w[0] <= w[1]));
        DataVec {
            id,
            espc: Arc::new(espc),
        }
    }

    /// Materialize rows into a vector with uniform chunking: `CHUNK_SZ`
    /// rows per chunk, the final chunk absorbing the remainder.
    pub fn from_i64s(store: &Arc<KvStore>, rows: &[i64]) -> Result<DataVec> {
        let n = rows.len() as u64;
        let nchunks = 1.max((n >> LOG_CHK) as usize);
        let id = store.new_vector_id();
        let mut espc = Vec::with_capacity(nchunks + 1);
        for c in 0..nchunks {
            espc.push((c as u64) << LOG_CHK);
        }
        espc.push(n);
        for c in 0..nchunks {
            let lo = espc[c] as usize;
            let hi = espc[c + 1] as usize;
            let payload = codec::encode_i64(&rows[lo..hi], Codec::Lz4);
            store.put(Key::chunk(id, c), Value::mem(payload));
        }
        Ok(DataVec::from_parts(id, espc))
    }

    pub fn id(&self) -> VectorId {
        self.id
    }

    pub fn length(&self) -> u64 {
        *self.espc.last().unwrap_or(&0)
    }

    pub fn nchunks(&self) -> usize {
        self.espc.len() - 1
    }

    pub fn chunk2start_row(&self, cidx: usize) -> u64 {
        self.espc[cidx]
    }

    pub fn chunk_rows(&self, cidx: usize) -> u64 {
        self.espc[cidx + 1] - self.espc[cidx]
    }

    /// Row to chunk index. Uniform chunking would be shift-and-clamp math;
    /// the start-row table makes this a binary search with the same result.
    pub fn elem2chunk_idx(&self, row: u64) -> usize {
        debug_assert!(row <= self.length());
        let nc = self.nchunks();
        let cidx = self.espc.partition_point(|&s| s <= row).saturating_sub(1);
        cidx.min(nc - 1)
    }

    pub fn chunk_key(&self, cidx: usize) -> Key {
        Key::chunk(self.id, cidx)
    }

    pub fn chunk_view(&self, start: u64, cidx: usize, store: &Arc<KvStore>) -> Result<ChunkView> {
        let key = self.chunk_key(cidx);
        let value = store
            .get(&key)
            .ok_or_else(|| CommonError::store_error(format!("missing chunk {:?}", key)))?;
        ChunkView::decode_i64(start, &value.bytes()?)
    }

    /// Read one row, resolving the owning chunk through the store. Meant
    /// for verification and small reads, not bulk access.
    pub fn at(&self, store: &Arc<KvStore>, row: u64) -> Result<i64> {
        let cidx = self.elem2chunk_idx(row);
        let start = self.chunk2start_row(cidx);
        let view = self.chunk_view(start, cidx, store)?;
        let rows = view
            .as_i64s()
            .ok_or_else(|| CommonError::store_error("chunk is not an i64 column"))?;
        rows.get((row - start) as usize).copied().ok_or_else(|| {
            CommonError::invalid_argument(format!("row {} out of range", row))
        })
    }

    /// True when chunks hold `CHUNK_SZ` rows apiece with a fat tail, the
    /// shape produced by `from_i64s`.
    pub fn uniform(&self) -> bool {
        let nc = self.nchunks();
        (0..nc).all(|c| self.espc[c] == (c as u64) * CHUNK_SZ)
    }
}
