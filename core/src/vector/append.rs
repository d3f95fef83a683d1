//! Appendable output vectors.
//!
//! An appendable vector accumulates write-once chunks while a task runs.
//! Each task clone carries its own bookkeeping of which chunks it wrote
//! and how many rows each holds; clones merge chunk-index-wise as results
//! reduce up the tree, and the root closes the union into a read-only
//! vector. Cross-task sharing is not permitted.

use std::collections::BTreeMap;
use std::sync::Arc;

use rill_common::{codec, Codec, CommonError, Result};

use crate::chunk::NewChunk;
use crate::key::{Key, VectorId};
use crate::store::{Futures, KvStore};
use crate::value::Value;
use crate::vector::DataVec;

#[derive(Debug, Clone)]
pub struct AppendableVec {
    id: VectorId,
    /// Rows written per chunk index by this clone's sub-tree.
    rows_per_chunk: BTreeMap<usize, u64>,
}

impl AppendableVec {
    pub fn new(store: &Arc<KvStore>) -> AppendableVec {
        AppendableVec {
            id: store.new_vector_id(),
            rows_per_chunk: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> VectorId {
        self.id
    }

    /// Rows recorded so far in this clone's sub-tree.
    pub fn length(&self) -> u64 {
        self.rows_per_chunk.values().sum()
    }

    pub fn nchunks(&self) -> usize {
        self.rows_per_chunk.len()
    }

    pub fn chunk_key(&self, cidx: usize) -> Key {
        Key::chunk(self.id, cidx)
    }

    /// Publish a finished builder as chunk `cidx` and record its rows.
    /// Publication runs in the background; completion is gated by `fs`.
    pub(crate) fn close_chunk(
        &mut self,
        cidx: usize,
        nc: NewChunk,
        store: &Arc<KvStore>,
        fs: &mut Futures,
    ) {
        let payload = codec::encode_i64(nc.rows(), Codec::Lz4);
        fs.defer_put(store.clone(), self.chunk_key(cidx), Value::mem(payload));
        let prior = self.rows_per_chunk.insert(cidx, nc.len() as u64);
        debug_assert!(prior.is_none(), "chunk {} written twice", cidx);
    }

    /// Merge another clone's bookkeeping, chunk-index-wise. The chunk sets
    /// are disjoint because every chunk is mapped exactly once.
    pub(crate) fn reduce(&mut self, other: AppendableVec) {
        debug_assert_eq!(self.id, other.id);
        for (cidx, rows) in other.rows_per_chunk {
            let prior = self.rows_per_chunk.insert(cidx, rows);
            debug_assert!(prior.is_none(), "chunk {} reduced twice", cidx);
        }
    }

    /// Finalize into a read-only vector. Requires the accumulated chunks to
    /// be contiguous from zero, which holds once every mapped chunk's
    /// bookkeeping has been reduced in.
    pub fn close(self) -> Result<DataVec> {
        let nchunks = self.rows_per_chunk.len();
        let mut espc = Vec::with_capacity(nchunks + 1);
        let mut total = 0u64;
        for (expect, (&cidx, &rows)) in self.rows_per_chunk.iter().enumerate() {
            if cidx != expect {
                return Err(CommonError::store_error(format!(
                    "appendable vector {:?} missing chunk {}",
                    self.id, expect
                )));
            }
            espc.push(total);
            total += rows;
        }
        espc.push(total);
        if nchunks == 0 {
            // No chunk was ever written; an empty single-chunk vector.
            espc.push(0);
        }
        Ok(DataVec::from_parts(self.id, espc))
    }
}
