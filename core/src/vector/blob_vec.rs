//! Object-store backed vectors.
//!
//! A blob vector wraps one large remote object (`s3://bucket/key`) as a
//! chunked byte column. Chunk values are materialized lazily as ranged
//! reads against the object; objects with a header (`.hex` names) shift
//! every chunk offset by the header length. Chunk keys use the legacy
//! arraylet layout so the offset is recoverable from the key alone.

use std::sync::Arc;

use rill_common::{CommonError, Result};

use crate::chunk::ChunkView;
use crate::key::{chunk2start_row, elem2chunk_idx, Key, CHUNK_SZ, LOG_CHK};
use crate::store::KvStore;
use crate::value::Value;

#[derive(Debug, Clone)]
pub struct BlobVec {
    url: String,
    /// Object size in bytes, header included.
    size: u64,
    /// Leading header bytes; all chunk offsets are shifted past it.
    header: u64,
}

impl BlobVec {
    pub fn new(url: String, size: u64, header: u64) -> Result<BlobVec> {
        if header > size {
            return Err(CommonError::invalid_argument(format!(
                "header {} exceeds object size {}",
                header, size
            )));
        }
        Ok(BlobVec { url, size, header })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Rows are the payload bytes past the header.
    pub fn length(&self) -> u64 {
        self.size - self.header
    }

    pub fn nchunks(&self) -> usize {
        1.max((self.length() >> LOG_CHK) as usize)
    }

    pub fn chunk2start_row(&self, cidx: usize) -> u64 {
        chunk2start_row(cidx)
    }

    pub fn chunk_rows(&self, cidx: usize) -> u64 {
        let nc = self.nchunks();
        if cidx < nc - 1 {
            CHUNK_SZ
        } else {
            self.length() - self.chunk2start_row(cidx)
        }
    }

    pub fn elem2chunk_idx(&self, row: u64) -> usize {
        debug_assert!(row <= self.length());
        elem2chunk_idx(row, self.nchunks())
    }

    pub fn chunk_key(&self, cidx: usize) -> Key {
        Key::arraylet(&Key::user(&self.url), cidx)
    }

    /// The stored value for chunk `cidx`, lazily created as a ranged view
    /// of the remote object. Bytes are fetched on first touch of the value.
    pub fn chunk_value(&self, store: &Arc<KvStore>, cidx: usize) -> Result<Arc<Value>> {
        let nc = self.nchunks();
        if cidx >= nc {
            return Err(CommonError::invalid_argument(format!(
                "chunk {} out of range, vector has {} chunks",
                cidx, nc
            )));
        }
        let key = self.chunk_key(cidx);
        if let Some(v) = store.get(&key) {
            return Ok(v);
        }
        let off = self.header + self.chunk2start_row(cidx);
        let len = self.chunk_rows(cidx) as usize;
        let fresh = Value::blob(self.url.clone(), off, len);
        Ok(store.put_if_match(key, fresh, None))
    }

    pub fn chunk_view(&self, start: u64, cidx: usize, store: &Arc<KvStore>) -> Result<ChunkView> {
        let value = self.chunk_value(store, cidx)?;
        Ok(ChunkView::bytes(start, value.bytes()?))
    }
}
