//! A distributed file-backed vector.
//!
//! The vector is a read-only view of a local file; rows are bytes. Chunks
//! are generated lazily: the first touch of chunk `c` publishes a value
//! pointing at the file slice, and a compare-and-swap against the store
//! resolves racing first touches so every reader observes the same value.

use std::path::PathBuf;
use std::sync::Arc;

use rill_common::{CommonError, Result};

use crate::chunk::ChunkView;
use crate::key::{chunk2start_row, elem2chunk_idx, Key, VectorId, CHUNK_SZ, LOG_CHK};
use crate::store::KvStore;
use crate::value::Value;

#[derive(Debug, Clone)]
pub struct FileVec {
    id: VectorId,
    path: PathBuf,
    len: u64,
}

impl FileVec {
    /// Open a file as a vector. The length is fixed at creation.
    pub fn open<P: Into<PathBuf>>(store: &Arc<KvStore>, path: P) -> Result<FileVec> {
        let path = path.into();
        let meta = std::fs::metadata(&path).map_err(|e| {
            CommonError::io_error_with_source(format!("stat {}", path.display()), e)
        })?;
        Ok(FileVec {
            id: store.new_vector_id(),
            path,
            len: meta.len(),
        })
    }

    pub fn length(&self) -> u64 {
        self.len
    }

    pub fn nchunks(&self) -> usize {
        1.max((self.len >> LOG_CHK) as usize)
    }

    pub fn chunk2start_row(&self, cidx: usize) -> u64 {
        chunk2start_row(cidx)
    }

    pub fn chunk_rows(&self, cidx: usize) -> u64 {
        let nc = self.nchunks();
        if cidx < nc - 1 {
            CHUNK_SZ
        } else {
            self.len - self.chunk2start_row(cidx)
        }
    }

    pub fn elem2chunk_idx(&self, row: u64) -> usize {
        debug_assert!(row <= self.len);
        elem2chunk_idx(row, self.nchunks())
    }

    pub fn chunk_key(&self, cidx: usize) -> Key {
        Key::chunk(self.id, cidx)
    }

    /// The stored value for chunk `cidx`, materializing it on first touch.
    /// Touching the returned value forces the file load.
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
        let start = self.chunk2start_row(cidx);
        let len = self.chunk_rows(cidx) as usize;
        let fresh = Value::file(self.path.clone(), start, len);
        // On a race the existing value wins and this one is discarded.
        Ok(store.put_if_match(key, fresh, None))
    }

    pub fn chunk_view(&self, start: u64, cidx: usize, store: &Arc<KvStore>) -> Result<ChunkView> {
        let value = self.chunk_value(store, cidx)?;
        Ok(ChunkView::bytes(start, value.bytes()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn file_of(bytes: usize) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        let row = [0x5au8; 4096];
        let mut left = bytes;
        while left > 0 {
            let n = left.min(row.len());
            f.write_all(&row[..n]).unwrap();
            left -= n;
        }
        f
    }

    #[test]
    fn test_fat_tail_chunk_counts() {
        let store = KvStore::new();
        let sz = CHUNK_SZ as usize;

        // Tiny file: one chunk holding everything.
        let f = file_of(10);
        let v = FileVec::open(&store, f.path()).unwrap();
        assert_eq!(v.nchunks(), 1);
        assert_eq!(v.chunk_rows(0), 10);

        // One full chunk plus a remainder smaller than a chunk: the final
        // chunk goes fat instead of spilling a runt.
        let f = file_of(sz + sz / 2);
        let v = FileVec::open(&store, f.path()).unwrap();
        assert_eq!(v.nchunks(), 1);
        assert_eq!(v.chunk_rows(0), (sz + sz / 2) as u64);

        // Three full chunks and a remainder: last chunk absorbs it.
        let f = file_of(3 * sz + 100);
        let v = FileVec::open(&store, f.path()).unwrap();
        assert_eq!(v.nchunks(), 3);
        assert_eq!(v.chunk_rows(0), CHUNK_SZ);
        assert_eq!(v.chunk_rows(2), CHUNK_SZ + 100);
        assert_eq!(v.length(), (3 * sz + 100) as u64);
    }

    #[test]
    fn test_row_to_chunk_clamps_into_fat_tail() {
        let store = KvStore::new();
        let sz = CHUNK_SZ as usize;
        let f = file_of(2 * sz + 7);
        let v = FileVec::open(&store, f.path()).unwrap();
        assert_eq!(v.nchunks(), 2);
        assert_eq!(v.elem2chunk_idx(0), 0);
        assert_eq!(v.elem2chunk_idx(CHUNK_SZ), 1);
        // Rows inside the fat tail map to the final chunk.
        assert_eq!(v.elem2chunk_idx(2 * CHUNK_SZ + 3), 1);
    }

    #[test]
    fn test_lazy_materialization_and_cas() {
        let store = KvStore::new();
        let f = file_of(CHUNK_SZ as usize * 2);
        let v = FileVec::open(&store, f.path()).unwrap();
        assert_eq!(store.len(), 0);

        let a = v.chunk_value(&store, 1).unwrap();
        let b = v.chunk_value(&store, 1).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(store.len(), 1);
        assert_eq!(a.bytes().unwrap().len(), CHUNK_SZ as usize);
    }

    #[test]
    fn test_concurrent_first_touch_converges() {
        let store = KvStore::new();
        let f = file_of(CHUNK_SZ as usize);
        let v = FileVec::open(&store, f.path()).unwrap();

        let values: Vec<Arc<Value>> = std::thread::scope(|s| {
            (0..8)
                .map(|_| {
                    let store = store.clone();
                    let v = v.clone();
                    s.spawn(move || v.chunk_value(&store, 0).unwrap())
                })
                .collect::<Vec<_>>()
                .into_iter()
                .map(|h| h.join().unwrap())
                .collect()
        });
        let first = values[0].bytes().unwrap();
        for val in &values {
            assert!(Arc::ptr_eq(&values[0], val));
            assert_eq!(val.bytes().unwrap(), first);
        }
    }

    #[test]
    fn test_not_writable() {
        let store = KvStore::new();
        let f = file_of(16);
        let v = crate::vector::Vector::File(FileVec::open(&store, f.path()).unwrap());
        assert!(!v.writable());
        assert!(v.readable());
    }
}
