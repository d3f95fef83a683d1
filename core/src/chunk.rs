//! Chunk views: the decoded window over one chunk handed to a map call.
//!
//! A view is either read-only rows (raw bytes for file/blob slices, decoded
//! i64 rows for materialized columns) or a write-once builder for a new
//! chunk that is published when the map call returns.

use bytes::Bytes;

use rill_common::{codec, CommonError, Result};

/// Raw byte rows over one chunk.
#[derive(Debug, Clone)]
pub struct ByteView {
    start: u64,
    data: Bytes,
}

/// Decoded fixed-width i64 rows over one chunk.
#[derive(Debug, Clone)]
pub struct I64View {
    start: u64,
    rows: Vec<i64>,
}

/// Write-once builder for a new chunk of an appendable vector. Rows are
/// pushed during a single map call; the framework closes the builder into
/// the output vector when the call returns.
#[derive(Debug)]
pub struct NewChunk {
    start: u64,
    rows: Vec<i64>,
}

/// A decoded window over one chunk of one vector.
#[derive(Debug)]
pub enum ChunkView {
    Bytes(ByteView),
    I64(I64View),
    New(NewChunk),
}

impl ChunkView {
    pub fn bytes(start: u64, data: Bytes) -> ChunkView {
        ChunkView::Bytes(ByteView { start, data })
    }

    pub fn decode_i64(start: u64, payload: &[u8]) -> Result<ChunkView> {
        Ok(ChunkView::I64(I64View {
            start,
            rows: codec::decode_i64(payload)?,
        }))
    }

    pub fn new_chunk(start: u64) -> ChunkView {
        ChunkView::New(NewChunk {
            start,
            rows: Vec::new(),
        })
    }

    /// Global row index of the first row in this view.
    pub fn start_row(&self) -> u64 {
        match self {
            ChunkView::Bytes(v) => v.start,
            ChunkView::I64(v) => v.start,
            ChunkView::New(v) => v.start,
        }
    }

    /// Rows currently in the view. For a builder this grows as rows are
    /// pushed.
    pub fn len(&self) -> usize {
        match self {
            ChunkView::Bytes(v) => v.data.len(),
            ChunkView::I64(v) => v.rows.len(),
            ChunkView::New(v) => v.rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw rows, when this view is byte-backed.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            ChunkView::Bytes(v) => Some(&v.data),
            _ => None,
        }
    }

    /// Decoded rows, when this view is a materialized column.
    pub fn as_i64s(&self) -> Option<&[i64]> {
        match self {
            ChunkView::I64(v) => Some(&v.rows),
            ChunkView::New(v) => Some(&v.rows),
            _ => None,
        }
    }

    /// Append a row to a builder view.
    pub fn push_i64(&mut self, v: i64) -> Result<()> {
        match self {
            ChunkView::New(nc) => {
                nc.rows.push(v);
                Ok(())
            }
            _ => Err(CommonError::invalid_argument(
                "cannot append to a read-only chunk view",
            )),
        }
    }

    pub(crate) fn into_new(self) -> Option<NewChunk> {
        match self {
            ChunkView::New(nc) => Some(nc),
            _ => None,
        }
    }
}

impl NewChunk {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub(crate) fn rows(&self) -> &[i64] {
        &self.rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rill_common::Codec;

    #[test]
    fn test_byte_view_accessors() {
        let v = ChunkView::bytes(128, Bytes::from_static(b"abcd"));
        assert_eq!(v.start_row(), 128);
        assert_eq!(v.len(), 4);
        assert_eq!(v.as_bytes().unwrap().as_ref(), b"abcd");
        assert!(v.as_i64s().is_none());
    }

    #[test]
    fn test_i64_view_round_trip() {
        let payload = codec::encode_i64(&[5, -6, 7], Codec::Lz4);
        let v = ChunkView::decode_i64(64, &payload).unwrap();
        assert_eq!(v.as_i64s().unwrap(), &[5, -6, 7]);
        assert_eq!(v.len(), 3);
    }

    #[test]
    fn test_builder_accepts_rows_and_readers_reject_them() {
        let mut nc = ChunkView::new_chunk(0);
        nc.push_i64(1).unwrap();
        nc.push_i64(2).unwrap();
        assert_eq!(nc.len(), 2);
        assert_eq!(nc.as_i64s().unwrap(), &[1, 2]);

        let mut ro = ChunkView::bytes(0, Bytes::new());
        assert!(ro.push_i64(1).is_err());
    }
}
