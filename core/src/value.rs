//! Stored values: a chunk's bytes plus where they come from.
//!
//! A `Value` may be born with its bytes in memory, or point at a slice of a
//! local file or a remote blob. Backed values load lazily on first read and
//! memoize the result, so publishing a file-backed vector costs nothing
//! until a chunk is actually touched.

use bytes::Bytes;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::OnceLock;

use rill_common::{CommonError, Result};

use crate::persist;

/// Where a value's bytes live until they are loaded.
#[derive(Debug, Clone)]
pub enum ValueSource {
    /// Bytes already in memory.
    Mem(Bytes),
    /// A slice of a local file.
    File { path: PathBuf, off: u64 },
    /// A ranged read of a remote blob, `url` in `s3://bucket/key` form.
    Blob { url: String, off: u64 },
}

/// One stored chunk: length, backing source, and the memoized bytes.
#[derive(Debug)]
pub struct Value {
    len: usize,
    source: ValueSource,
    loaded: OnceLock<Bytes>,
}

impl Value {
    pub fn mem(bytes: Bytes) -> Value {
        let len = bytes.len();
        Value {
            len,
            source: ValueSource::Mem(bytes),
            loaded: OnceLock::new(),
        }
    }

    pub fn file(path: PathBuf, off: u64, len: usize) -> Value {
        Value {
            len,
            source: ValueSource::File { path, off },
            loaded: OnceLock::new(),
        }
    }

    pub fn blob(url: String, off: u64, len: usize) -> Value {
        Value {
            len,
            source: ValueSource::Blob { url, off },
            loaded: OnceLock::new(),
        }
    }

    /// Byte length, known without loading.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn source(&self) -> &ValueSource {
        &self.source
    }

    /// The value's bytes, loading from the backing source on first touch.
    /// Racing loaders may both read the backing store; one result is kept.
    pub fn bytes(&self) -> Result<Bytes> {
        if let Some(b) = self.loaded.get() {
            return Ok(b.clone());
        }
        let fresh = self.load()?;
        Ok(self.loaded.get_or_init(|| fresh).clone())
    }

    fn load(&self) -> Result<Bytes> {
        match &self.source {
            ValueSource::Mem(b) => Ok(b.clone()),
            ValueSource::File { path, off } => {
                let mut f = std::fs::File::open(path).map_err(|e| {
                    CommonError::io_error_with_source(format!("open {}", path.display()), e)
                })?;
                f.seek(SeekFrom::Start(*off)).map_err(|e| {
                    CommonError::io_error_with_source(format!("seek {}", path.display()), e)
                })?;
                let mut buf = vec![0u8; self.len];
                f.read_exact(&mut buf).map_err(|e| {
                    CommonError::io_error_with_source(
                        format!("read {} bytes at {} from {}", self.len, off, path.display()),
                        e,
                    )
                })?;
                Ok(Bytes::from(buf))
            }
            ValueSource::Blob { url, off } => persist::s3::fetch_blocking(url, *off, self.len, None),
        }
    }
}
