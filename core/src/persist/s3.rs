//! Object-store persistence backend.
//!
//! Whole vectors are stored and retrieved against a remote object store
//! addressed as `s3://bucket/key`; chunk reads map to ranged GETs. S3
//! likes to reset connections when hit hard, so reads silently retry
//! end-of-stream and timeout failures with a short backoff; other I/O
//! errors are retried a bounded number of times with exponential backoff
//! before propagating.

use std::ops::Range;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use thiserror::Error;
use tracing::{debug, warn};

use rill_common::{CommonError, Result};

use crate::cloud::NodeCtx;
use crate::key::{Key, ARRAYLET_CHUNK, CHUNK_SZ};
use crate::persist::ProgressMonitor;
use crate::store::KvStore;
use crate::value::Value;
use crate::vector::{BlobVec, Vector};

const KEY_PREFIX: &str = "s3://";
/// Objects with this name suffix carry a header; chunk offsets shift past
/// it. The header's total length is the object's first 8 bytes,
/// little-endian, the length field included.
const HEX_SUFFIX: &str = ".hex";

/// Bounded-retry attempt count for non-transient I/O errors.
const DEFAULT_RETRIES: u32 = 3;
/// Backoff before retrying a reset or timed-out connection.
const RESET_BACKOFF: Duration = Duration::from_millis(500);

/// Socket timeout in milliseconds, read at client construction.
pub const S3_SOCKET_TIMEOUT_ENV: &str = "RILL_S3_SOCKET_TIMEOUT_MS";
/// Connection timeout in milliseconds.
pub const S3_CONNECTION_TIMEOUT_ENV: &str = "RILL_S3_CONNECTION_TIMEOUT_MS";
/// Maximum SDK-level error retries.
pub const S3_MAX_ERROR_RETRY_ENV: &str = "RILL_S3_MAX_ERROR_RETRY";
/// Maximum pooled HTTP connections per host.
pub const S3_MAX_HTTP_CONNECTIONS_ENV: &str = "RILL_S3_MAX_HTTP_CONNECTIONS";

/// Classified blob I/O failure; the class drives the retry policy.
#[derive(Debug, Error)]
pub enum BlobIoError {
    #[error("unexpected end of stream")]
    Eof,
    #[error("timed out")]
    Timeout,
    #[error("object not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The narrow seam the backend consumes: sized objects and ranged reads.
/// Production wires this to an object store; tests inject fault-carrying
/// sources.
#[async_trait]
pub trait BlobSource: Send + Sync + std::fmt::Debug {
    async fn size(&self, bucket: &str, key: &str) -> std::result::Result<u64, BlobIoError>;

    async fn get_range(
        &self,
        bucket: &str,
        key: &str,
        range: Range<u64>,
    ) -> std::result::Result<Bytes, BlobIoError>;

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: Bytes,
    ) -> std::result::Result<(), BlobIoError>;
}

/// `BlobSource` over any `object_store` backend, with bucket names mapped
/// to leading path segments.
#[derive(Debug)]
pub struct ObjectStoreSource {
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreSource {
    pub fn new(store: Arc<dyn ObjectStore>) -> ObjectStoreSource {
        ObjectStoreSource { store }
    }

    fn path(bucket: &str, key: &str) -> ObjectPath {
        ObjectPath::from(format!("{}/{}", bucket, key))
    }
}

fn classify(e: object_store::Error) -> BlobIoError {
    if let object_store::Error::NotFound { path, .. } = &e {
        return BlobIoError::NotFound(path.clone());
    }
    let msg = e.to_string().to_lowercase();
    if msg.contains("timed out") || msg.contains("timeout") {
        BlobIoError::Timeout
    } else if msg.contains("eof") || msg.contains("end of file") || msg.contains("reset") {
        BlobIoError::Eof
    } else {
        BlobIoError::Other(e.into())
    }
}

#[async_trait]
impl BlobSource for ObjectStoreSource {
    async fn size(&self, bucket: &str, key: &str) -> std::result::Result<u64, BlobIoError> {
        let meta = self
            .store
            .head(&Self::path(bucket, key))
            .await
            .map_err(classify)?;
        Ok(meta.size as u64)
    }

    async fn get_range(
        &self,
        bucket: &str,
        key: &str,
        range: Range<u64>,
    ) -> std::result::Result<Bytes, BlobIoError> {
        self.store
            .get_range(
                &Self::path(bucket, key),
                range.start as usize..range.end as usize,
            )
            .await
            .map_err(classify)
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: Bytes,
    ) -> std::result::Result<(), BlobIoError> {
        self.store
            .put(&Self::path(bucket, key), PutPayload::from(bytes))
            .await
            .map_err(classify)?;
        Ok(())
    }
}

static CLIENT: OnceLock<Arc<dyn BlobSource>> = OnceLock::new();

/// Install the process-wide blob client. The first install wins; the
/// lifecycle is init-once with no teardown. Returns false if a client was
/// already installed.
pub fn install_client(source: Arc<dyn BlobSource>) -> bool {
    CLIENT.set(source).is_ok()
}

/// The process-wide blob client, constructed lazily. With the `aws`
/// feature the default client targets S3 with tunables read from the
/// environment; otherwise a client must have been installed.
pub fn client() -> Result<Arc<dyn BlobSource>> {
    if let Some(c) = CLIENT.get() {
        return Ok(c.clone());
    }
    default_client()
}

#[cfg(feature = "aws")]
fn default_client() -> Result<Arc<dyn BlobSource>> {
    Ok(CLIENT
        .get_or_init(|| Arc::new(aws::S3Source::from_env()))
        .clone())
}

#[cfg(not(feature = "aws"))]
fn default_client() -> Result<Arc<dyn BlobSource>> {
    Err(CommonError::io_error(
        "no blob client installed; enable the `aws` feature or install one",
    ))
}

#[cfg(feature = "aws")]
mod aws {
    use super::*;
    use dashmap::DashMap;
    use object_store::aws::AmazonS3Builder;
    use object_store::{ClientOptions, RetryConfig};

    /// S3-backed blob source with one lazily built client per bucket.
    #[derive(Debug, Default)]
    pub struct S3Source {
        stores: DashMap<String, Arc<dyn ObjectStore>>,
    }

    impl S3Source {
        pub fn from_env() -> S3Source {
            S3Source::default()
        }

        fn store_for(&self, bucket: &str) -> std::result::Result<Arc<dyn ObjectStore>, BlobIoError> {
            if let Some(s) = self.stores.get(bucket) {
                return Ok(s.clone());
            }
            let store: Arc<dyn ObjectStore> = Arc::new(
                AmazonS3Builder::from_env()
                    .with_bucket_name(bucket)
                    .with_client_options(client_options())
                    .with_retry(retry_config())
                    .build()
                    .map_err(|e| BlobIoError::Other(e.into()))?,
            );
            self.stores.insert(bucket.to_string(), store.clone());
            Ok(store)
        }
    }

    fn env_u64(name: &str) -> Option<u64> {
        std::env::var(name).ok()?.parse().ok()
    }

    fn client_options() -> ClientOptions {
        let mut opts = ClientOptions::new();
        if let Some(ms) = env_u64(S3_SOCKET_TIMEOUT_ENV) {
            opts = opts.with_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = env_u64(S3_CONNECTION_TIMEOUT_ENV) {
            opts = opts.with_connect_timeout(Duration::from_millis(ms));
        }
        if let Some(n) = env_u64(S3_MAX_HTTP_CONNECTIONS_ENV) {
            opts = opts.with_pool_max_idle_per_host(n as usize);
        }
        opts
    }

    fn retry_config() -> RetryConfig {
        let mut cfg = RetryConfig::default();
        if let Some(n) = env_u64(S3_MAX_ERROR_RETRY_ENV) {
            cfg.max_retries = n as usize;
        }
        cfg
    }

    #[async_trait]
    impl BlobSource for S3Source {
        async fn size(&self, bucket: &str, key: &str) -> std::result::Result<u64, BlobIoError> {
            let store = self.store_for(bucket)?;
            let meta = store
                .head(&ObjectPath::from(key))
                .await
                .map_err(classify)?;
            Ok(meta.size as u64)
        }

        async fn get_range(
            &self,
            bucket: &str,
            key: &str,
            range: Range<u64>,
        ) -> std::result::Result<Bytes, BlobIoError> {
            let store = self.store_for(bucket)?;
            store
                .get_range(
                    &ObjectPath::from(key),
                    range.start as usize..range.end as usize,
                )
                .await
                .map_err(classify)
        }

        async fn put(
            &self,
            bucket: &str,
            key: &str,
            bytes: Bytes,
        ) -> std::result::Result<(), BlobIoError> {
            let store = self.store_for(bucket)?;
            store
                .put(&ObjectPath::from(key), PutPayload::from(bytes))
                .await
                .map_err(classify)?;
            Ok(())
        }
    }
}

/// Encode an S3 bucket/key pair as a store key. Encoding and decoding are
/// a bijection, checked in debug builds.
pub fn encode_key(bucket: &str, key: &str) -> Key {
    let res = encode_key_impl(bucket, key);
    debug_assert!(check_bijection(&res, bucket, key));
    res
}

/// Decode a store key back to its S3 bucket and key names.
pub fn decode_key(k: &Key) -> Result<(String, String)> {
    let (bucket, key) = decode_key_impl(k)?;
    debug_assert!(check_bijection(k, &bucket, &key));
    Ok((bucket, key))
}

fn encode_key_impl(bucket: &str, key: &str) -> Key {
    Key::user(format!("{}{}/{}", KEY_PREFIX, bucket, key))
}

fn decode_key_impl(k: &Key) -> Result<(String, String)> {
    let name = std::str::from_utf8(k.user_name()?)
        .map_err(|_| CommonError::invalid_argument("s3 key is not utf-8"))?;
    let rest = name.strip_prefix(KEY_PREFIX).ok_or_else(|| {
        CommonError::invalid_argument(format!("attempting to decode non-s3 key: {}", name))
    })?;
    let dlm = rest
        .find('/')
        .ok_or_else(|| CommonError::invalid_argument(format!("s3 key has no bucket: {}", name)))?;
    Ok((rest[..dlm].to_string(), rest[dlm + 1..].to_string()))
}

fn check_bijection(k: &Key, bucket: &str, key: &str) -> bool {
    let en = encode_key_impl(bucket, key);
    let de = decode_key_impl(k);
    matches!(de, Ok((b, s)) if en == *k && b == bucket && s == key)
}

/// What a blob loads as: large objects wrap as chunked vectors, smaller
/// blobs as a single lazily fetched value.
#[derive(Debug)]
pub enum Loaded {
    Vector(Vector),
    Value(Arc<Value>),
}

/// Load an object's metadata and register it: `.hex` objects become
/// header-shifted vectors, objects of at least two chunks become chunked
/// vectors, and anything smaller a single value in the store.
pub async fn load_key(
    source: &Arc<dyn BlobSource>,
    store: &Arc<KvStore>,
    bucket: &str,
    key: &str,
) -> Result<(Key, Loaded)> {
    let k = encode_key(bucket, key);
    let url = format!("{}{}/{}", KEY_PREFIX, bucket, key);
    let size = source.size(bucket, key).await.map_err(to_common)?;
    let loaded = if key.ends_with(HEX_SUFFIX) {
        let h = read_header_len(source, bucket, key, size).await?;
        Loaded::Vector(Vector::Blob(BlobVec::new(url, size, h)?))
    } else if size >= 2 * CHUNK_SZ {
        Loaded::Vector(Vector::Blob(BlobVec::new(url, size, 0)?))
    } else {
        let val = store.put(k.clone(), Value::blob(url, 0, size as usize));
        Loaded::Value(val)
    };
    debug!(bucket, key, size, "loaded s3 object");
    Ok((k, loaded))
}

async fn read_header_len(
    source: &Arc<dyn BlobSource>,
    bucket: &str,
    key: &str,
    size: u64,
) -> Result<u64> {
    if size < 8 {
        return Err(CommonError::invalid_argument(format!(
            "object {} too small to carry a header",
            key
        )));
    }
    let raw = source
        .get_range(bucket, key, 0..8)
        .await
        .map_err(to_common)?;
    let bytes: [u8; 8] = raw[..8]
        .try_into()
        .map_err(|_| CommonError::io_error("short header read"))?;
    let h = u64::from_le_bytes(bytes);
    if h < 8 || h > size {
        return Err(CommonError::invalid_argument(format!(
            "object {} header length {} out of range",
            key, h
        )));
    }
    Ok(h)
}

/// Lazily create the value for a legacy blob chunk key. Returns `None` for
/// a would-be trailing chunk whose remainder is smaller than `CHUNK_SZ` at
/// a non-zero offset: the previous chunk went fat and swallowed it.
pub async fn lazy_chunk(source: &Arc<dyn BlobSource>, key: &Key) -> Result<Option<Value>> {
    let (bucket, name) = decode_key(key)?;
    let off = key.arraylet_offset()?;
    let size = source.size(&bucket, &name).await.map_err(to_common)?;
    let header = if name.ends_with(HEX_SUFFIX) {
        read_header_len(source, &bucket, &name, size).await?
    } else {
        0
    };
    let rem = (size as i64) - (header as i64) - (off as i64);
    if rem < CHUNK_SZ as i64 && off > 0 {
        return Ok(None);
    }
    let sz = if rem >= 2 * CHUNK_SZ as i64 {
        CHUNK_SZ
    } else {
        rem.max(0) as u64
    };
    let url = format!("{}{}/{}", KEY_PREFIX, bucket, name);
    Ok(Some(Value::blob(url, header + off, sz as usize)))
}

/// Store a whole value as an object. Chunk slices are never stored; only
/// the node homing the key uploads, so a cluster-wide sweep writes each
/// object once.
pub async fn store_blob(
    source: &Arc<dyn BlobSource>,
    ctx: &NodeCtx,
    key: &Key,
    value: &Value,
) -> Result<()> {
    if !key.home(ctx) {
        return Ok(());
    }
    if key.kind() == ARRAYLET_CHUNK {
        return Err(CommonError::invalid_argument(
            "blob chunks are not stored individually",
        ));
    }
    let (bucket, name) = decode_key(key)?;
    source
        .put(&bucket, &name, value.bytes()?)
        .await
        .map_err(to_common)
}

fn to_common(e: BlobIoError) -> CommonError {
    match e {
        BlobIoError::NotFound(p) => CommonError::io_error(format!("object not found: {}", p)),
        other => CommonError::io_error_with_source("blob read failed", other),
    }
}

/// Fetch a byte range with the full retry policy. Connection resets and
/// timeouts wait briefly and go again; other I/O errors back off
/// exponentially for a bounded number of attempts.
pub async fn fetch(
    source: &Arc<dyn BlobSource>,
    bucket: &str,
    key: &str,
    off: u64,
    len: usize,
    pmon: Option<&dyn ProgressMonitor>,
) -> Result<Bytes> {
    let range = off..off + len as u64;
    let mut attempts = 0u32;
    loop {
        match source.get_range(bucket, key, range.clone()).await {
            Ok(b) if b.len() == len => {
                if let Some(p) = pmon {
                    p.update(b.len() as u64);
                }
                return Ok(b);
            }
            Ok(b) => {
                return Err(CommonError::io_error(format!(
                    "short range read: wanted {} bytes, got {}",
                    len,
                    b.len()
                )))
            }
            Err(BlobIoError::Eof) | Err(BlobIoError::Timeout) => {
                debug!(bucket, key, off, "hit the S3 reset problem, waiting and retrying");
                tokio::time::sleep(RESET_BACKOFF).await;
            }
            Err(BlobIoError::NotFound(p)) => {
                return Err(CommonError::io_error(format!("object not found: {}", p)))
            }
            Err(e) => {
                attempts += 1;
                if attempts > DEFAULT_RETRIES {
                    return Err(CommonError::io_error_with_source(
                        format!("range read of {}/{} failed after retries", bucket, key),
                        e,
                    ));
                }
                warn!(bucket, key, attempts, "retrying blob read: {}", e);
                tokio::time::sleep(Duration::from_millis(256u64 << attempts)).await;
            }
        }
    }
}

/// Synchronous fetch for chunk fault-in from pool threads. Runs on a
/// dedicated I/O runtime so callers never block inside the async executor.
pub(crate) fn fetch_blocking(
    url: &str,
    off: u64,
    len: usize,
    pmon: Option<&dyn ProgressMonitor>,
) -> Result<Bytes> {
    let key = Key::user(url);
    let (bucket, name) = decode_key(&key)?;
    let source = client()?;
    io_runtime().block_on(fetch(&source, &bucket, &name, off, len, pmon))
}

fn io_runtime() -> &'static tokio::runtime::Runtime {
    static RT: OnceLock<tokio::runtime::Runtime> = OnceLock::new();
    RT.get_or_init(|| {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("blob io runtime")
    })
}

/// Streaming reader over one object, `[off, end)`. Each read issues its
/// own ranged request, so a retry transparently reopens the stream at the
/// carried offset. Forward-only: there is no mark/reset.
pub struct BlobReader {
    source: Arc<dyn BlobSource>,
    bucket: String,
    key: String,
    off: u64,
    end: u64,
    retries: u32,
    pmon: Option<Arc<dyn ProgressMonitor>>,
}

impl BlobReader {
    /// Open a reader over `[from, to)`, clamped to the object's size.
    pub async fn open(
        source: Arc<dyn BlobSource>,
        k: &Key,
        pmon: Option<Arc<dyn ProgressMonitor>>,
        from: u64,
        to: u64,
    ) -> Result<BlobReader> {
        let (bucket, key) = decode_key(k)?;
        let size = source.size(&bucket, &key).await.map_err(to_common)?;
        Ok(BlobReader {
            source,
            bucket,
            key,
            off: from,
            end: to.min(size),
            retries: DEFAULT_RETRIES,
            pmon,
        })
    }

    /// Current absolute offset; carried across retries.
    pub fn offset(&self) -> u64 {
        self.off
    }

    /// Bytes left to read.
    pub fn available(&self) -> u64 {
        self.end.saturating_sub(self.off)
    }

    /// Read up to `buf.len()` bytes; 0 at end of range.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() || self.off >= self.end {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(self.end - self.off);
        let mut attempt = 0u32;
        loop {
            match self
                .source
                .get_range(&self.bucket, &self.key, self.off..self.off + want)
                .await
            {
                Ok(b) => {
                    buf[..b.len()].copy_from_slice(&b);
                    self.off += b.len() as u64;
                    if let Some(p) = &self.pmon {
                        p.update(b.len() as u64);
                    }
                    return Ok(b.len());
                }
                Err(e) => self.try_recover(&mut attempt, e).await?,
            }
        }
    }

    /// Skip forward; counts toward progress like a read.
    pub async fn skip(&mut self, n: u64) -> u64 {
        let s = n.min(self.available());
        self.off += s;
        if let Some(p) = &self.pmon {
            p.update(s);
        }
        s
    }

    /// Drain the remaining range.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.available() as usize);
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    async fn try_recover(&self, attempt: &mut u32, e: BlobIoError) -> Result<()> {
        if *attempt == self.retries {
            return Err(CommonError::io_error_with_source(
                format!(
                    "stream read of {}/{} failed after {} attempts, off = {}",
                    self.bucket, self.key, self.retries, self.off
                ),
                e,
            ));
        }
        warn!(
            attempt = *attempt,
            off = self.off,
            "recovering blob stream from {}",
            e
        );
        if *attempt > 0 {
            tokio::time::sleep(Duration::from_millis(256u64 << *attempt)).await;
        }
        *attempt += 1;
        Ok(())
    }
}
