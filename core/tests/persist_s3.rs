//! Object-store backing: loads, lazy chunks, and retry transparency.

use std::ops::Range;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use bytes::Bytes;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};

use rill_core::persist::s3::{
    self, BlobIoError, BlobReader, BlobSource, Loaded, ObjectStoreSource,
};
use rill_core::persist::ProgressMonitor;
use rill_core::{
    ChunkView, Cloud, CommonError, Key, MapReduce, MrTask, Result, ValueSource, Vector, CHUNK_SZ,
};

fn shared_memory() -> Arc<InMemory> {
    static MEM: OnceLock<Arc<InMemory>> = OnceLock::new();
    MEM.get_or_init(|| Arc::new(InMemory::new())).clone()
}

/// One shared source over one shared in-memory object store; also installed
/// as the process-wide client so lazy chunk fault-in resolves here.
fn shared_source() -> Arc<dyn BlobSource> {
    static SRC: OnceLock<Arc<dyn BlobSource>> = OnceLock::new();
    let src = SRC
        .get_or_init(|| Arc::new(ObjectStoreSource::new(shared_memory())))
        .clone();
    s3::install_client(src.clone());
    src
}

async fn put_object(bucket: &str, key: &str, bytes: Vec<u8>) {
    shared_memory()
        .put(
            &ObjectPath::from(format!("{}/{}", bucket, key)),
            PutPayload::from(bytes),
        )
        .await
        .unwrap();
}

struct ByteTotal(AtomicU64);

impl ProgressMonitor for ByteTotal {
    fn update(&self, delta: u64) {
        self.0.fetch_add(delta, Ordering::SeqCst);
    }
}

/// Fails the first `failures` ranged reads with an end-of-stream error,
/// then delegates.
#[derive(Debug)]
struct FlakySource {
    inner: Arc<dyn BlobSource>,
    failures: AtomicU32,
}

#[async_trait]
impl BlobSource for FlakySource {
    async fn size(&self, bucket: &str, key: &str) -> std::result::Result<u64, BlobIoError> {
        self.inner.size(bucket, key).await
    }

    async fn get_range(
        &self,
        bucket: &str,
        key: &str,
        range: Range<u64>,
    ) -> std::result::Result<Bytes, BlobIoError> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(BlobIoError::Eof);
        }
        self.inner.get_range(bucket, key, range).await
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: Bytes,
    ) -> std::result::Result<(), BlobIoError> {
        self.inner.put(bucket, key, bytes).await
    }
}

#[tokio::test]
async fn test_reader_retries_eof_transparently() {
    let source = shared_source();
    let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
    put_object("bkt", "flaky.bin", payload.clone()).await;

    let flaky: Arc<dyn BlobSource> = Arc::new(FlakySource {
        inner: source,
        failures: AtomicU32::new(2),
    });
    let total = Arc::new(ByteTotal(AtomicU64::new(0)));
    let key = s3::encode_key("bkt", "flaky.bin");
    let mut reader = BlobReader::open(flaky, &key, Some(total.clone()), 0, u64::MAX)
        .await
        .unwrap();

    // Two EOFs then success: the caller sees the full payload and the
    // progress total matches its length.
    let got = reader.read_to_end().await.unwrap();
    assert_eq!(got, payload);
    assert_eq!(total.0.load(Ordering::SeqCst), payload.len() as u64);
    assert_eq!(reader.offset(), payload.len() as u64);
    assert_eq!(reader.available(), 0);
}

#[tokio::test]
async fn test_reader_gives_up_after_bounded_attempts() {
    let source = shared_source();
    put_object("bkt", "dead.bin", vec![1u8; 64]).await;

    let flaky: Arc<dyn BlobSource> = Arc::new(FlakySource {
        inner: source,
        failures: AtomicU32::new(16),
    });
    let key = s3::encode_key("bkt", "dead.bin");
    let mut reader = BlobReader::open(flaky, &key, None, 0, u64::MAX).await.unwrap();
    let mut buf = [0u8; 16];
    let err = reader.read(&mut buf).await.unwrap_err();
    assert!(matches!(err, CommonError::IoError { .. }));
}

#[tokio::test]
async fn test_reader_skip_counts_toward_progress() {
    let source = shared_source();
    put_object("bkt", "skippy.bin", (0..=255u8).collect()).await;

    let total = Arc::new(ByteTotal(AtomicU64::new(0)));
    let key = s3::encode_key("bkt", "skippy.bin");
    let mut reader = BlobReader::open(source, &key, Some(total.clone()), 0, u64::MAX)
        .await
        .unwrap();
    assert_eq!(reader.skip(100).await, 100);
    let mut buf = [0u8; 4];
    reader.read(&mut buf).await.unwrap();
    assert_eq!(buf, [100, 101, 102, 103]);
    assert_eq!(total.0.load(Ordering::SeqCst), 104);
}

#[tokio::test]
async fn test_lazy_chunk_fat_tail_boundary() {
    let source = shared_source();
    // CHUNK_SZ <= remainder < 2*CHUNK_SZ: one fat chunk, and the would-be
    // trailing chunk was swallowed by it.
    let size = CHUNK_SZ as usize + CHUNK_SZ as usize / 2;
    put_object("bkt", "fat.bin", vec![7u8; size]).await;
    let base = s3::encode_key("bkt", "fat.bin");

    let v0 = s3::lazy_chunk(&source, &Key::arraylet(&base, 0))
        .await
        .unwrap()
        .expect("first chunk exists");
    assert_eq!(v0.len(), size);

    let v1 = s3::lazy_chunk(&source, &Key::arraylet(&base, 1)).await.unwrap();
    assert!(v1.is_none(), "swallowed trailing chunk must yield nothing");
}

#[tokio::test]
async fn test_lazy_chunk_full_chunks() {
    let source = shared_source();
    let size = 3 * CHUNK_SZ as usize;
    put_object("bkt", "even.bin", vec![1u8; size]).await;
    let base = s3::encode_key("bkt", "even.bin");

    for c in 0..3 {
        let v = s3::lazy_chunk(&source, &Key::arraylet(&base, c))
            .await
            .unwrap()
            .expect("chunk exists");
        assert_eq!(v.len(), CHUNK_SZ as usize);
    }
}

#[tokio::test]
async fn test_load_key_small_object_is_a_single_value() {
    let source = shared_source();
    let cloud = Cloud::local(1);
    put_object("bkt", "small.bin", b"tiny payload".to_vec()).await;

    let (_k, loaded) = s3::load_key(&source, cloud.store(), "bkt", "small.bin")
        .await
        .unwrap();
    let value = match loaded {
        Loaded::Value(v) => v,
        Loaded::Vector(v) => panic!("small object became a vector: {:?}", v),
    };
    // Bytes fault in through the installed client, off the async executor.
    let bytes = tokio::task::spawn_blocking(move || value.bytes())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(bytes.as_ref(), b"tiny payload");
}

#[tokio::test]
async fn test_load_key_large_object_wraps_as_vector() {
    let source = shared_source();
    let cloud = Cloud::local(1);
    let size = 2 * CHUNK_SZ as usize;
    put_object("bkt", "large.bin", vec![9u8; size]).await;

    let (_k, loaded) = s3::load_key(&source, cloud.store(), "bkt", "large.bin")
        .await
        .unwrap();
    match loaded {
        Loaded::Vector(v) => {
            assert_eq!(v.length(), size as u64);
            assert_eq!(v.nchunks(), 2);
        }
        Loaded::Value(_) => panic!("large object should wrap as a vector"),
    }
}

#[tokio::test]
async fn test_load_key_hex_header_shifts_offsets() {
    let source = shared_source();
    let cloud = Cloud::local(1);
    // 16-byte header (length prefix included), then two chunks of payload.
    let header_len = 16u64;
    let mut object = Vec::new();
    object.extend_from_slice(&header_len.to_le_bytes());
    object.extend_from_slice(&[0u8; 8]);
    object.extend(vec![5u8; 2 * CHUNK_SZ as usize]);
    put_object("bkt", "table.hex", object).await;

    let (_k, loaded) = s3::load_key(&source, cloud.store(), "bkt", "table.hex")
        .await
        .unwrap();
    let vec = match loaded {
        Loaded::Vector(Vector::Blob(v)) => v,
        other => panic!("hex object should wrap as a blob vector: {:?}", other),
    };
    assert_eq!(vec.length(), 2 * CHUNK_SZ);
    assert_eq!(vec.nchunks(), 2);
    // Chunk offsets are shifted past the header.
    let value = vec.chunk_value(cloud.store(), 1).unwrap();
    match value.source() {
        ValueSource::Blob { off, .. } => assert_eq!(*off, header_len + CHUNK_SZ),
        other => panic!("unexpected source: {:?}", other),
    }
}

#[tokio::test]
async fn test_store_blob_round_trips_whole_objects() {
    let source = shared_source();
    let cloud = Cloud::local(1);
    let key = s3::encode_key("bkt", "out/result.bin");
    let value = rill_core::Value::mem(Bytes::from_static(b"column bytes"));

    s3::store_blob(&source, &cloud.node(0), &key, &value)
        .await
        .unwrap();
    let back = source
        .get_range("bkt", "out/result.bin", 0..12)
        .await
        .unwrap();
    assert_eq!(back.as_ref(), b"column bytes");

    // Chunk slices are never stored individually.
    let chunk = Key::arraylet(&key, 0);
    assert!(s3::store_blob(&source, &cloud.node(0), &chunk, &value)
        .await
        .is_err());
}

/// Sums raw bytes of a byte-backed column.
#[derive(Clone, Default)]
struct ByteSumTask {
    acc: u64,
}

impl MapReduce for ByteSumTask {
    fn map(&mut self, _start: u64, _len: usize, v0: &mut ChunkView) -> Result<()> {
        let bytes = v0
            .as_bytes()
            .ok_or_else(|| CommonError::task_error("expected a byte column"))?;
        self.acc += bytes.iter().map(|&b| b as u64).sum::<u64>();
        Ok(())
    }

    fn reduce(&mut self, other: Self) {
        self.acc += other.acc;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_blob_vector_feeds_map_reduce() {
    let source = shared_source();
    let cloud = Cloud::local(1);
    let size = 2 * CHUNK_SZ as usize;
    put_object("bkt", "col.bin", vec![1u8; size]).await;

    let (_k, loaded) = s3::load_key(&source, cloud.store(), "bkt", "col.bin")
        .await
        .unwrap();
    let vec = match loaded {
        Loaded::Vector(v) => v,
        Loaded::Value(_) => panic!("expected a vector"),
    };

    let done = MrTask::new(ByteSumTask::default())
        .invoke(&cloud.node(0), vec![vec])
        .await
        .unwrap();
    assert_eq!(done.user().acc, size as u64);
}
