//! rill-core: the distributed map/reduce execution core of the rill
//! column-store runtime.
//!
//! A user task is applied to one or more chunk-aligned column vectors. The
//! invocation fans out across the cluster as a balanced tree of remote
//! calls, fans out locally over a node's owned chunks on a work-stealing
//! fork/join pool, and reduces partial results pairwise back up both
//! trees. Chunk bytes live in a concurrent key/value store and are lazily
//! materialized from local files or a remote object store.

pub mod chunk;
pub mod cloud;
pub mod key;
pub mod mr;
pub mod persist;
pub mod store;
pub mod value;
pub mod vector;

pub use chunk::ChunkView;
pub use cloud::{Cloud, NodeCtx, Rpc};
pub use key::{Key, VectorId, CHUNK_SZ, LOG_CHK};
pub use mr::{MapReduce, MrTask, TaskState};
pub use store::{Futures, KvStore};
pub use value::{Value, ValueSource};
pub use vector::{check_compatible, AppendableVec, BlobVec, DataVec, FileVec, Vector};

pub use rill_common::{CommonError, Result};
