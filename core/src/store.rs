//! The key/value store and the pending-publication future set.
//!
//! The store is the cluster's shared value space: chunk bytes, vector
//! headers, and blob values all live here, addressed by `Key`. It is
//! concurrent; racing first-touch publication is resolved with
//! compare-and-swap so duplicate materializations collapse to one winner.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use rill_common::{CommonError, Result};

use crate::key::{Key, VectorId};
use crate::value::Value;

/// Concurrent key/value store.
#[derive(Debug, Default)]
pub struct KvStore {
    map: DashMap<Key, Arc<Value>>,
    next_vec_id: AtomicU32,
}

impl KvStore {
    pub fn new() -> Arc<KvStore> {
        Arc::new(KvStore::default())
    }

    /// Allocate a fresh vector identifier.
    pub fn new_vector_id(&self) -> VectorId {
        VectorId(self.next_vec_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(&self, key: &Key) -> Option<Arc<Value>> {
        self.map.get(key).map(|v| v.clone())
    }

    /// Unconditional publish. Returns the stored value.
    pub fn put(&self, key: Key, value: Value) -> Arc<Value> {
        let value = Arc::new(value);
        self.map.insert(key, value.clone());
        value
    }

    /// Compare-and-swap publish. Installs `new` only when the current
    /// mapping matches `expected` (`None` = no mapping). Returns the value
    /// now in the store: `new` on success, the surviving incumbent on a
    /// lost race.
    pub fn put_if_match(
        &self,
        key: Key,
        new: Value,
        expected: Option<&Arc<Value>>,
    ) -> Arc<Value> {
        match self.map.entry(key) {
            Entry::Occupied(mut e) => match expected {
                Some(old) if Arc::ptr_eq(e.get(), old) => {
                    let new = Arc::new(new);
                    e.insert(new.clone());
                    new
                }
                _ => e.get().clone(),
            },
            Entry::Vacant(v) => match expected {
                None => {
                    let new = Arc::new(new);
                    v.insert(new.clone());
                    new
                }
                // Expected a value that is no longer there; the caller's
                // view is stale and there is nothing to swap against.
                Some(old) => old.clone(),
            },
        }
    }

    pub fn remove(&self, key: &Key) -> Option<Arc<Value>> {
        self.map.remove(key).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Pending publications a task must see through before it completes.
///
/// Chunk closes enqueue their store puts here instead of blocking a worker;
/// sets merge up the reduction tree and the node's top-level instance blocks
/// on the union before replying.
#[derive(Debug)]
pub struct Futures {
    handle: tokio::runtime::Handle,
    pending: Vec<tokio::task::JoinHandle<()>>,
}

impl Futures {
    pub fn new(handle: tokio::runtime::Handle) -> Futures {
        Futures {
            handle,
            pending: Vec::new(),
        }
    }

    /// Publish `value` in the background; completion is observed by
    /// `block_for_pending`.
    pub fn defer_put(&mut self, store: Arc<KvStore>, key: Key, value: Value) {
        let h = self.handle.spawn(async move {
            store.put(key, value);
        });
        self.pending.push(h);
    }

    /// Fold another set's pending work into this one.
    pub fn merge(&mut self, other: Futures) {
        self.pending.extend(other.pending);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Await everything enqueued so far.
    pub async fn block_for_pending(&mut self) -> Result<()> {
        for h in self.pending.drain(..) {
            h.await.map_err(|e| {
                CommonError::store_error_with_source("pending publication failed", e)
            })?;
        }
        Ok(())
    }
}
