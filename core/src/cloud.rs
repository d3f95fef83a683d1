//! The cluster seam: node identity, peers, and remote calls.
//!
//! The surrounding runtime supplies membership and a wire transport; this
//! module is the contract the execution core consumes. `Cloud::local(n)`
//! realizes that contract in-process, with peers as indices into one
//! shared store and remote calls as tokio tasks, which is how the
//! integration tests drive multi-node fan-out.

use std::sync::{Arc, OnceLock};

use tracing::debug;

use rill_common::{CommonError, Result};

use crate::store::KvStore;

struct CloudInner {
    store: Arc<KvStore>,
    nodes: OnceLock<Vec<Arc<NodeCtx>>>,
}

/// A cluster of peer nodes.
#[derive(Clone)]
pub struct Cloud {
    inner: Arc<CloudInner>,
}

/// One node's view of the cluster: its index, its peers, the shared store,
/// and the runtime handle used to dispatch remote calls and background
/// publications.
pub struct NodeCtx {
    idx: usize,
    cloud: Arc<CloudInner>,
    handle: tokio::runtime::Handle,
}

impl Cloud {
    /// Build an in-process cluster of `n` peers. Must be called from within
    /// a tokio runtime; remote calls run as tasks on it.
    pub fn local(n: usize) -> Cloud {
        assert!(n > 0, "a cloud has at least one node");
        let inner = Arc::new(CloudInner {
            store: KvStore::new(),
            nodes: OnceLock::new(),
        });
        let handle = tokio::runtime::Handle::current();
        let nodes = (0..n)
            .map(|idx| {
                Arc::new(NodeCtx {
                    idx,
                    cloud: inner.clone(),
                    handle: handle.clone(),
                })
            })
            .collect();
        let _ = inner.nodes.set(nodes);
        Cloud { inner }
    }

    pub fn size(&self) -> usize {
        self.nodes().len()
    }

    /// Peer handle by index.
    pub fn node(&self, idx: usize) -> Arc<NodeCtx> {
        self.nodes()[idx].clone()
    }

    pub fn store(&self) -> &Arc<KvStore> {
        &self.inner.store
    }

    fn nodes(&self) -> &[Arc<NodeCtx>] {
        self.inner.nodes.get().map(Vec::as_slice).unwrap_or(&[])
    }
}

impl NodeCtx {
    /// This node's index in the cluster.
    pub fn idx(&self) -> usize {
        self.idx
    }

    pub fn cloud_size(&self) -> usize {
        self.cloud.nodes.get().map(Vec::len).unwrap_or(1)
    }

    pub fn store(&self) -> &Arc<KvStore> {
        &self.cloud.store
    }

    pub fn handle(&self) -> &tokio::runtime::Handle {
        &self.handle
    }

    pub(crate) fn peer(&self, idx: usize) -> Arc<NodeCtx> {
        self.cloud
            .nodes
            .get()
            .expect("cloud nodes are set at construction")[idx]
            .clone()
    }
}

impl std::fmt::Debug for NodeCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeCtx({}/{})", self.idx, self.cloud_size())
    }
}

/// An in-flight remote call. Dropping an unconsumed call aborts it, so
/// cancelling a parent recursively tears down the remote sub-tree.
#[derive(Debug)]
pub struct Rpc<R> {
    handle: Option<tokio::task::JoinHandle<Result<R>>>,
}

impl<R: Send + 'static> Rpc<R> {
    /// Dispatch `fut` as a remote call on the runtime.
    pub(crate) fn spawn<F>(handle: &tokio::runtime::Handle, fut: F) -> Rpc<R>
    where
        F: std::future::Future<Output = Result<R>> + Send + 'static,
    {
        Rpc {
            handle: Some(handle.spawn(fut)),
        }
    }

    /// Block for the remote ACK and return its payload.
    pub async fn get(mut self) -> Result<R> {
        let handle = self
            .handle
            .take()
            .ok_or_else(|| CommonError::remote_error("remote call already consumed"))?;
        match handle.await {
            Ok(res) => res,
            Err(e) if e.is_cancelled() => Err(CommonError::Cancelled),
            Err(e) => Err(CommonError::remote_error(format!(
                "remote task panicked: {}",
                e
            ))),
        }
    }

    /// Cancel the call; the remote sub-tree stops at its next suspension
    /// point and its own outstanding calls are torn down with it.
    pub fn cancel(&self) {
        if let Some(h) = &self.handle {
            debug!("cancelling in-flight remote call");
            h.abort();
        }
    }
}

impl<R> Drop for Rpc<R> {
    fn drop(&mut self) {
        if let Some(h) = &self.handle {
            h.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_cloud_shape() {
        let cloud = Cloud::local(4);
        assert_eq!(cloud.size(), 4);
        for i in 0..4 {
            assert_eq!(cloud.node(i).idx(), i);
            assert_eq!(cloud.node(i).cloud_size(), 4);
        }
        // Peers share one store.
        assert!(Arc::ptr_eq(cloud.node(0).store(), cloud.node(3).store()));
    }

    #[tokio::test]
    async fn test_rpc_get_returns_payload() {
        let cloud = Cloud::local(1);
        let rpc = Rpc::spawn(cloud.node(0).handle(), async { Ok(41 + 1) });
        assert_eq!(rpc.get().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_rpc_cancel_surfaces_cancelled() {
        let cloud = Cloud::local(1);
        let rpc: Rpc<u32> = Rpc::spawn(cloud.node(0).handle(), async {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            Ok(0)
        });
        rpc.cancel();
        assert!(matches!(rpc.get().await, Err(CommonError::Cancelled)));
    }
}
