//! Map/reduce style distributed computation.
//!
//! A task is invoked against one or more chunk-aligned vectors. The
//! invocation fans out across the cluster as a balanced binary tree of
//! remote calls, fans out locally over the node's chunk range on the
//! work-stealing pool, runs the user's `map` once per homed chunk, and
//! reduces partial results pairwise back up both trees. The root call
//! returns a single coalesced task with any appendable outputs closed to
//! read-only vectors.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;

use rill_common::{CommonError, Result};

use crate::chunk::ChunkView;
use crate::cloud::{NodeCtx, Rpc};
use crate::store::Futures;
use crate::vector::{check_compatible, Vector};

/// User hooks for a map/reduce task. Any subset may be overridden; the
/// defaults are no-ops.
pub trait MapReduce: Clone + Send + Sync + 'static {
    /// Called once per node before any `map` on that node, to set up
    /// node-local shared state.
    fn init(&mut self, _ctx: &NodeCtx) {}

    /// Called once per homed chunk when the task has one input vector.
    fn map(&mut self, _start: u64, _len: usize, _v0: &mut ChunkView) -> Result<()> {
        Ok(())
    }

    /// Called once per homed chunk when the task has two input vectors.
    fn map2(
        &mut self,
        _start: u64,
        _len: usize,
        _v0: &mut ChunkView,
        _v1: &mut ChunkView,
    ) -> Result<()> {
        Ok(())
    }

    /// Combine another task's result into this one. Both sides have either
    /// had `map` run on them or are themselves results of a prior reduce.
    /// Pairing order is non-deterministic: it follows the fork/join tree,
    /// not chunk order, so the operation must be associative.
    fn reduce(&mut self, _other: Self) {}
}

/// Lifecycle of one task instance. Setup happens exactly once per node, on
/// the instance that owns that node's final result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    New,
    Setup,
    FannedOut,
    /// Leaf: the chunk was mapped (or skipped as non-homed).
    Mapped,
    /// Interior: split into two children.
    Split,
    Reduced,
    PostLocalDone,
    Complete,
    Cancelled,
}

/// One instance of a running task: the user's value plus the ranges,
/// links, and bookkeeping that drive the execution trees.
pub struct MrTask<T: MapReduce> {
    user: T,
    vecs: Vec<Vector>,
    /// Index of the first readable vector; it gates all addressing.
    vec0: usize,
    /// Range of cluster nodes this instance covers; `-1` after completion
    /// marks "no local result in this sub-tree".
    nlo: i32,
    nhi: i32,
    /// Range of local chunks this instance covers.
    lo: usize,
    hi: usize,
    /// The unique instance per node that collects the node's final result.
    top_local: bool,
    /// Set once `map` has run in this instance's sub-tree.
    mapped: bool,
    state: TaskState,
    fs: Option<Futures>,
    /// Shared by every clone on a node; once set, the node's tree stops
    /// spawning further work. Remote sub-trees carry their own flag and
    /// are torn down through RPC cancellation, so a remote fault reaches
    /// the parent as the original error, not as a cancellation.
    cancel: Arc<AtomicBool>,
}

impl<T: MapReduce> MrTask<T> {
    pub fn new(user: T) -> MrTask<T> {
        MrTask {
            user,
            vecs: Vec::new(),
            vec0: 0,
            nlo: 0,
            nhi: 0,
            lo: 0,
            hi: 0,
            top_local: false,
            mapped: false,
            state: TaskState::New,
            fs: None,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Top-level blocking call: run the task over the whole cluster and
    /// return it with results coalesced and appendable outputs closed.
    ///
    /// Fails fast, before any fan-out, on incompatible vector shapes or an
    /// unsupported vector count. Any error raised by a hook, a peer, or the
    /// scheduler cancels outstanding work and surfaces here.
    pub async fn invoke(mut self, ctx: &Arc<NodeCtx>, vecs: Vec<Vector>) -> Result<MrTask<T>> {
        if vecs.len() > 2 {
            return Err(CommonError::invalid_argument(format!(
                "{} input vectors; map supports one or two",
                vecs.len()
            )));
        }
        self.vec0 = check_compatible(&vecs)?;
        self.vecs = vecs;
        self.nlo = 0;
        self.nhi = ctx.cloud_size() as i32;
        let mut done = run_node(ctx.clone(), self).await?;
        // Final close ops on any new appendable vector.
        for v in &mut done.vecs {
            v.close_in_place()?;
        }
        done.state = TaskState::Complete;
        Ok(done)
    }

    /// The user's task value with accumulated results.
    pub fn user(&self) -> &T {
        &self.user
    }

    pub fn into_user(self) -> T {
        self.user
    }

    /// Vector handle `i` as of completion; appendable inputs have been
    /// closed to read-only vectors.
    pub fn vec(&self, i: usize) -> &Vector {
        &self.vecs[i]
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Per-fork clone: user fields shallow-copy, execution links reset.
    /// The cancellation flag is shared with the whole invocation.
    fn fork_clone(&self) -> MrTask<T> {
        MrTask {
            user: self.user.clone(),
            vecs: self.vecs.clone(),
            vec0: self.vec0,
            nlo: self.nlo,
            nhi: self.nhi,
            lo: self.lo,
            hi: self.hi,
            top_local: false,
            mapped: false,
            state: TaskState::New,
            fs: None,
            cancel: self.cancel.clone(),
        }
    }

    /// Local fan-out, called on pool threads. Splits multi-chunk ranges
    /// down to single-chunk leaves, forking one side and computing the
    /// other inline in the current worker.
    fn compute(self, ctx: &NodeCtx) -> Result<MrTask<T>> {
        let cancel = self.cancel.clone();
        match self.compute_inner(ctx) {
            Ok(t) => Ok(t),
            Err(e) => {
                cancel.store(true, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn compute_inner(mut self, ctx: &NodeCtx) -> Result<MrTask<T>> {
        if self.cancel.load(Ordering::SeqCst) {
            self.state = TaskState::Cancelled;
            return Err(CommonError::Cancelled);
        }
        if self.hi - self.lo >= 2 {
            let mid = (self.lo + self.hi) >> 1;
            let mut left = self.fork_clone();
            let mut rite = self.fork_clone();
            left.hi = mid;
            rite.lo = mid;
            self.state = TaskState::Split;
            // Right half runs in this worker; the left fork is up for
            // stealing. This frame completes only once both halves have.
            let (rres, lres) = rayon::join(|| rite.compute(ctx), || left.compute(ctx));
            self.reduce2(lres?);
            self.reduce2(rres?);
            self.state = TaskState::Reduced;
            return Ok(self);
        }
        if self.hi > self.lo {
            let cidx = self.lo;
            if self.vecs[self.vec0].chunk_key(cidx).home(ctx) {
                self.map_chunk(ctx, cidx)?;
            } else {
                // Ranges can straddle chunks that another node will handle.
                debug!(node = ctx.idx(), chunk = cidx, "skipping non-homed chunk");
            }
            self.state = TaskState::Mapped;
        }
        Ok(self)
    }

    /// Single-chunk leaf: decode a view per input vector and run the map
    /// overload for the vector count, then publish any chunks the call
    /// built into their appendable outputs.
    fn map_chunk(&mut self, ctx: &NodeCtx, cidx: usize) -> Result<()> {
        let store = ctx.store();
        let vec0 = &self.vecs[self.vec0];
        let start = vec0.chunk2start_row(cidx);
        let len = vec0.chunk_rows(cidx) as usize;
        let mut views = Vec::with_capacity(self.vecs.len());
        for v in &self.vecs {
            views.push(v.chunk_view(start, cidx, store)?);
        }
        match views.as_mut_slice() {
            [v0] => self.user.map(start, len, v0)?,
            [v0, v1] => self.user.map2(start, len, v0, v1)?,
            _ => {
                return Err(CommonError::invalid_argument(format!(
                    "{} input vectors; map supports one or two",
                    views.len()
                )))
            }
        }
        self.mapped = true;
        for (i, view) in views.into_iter().enumerate() {
            if let Some(nc) = view.into_new() {
                let fs = self
                    .fs
                    .get_or_insert_with(|| Futures::new(ctx.handle().clone()));
                if let Some(av) = self.vecs[i].as_appendable_mut() {
                    av.close_chunk(cidx, nc, store, fs);
                }
            }
        }
        Ok(())
    }

    /// Fold a completed child into this instance, then drop it so partial
    /// state is released promptly.
    fn reduce2(&mut self, child: MrTask<T>) {
        let MrTask {
            user,
            vecs,
            mapped,
            fs,
            ..
        } = child;
        if mapped {
            if self.mapped {
                self.reduce_all(user, vecs);
            } else {
                // Nothing mapped here yet: adopt the child's result.
                self.user = user;
                self.vecs = vecs;
                self.mapped = true;
            }
        }
        if let Some(child_fs) = fs {
            match &mut self.fs {
                Some(own) => own.merge(child_fs),
                None => self.fs = Some(child_fs),
            }
        }
    }

    /// Framework reduction: combine appendable outputs chunk-index-wise,
    /// then call the user's reduce.
    fn reduce_all(&mut self, other_user: T, other_vecs: Vec<Vector>) {
        for (v, ov) in self.vecs.iter_mut().zip(other_vecs) {
            if let (Some(av), Some(oav)) = (v.as_appendable_mut(), ov.into_appendable()) {
                av.reduce(oav);
            }
        }
        self.user.reduce(other_user);
    }
}

impl<T: MapReduce> std::fmt::Debug for MrTask<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MrTask")
            .field("nlo", &self.nlo)
            .field("nhi", &self.nhi)
            .field("lo", &self.lo)
            .field("hi", &self.hi)
            .field("top_local", &self.top_local)
            .field("mapped", &self.mapped)
            .field("state", &self.state)
            .finish()
    }
}

/// Per-node execution: fire remote fan-out, run the local chunk tree, then
/// gather remote results and pending publications. This is both the root
/// path and the body of every remote call.
async fn run_node<T: MapReduce>(ctx: Arc<NodeCtx>, mut task: MrTask<T>) -> Result<MrTask<T>> {
    task.top_local = true;
    task.state = TaskState::Setup;

    // Global work: split the node range around self and dispatch each half
    // to the node at its midpoint, completing only when both ACK.
    let mut nleft: Option<Rpc<MrTask<T>>> = None;
    let mut nrite: Option<Rpc<MrTask<T>>> = None;
    if task.nlo >= 0 && task.nlo < task.nhi - 1 {
        let s = ctx.idx() as i32;
        if task.nlo < s {
            nleft = Some(remote_compute(&ctx, &task, task.nlo, s));
        }
        if s + 1 < task.nhi {
            nrite = Some(remote_compute(&ctx, &task, s + 1, task.nhi));
        }
    }

    // Local work covers every chunk; non-homed leaves skip themselves.
    task.lo = 0;
    task.hi = task.vecs[task.vec0].nchunks();
    if task.vecs.iter().any(|v| v.writable()) {
        task.fs = Some(Futures::new(ctx.handle().clone()));
    }
    task.user.init(&ctx);
    task.state = TaskState::FannedOut;
    debug!(
        node = ctx.idx(),
        nlo = task.nlo,
        nhi = task.nhi,
        chunks = task.hi,
        "task fanned out"
    );

    let cancel = task.cancel.clone();
    let pool_ctx = ctx.clone();
    let task = match tokio::task::spawn_blocking(move || task.compute(&pool_ctx)).await {
        Ok(Ok(t)) => t,
        Ok(Err(e)) => return fail(&cancel, nleft, nrite, e),
        Err(e) => {
            return fail(
                &cancel,
                nleft,
                nrite,
                CommonError::task_error(format!("local fan-out panicked: {}", e)),
            )
        }
    };

    post_local(ctx, task, nleft, nrite).await
}

/// Boxing indirection so a node can recursively dispatch itself to peers.
fn run_node_boxed<T: MapReduce>(
    ctx: Arc<NodeCtx>,
    task: MrTask<T>,
) -> BoxFuture<'static, Result<MrTask<T>>> {
    Box::pin(run_node(ctx, task))
}

/// Clone the task onto the node at the midpoint of `[lo, hi)`, which will
/// recursively split the rest of the range.
fn remote_compute<T: MapReduce>(
    ctx: &Arc<NodeCtx>,
    task: &MrTask<T>,
    lo: i32,
    hi: i32,
) -> Rpc<MrTask<T>> {
    let mid = (lo + hi) >> 1;
    let mut clone = task.fork_clone();
    clone.nlo = lo;
    clone.nhi = hi;
    clone.cancel = Arc::new(AtomicBool::new(false));
    debug!(from = ctx.idx(), to = mid, lo, hi, "remote fan-out");
    Rpc::spawn(ctx.handle(), run_node_boxed(ctx.peer(mid as usize), clone))
}

/// Work done after the node's local tree completes: gather and reduce the
/// two remote sub-results, block for pending publications, and leave the
/// final result in the task itself. Runs on the node's async continuation,
/// never on a pool worker.
async fn post_local<T: MapReduce>(
    ctx: Arc<NodeCtx>,
    mut task: MrTask<T>,
    nleft: Option<Rpc<MrTask<T>>>,
    nrite: Option<Rpc<MrTask<T>>>,
) -> Result<MrTask<T>> {
    let cancel = task.cancel.clone();
    if let Err(e) = reduce3(&mut task, nleft).await {
        return fail(&cancel, None, nrite, e);
    }
    if let Err(e) = reduce3(&mut task, nrite).await {
        return fail::<T>(&cancel, None, None, e);
    }
    if let Some(fs) = task.fs.as_mut() {
        if let Err(e) = fs.block_for_pending().await {
            return fail::<T>(&cancel, None, None, e);
        }
    }
    // Replies never carry blockable futures.
    task.fs = None;
    if !task.mapped {
        // No chunk was homed here; callers up the tree skip this sub-tree.
        task.nlo = -1;
    }
    task.state = TaskState::PostLocalDone;
    debug!(node = ctx.idx(), mapped = task.mapped, "post-local done");
    Ok(task)
}

/// Block for a remote ACK and reduce it in. Unlike `reduce2` the reply is
/// the remote task itself, not a child slot; a no-result sentinel is
/// skipped outright.
async fn reduce3<T: MapReduce>(
    task: &mut MrTask<T>,
    rpc: Option<Rpc<MrTask<T>>>,
) -> Result<()> {
    let Some(rpc) = rpc else { return Ok(()) };
    let remote = rpc.get().await?;
    debug_assert!(remote.fs.is_none(), "remote reply carries futures");
    if remote.nlo == -1 {
        debug!("remote sub-tree produced no result");
        return Ok(());
    }
    let MrTask {
        user, vecs, mapped, ..
    } = remote;
    debug_assert!(mapped, "non-sentinel remote reply must carry a result");
    if task.mapped {
        task.reduce_all(user, vecs);
    } else {
        task.user = user;
        task.vecs = vecs;
        task.mapped = true;
    }
    Ok(())
}

/// Exceptional completion: cancel outstanding remote calls, release child
/// state, and rethrow. A fault is never swallowed.
fn fail<T: MapReduce>(
    cancel: &AtomicBool,
    nleft: Option<Rpc<MrTask<T>>>,
    nrite: Option<Rpc<MrTask<T>>>,
    e: CommonError,
) -> Result<MrTask<T>> {
    cancel.store(true, Ordering::SeqCst);
    if let Some(l) = &nleft {
        l.cancel();
    }
    if let Some(r) = &nrite {
        r.cancel();
    }
    Err(e)
}
