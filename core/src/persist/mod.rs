//! Persistence backends for chunk bytes that live outside the store.

pub mod s3;

/// Callback observing bytes as a streaming read makes progress. Invoked
/// with the byte delta after each successful read.
pub trait ProgressMonitor: Send + Sync {
    fn update(&self, delta: u64);
}

impl<F: Fn(u64) + Send + Sync> ProgressMonitor for F {
    fn update(&self, delta: u64) {
        self(delta)
    }
}
