//! Worker identity and the fixed worker pool

use std::ops::Range;

use parking_lot::Mutex;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::debug;

use crate::compute::chunking::distribute_items;
use crate::error::{Result, RuntimeError};
use crate::sync::SpinBarrier;

/// What one worker knows about the dispatch it is part of
#[derive(Debug, Clone, Copy)]
pub struct ComputeParam<'a> {
    /// Index of this worker
    pub ith: usize,
    /// Number of workers
    pub nth: usize,
    /// Workspace ceiling in bytes
    pub wsize: usize,
    barrier: Option<&'a SpinBarrier>,
}

impl<'a> ComputeParam<'a> {
    /// Parameters for worker `ith` of `nth`
    pub fn new(ith: usize, nth: usize, wsize: usize, barrier: Option<&'a SpinBarrier>) -> Self {
        debug_assert!(ith < nth);
        Self {
            ith,
            nth,
            wsize,
            barrier,
        }
    }

    /// Parameters for a lone worker; `sync` is a no-op
    pub fn single(wsize: usize) -> Self {
        Self::new(0, 1, wsize, None)
    }

    /// Wait for every worker. Returns `true` on exactly one of them.
    pub fn sync(&self) -> bool {
        match self.barrier {
            Some(barrier) => barrier.wait(),
            None => true,
        }
    }

    /// This worker's contiguous share of `n` items
    pub fn distribute(&self, n: usize, block: usize) -> Range<usize> {
        distribute_items(n, self.nth, self.ith, block)
    }
}

/// Fixed set of compute threads.
///
/// Every dispatch runs the same closure once on each thread, so barriers
/// inside the closure see all `nth` workers. Dispatches are serialized.
pub struct WorkerPool {
    pool: ThreadPool,
    nth: usize,
    dispatch: Mutex<()>,
}

impl WorkerPool {
    /// Pool of `threads` workers; 0 means one per available core
    pub fn new(threads: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("powerinfer-worker-{}", i))
            .build()
            .map_err(|e| RuntimeError::Config(format!("failed to start worker pool: {}", e)))?;
        let nth = pool.current_num_threads();
        debug!(threads = nth, "worker pool started");
        Ok(Self {
            pool,
            nth,
            dispatch: Mutex::new(()),
        })
    }

    /// Number of workers
    pub fn num_threads(&self) -> usize {
        self.nth
    }

    /// Run `f(ith, nth)` on every worker and collect the results by `ith`
    pub fn run<F, R>(&self, f: F) -> Vec<R>
    where
        F: Fn(usize, usize) -> R + Sync,
        R: Send,
    {
        let _guard = self.dispatch.lock();
        self.pool
            .broadcast(|ctx| f(ctx.index(), ctx.num_threads()))
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool").field("nth", &self.nth).finish()
    }
}
