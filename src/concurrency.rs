//! Concurrency helper: fixed-size worker pools on top of rayon.

use anyhow::{Context, Result};
use rayon::{ThreadPool, ThreadPoolBuilder};

/// A named pool of exactly `size` threads. `run` starts one worker loop per thread and returns
/// when every loop has returned.
pub struct WorkerPool {
    name: &'static str,
    size: usize,
    pool: ThreadPool,
}

impl WorkerPool {
    pub fn new(name: &'static str, size: usize) -> Result<Self> {
        let size = size.max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(size)
            .thread_name(move |i| format!("{name}-{i}"))
            .build()
            .with_context(|| format!("build {name} pool"))?;
        Ok(Self { name, size, pool })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Run `worker(index)` on every thread of the pool concurrently; returns the per-worker
    /// results in index order.
    pub fn run<F, R>(&self, worker: F) -> Vec<R>
    where
        F: Fn(usize) -> R + Sync,
        R: Send,
    {
        self.pool.broadcast(|ctx| worker(ctx.index()))
    }
}
