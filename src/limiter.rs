//! Defines [`ConcurrencyLimiter`], which bounds the number of files a build
//! holds open at once. The budget is split evenly between two independent
//! pools: one for files being read and one for files being written. A copy
//! holds one permit from each pool, a render holds only an output permit, so
//! the total number of open descriptors never exceeds the configured budget.

use std::io;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Two counting permit pools, each sized at half of the open-file budget.
/// Clones share the same pools.
#[derive(Clone, Debug)]
pub struct ConcurrencyLimiter {
    input: Arc<Semaphore>,
    output: Arc<Semaphore>,
    per_pool: usize,
}

impl ConcurrencyLimiter {
    /// Creates a limiter for a budget of `max_open` descriptors. Each pool gets
    /// `max_open / 2` permits, so budgets below 2 leave nothing to acquire.
    pub fn new(max_open: usize) -> ConcurrencyLimiter {
        let per_pool = max_open / 2;
        ConcurrencyLimiter {
            input: Arc::new(Semaphore::new(per_pool)),
            output: Arc::new(Semaphore::new(per_pool)),
            per_pool,
        }
    }

    /// The number of permits in each pool.
    pub fn per_pool(&self) -> usize {
        self.per_pool
    }

    /// Waits for a permit to open a file for reading. The permit is returned
    /// to the pool when dropped.
    pub async fn acquire_input(&self) -> io::Result<OwnedSemaphorePermit> {
        acquire(&self.input).await
    }

    /// Waits for a permit to open a file for writing. The permit is returned
    /// to the pool when dropped.
    pub async fn acquire_output(&self) -> io::Result<OwnedSemaphorePermit> {
        acquire(&self.output).await
    }

    /// The number of input permits not currently held.
    pub fn available_input(&self) -> usize {
        self.input.available_permits()
    }

    /// The number of output permits not currently held.
    pub fn available_output(&self) -> usize {
        self.output.available_permits()
    }
}

async fn acquire(pool: &Arc<Semaphore>) -> io::Result<OwnedSemaphorePermit> {
    Arc::clone(pool)
        .acquire_owned()
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
}
