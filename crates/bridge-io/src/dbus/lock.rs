//! FIFO mutual exclusion for channel output.

use tokio::sync::{Mutex, MutexGuard};

/// Waiters acquire in the order they started waiting.
///
/// Backed by tokio's `Mutex`, whose semaphore queues waiters first-in
/// first-out.
#[derive(Debug, Default)]
pub struct FairLock {
    inner: Mutex<()>,
}

pub type FairLockGuard<'a> = MutexGuard<'a, ()>;

impl FairLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self) -> FairLockGuard<'_> {
        self.inner.lock().await
    }
}
