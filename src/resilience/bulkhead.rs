//! Bulkhead stage: caps concurrent in-flight operations with a semaphore.

use crate::resilience::error::ResilienceError;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;

#[derive(Clone)]
pub struct BulkheadPolicy {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl BulkheadPolicy {
    pub fn new(max_concurrent: usize) -> Self {
        Self { semaphore: Arc::new(Semaphore::new(max_concurrent)), max_concurrent }
    }

    /// A bulkhead that never rejects. 1 billion permits, not `usize::MAX`,
    /// to stay well clear of `Semaphore::MAX_PERMITS`.
    pub fn unlimited() -> Self {
        Self::new(1_000_000_000)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub async fn execute<T, E, Fut, Op>(&self, mut operation: Op) -> Result<T, ResilienceError<E>>
    where
        T: Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let available = self.semaphore.available_permits();
        let in_flight = self.max_concurrent.saturating_sub(available);

        let permit = self
            .semaphore
            .try_acquire()
            .map_err(|_| ResilienceError::Bulkhead { in_flight, max: self.max_concurrent })?;

        let result = operation().await;
        drop(permit);
        result
    }
}
