//! Global ceiling on leased connections.
//!
//! Every lease from the main pool or a cached pool holds one permit. Requests
//! over the ceiling fail immediately instead of queueing.

use crate::error::{DbError, DbResult};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct ConnectionLimiter {
    semaphore: Arc<Semaphore>,
    max: usize,
}

impl ConnectionLimiter {
    pub fn new(max: usize) -> Self {
        let max = max.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max)),
            max,
        }
    }

    /// Take one permit or fail with a resource-exhaustion error.
    pub fn try_acquire(&self) -> DbResult<OwnedSemaphorePermit> {
        Arc::clone(&self.semaphore).try_acquire_owned().map_err(|_| {
            warn!(max_connections = self.max, "Connection ceiling reached, rejecting lease");
            DbError::resource_exhausted(format!(
                "all {} connections are in use",
                self.max
            ))
        })
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// Permits currently held.
    pub fn in_use(&self) -> usize {
        self.max - self.semaphore.available_permits()
    }
}
