//! Bounded execution context for checks
//!
//! Every request pipeline runs on its own task once a permit is free, so at
//! most `size` checks (and engine processes) are in flight.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::debug;

use crate::error::AppError;

#[derive(Clone)]
pub struct CheckPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl CheckPool {
    pub fn new(size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Run `task` on a pooled worker and wait for its result
    pub async fn run<F, T>(&self, task: F) -> Result<T, AppError>
    where
        F: Future<Output = Result<T, AppError>> + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| AppError::Internal(anyhow::Error::new(e).context("Check pool is closed")))?;

        debug!(
            "Check started: busy={}/{}",
            self.size - self.permits.available_permits(),
            self.size
        );

        let handle = tokio::spawn(async move {
            let _permit = permit;
            task.await
        });

        handle
            .await
            .map_err(|e| AppError::Internal(anyhow::Error::new(e).context("Check task failed")))?
    }

    /// Number of checks that could start right now
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}
