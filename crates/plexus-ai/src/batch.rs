use std::future::Future;
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::error::{PlexusError, PlexusErrorCode};

/// Counting gate that bounds how many units of work run at once.
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// Held for the lifetime of one admitted unit. Dropping it, whether the unit
/// finished, failed or was cancelled, frees the slot.
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
}

impl AdmissionGate {
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub async fn admit(&self) -> Result<AdmissionPermit, PlexusError> {
        let permit = self.semaphore.clone().acquire_owned().await.map_err(|_| {
            PlexusError::new(
                PlexusErrorCode::ConfigurationInvalid,
                "admission gate was closed",
            )
        })?;
        Ok(AdmissionPermit { _permit: permit })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// Runs a batch of async work items with at most `max_concurrent` in flight,
/// returning results in input order.
#[derive(Debug, Clone)]
pub struct BatchScheduler {
    gate: AdmissionGate,
}

impl BatchScheduler {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            gate: AdmissionGate::new(max_concurrent),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.gate.capacity()
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    /// Every item runs to completion; a failure never cancels its siblings.
    pub async fn run_all<I, T, F, Fut>(
        &self,
        items: Vec<I>,
        work: F,
    ) -> Vec<Result<T, PlexusError>>
    where
        F: Fn(I) -> Fut,
        Fut: Future<Output = Result<T, PlexusError>>,
    {
        debug!(
            items = items.len(),
            max_concurrent = self.gate.capacity(),
            "scheduling batch"
        );
        let work = &work;
        let tasks = items.into_iter().map(|item| async move {
            let _permit = self.gate.admit().await?;
            work(item).await
        });
        join_all(tasks).await
    }

    /// Like [`BatchScheduler::run_all`], but surfaces the first failure in
    /// input order once every item has settled.
    pub async fn try_run_all<I, T, F, Fut>(
        &self,
        items: Vec<I>,
        work: F,
    ) -> Result<Vec<T>, PlexusError>
    where
        F: Fn(I) -> Fut,
        Fut: Future<Output = Result<T, PlexusError>>,
    {
        self.run_all(items, work).await.into_iter().collect()
    }
}
