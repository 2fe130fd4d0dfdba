//! Bounded pool of per-resource workers.
//!
//! Workers run on the Tokio runtime and hand their finished
//! [`ResourceRecord`] back to the coordinator, which is the only writer of
//! the run state.

use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::controller::ResourceController;
use crate::descriptor::ResourceDescriptor;
use crate::retry::RetryPolicy;
use crate::state::{FailureClass, Outcome, ResourceRecord, Stage};

/// Everything a worker needs, cheap to clone into each task.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub controller: Arc<dyn ResourceController>,
    pub retry: RetryPolicy,
    pub probe_failure_tolerance: u32,
    pub cancel: CancellationToken,
    /// Start of the run; record timestamps are relative to it.
    pub clock: Instant,
}

impl WorkerContext {
    /// Milliseconds since the start of the run.
    pub fn offset_ms(&self) -> u64 {
        u64::try_from(self.clock.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

pub(crate) struct WorkerPool {
    tasks: JoinSet<ResourceRecord>,
    limit: usize,
}

impl WorkerPool {
    pub fn new(limit: usize) -> Self {
        Self {
            tasks: JoinSet::new(),
            limit: limit.max(1),
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.tasks.len() < self.limit
    }

    /// Run `worker` for `descriptor`.
    ///
    /// A worker that panics still yields a record: `Failed` at `stage`, so
    /// the coordinator never loses track of which resource it was handling.
    pub fn spawn<F>(&mut self, descriptor: &ResourceDescriptor, stage: Stage, worker: F)
    where
        F: Future<Output = ResourceRecord> + Send + 'static,
    {
        let fallback = ResourceRecord::new(descriptor, Outcome::Failed, stage)
            .with_class(FailureClass::Permanent);
        self.tasks.spawn(async move {
            match tokio::spawn(worker).await {
                Ok(record) => record,
                Err(e) => {
                    error!(resource = %fallback.id, error = %e, "Worker terminated unexpectedly");
                    fallback.with_reason(format!("worker terminated unexpectedly: {e}"))
                }
            }
        });
    }

    /// Wait for the next worker to finish; `None` once the pool is idle.
    pub async fn next(&mut self) -> Option<ResourceRecord> {
        loop {
            match self.tasks.join_next().await? {
                Ok(record) => return Some(record),
                Err(e) => error!(error = %e, "Worker supervisor terminated"),
            }
        }
    }
}
