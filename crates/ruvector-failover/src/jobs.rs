//! Per-partition job queue
//!
//! Work against a failover unit is serialized through one worker task per
//! partition. Jobs for the same partition run in submission order while
//! different partitions proceed in parallel. Each job runs with the unit
//! locked on the blocking pool, and the lock is released (persisting any
//! change) after the job.

use crate::{
    failover_unit::FailoverUnit,
    locked::{FailoverUnitMap, LockedFailoverUnit},
    node::PartitionId,
    FailoverError, Result,
};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A unit of work run against a locked failover unit
pub type FailoverJob = Box<dyn FnOnce(&mut LockedFailoverUnit) + Send + 'static>;

struct Worker {
    sender: mpsc::UnboundedSender<FailoverJob>,
    handle: JoinHandle<()>,
}

/// Serializes jobs per partition
///
/// Must be used from within a tokio runtime.
pub struct FailoverJobQueue {
    map: Arc<FailoverUnitMap>,
    workers: DashMap<PartitionId, Worker>,
}

impl FailoverJobQueue {
    pub fn new(map: Arc<FailoverUnitMap>) -> Self {
        Self {
            map,
            workers: DashMap::new(),
        }
    }

    /// The failover unit map the jobs run against
    pub fn map(&self) -> &Arc<FailoverUnitMap> {
        &self.map
    }

    /// Number of partitions with a live worker
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Queue a job without waiting for it
    pub fn enqueue<F>(&self, id: PartitionId, job: F) -> Result<()>
    where
        F: FnOnce(&mut LockedFailoverUnit) + Send + 'static,
    {
        let job: FailoverJob = Box::new(job);

        let sender = self
            .workers
            .entry(id)
            .or_insert_with(|| self.spawn_worker(id))
            .sender
            .clone();

        if let Err(mpsc::error::SendError(job)) = sender.send(job) {
            // The worker exited; start a fresh one.
            let worker = self.spawn_worker(id);
            let sender = worker.sender.clone();
            self.workers.insert(id, worker);
            sender
                .send(job)
                .map_err(|_| FailoverError::JobQueueClosed(id))?;
        }
        Ok(())
    }

    /// Queue a job and wait for its result
    ///
    /// The result is only returned once the unit has been released, so an
    /// update that failed to persist surfaces as an error.
    pub async fn run<F, T>(&self, id: PartitionId, job: F) -> Result<T>
    where
        F: FnOnce(&mut LockedFailoverUnit) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        if !self.map.contains(&id) {
            return Err(FailoverError::FailoverUnitNotFound(id));
        }

        let (tx, rx) = oneshot::channel();
        self.enqueue(id, move |locked| {
            let result = job(locked).and_then(|value| locked.release().map(|_| value));
            let _ = tx.send(result);
        })?;

        rx.await
            .map_err(|_| FailoverError::FailoverUnitNotFound(id))?
    }

    /// Stop the worker of a partition and remove its failover unit
    ///
    /// Jobs queued before the call still run.
    pub async fn remove(&self, id: &PartitionId) -> Option<FailoverUnit> {
        if let Some((_, worker)) = self.workers.remove(id) {
            drop(worker.sender);
            if let Err(e) = worker.handle.await {
                warn!("Job worker for failover unit {} failed: {}", id, e);
            }
        }
        self.map.remove(id)
    }

    fn spawn_worker(&self, id: PartitionId) -> Worker {
        let (sender, mut rx) = mpsc::unbounded_channel::<FailoverJob>();
        let map = self.map.clone();

        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let map = map.clone();
                let ran = tokio::task::spawn_blocking(move || run_job(&map, id, job)).await;

                match ran {
                    Ok(true) => {}
                    Ok(false) => {
                        rx.close();
                        let mut dropped = 0usize;
                        while rx.recv().await.is_some() {
                            dropped += 1;
                        }
                        debug!(
                            "Failover unit {} is gone, dropped {} queued jobs",
                            id, dropped
                        );
                        break;
                    }
                    Err(e) => warn!("Job for failover unit {} panicked: {}", id, e),
                }
            }
            debug!("Job worker for failover unit {} stopped", id);
        });

        Worker { sender, handle }
    }
}

/// Run one job under the unit lock; false if the unit no longer exists
fn run_job(map: &FailoverUnitMap, id: PartitionId, job: FailoverJob) -> bool {
    match map.lock(&id) {
        Ok(mut locked) => {
            job(&mut locked);
            if let Err(e) = locked.release() {
                warn!("Job for failover unit {} not persisted: {}", id, e);
            }
            true
        }
        Err(e) => {
            debug!("Dropping job for failover unit {}: {}", id, e);
            false
        }
    }
}
