//! Bounded worker pool
//!
//! A fixed set of worker tasks drains one bounded channel of jobs. When the
//! channel is full, `submit` waits for room, which is the only place a
//! sustained broker outage pushes back on callers.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{DispatchError, Result};

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Handle to an accepted submission
#[derive(Debug)]
pub struct Submission {
    message_id: String,
    completion: oneshot::Receiver<Result<()>>,
}

impl Submission {
    pub fn new(message_id: String, completion: oneshot::Receiver<Result<()>>) -> Self {
        Self { message_id, completion }
    }

    /// Submission already finished with `result`
    pub fn completed(message_id: String, result: Result<()>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self::new(message_id, rx)
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Wait for the background publish. Dropping the submission instead is
    /// fine; the outcome is recorded in the ledger either way.
    pub async fn wait(self) -> Result<()> {
        self.completion.await.unwrap_or(Err(DispatchError::PoolClosed))
    }
}

pub struct WorkerPool {
    sender: RwLock<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    queued: Arc<AtomicU32>,
    capacity: usize,
}

impl WorkerPool {
    pub fn new(workers: usize, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let queued = Arc::new(AtomicU32::new(0));

        let handles = (0..workers.max(1))
            .map(|worker_id| {
                let rx = rx.clone();
                let queued = queued.clone();
                tokio::spawn(async move {
                    loop {
                        let job = rx.lock().await.recv().await;
                        let Some(job) = job else { break };
                        queued.fetch_sub(1, Ordering::SeqCst);
                        if std::panic::AssertUnwindSafe(job).catch_unwind().await.is_err() {
                            error!(worker_id, "Dispatch job panicked");
                        }
                    }
                    debug!(worker_id, "Dispatch worker exiting");
                })
            })
            .collect();

        info!(workers, capacity, "Dispatch worker pool started");
        Self {
            sender: RwLock::new(Some(tx)),
            workers: Mutex::new(handles),
            queued,
            capacity,
        }
    }

    /// Queue a job, waiting for room when the pool is saturated
    pub async fn submit<F>(&self, job: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let sender = self.sender.read().clone().ok_or(DispatchError::PoolClosed)?;
        let job: Job = Box::pin(job);

        self.queued.fetch_add(1, Ordering::SeqCst);
        let result = match sender.try_send(job) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(job)) => {
                warn!(capacity = self.capacity, "Dispatch pool saturated, waiting for capacity");
                sender.send(job).await.map_err(|_| DispatchError::PoolClosed)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DispatchError::PoolClosed),
        };
        if result.is_err() {
            self.queued.fetch_sub(1, Ordering::SeqCst);
        }
        result
    }

    /// Jobs accepted but not yet picked up by a worker
    pub fn queued(&self) -> u32 {
        self.queued.load(Ordering::SeqCst)
    }

    /// Stop accepting jobs and wait for queued ones to finish
    pub async fn shutdown(&self) {
        self.sender.write().take();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            let _ = handle.await;
        }
        info!("Dispatch worker pool stopped");
    }
}
