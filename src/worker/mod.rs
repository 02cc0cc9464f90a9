/// Generic poll-fan-out-wait worker loop shared by every queue kind.
///
/// Generalizes the background-task-plus-retry shape of the ambient stack's
/// embedding/extraction pipelines from a single mpsc-fed worker to a
/// poll-fed fan-out pool: each tick asks the kind's `JobProcessor` for a
/// batch, processes it across a semaphore sized by the Adaptive Scaler, and
/// waits for the whole batch before ticking again.

pub mod scaler;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::errors::CoreError;
use crate::services::HealthMonitor;
use crate::worker::scaler::Scaler;

/// Outcome of processing a single job, reported back to the worker loop for
/// metrics bookkeeping. `Cancelled` jobs are not counted as processed: the
/// row stays `processing` and stale-recovery resurrects it.
pub enum Outcome {
    Completed,
    Failed,
    Cancelled,
}

#[async_trait]
pub trait JobProcessor: Send + Sync {
    type Job: Send + 'static;

    async fn dequeue(&self, batch_size: i64) -> Result<Vec<Self::Job>, CoreError>;

    /// Process one claimed job to completion: on success or failure this
    /// implementation is responsible for calling the queue's
    /// `mark_completed`/`mark_failed`, per the "processing code does not
    /// decide whether to retry" propagation policy — that decision lives in
    /// `mark_failed`, which this method must call on error.
    async fn process(&self, job: Self::Job, cancel: CancellationToken) -> Outcome;

    async fn recover_stale(&self) -> Result<u64, CoreError>;

    fn configured_concurrency(&self) -> usize;
    fn configured_batch_size(&self) -> i64;
    fn poll_interval(&self) -> Duration;
}

#[derive(Default)]
pub struct WorkerMetrics {
    pub processed: AtomicU64,
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
}

impl WorkerMetrics {
    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.processed.load(Ordering::SeqCst),
            self.succeeded.load(Ordering::SeqCst),
            self.failed.load(Ordering::SeqCst),
        )
    }
}

pub struct WorkerHandle {
    paused: Arc<AtomicBool>,
    cancel: CancellationToken,
    metrics: Arc<WorkerMetrics>,
    stopped: Arc<Notify>,
}

impl WorkerHandle {
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    /// Signal stop and wait up to `deadline` for the in-flight batch to
    /// finish. On deadline expiry this logs and returns without killing
    /// tasks; they complete naturally against the database.
    pub async fn stop(&self, deadline: Duration) {
        self.cancel.cancel();
        if tokio::time::timeout(deadline, self.stopped.notified()).await.is_err() {
            warn!("worker stop deadline elapsed before in-flight batch finished");
        }
    }

    pub fn metrics(&self) -> Arc<WorkerMetrics> {
        self.metrics.clone()
    }
}

/// Spawn a worker loop for `processor`, returning a handle to control it.
pub fn spawn<P>(
    processor: Arc<P>,
    scaler: Arc<Scaler>,
    health: Arc<dyn HealthMonitor>,
    name: &'static str,
) -> WorkerHandle
where
    P: JobProcessor + 'static,
{
    let paused = Arc::new(AtomicBool::new(false));
    let cancel = CancellationToken::new();
    let metrics = Arc::new(WorkerMetrics::default());
    let stopped = Arc::new(Notify::new());

    let handle = WorkerHandle {
        paused: paused.clone(),
        cancel: cancel.clone(),
        metrics: metrics.clone(),
        stopped: stopped.clone(),
    };

    let loop_cancel = cancel.clone();
    let loop_stopped = stopped.clone();
    tokio::spawn(async move {
        if let Err(e) = processor.recover_stale().await {
            warn!(worker = name, error = %e, "startup recover_stale failed");
        }

        let period = processor.poll_interval().max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);

        loop {
            tokio::select! {
                _ = loop_cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if paused.load(Ordering::SeqCst) {
                        continue;
                    }

                    let batch = match processor.dequeue(processor.configured_batch_size()).await {
                        Ok(batch) => batch,
                        Err(e) => {
                            error!(worker = name, error = %e, "dequeue failed");
                            continue;
                        }
                    };
                    if batch.is_empty() {
                        continue;
                    }

                    let concurrency = scaler
                        .get(processor.configured_concurrency(), health.get_health())
                        .max(1);
                    let semaphore = Arc::new(Semaphore::new(concurrency));

                    let mut tasks = Vec::with_capacity(batch.len());
                    for job in batch {
                        let sem = semaphore.clone();
                        let proc = processor.clone();
                        let token = loop_cancel.child_token();
                        let metrics = metrics.clone();
                        tasks.push(tokio::spawn(async move {
                            let permit = match sem.acquire_owned().await {
                                Ok(permit) => permit,
                                Err(_) => return,
                            };
                            let outcome = proc.process(job, token).await;
                            drop(permit);
                            match outcome {
                                Outcome::Completed => {
                                    metrics.processed.fetch_add(1, Ordering::SeqCst);
                                    metrics.succeeded.fetch_add(1, Ordering::SeqCst);
                                }
                                Outcome::Failed => {
                                    metrics.processed.fetch_add(1, Ordering::SeqCst);
                                    metrics.failed.fetch_add(1, Ordering::SeqCst);
                                }
                                Outcome::Cancelled => {}
                            }
                        }));
                    }

                    for task in tasks {
                        let _ = task.await;
                    }
                }
            }
        }

        info!(worker = name, "worker loop stopped");
        loop_stopped.notify_waiters();
    });

    handle
}
