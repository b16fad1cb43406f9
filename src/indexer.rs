//! Background indexing: a bounded FIFO queue of [`IndexJob`]s and a single
//! consumer task that embeds and stores them.
//!
//! Enqueueing never blocks. When the queue is full the job is dropped with a
//! warning, so image generation is never throttled by indexing. Jobs queued
//! while the indexer is stopped wait for the next [`start`](BackgroundIndexer::start)
//! or are processed by the drain in [`stop`](BackgroundIndexer::stop).
//!
//! Each job runs as its own task; a panic inside one is logged and the
//! consumer moves on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::IndexerConfig;
use crate::models::IndexJob;
use crate::search::SearchService;

/// How long `stop` waits for an in-flight job before cancelling the consumer.
const STOP_GRACE: Duration = Duration::from_secs(30);

struct Worker {
    handle: JoinHandle<()>,
    shutdown: Arc<Notify>,
}

pub struct BackgroundIndexer {
    search: Arc<SearchService>,
    sender: mpsc::Sender<IndexJob>,
    receiver: Arc<Mutex<mpsc::Receiver<IndexJob>>>,
    running: Arc<AtomicBool>,
    worker: std::sync::Mutex<Option<Worker>>,
    poll_interval: Duration,
}

impl BackgroundIndexer {
    pub fn new(search: Arc<SearchService>, capacity: usize, poll_interval: Duration) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            search,
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            running: Arc::new(AtomicBool::new(false)),
            worker: std::sync::Mutex::new(None),
            poll_interval,
        }
    }

    pub fn from_config(search: Arc<SearchService>, config: &IndexerConfig) -> Self {
        Self::new(
            search,
            config.queue_capacity,
            Duration::from_millis(config.poll_interval_ms),
        )
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of jobs waiting in the queue. Never exceeds the capacity.
    pub fn pending_count(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    /// Spawn the consumer. Must be called from within a tokio runtime.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("background indexer already running");
            return;
        }

        let shutdown = Arc::new(Notify::new());
        let handle = tokio::spawn(consume(
            Arc::clone(&self.search),
            Arc::clone(&self.receiver),
            Arc::clone(&self.running),
            Arc::clone(&shutdown),
            self.poll_interval,
        ));
        *self.worker_slot() = Some(Worker { handle, shutdown });
        info!(pending = self.pending_count(), "background indexer started");
    }

    /// Stop the consumer, then process every job still queued.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        // The consumer finishes its current job before the drain starts, so
        // jobs complete in queue order.
        if let Some(w) = self.worker_slot().take() {
            w.shutdown.notify_one();
            let mut handle = w.handle;
            if tokio::time::timeout(STOP_GRACE, &mut handle).await.is_err() {
                warn!("background indexer did not finish in time, cancelling");
                handle.abort();
                let _ = handle.await;
            }
        }

        let drained = self.drain().await;
        info!(drained, "background indexer stopped");
    }

    /// Enqueue a job without waiting. Returns `false` if it was dropped.
    pub fn queue_for_indexing(&self, job: IndexJob) -> bool {
        match self.sender.try_send(job) {
            Ok(()) => {
                debug!(pending = self.pending_count(), "queued index job");
                true
            }
            Err(TrySendError::Full(job)) => {
                warn!(image_id = %job.image_id, "index queue full, dropping job");
                false
            }
            Err(TrySendError::Closed(job)) => {
                warn!(image_id = %job.image_id, "index queue closed, dropping job");
                false
            }
        }
    }

    async fn drain(&self) -> usize {
        let mut rx = self.receiver.lock().await;
        let mut drained = 0;
        while let Ok(job) = rx.try_recv() {
            run_job(&self.search, job).await;
            drained += 1;
        }
        drained
    }

    fn worker_slot(&self) -> std::sync::MutexGuard<'_, Option<Worker>> {
        self.worker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn consume(
    search: Arc<SearchService>,
    receiver: Arc<Mutex<mpsc::Receiver<IndexJob>>>,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    poll_interval: Duration,
) {
    while running.load(Ordering::SeqCst) {
        let job = {
            let mut rx = receiver.lock().await;
            tokio::select! {
                biased;
                _ = shutdown.notified() => break,
                received = tokio::time::timeout(poll_interval, rx.recv()) => match received {
                    Ok(Some(job)) => job,
                    Ok(None) => break,
                    Err(_) => continue,
                },
            }
        };
        run_job(&search, job).await;
    }
    debug!("background indexer consumer exited");
}

async fn run_job(search: &Arc<SearchService>, job: IndexJob) {
    let image_id = job.image_id.clone();
    let search = Arc::clone(search);
    let task = tokio::spawn(async move { search.index_job(&job).await });
    match task.await {
        Ok(true) => debug!(%image_id, "index job done"),
        Ok(false) => warn!(%image_id, "index job did not index image"),
        Err(e) => error!(%image_id, error = %e, "index job panicked"),
    }
}
