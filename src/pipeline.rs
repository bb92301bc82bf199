//! Pipeline worker pool.
//!
//! A bounded FIFO queue feeds `max_workers` persistent workers; each worker
//! drives one task at a time through Download → Split → Transcribe → Merge
//! with validated status transitions. Workers receive tasks only through the
//! queue and never hold references back to the pool, so shutdown is just:
//! stop admitting, close the queue, wait for the drain, join with a grace
//! period.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::downloader::Downloader;
use crate::error::{Error as PipelineError, Result};
use crate::media::MediaTools;
use crate::ratelimit::RateLimiter;
use crate::registry::TaskRegistry;
use crate::splitter::Splitter;
use crate::store::ObjectStore;
use crate::task::{Task, TaskStatus};
use crate::transcriber::Transcriber;

/// How long a blocked worker waits on the queue before re-checking shutdown.
const DEQUEUE_POLL: Duration = Duration::from_secs(1);
/// Per-worker join timeout during shutdown.
const WORKER_JOIN_GRACE: Duration = Duration::from_secs(2);

/// Why a submission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("a task for this URL already exists")]
    Duplicate,
    #[error("task queue is full")]
    QueueFull,
    #[error("the pipeline is shutting down")]
    ShuttingDown,
}

struct Stages {
    downloader: Downloader,
    splitter: Splitter,
    transcriber: Transcriber,
}

pub struct WorkerPool {
    registry: Arc<TaskRegistry>,
    sender: std::sync::Mutex<Option<mpsc::Sender<Arc<Task>>>>,
    shutdown: watch::Sender<bool>,
    /// Tasks accepted but not yet finished processing (queued + in-flight).
    outstanding: Arc<AtomicUsize>,
    drained: Arc<Notify>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
    max_queue_size: usize,
}

impl WorkerPool {
    /// Build the stage handlers and start the workers. Must run inside a
    /// tokio runtime.
    pub fn start(
        cfg: &Config,
        registry: Arc<TaskRegistry>,
        store: Arc<dyn ObjectStore>,
        media: Arc<dyn MediaTools>,
        limiter: Arc<RateLimiter>,
    ) -> Arc<Self> {
        let stages = Arc::new(Stages {
            downloader: Downloader::new(store.clone(), media.clone(), cfg.download.clone()),
            splitter: Splitter::new(store.clone(), media.clone(), cfg.transcription.clone()),
            transcriber: Transcriber::new(
                store,
                media,
                limiter,
                cfg.transcription.clone(),
                cfg.download.retry_delay,
            ),
        });

        let (sender, receiver) = mpsc::channel(cfg.worker.max_queue_size);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let (shutdown, _) = watch::channel(false);
        let outstanding = Arc::new(AtomicUsize::new(0));
        let drained = Arc::new(Notify::new());

        let mut workers = Vec::with_capacity(cfg.worker.max_workers);
        for index in 0..cfg.worker.max_workers {
            let receiver = receiver.clone();
            let stages = stages.clone();
            let outstanding = outstanding.clone();
            let drained = drained.clone();
            workers.push(tokio::spawn(async move {
                worker_loop(index, receiver, stages, outstanding, drained).await;
            }));
            info!(worker = index, "started pipeline worker");
        }

        Arc::new(Self {
            registry,
            sender: std::sync::Mutex::new(Some(sender)),
            shutdown,
            outstanding,
            drained,
            workers: std::sync::Mutex::new(workers),
            max_queue_size: cfg.worker.max_queue_size,
        })
    }

    fn current_sender(&self) -> Option<mpsc::Sender<Arc<Task>>> {
        self.sender
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Register and enqueue a new task for `url`.
    ///
    /// De-duplicates by URL under the registry lock; a full queue rolls the
    /// registration back so the URL stays available.
    pub fn submit(&self, url: &str) -> std::result::Result<Arc<Task>, SubmitError> {
        let Some(sender) = self.current_sender() else {
            return Err(SubmitError::ShuttingDown);
        };
        if *self.shutdown.borrow() {
            return Err(SubmitError::ShuttingDown);
        }

        let task = self
            .registry
            .register(url)
            .ok_or(SubmitError::Duplicate)?;

        match sender.try_send(task.clone()) {
            Ok(()) => {
                self.outstanding.fetch_add(1, Ordering::SeqCst);
                info!(task_id = %task.id, %url, "task queued");
                Ok(task)
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(%url, "queue full, rejecting submission");
                self.registry.deregister(&task);
                Err(SubmitError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.registry.deregister(&task);
                Err(SubmitError::ShuttingDown)
            }
        }
    }

    /// Re-enqueue a Failed/Cancelled/Paused task. Refuses anything else.
    pub async fn resume(&self, task: &Arc<Task>) -> bool {
        if !task.can_resume() {
            warn!(task_id = %task.id, status = %task.status(), "task is not resumable");
            return false;
        }
        if !task.try_transition(TaskStatus::Pending) {
            return false;
        }
        let Some(sender) = self.current_sender() else {
            return false;
        };

        self.outstanding.fetch_add(1, Ordering::SeqCst);
        if sender.send(task.clone()).await.is_err() {
            self.release_one();
            return false;
        }
        info!(task_id = %task.id, "task resumed");
        true
    }

    /// Tasks currently queued or being processed.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Tasks sitting in the queue, waiting for a worker.
    pub fn queue_depth(&self) -> usize {
        self.current_sender()
            .map(|sender| self.max_queue_size - sender.capacity())
            .unwrap_or(0)
    }

    fn release_one(&self) {
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }

    /// Stop admitting work, drain the queue, and join the workers.
    ///
    /// Queued and in-flight tasks run to a terminal status; workers that do
    /// not exit within the grace period are logged and abandoned.
    pub async fn shutdown(&self) {
        info!("worker pool: initiating shutdown");
        let _ = self.shutdown.send(true);
        // Closing the queue lets workers drain the backlog and then exit.
        self.sender.lock().unwrap_or_else(|p| p.into_inner()).take();

        loop {
            let notified = self.drained.notified();
            if self.outstanding.load(Ordering::SeqCst) == 0 {
                break;
            }
            notified.await;
        }

        let workers = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(|p| p.into_inner()),
        );
        for (index, handle) in workers.into_iter().enumerate() {
            match tokio::time::timeout(WORKER_JOIN_GRACE, handle).await {
                Ok(_) => info!(worker = index, "worker terminated"),
                Err(_) => warn!(worker = index, "worker did not terminate within grace period"),
            }
        }
        info!("worker pool: shutdown complete");
    }
}

async fn worker_loop(
    index: usize,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Arc<Task>>>>,
    stages: Arc<Stages>,
    outstanding: Arc<AtomicUsize>,
    drained: Arc<Notify>,
) {
    loop {
        let received = {
            let mut receiver = receiver.lock().await;
            tokio::time::timeout(DEQUEUE_POLL, receiver.recv()).await
        };

        match received {
            Ok(Some(task)) => {
                info!(worker = index, task_id = %task.id, "picked up task");
                process_task(&stages, &task).await;
                info!(worker = index, task_id = %task.id, status = %task.status(), "finished task");
                if outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
                    drained.notify_waiters();
                }
            }
            // Queue closed and fully drained.
            Ok(None) => break,
            // Poll timeout: releases the receiver lock so shutdown stays
            // observable at this granularity even under contention.
            Err(_) => {}
        }
    }
    info!(worker = index, "worker exiting");
}

async fn process_task(stages: &Stages, task: &Arc<Task>) {
    if let Err(err) = run_stages(stages, task).await {
        if matches!(err, PipelineError::InvalidTransition { .. }) {
            error!(task_id = %task.id, error = %err, "pipeline invariant violated");
            task.add_error(err.to_string(), None);
        }
        if !task.try_transition(TaskStatus::Failed) {
            warn!(task_id = %task.id, status = %task.status(), "could not mark task failed");
        }
    }
}

async fn run_stages(stages: &Stages, task: &Arc<Task>) -> Result<()> {
    task.transition(TaskStatus::Downloading)?;
    if let Err(err) = stages.downloader.run(task).await {
        task.add_error(format!("failed to download media: {err}"), None);
        return Err(err);
    }

    task.transition(TaskStatus::Splitting)?;
    if let Err(err) = stages.splitter.run(task).await {
        task.add_error(format!("audio splitting failed: {err}"), None);
        return Err(err);
    }

    task.transition(TaskStatus::Transcribing)?;
    if let Err(err) = stages.transcriber.transcribe_all_chunks(task).await {
        let failed = task.snapshot().metadata.processing.failed_chunks;
        let message = if failed.is_empty() {
            format!("audio transcription failed: {err}")
        } else {
            format!("audio transcription failed for chunks: {}", failed.join(", "))
        };
        task.add_error(message, None);
        return Err(err);
    }

    task.transition(TaskStatus::Merging)?;
    if let Err(err) = stages.transcriber.merge_transcripts(task).await {
        task.add_error(format!("merging transcripts failed: {err}"), None);
        return Err(err);
    }

    task.transition(TaskStatus::Completed)?;
    task.update(|state| {
        state.metadata.processing.processing_completed_at = Some(chrono::Utc::now());
    });
    Ok(())
}
