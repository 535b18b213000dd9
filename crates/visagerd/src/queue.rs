//! FIFO queue of photos waiting for the worker loop.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

#[derive(Error, Debug, PartialEq, Eq)]
#[error("ingest queue is closed")]
pub struct QueueClosed;

/// A staged photo awaiting classification. Consumed exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhotoTask {
    pub path: PathBuf,
}

impl PhotoTask {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// File name for logs and progress reporting.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Unbounded multi-producer, single-consumer FIFO.
///
/// Producers never wait. Tasks from one producer keep their relative order.
pub struct IngestQueue {
    tx: mpsc::UnboundedSender<PhotoTask>,
    rx: Mutex<mpsc::UnboundedReceiver<PhotoTask>>,
    pending: AtomicUsize,
    closed: AtomicBool,
}

impl IngestQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
            pending: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Append a task to the tail.
    pub fn enqueue(&self, task: PhotoTask) -> Result<(), QueueClosed> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueClosed);
        }
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.tx.send(task).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            QueueClosed
        })
    }

    /// Wait for and remove the head task.
    ///
    /// Cancel-safe: dropping the future before it resolves loses nothing.
    pub async fn dequeue(&self) -> Option<PhotoTask> {
        let mut rx = self.rx.lock().await;
        let task = rx.recv().await?;
        self.pending.fetch_sub(1, Ordering::AcqRel);
        Some(task)
    }

    /// Stop accepting new tasks. Already queued tasks stay dequeueable.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of tasks waiting.
    pub fn len(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for IngestQueue {
    fn default() -> Self {
        Self::new()
    }
}
