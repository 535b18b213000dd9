//! Queue and processing progress, written by ingestion and the worker loop
//! and read by any number of status queries.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Idle,
    /// New files are being staged.
    Indexing,
    /// A dequeued file is being classified.
    Analyzing,
}

/// Snapshot of progress.
///
/// `processed_count <= total_queued` always holds, and `status` is `Idle`
/// only once every queued task has been processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressState {
    pub total_queued: usize,
    pub processed_count: usize,
    pub current_file: String,
    pub status: Status,
    /// Ingestion calls currently staging files. Lives under the same lock
    /// as the counters so the Idle decision sees both.
    #[serde(skip)]
    active_ingests: usize,
}

impl Default for ProgressState {
    fn default() -> Self {
        Self {
            total_queued: 0,
            processed_count: 0,
            current_file: String::new(),
            status: Status::Idle,
            active_ingests: 0,
        }
    }
}

impl ProgressState {
    /// Every queued task has been processed.
    pub fn is_drained(&self) -> bool {
        self.processed_count == self.total_queued
    }
}

/// Writer side of the progress state.
///
/// Every update is a single `send_modify`, so each decision is made under
/// the watch lock and readers always see a consistent snapshot.
pub struct ProgressTracker {
    tx: watch::Sender<ProgressState>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ProgressState::default());
        Self { tx }
    }

    pub fn snapshot(&self) -> ProgressState {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ProgressState> {
        self.tx.subscribe()
    }

    /// An ingestion call is about to stage files. Starts a fresh batch when
    /// the previous one is fully processed.
    pub fn begin_ingest(&self) {
        self.tx.send_modify(|s| {
            s.active_ingests += 1;
            if s.is_drained() {
                s.total_queued = 0;
                s.processed_count = 0;
            }
            if s.status != Status::Analyzing {
                s.status = Status::Indexing;
            }
        });
    }

    /// A task is about to be enqueued.
    pub fn task_queued(&self) {
        self.tx.send_modify(|s| s.total_queued += 1);
    }

    /// The ingestion call started with [`begin_ingest`](Self::begin_ingest)
    /// has finished staging.
    pub fn end_ingest(&self) {
        self.tx.send_modify(|s| {
            s.active_ingests = s.active_ingests.saturating_sub(1);
            if s.active_ingests == 0 && s.status == Status::Indexing && s.is_drained() {
                s.status = Status::Idle;
                s.current_file.clear();
            }
        });
    }

    /// The worker loop dequeued `file`.
    pub fn task_started(&self, file: &str) {
        self.tx.send_modify(|s| {
            s.status = Status::Analyzing;
            s.current_file = file.to_string();
        });
    }

    /// The worker loop is done with its current task, successfully or not.
    pub fn task_finished(&self) {
        self.tx.send_modify(|s| {
            if s.processed_count < s.total_queued {
                s.processed_count += 1;
            } else {
                tracing::warn!(
                    processed = s.processed_count,
                    total = s.total_queued,
                    "task finished beyond queued total"
                );
            }
            if s.is_drained() {
                s.current_file.clear();
                s.status = if s.active_ingests > 0 {
                    Status::Indexing
                } else {
                    Status::Idle
                };
            }
        });
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_lifecycle() {
        let progress = ProgressTracker::new();
        assert_eq!(progress.snapshot().status, Status::Idle);

        progress.begin_ingest();
        progress.task_queued();
        progress.task_queued();
        assert_eq!(progress.snapshot().status, Status::Indexing);
        progress.end_ingest();
        assert_eq!(progress.snapshot().status, Status::Indexing);

        progress.task_started("a.jpg");
        let s = progress.snapshot();
        assert_eq!((s.status, s.current_file.as_str()), (Status::Analyzing, "a.jpg"));

        progress.task_finished();
        let s = progress.snapshot();
        assert_eq!((s.processed_count, s.total_queued), (1, 2));
        assert_eq!(s.status, Status::Analyzing);

        progress.task_started("b.jpg");
        progress.task_finished();
        let s = progress.snapshot();
        assert_eq!(s, ProgressState {
            total_queued: 2,
            processed_count: 2,
            current_file: String::new(),
            status: Status::Idle,
            active_ingests: 0,
        });
    }

    #[test]
    fn test_empty_ingest_returns_to_idle() {
        let progress = ProgressTracker::new();
        progress.begin_ingest();
        progress.end_ingest();
        assert_eq!(progress.snapshot().status, Status::Idle);
    }

    #[test]
    fn test_ingest_during_analysis_keeps_analyzing() {
        let progress = ProgressTracker::new();
        progress.begin_ingest();
        progress.task_queued();
        progress.end_ingest();
        progress.task_started("a.jpg");

        progress.begin_ingest();
        progress.task_queued();
        let s = progress.snapshot();
        assert_eq!(s.status, Status::Analyzing);
        assert_eq!(s.total_queued, 2);
        progress.end_ingest();

        progress.task_finished();
        progress.task_started("b.jpg");
        progress.task_finished();
        assert_eq!(progress.snapshot().status, Status::Idle);
    }

    #[test]
    fn test_new_batch_resets_counters_once_drained() {
        let progress = ProgressTracker::new();
        progress.begin_ingest();
        progress.task_queued();
        progress.end_ingest();
        progress.task_started("a.jpg");
        progress.task_finished();

        progress.begin_ingest();
        let s = progress.snapshot();
        assert_eq!((s.processed_count, s.total_queued), (0, 0));
    }

    #[test]
    fn test_processed_never_exceeds_total() {
        let progress = ProgressTracker::new();
        progress.task_finished();
        let s = progress.snapshot();
        assert_eq!((s.processed_count, s.total_queued), (0, 0));
        assert_eq!(s.status, Status::Idle);
    }

    #[test]
    fn test_drained_while_still_ingesting_reports_indexing() {
        let progress = ProgressTracker::new();
        progress.begin_ingest();
        progress.task_queued();
        progress.task_started("a.jpg");
        progress.task_finished();
        assert_eq!(progress.snapshot().status, Status::Indexing);
        progress.end_ingest();
        assert_eq!(progress.snapshot().status, Status::Idle);
    }

    #[test]
    fn test_concurrent_finish_and_end_ingest_reach_idle() {
        use std::sync::{Arc, Barrier};

        for _ in 0..2_000 {
            let progress = Arc::new(ProgressTracker::new());
            progress.begin_ingest();
            progress.task_queued();
            progress.task_started("a.jpg");

            let barrier = Arc::new(Barrier::new(2));
            let worker = {
                let (progress, barrier) = (Arc::clone(&progress), Arc::clone(&barrier));
                std::thread::spawn(move || {
                    barrier.wait();
                    progress.task_finished();
                })
            };
            barrier.wait();
            progress.end_ingest();
            worker.join().unwrap();

            let s = progress.snapshot();
            assert!(s.is_drained());
            assert_eq!(s.status, Status::Idle, "{s:?}");
        }
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_value(ProgressState::default()).unwrap();
        assert_eq!(json["status"], "idle");
        assert_eq!(json["processed_count"], 0);
        assert!(json.get("active_ingests").is_none());
    }
}
