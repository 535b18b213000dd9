//! Worker loop: the single consumer of the ingest queue.
//!
//! Tasks are taken strictly in FIFO order and handed to the engine one at a
//! time. Every dequeued task counts as processed exactly once, whether it
//! was classified or failed; nothing is retried.

use crate::pipeline::{Pipeline, PipelineError};
use crate::queue::PhotoTask;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use visager_core::{classify, Classification, CosineMatcher};

pub(crate) async fn run(pipeline: Arc<Pipeline>, mut shutdown: watch::Receiver<bool>) {
    tracing::info!("worker loop started");
    loop {
        // Shutdown is only observed between tasks; an in-flight task always
        // runs to completion.
        let task = tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => break,
            task = pipeline.queue.dequeue() => match task {
                Some(task) => task,
                None => break,
            },
        };

        let file = task.file_name();
        pipeline.progress.task_started(&file);
        tracing::info!(file = %file, "worker: handing off to engine");

        match process(&pipeline, &task).await {
            Ok((classification, dest)) => tracing::info!(
                file = %file,
                folder = classification.folder(),
                dest = %dest.display(),
                "worker: photo classified"
            ),
            Err(e) => tracing::error!(file = %file, error = %e, "worker: task failed"),
        }

        pipeline.progress.task_finished();
    }
    tracing::info!("worker loop stopped");
}

/// Recognize, classify and route one staged photo.
async fn process(
    pipeline: &Pipeline,
    task: &PhotoTask,
) -> Result<(Classification, PathBuf), PipelineError> {
    if !tokio::fs::try_exists(&task.path).await.unwrap_or(false) {
        return Err(PipelineError::NotFound(task.path.clone()));
    }

    let faces = pipeline.engine.detect(task.path.clone()).await?;
    tracing::debug!(file = %task.file_name(), faces = faces.len(), "worker: faces detected");

    let classification = {
        let store = pipeline.store.lock().await;
        classify(&faces, &store, &CosineMatcher, pipeline.threshold)
    };

    let router = pipeline.router.clone();
    let path = task.path.clone();
    let target = classification.clone();
    let dest = tokio::task::spawn_blocking(move || router.route(&path, &target)).await??;
    Ok((classification, dest))
}
