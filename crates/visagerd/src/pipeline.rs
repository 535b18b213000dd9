//! Service context shared by the worker loop and every control operation.
//!
//! One [`Pipeline`] is built at startup and handed around as an `Arc`; it
//! owns the ingest queue, the progress tracker, the identity store and the
//! handle to the engine thread.

use crate::config::Config;
use crate::engine::{spawn_engine, EngineHandle, ExecutorError};
use crate::progress::{ProgressState, ProgressTracker};
use crate::queue::{IngestQueue, PhotoTask, QueueClosed};
use crate::worker;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use visager_core::library::{self, Album, LibraryPhoto, ReviewItem};
use visager_core::router::{self, GROUP_PHOTOS, NEEDS_NAME, NEEDS_REVIEW};
use visager_core::types::most_confident;
use visager_core::{
    CosineMatcher, Embedding, FaceBackend, FileRouter, IdentityStore, MatchResult, Matcher,
    RouteError, StoreError,
};

/// Upload chunk size.
const CHUNK_SIZE: usize = 1024 * 1024;
/// Log upload progress every this many bytes.
const PROGRESS_LOG_BYTES: u64 = 2 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("not found: {0}")]
    NotFound(PathBuf),
    #[error("invalid name {0:?}: must be a single folder name and not a reserved folder")]
    InvalidName(String),
    #[error("not a supported image: {0}")]
    Unsupported(PathBuf),
    #[error("pipeline is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Route(RouteError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl From<RouteError> for PipelineError {
    fn from(e: RouteError) -> Self {
        match e {
            RouteError::NotFound(path) => PipelineError::NotFound(path),
            RouteError::InvalidName(name) => PipelineError::InvalidName(name),
            other => PipelineError::Route(other),
        }
    }
}

impl From<QueueClosed> for PipelineError {
    fn from(_: QueueClosed) -> Self {
        PipelineError::ShuttingDown
    }
}

/// Result of an `index` call.
#[derive(Debug, Clone, Serialize)]
pub struct IndexReport {
    pub queued: usize,
    /// Paths that were not staged (missing, not an image, copy failed).
    pub skipped: Vec<String>,
}

/// Result of naming a reviewed photo.
#[derive(Debug, Clone, Serialize)]
pub struct AssignOutcome {
    pub name: String,
    /// Where the photo now lives.
    pub path: PathBuf,
    /// Whether a reference embedding was added to the identity store.
    pub embedding_added: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub queue_size: usize,
    pub worker_alive: bool,
    pub executor_ready: bool,
}

pub struct Pipeline {
    pub(crate) router: FileRouter,
    pub(crate) threshold: f32,
    store_path: PathBuf,
    pub(crate) store: Mutex<IdentityStore>,
    pub(crate) queue: IngestQueue,
    pub(crate) progress: ProgressTracker,
    pub(crate) engine: EngineHandle,
    shutdown_tx: watch::Sender<bool>,
    worker: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Pipeline {
    /// Build the pipeline and spawn the engine thread around `backend`.
    ///
    /// Loads the identity store; does not start the backend or the worker
    /// loop (see [`initialize`](Self::initialize) and [`start`](Self::start)).
    pub fn new<B>(config: &Config, backend: B) -> Result<Arc<Self>, PipelineError>
    where
        B: FaceBackend + 'static,
    {
        let store = IdentityStore::load(&config.store_path, &config.model_tag);
        let engine = spawn_engine(backend)?;
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            router: FileRouter::new(&config.photos_root),
            threshold: config.match_threshold,
            store_path: config.store_path.clone(),
            store: Mutex::new(store),
            queue: IngestQueue::new(),
            progress: ProgressTracker::new(),
            engine,
            shutdown_tx,
            worker: std::sync::Mutex::new(None),
        }))
    }

    /// Create the folder layout and bring the recognition backend up.
    /// Safe to call again after a failure.
    pub async fn initialize(&self) -> Result<(), PipelineError> {
        let router = self.router.clone();
        tokio::task::spawn_blocking(move || router.ensure_layout()).await??;
        self.engine.initialize().await?;
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.engine.is_ready()
    }

    /// Spawn the worker loop. Does nothing if it is already running.
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let shutdown_rx = self.shutdown_tx.subscribe();
        *slot = Some(tokio::spawn(worker::run(Arc::clone(self), shutdown_rx)));
    }

    pub fn root(&self) -> &Path {
        self.router.root()
    }

    /// Stage each path into the Inbox and queue it for classification.
    pub async fn index(&self, paths: Vec<PathBuf>) -> Result<IndexReport, PipelineError> {
        if self.queue.is_closed() {
            return Err(PipelineError::ShuttingDown);
        }
        self.progress.begin_ingest();
        let result = self.stage_all(paths).await;
        self.progress.end_ingest();

        let report = result?;
        tracing::info!(queued = report.queued, skipped = report.skipped.len(), "index: batch staged");
        Ok(report)
    }

    async fn stage_all(&self, paths: Vec<PathBuf>) -> Result<IndexReport, PipelineError> {
        let mut report = IndexReport {
            queued: 0,
            skipped: Vec::new(),
        };

        // Sequential copies keep disk I/O from saturating.
        for path in paths {
            if !library::is_photo(&path) {
                tracing::warn!(path = %path.display(), "index: not a supported image; skipping");
                report.skipped.push(path.display().to_string());
                continue;
            }

            let router = self.router.clone();
            let src = path.clone();
            let staged = match tokio::task::spawn_blocking(move || router.stage_copy(&src)).await? {
                Ok(staged) => staged,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "index: cannot stage; skipping");
                    report.skipped.push(path.display().to_string());
                    continue;
                }
            };

            self.submit(PhotoTask::new(staged))?;
            report.queued += 1;
        }
        Ok(report)
    }

    /// Stream a photo into the Inbox and queue it.
    pub async fn receive<R>(&self, filename: &str, mut reader: R) -> Result<PathBuf, PipelineError>
    where
        R: AsyncRead + Unpin,
    {
        if self.queue.is_closed() {
            return Err(PipelineError::ShuttingDown);
        }
        let name = Path::new(filename)
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| PipelineError::Unsupported(PathBuf::from(filename)))?
            .to_string();
        if !library::is_photo(Path::new(&name)) {
            return Err(PipelineError::Unsupported(PathBuf::from(name)));
        }

        self.progress.begin_ingest();
        let result = self.write_to_inbox(&name, &mut reader).await;
        let result = match result {
            Ok(dest) => self.submit(PhotoTask::new(dest.clone())).map(|()| dest),
            Err(e) => Err(e),
        };
        self.progress.end_ingest();
        result
    }

    async fn write_to_inbox<R>(&self, name: &str, reader: &mut R) -> Result<PathBuf, PipelineError>
    where
        R: AsyncRead + Unpin,
    {
        let inbox = self.router.inbox();
        tokio::fs::create_dir_all(&inbox).await?;

        let (dest, mut file) = create_unique(&inbox, name).await?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut received: u64 = 0;
        let mut next_log = PROGRESS_LOG_BYTES;

        let copied: Result<(), std::io::Error> = async {
            loop {
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                file.write_all(&buf[..n]).await?;
                received += n as u64;
                if received >= next_log {
                    tracing::info!(file = name, mib = received / (1024 * 1024), "upload: receiving");
                    next_log += PROGRESS_LOG_BYTES;
                }
            }
            file.flush().await?;
            file.sync_all().await
        }
        .await;

        if let Err(e) = copied {
            drop(file);
            let _ = tokio::fs::remove_file(&dest).await;
            return Err(e.into());
        }
        tracing::info!(file = name, bytes = received, dest = %dest.display(), "upload: saved");
        Ok(dest)
    }

    fn submit(&self, task: PhotoTask) -> Result<(), PipelineError> {
        self.progress.task_queued();
        if let Err(e) = self.queue.enqueue(task) {
            // Keep processed <= total reachable: count the dropped task as done.
            self.progress.task_finished();
            return Err(e.into());
        }
        Ok(())
    }

    /// Current progress snapshot.
    pub fn status(&self) -> ProgressState {
        self.progress.snapshot()
    }

    /// Receiver that observes every progress change.
    pub fn subscribe(&self) -> watch::Receiver<ProgressState> {
        self.progress.subscribe()
    }

    pub fn health(&self) -> Health {
        let worker_alive = self
            .worker
            .lock()
            .map(|slot| slot.as_ref().is_some_and(|h| !h.is_finished()))
            .unwrap_or(false);
        Health {
            status: "healthy",
            queue_size: self.queue.len(),
            worker_alive,
            executor_ready: self.engine.is_ready(),
        }
    }

    pub async fn albums(&self) -> Result<Vec<Album>, PipelineError> {
        let root = self.router.root().to_path_buf();
        Ok(tokio::task::spawn_blocking(move || library::albums(&root)).await??)
    }

    pub async fn photos(&self) -> Result<Vec<LibraryPhoto>, PipelineError> {
        let root = self.router.root().to_path_buf();
        Ok(tokio::task::spawn_blocking(move || library::photos(&root)).await??)
    }

    pub async fn review(&self) -> Result<Vec<ReviewItem>, PipelineError> {
        let root = self.router.root().to_path_buf();
        Ok(tokio::task::spawn_blocking(move || library::review_items(&root)).await??)
    }

    /// Match an embedding against the identity store.
    pub async fn identify(&self, embedding: &Embedding) -> MatchResult {
        let store = self.store.lock().await;
        CosineMatcher.best_match(embedding, &store, self.threshold)
    }

    /// Number of identities and reference embeddings in the store.
    pub async fn store_size(&self) -> (usize, usize) {
        let store = self.store.lock().await;
        (store.len(), store.embedding_count())
    }

    /// Name a photo waiting for review.
    ///
    /// Moves it into the person's folder and adds its face embedding to the
    /// identity store, which is persisted straight away.
    pub async fn assign(&self, path: &str, name: &str) -> Result<AssignOutcome, PipelineError> {
        if !router::is_valid_person_name(name) {
            return Err(PipelineError::InvalidName(name.to_string()));
        }
        let source = self.pending_location(path).await?;
        if !tokio::fs::try_exists(&source).await.unwrap_or(false) {
            tracing::warn!(source = %source.display(), "assign: source not found");
            return Err(PipelineError::NotFound(source));
        }

        let router = self.router.clone();
        let folder = name.to_string();
        let src = source.clone();
        let dest = tokio::task::spawn_blocking(move || router.move_into(&src, &folder)).await??;
        tracing::info!(name, from = %source.display(), to = %dest.display(), "assign: photo moved");

        let faces = match self.engine.detect(dest.clone()).await {
            Ok(faces) => faces,
            Err(e) => {
                tracing::error!(name, path = %dest.display(), error = %e, "assign: embedding extraction failed");
                Vec::new()
            }
        };
        let Some(face) = most_confident(&faces) else {
            tracing::warn!(name, path = %dest.display(), "assign: no face to learn from; store unchanged");
            return Ok(AssignOutcome {
                name: name.to_string(),
                path: dest,
                embedding_added: false,
            });
        };

        self.remember(name, face.embedding.clone()).await?;
        Ok(AssignOutcome {
            name: name.to_string(),
            path: dest,
            embedding_added: true,
        })
    }

    /// Append a reference embedding and persist the store. The whole
    /// read-modify-write runs under the store lock.
    async fn remember(&self, name: &str, embedding: Embedding) -> Result<(), PipelineError> {
        let mut store = self.store.lock().await;
        store.append(name, embedding)?;
        let embeddings = store.get(name).map_or(0, |r| r.embeddings.len());

        let snapshot = store.clone();
        let path = self.store_path.clone();
        match tokio::task::spawn_blocking(move || snapshot.save(&path)).await? {
            Ok(()) => tracing::info!(name, embeddings, "assign: identity updated"),
            // The in-memory store stays authoritative until the next save.
            Err(e) => tracing::error!(name, error = %e, "assign: failed to persist identity store"),
        }
        Ok(())
    }

    /// Where a photo submitted for review is expected to be.
    ///
    /// A folder named in `path` wins; a bare file name is looked up in
    /// `Needs_Name`, then `Group_Photos`, then the legacy review folder.
    async fn pending_location(&self, path: &str) -> Result<PathBuf, PipelineError> {
        let file_name = Path::new(path)
            .file_name()
            .ok_or_else(|| PipelineError::NotFound(PathBuf::from(path)))?;
        let hinted = [NEEDS_NAME, GROUP_PHOTOS]
            .into_iter()
            .find(|folder| path.contains(*folder));
        if let Some(folder) = hinted {
            return Ok(self.router.folder(folder).join(file_name));
        }
        for folder in [NEEDS_NAME, GROUP_PHOTOS] {
            let candidate = self.router.folder(folder).join(file_name);
            if tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
                return Ok(candidate);
            }
        }
        Ok(self.router.folder(NEEDS_REVIEW).join(file_name))
    }

    /// Stop accepting work, let the in-flight task finish, then release the
    /// recognition backend. Tasks still queued stay in the Inbox.
    pub async fn shutdown(&self) {
        tracing::info!("pipeline shutting down");
        self.queue.close();
        let _ = self.shutdown_tx.send(true);

        let handle = self
            .worker
            .lock()
            .map(|mut slot| slot.take())
            .unwrap_or(None);
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "worker loop ended abnormally");
            }
        }

        let left = self.queue.len();
        if left > 0 {
            tracing::warn!(left, "unprocessed photos remain in the Inbox");
        }
        self.engine.shutdown().await;
        tracing::info!("pipeline stopped");
    }
}

/// Create `dir/name` exclusively, suffixing the name on clash.
async fn create_unique(dir: &Path, name: &str) -> std::io::Result<(PathBuf, tokio::fs::File)> {
    let mut candidate = dir.join(name);
    for _ in 0..16 {
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
            .await
        {
            Ok(file) => return Ok((candidate, file)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                candidate = dir.join(router::collision_name(name));
            }
            Err(e) => return Err(e),
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        format!("no free name for {name} in {}", dir.display()),
    ))
}
