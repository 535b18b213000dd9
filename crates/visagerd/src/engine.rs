use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use visager_core::{DetectError, FaceBackend, FaceObservation};

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("recognition failed: {0}")]
    Detect(#[from] DetectError),
    #[error("recognition panicked: {0}")]
    Panicked(String),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from the pipeline to the engine thread.
enum EngineRequest {
    Initialize {
        reply: oneshot::Sender<Result<(), ExecutorError>>,
    },
    Detect {
        path: PathBuf,
        reply: oneshot::Sender<Result<Vec<FaceObservation>, ExecutorError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Clone-safe handle to the engine thread.
///
/// The engine owns the recognition backend and runs exactly one job at a
/// time. Callers await the reply without blocking the runtime.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    ready: Arc<AtomicBool>,
}

impl EngineHandle {
    /// Bring the backend up. Idempotent.
    pub async fn initialize(&self) -> Result<(), ExecutorError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Initialize { reply: reply_tx })
            .await
            .map_err(|_| ExecutorError::ChannelClosed)?;
        reply_rx.await.map_err(|_| ExecutorError::ChannelClosed)?
    }

    /// Whether the backend reported ready after its last initialization.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Detect faces in one image.
    ///
    /// "No face" and backend-reported failures come back as an empty list;
    /// only crashes, hangs and panics are errors.
    pub async fn detect(&self, path: PathBuf) -> Result<Vec<FaceObservation>, ExecutorError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Detect {
                path,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ExecutorError::ChannelClosed)?;
        reply_rx.await.map_err(|_| ExecutorError::ChannelClosed)?
    }

    /// Stop the engine after the jobs already submitted have run, then
    /// release the backend. Returns once the backend is shut down.
    pub async fn shutdown(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(EngineRequest::Shutdown { reply: reply_tx })
            .await
            .is_err()
        {
            return;
        }
        let _ = reply_rx.await;
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The backend is not initialized here; call [`EngineHandle::initialize`]
/// at startup. A panic inside the backend is caught and reported as a
/// failed job; the thread keeps serving.
pub fn spawn_engine<B>(backend: B) -> Result<EngineHandle, ExecutorError>
where
    B: FaceBackend + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);
    let ready = Arc::new(AtomicBool::new(false));
    let thread_ready = Arc::clone(&ready);
    let mut backend = backend;

    std::thread::Builder::new()
        .name("visager-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Initialize { reply } => {
                        let result = run_initialize(&mut backend);
                        thread_ready.store(backend.is_ready(), Ordering::Release);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Detect { path, reply } => {
                        let result = run_detect(&mut backend, &path);
                        thread_ready.store(backend.is_ready(), Ordering::Release);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Shutdown { reply } => {
                        tracing::info!("engine shutting down backend");
                        if let Err(payload) =
                            panic::catch_unwind(AssertUnwindSafe(|| backend.shutdown()))
                        {
                            tracing::error!(panic = %panic_message(&*payload), "backend shutdown panicked");
                        }
                        thread_ready.store(false, Ordering::Release);
                        let _ = reply.send(());
                        break;
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(ExecutorError::Spawn)?;

    Ok(EngineHandle { tx, ready })
}

fn run_initialize<B: FaceBackend>(backend: &mut B) -> Result<(), ExecutorError> {
    match panic::catch_unwind(AssertUnwindSafe(|| backend.initialize())) {
        Ok(Ok(())) => {
            tracing::info!("recognition backend ready");
            Ok(())
        }
        Ok(Err(e)) => Err(e.into()),
        Err(payload) => Err(ExecutorError::Panicked(panic_message(&*payload))),
    }
}

/// Run one detection, degrading per-image backend failures to "no faces".
fn run_detect<B: FaceBackend>(
    backend: &mut B,
    path: &Path,
) -> Result<Vec<FaceObservation>, ExecutorError> {
    let started = std::time::Instant::now();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| backend.detect_faces(path)));
    let elapsed_ms = started.elapsed().as_millis() as u64;

    match outcome {
        Ok(Ok(faces)) => {
            tracing::debug!(path = %path.display(), faces = faces.len(), elapsed_ms, "detect: done");
            Ok(faces)
        }
        Ok(Err(DetectError::NoFace)) => {
            tracing::debug!(path = %path.display(), elapsed_ms, "detect: no face");
            Ok(Vec::new())
        }
        Ok(Err(e)) if e.degrades_to_empty() => {
            tracing::warn!(path = %path.display(), error = %e, "detect: backend error; treating as no faces");
            Ok(Vec::new())
        }
        Ok(Err(e)) => Err(e.into()),
        Err(payload) => {
            let msg = panic_message(&*payload);
            tracing::error!(path = %path.display(), panic = %msg, "detect: backend panicked");
            Err(ExecutorError::Panicked(msg))
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
