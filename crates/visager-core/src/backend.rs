//! Boundary to the face recognition capability.
//!
//! The backend turns an image into zero or more [`FaceObservation`]s. How it
//! does so (model, detector, process layout) is its own business; the
//! pipeline only relies on the error taxonomy below.

use crate::types::FaceObservation;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectError {
    /// The image was read and contains no face. Not a failure.
    #[error("no face detected")]
    NoFace,
    /// The backend ran and reported a failure for this image.
    #[error("backend error: {0}")]
    Backend(String),
    /// The backend could not be started or is not ready.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    /// The backend died or broke protocol while handling the image.
    #[error("backend crashed: {0}")]
    Crashed(String),
    /// The backend did not answer in time and was killed.
    #[error("backend timed out after {0:?}")]
    TimedOut(Duration),
}

impl DetectError {
    /// Errors that mean "this image has no usable faces" rather than "the
    /// job failed". They degrade to zero observations.
    pub fn degrades_to_empty(&self) -> bool {
        matches!(self, DetectError::NoFace | DetectError::Backend(_))
    }
}

/// A face detection + embedding capability.
///
/// Calls are blocking and may be slow; implementations are driven from a
/// dedicated thread, one image at a time.
pub trait FaceBackend: Send {
    /// Bring the backend up. Must be idempotent.
    fn initialize(&mut self) -> Result<(), DetectError> {
        Ok(())
    }

    fn is_ready(&self) -> bool {
        true
    }

    /// Detect every face in the image at `path`, in backend order.
    fn detect_faces(&mut self, path: &Path) -> Result<Vec<FaceObservation>, DetectError>;

    /// Release backend resources. Called once, after the last job.
    fn shutdown(&mut self) {}
}

impl<B: FaceBackend + ?Sized> FaceBackend for Box<B> {
    fn initialize(&mut self) -> Result<(), DetectError> {
        (**self).initialize()
    }

    fn is_ready(&self) -> bool {
        (**self).is_ready()
    }

    fn detect_faces(&mut self, path: &Path) -> Result<Vec<FaceObservation>, DetectError> {
        (**self).detect_faces(path)
    }

    fn shutdown(&mut self) {
        (**self).shutdown()
    }
}
