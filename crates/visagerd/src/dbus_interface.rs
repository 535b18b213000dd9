use crate::pipeline::{Pipeline, PipelineError};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use zbus::interface;

/// Well-known bus name claimed by the daemon.
pub const BUS_NAME: &str = "org.freedesktop.Visager1";
/// Object path the service is exported at.
pub const OBJECT_PATH: &str = "/org/freedesktop/Visager1";

/// D-Bus control surface of the photo pipeline.
///
/// Every method answers with a JSON document so the CLI and any other
/// client can print or parse it without generated bindings.
pub struct VisagerService {
    pipeline: Arc<Pipeline>,
}

impl VisagerService {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }
}

#[interface(name = "org.freedesktop.Visager1")]
impl VisagerService {
    /// Stage files from the local filesystem and queue them.
    async fn index(&self, paths: Vec<String>) -> zbus::fdo::Result<String> {
        tracing::info!(count = paths.len(), "index requested");
        let paths = paths.into_iter().map(PathBuf::from).collect();
        let report = self.pipeline.index(paths).await.map_err(to_fdo)?;
        to_json(&report)
    }

    /// Receive one photo's bytes and queue it.
    async fn upload(&self, filename: &str, data: Vec<u8>) -> zbus::fdo::Result<String> {
        tracing::info!(filename, bytes = data.len(), "upload requested");
        let dest = self
            .pipeline
            .receive(filename, &data[..])
            .await
            .map_err(to_fdo)?;
        to_json(&serde_json::json!({
            "status": "queued",
            "path": dest,
        }))
    }

    /// Current queue and processing progress.
    async fn status(&self) -> zbus::fdo::Result<String> {
        to_json(&self.pipeline.status())
    }

    async fn health(&self) -> zbus::fdo::Result<String> {
        let (identities, embeddings) = self.pipeline.store_size().await;
        to_json(&serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "health": self.pipeline.health(),
            "identities": identities,
            "embeddings": embeddings,
        }))
    }

    /// Person folders with a cover photo and photo count.
    async fn albums(&self) -> zbus::fdo::Result<String> {
        let albums = self.pipeline.albums().await.map_err(to_fdo)?;
        to_json(&albums)
    }

    /// Every photo in the library outside the Inbox.
    async fn photos(&self) -> zbus::fdo::Result<String> {
        let photos = self.pipeline.photos().await.map_err(to_fdo)?;
        to_json(&photos)
    }

    /// Photos waiting for a name.
    async fn review(&self) -> zbus::fdo::Result<String> {
        let items = self.pipeline.review().await.map_err(to_fdo)?;
        to_json(&items)
    }

    /// Name a reviewed photo and learn the face.
    async fn assign(&self, path: &str, name: &str) -> zbus::fdo::Result<String> {
        tracing::info!(path, name, "assign requested");
        let outcome = self.pipeline.assign(path, name).await.map_err(to_fdo)?;
        to_json(&outcome)
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

fn to_fdo(e: PipelineError) -> zbus::fdo::Error {
    match e {
        PipelineError::NotFound(_) => zbus::fdo::Error::FileNotFound(e.to_string()),
        PipelineError::InvalidName(_) | PipelineError::Unsupported(_) => {
            zbus::fdo::Error::InvalidArgs(e.to_string())
        }
        other => {
            tracing::error!(error = %other, "request failed");
            zbus::fdo::Error::Failed(other.to_string())
        }
    }
}
