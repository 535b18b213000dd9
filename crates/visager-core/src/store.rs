//! Persisted identity store: person name → reference embeddings.
//!
//! The store is a single JSON document tagged with a schema version and the
//! name of the embedding model that produced its vectors. Embeddings from
//! different models are not comparable, so a document written under another
//! model (or an unknown schema) is discarded on load and an empty store is
//! used in its place.

use crate::types::Embedding;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Schema version written by this build. No migrations exist yet: any other
/// version is rejected on load.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("store document is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("unsupported store schema version {found} (expected {SCHEMA_VERSION})")]
    UnsupportedSchema { found: u32 },
    #[error("store was built with model {found:?}, expected {expected:?}")]
    ModelMismatch { expected: String, found: String },
    #[error("embedding has {found} dimensions, store holds {expected}-dimensional vectors")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("cannot store an empty embedding")]
    EmptyEmbedding,
}

/// One known person and every reference embedding collected for them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub name: String,
    pub embeddings: Vec<Embedding>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// On-disk layout.
#[derive(Debug, Serialize, Deserialize)]
struct StoreDocument {
    schema_version: u32,
    model: String,
    saved_at: DateTime<Utc>,
    #[serde(default)]
    records: Vec<IdentityRecord>,
}

/// In-memory identity store. Records keep insertion order, which is the
/// tie-break order used by matching.
#[derive(Debug, Clone)]
pub struct IdentityStore {
    model: String,
    records: Vec<IdentityRecord>,
}

impl IdentityStore {
    /// Empty store for the given embedding model.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            records: Vec::new(),
        }
    }

    /// Load the store at `path`, falling back to an empty store.
    ///
    /// A missing file is the normal first-run case. Corrupt documents,
    /// unknown schema versions and model mismatches are logged and discarded.
    pub fn load(path: &Path, model: &str) -> Self {
        match Self::try_load(path, model) {
            Ok(store) => {
                tracing::info!(
                    path = %path.display(),
                    identities = store.len(),
                    embeddings = store.embedding_count(),
                    "identity store loaded"
                );
                store
            }
            Err(StoreError::Io { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no identity store yet; starting empty");
                Self::new(model)
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "discarding identity store");
                Self::new(model)
            }
        }
    }

    /// Load the store at `path`, reporting why it cannot be used.
    pub fn try_load(path: &Path, model: &str) -> Result<Self, StoreError> {
        let bytes = std::fs::read(path).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_slice(&bytes, model)
    }

    /// Decode a store document, applying the schema and model policy.
    pub fn from_slice(bytes: &[u8], model: &str) -> Result<Self, StoreError> {
        // Peek at the version before committing to the full layout so that a
        // future schema is reported as unsupported, not as corruption.
        #[derive(Deserialize)]
        struct Header {
            schema_version: u32,
        }
        let header: Header = serde_json::from_slice(bytes)?;
        if header.schema_version != SCHEMA_VERSION {
            return Err(StoreError::UnsupportedSchema {
                found: header.schema_version,
            });
        }

        let doc: StoreDocument = serde_json::from_slice(bytes)?;
        if doc.model != model {
            return Err(StoreError::ModelMismatch {
                expected: model.to_string(),
                found: doc.model,
            });
        }

        let mut store = Self::new(model);
        for record in doc.records {
            store.insert_record(record);
        }
        Ok(store)
    }

    /// Encode the store as a versioned document.
    pub fn to_vec(&self) -> Result<Vec<u8>, StoreError> {
        let doc = StoreDocument {
            schema_version: SCHEMA_VERSION,
            model: self.model.clone(),
            saved_at: Utc::now(),
            records: self.records.clone(),
        };
        Ok(serde_json::to_vec(&doc)?)
    }

    /// Write the store to `path` atomically (temp file + rename).
    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        };
        let bytes = self.to_vec()?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        std::fs::write(&tmp, &bytes).map_err(io_err)?;
        std::fs::rename(&tmp, path).map_err(io_err)?;

        tracing::debug!(
            path = %path.display(),
            identities = self.len(),
            bytes = bytes.len(),
            "identity store saved"
        );
        Ok(())
    }

    /// Append a reference embedding to `name`, creating the record if new.
    pub fn append(&mut self, name: &str, embedding: Embedding) -> Result<(), StoreError> {
        if embedding.dim() == 0 {
            return Err(StoreError::EmptyEmbedding);
        }
        if let Some(expected) = self.dimension() {
            if expected != embedding.dim() {
                return Err(StoreError::DimensionMismatch {
                    expected,
                    found: embedding.dim(),
                });
            }
        }

        let now = Utc::now();
        match self.records.iter_mut().find(|r| r.name == name) {
            Some(record) => {
                record.embeddings.push(embedding);
                record.updated_at = now;
            }
            None => self.records.push(IdentityRecord {
                name: name.to_string(),
                embeddings: vec![embedding],
                created_at: now,
                updated_at: now,
            }),
        }
        Ok(())
    }

    /// Merge a record read from a document. Duplicate names are folded into
    /// the first occurrence and empty records are dropped.
    fn insert_record(&mut self, record: IdentityRecord) {
        if record.embeddings.is_empty() {
            tracing::debug!(name = %record.name, "skipping identity without embeddings");
            return;
        }
        match self.records.iter_mut().find(|r| r.name == record.name) {
            Some(existing) => {
                tracing::warn!(name = %record.name, "duplicate identity in store; merging");
                existing.embeddings.extend(record.embeddings);
                existing.updated_at = existing.updated_at.max(record.updated_at);
            }
            None => self.records.push(record),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Records in insertion order.
    pub fn records(&self) -> &[IdentityRecord] {
        &self.records
    }

    pub fn get(&self, name: &str) -> Option<&IdentityRecord> {
        self.records.iter().find(|r| r.name == name)
    }

    /// Number of identities.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Total number of reference embeddings across all identities.
    pub fn embedding_count(&self) -> usize {
        self.records.iter().map(|r| r.embeddings.len()).sum()
    }

    /// Dimensionality of the stored vectors, if any are stored.
    pub fn dimension(&self) -> Option<usize> {
        self.records
            .iter()
            .flat_map(|r| r.embeddings.first())
            .map(Embedding::dim)
            .next()
    }
}
