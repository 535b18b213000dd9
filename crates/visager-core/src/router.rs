//! Classification of recognition results and the folder layout they map to.
//!
//! Every processed photo ends up in exactly one folder under the photos
//! root. Moves never overwrite: a name clash at the destination gets a
//! random suffix before the extension.

use crate::matcher::Matcher;
use crate::store::IdentityStore;
use crate::types::FaceObservation;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Staging folder for files waiting to be processed.
pub const INBOX: &str = "Inbox";
/// No face detected.
pub const UNSORTED: &str = "Unsorted";
/// More than one face detected.
pub const GROUP_PHOTOS: &str = "Group_Photos";
/// A single face that matched nobody.
pub const NEEDS_NAME: &str = "Needs_Name";
/// Review folder used by older libraries.
pub const NEEDS_REVIEW: &str = "Needs_Review";

/// Working folders that are never albums and never valid person names.
pub const RESERVED_FOLDERS: [&str; 5] = [INBOX, UNSORTED, NEEDS_REVIEW, NEEDS_NAME, GROUP_PHOTOS];

/// Attempts at finding a free name before giving up.
const MAX_RENAME_ATTEMPTS: usize = 16;

#[derive(Error, Debug)]
pub enum RouteError {
    #[error("source file not found: {0}")]
    NotFound(PathBuf),
    #[error("invalid folder name: {0:?}")]
    InvalidName(String),
    #[error("no usable file name in {0}")]
    NoFileName(PathBuf),
    #[error("no free destination name for {0} after {MAX_RENAME_ATTEMPTS} attempts")]
    Exhausted(PathBuf),
    #[error("moving {from} to {to}: {source}")]
    Io {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Outcome of classifying one photo. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    NoFace,
    MultiFace,
    Matched(String),
    Unmatched,
}

impl Classification {
    /// Destination folder name under the photos root.
    pub fn folder(&self) -> &str {
        match self {
            Classification::NoFace => UNSORTED,
            Classification::MultiFace => GROUP_PHOTOS,
            Classification::Matched(name) => name,
            Classification::Unmatched => NEEDS_NAME,
        }
    }
}

/// Classify the faces found in one photo.
///
/// Only a single face is matched; group photos are routed for review
/// without identity resolution.
pub fn classify(
    faces: &[FaceObservation],
    store: &IdentityStore,
    matcher: &impl Matcher,
    threshold: f32,
) -> Classification {
    match faces {
        [] => Classification::NoFace,
        [face] => {
            let result = matcher.best_match(&face.embedding, store, threshold);
            match result.name {
                Some(name) => {
                    tracing::info!(name = %name, distance = ?result.distance, "identity matched");
                    Classification::Matched(name)
                }
                None => {
                    tracing::info!(best_distance = ?result.distance, "no identity within threshold");
                    Classification::Unmatched
                }
            }
        }
        _ => Classification::MultiFace,
    }
}

/// Whether `name` can be used as a person folder.
pub fn is_valid_person_name(name: &str) -> bool {
    let trimmed = name.trim();
    !trimmed.is_empty()
        && trimmed == name
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
        && !RESERVED_FOLDERS.contains(&name)
}

/// Moves photos between folders under a single root.
#[derive(Debug, Clone)]
pub struct FileRouter {
    root: PathBuf,
}

impl FileRouter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn folder(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn inbox(&self) -> PathBuf {
        self.folder(INBOX)
    }

    /// Create the root and its working folders.
    pub fn ensure_layout(&self) -> io::Result<()> {
        for name in [INBOX, UNSORTED, GROUP_PHOTOS, NEEDS_NAME] {
            fs::create_dir_all(self.folder(name))?;
        }
        Ok(())
    }

    /// Move `src` into the folder its classification selects.
    pub fn route(&self, src: &Path, classification: &Classification) -> Result<PathBuf, RouteError> {
        let dest = self.move_into(src, classification.folder())?;
        tracing::info!(
            file = %display_name(src),
            target = classification.folder(),
            dest = %dest.display(),
            "photo routed"
        );
        Ok(dest)
    }

    /// Move `src` into `<root>/<folder>`, creating the folder if needed.
    /// Returns the final path, which differs from the source name on clash.
    pub fn move_into(&self, src: &Path, folder: &str) -> Result<PathBuf, RouteError> {
        if folder.is_empty() || folder.contains(['/', '\\']) || folder == "." || folder == ".." {
            return Err(RouteError::InvalidName(folder.to_string()));
        }
        if !src.is_file() {
            return Err(RouteError::NotFound(src.to_path_buf()));
        }
        let file_name = src
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| RouteError::NoFileName(src.to_path_buf()))?;

        let dir = self.folder(folder);
        fs::create_dir_all(&dir).map_err(|source| RouteError::Io {
            from: src.to_path_buf(),
            to: dir.clone(),
            source,
        })?;

        place_unique(&dir, file_name, |dest| move_no_clobber(src, dest))
    }

    /// Copy `src` into the Inbox without touching the original. A name clash
    /// first tries `<stem>_<mtime><ext>`, then a random suffix.
    pub fn stage_copy(&self, src: &Path) -> Result<PathBuf, RouteError> {
        if !src.is_file() {
            return Err(RouteError::NotFound(src.to_path_buf()));
        }
        let file_name = src
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| RouteError::NoFileName(src.to_path_buf()))?;

        let inbox = self.inbox();
        fs::create_dir_all(&inbox).map_err(|source| RouteError::Io {
            from: src.to_path_buf(),
            to: inbox.clone(),
            source,
        })?;

        let first = inbox.join(file_name);
        match copy_no_clobber(src, &first) {
            Ok(()) => return Ok(first),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(source) => {
                return Err(RouteError::Io {
                    from: src.to_path_buf(),
                    to: first,
                    source,
                })
            }
        }

        if let Some(mtime) = modified_secs(src) {
            let (stem, ext) = split_name(file_name);
            let dated = inbox.join(format!("{stem}_{mtime}{ext}"));
            match copy_no_clobber(src, &dated) {
                Ok(()) => return Ok(dated),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(source) => {
                    return Err(RouteError::Io {
                        from: src.to_path_buf(),
                        to: dated,
                        source,
                    })
                }
            }
        }

        place_unique(&inbox, file_name, |dest| copy_no_clobber(src, dest))
    }
}

/// Try `dir/file_name`, then suffixed variants, until `place` succeeds
/// without hitting an existing file.
pub(crate) fn place_unique(
    dir: &Path,
    file_name: &str,
    mut place: impl FnMut(&Path) -> io::Result<()>,
) -> Result<PathBuf, RouteError> {
    let mut candidate = dir.join(file_name);
    for _ in 0..MAX_RENAME_ATTEMPTS {
        match place(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                tracing::debug!(existing = %candidate.display(), "destination taken; renaming");
                candidate = dir.join(collision_name(file_name));
            }
            Err(source) => {
                return Err(RouteError::Io {
                    from: PathBuf::from(file_name),
                    to: candidate,
                    source,
                })
            }
        }
    }
    Err(RouteError::Exhausted(dir.join(file_name)))
}

/// Disambiguated variant of a file name: `photo.jpg` → `photo_3f9a1c2e.jpg`.
pub fn collision_name(file_name: &str) -> String {
    let (stem, ext) = split_name(file_name);
    let token = uuid::Uuid::new_v4().simple().to_string();
    format!("{stem}_{}{ext}", &token[..8])
}

/// Split into stem and extension (with its dot). Dotfiles have no extension.
fn split_name(file_name: &str) -> (&str, &str) {
    match file_name.rfind('.') {
        Some(idx) if idx > 0 => file_name.split_at(idx),
        _ => (file_name, ""),
    }
}

fn modified_secs(path: &Path) -> Option<u64> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    Some(modified.duration_since(std::time::UNIX_EPOCH).ok()?.as_secs())
}

/// Move without ever replacing `dest`. A hard link fails atomically when
/// the name is taken; across filesystems fall back to an exclusive copy.
fn move_no_clobber(src: &Path, dest: &Path) -> io::Result<()> {
    match fs::hard_link(src, dest) {
        Ok(()) => fs::remove_file(src),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(e),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(e),
        Err(e) => {
            tracing::debug!(error = %e, "hard link unavailable; copying");
            copy_no_clobber(src, dest)?;
            fs::remove_file(src)
        }
    }
}

fn copy_no_clobber(src: &Path, dest: &Path) -> io::Result<()> {
    let mut input = File::open(src)?;
    let mut output = OpenOptions::new().write(true).create_new(true).open(dest)?;
    if let Err(e) = io::copy(&mut input, &mut output).and_then(|_| output.sync_all()) {
        let _ = fs::remove_file(dest);
        return Err(e);
    }
    if let Ok(modified) = input.metadata().and_then(|m| m.modified()) {
        let _ = output.set_modified(modified);
    }
    Ok(())
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
