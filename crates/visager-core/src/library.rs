//! Read-only views over the photos root: albums, review items and the
//! full photo listing.

use crate::router::{GROUP_PHOTOS, INBOX, NEEDS_NAME, RESERVED_FOLDERS};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;

/// Album name used for photos sitting directly in the root.
pub const ROOT_ALBUM: &str = "Library";

/// A person folder (or any non-reserved folder) under the root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Album {
    pub name: String,
    /// Root-relative path of the first photo, empty for an empty album.
    pub cover: String,
    pub count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewKind {
    /// Single unmatched face (`Needs_Name`).
    Single,
    /// Several faces (`Group_Photos`).
    Group,
}

/// A photo waiting for a human to name it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewItem {
    pub name: String,
    /// Root-relative path, e.g. `Needs_Name/photo.jpg`.
    pub path: String,
    #[serde(rename = "type")]
    pub kind: ReviewKind,
}

/// One classified photo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryPhoto {
    pub id: String,
    pub name: String,
    /// Root-relative path.
    pub path: String,
    pub album: String,
}

/// Whether the extension names an image format the `image` crate knows.
///
/// The single photo predicate: ingestion accepts exactly what the listings
/// show.
pub fn is_photo(path: &Path) -> bool {
    image::ImageFormat::from_path(path).is_ok()
}

/// Listed photo file names directly inside `dir`, sorted. A missing
/// directory lists as empty.
fn photo_names(dir: &Path) -> io::Result<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.is_file() && is_photo(&path) {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

/// Folders under `root` that are not reserved working folders.
pub fn albums(root: &Path) -> io::Result<Vec<Album>> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut albums = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if RESERVED_FOLDERS.contains(&name.as_str()) || name.starts_with('.') {
            continue;
        }
        let photos = photo_names(&entry.path())?;
        albums.push(Album {
            cover: photos
                .first()
                .map(|f| format!("{name}/{f}"))
                .unwrap_or_default(),
            count: photos.len(),
            name,
        });
    }
    albums.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(albums)
}

/// Photos waiting in `Needs_Name` (single) followed by `Group_Photos` (group).
pub fn review_items(root: &Path) -> io::Result<Vec<ReviewItem>> {
    let mut items = Vec::new();
    for (folder, kind) in [(NEEDS_NAME, ReviewKind::Single), (GROUP_PHOTOS, ReviewKind::Group)] {
        for name in photo_names(&root.join(folder))? {
            items.push(ReviewItem {
                path: format!("{folder}/{name}"),
                name,
                kind,
            });
        }
    }
    Ok(items)
}

/// Every classified photo under `root` (the Inbox excluded), sorted by file
/// name descending.
pub fn photos(root: &Path) -> io::Result<Vec<LibraryPhoto>> {
    let mut photos = Vec::new();
    collect_photos(root, root, &mut photos)?;
    photos.sort_by(|a, b| b.name.cmp(&a.name));
    Ok(photos)
}

fn collect_photos(root: &Path, dir: &Path, out: &mut Vec<LibraryPhoto>) -> io::Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    let album = if dir == root {
        ROOT_ALBUM.to_string()
    } else {
        dir.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    };

    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            if dir == root && entry.file_name() == INBOX {
                continue;
            }
            collect_photos(root, &path, out)?;
        } else if file_type.is_file() && is_photo(&path) {
            let name = entry.file_name().to_string_lossy().into_owned();
            let rel = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .to_string_lossy()
                .into_owned();
            out.push(LibraryPhoto {
                id: format!("{album}-{name}"),
                name,
                path: rel,
                album: album.clone(),
            });
        }
    }
    Ok(())
}
