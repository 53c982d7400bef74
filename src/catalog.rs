// vidswarm - catalog.rs
//
// Builds the catalog of videos this process shares by walking a folder and hashing each file.
// Blocking: run it on a blocking thread from async code.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::metadata::FileRecord;

pub const VIDEO_EXTENSIONS: [&str; 6] = ["mp4", "mkv", "avi", "mov", "m4v", "webm"];

const HASH_BUFFER: usize = 1024 * 1024;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Share root {0:?} is not a directory")]
    NotADirectory(PathBuf),
}

pub fn is_video(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| VIDEO_EXTENSIONS.iter().any(|known| known.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

/// Lowercase hex SHA-256 of the file at `path`.
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hasher
        .finalize()
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect())
}

/// One record per distinct content under `root`. Copies of the same bytes merge into a single
/// record carrying every name; the first path walked is the one served.
pub fn build_local_catalog(root: &Path) -> Result<Vec<FileRecord>, CatalogError> {
    if !root.exists() {
        info!(root = ?root, "Share folder does not exist, sharing nothing");
        return Ok(Vec::new());
    }
    if !root.is_dir() {
        return Err(CatalogError::NotADirectory(root.to_path_buf()));
    }

    let mut by_hash: HashMap<String, FileRecord> = HashMap::new();
    let mut order = Vec::new();

    let entries = WalkDir::new(root)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(error = %e, "Skipping unreadable entry");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file() && is_video(entry.path()));

    for entry in entries {
        let path = entry.path();
        let size = match entry.metadata() {
            Ok(meta) => meta.len(),
            Err(e) => {
                warn!(path = ?path, error = %e, "Skipping file without metadata");
                continue;
            }
        };
        let hash = match hash_file(path) {
            Ok(hash) => hash,
            Err(e) => {
                warn!(path = ?path, error = %e, "Skipping file that could not be hashed");
                continue;
            }
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        debug!(path = ?path, hash = %hash, size, "Indexed");

        match by_hash.get_mut(&hash) {
            Some(record) => record.add_name(name),
            None => {
                order.push(hash.clone());
                by_hash.insert(hash.clone(), FileRecord::new(hash, size, name).with_local_path(path));
            }
        }
    }

    info!(root = ?root, files = order.len(), "Local catalog built");
    Ok(order.into_iter().filter_map(|hash| by_hash.remove(&hash)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_video_extensions() {
        assert!(is_video(Path::new("a/b/clip.MP4")));
        assert!(is_video(Path::new("movie.webm")));
        assert!(!is_video(Path::new("notes.txt")));
        assert!(!is_video(Path::new("mp4")));
    }

    #[test]
    fn hashes_with_sha256() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.mp4");
        std::fs::write(&path, b"hello").unwrap();
        assert_eq!(
            hash_file(&path).unwrap(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn merges_copies_and_ignores_other_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("a.mp4"), b"same bytes").unwrap();
        std::fs::write(dir.path().join("nested").join("copy.mkv"), b"same bytes").unwrap();
        std::fs::write(dir.path().join("other.mov"), b"different").unwrap();
        std::fs::write(dir.path().join("readme.txt"), b"same bytes").unwrap();

        let catalog = build_local_catalog(dir.path()).unwrap();
        assert_eq!(catalog.len(), 2);

        let merged = catalog.iter().find(|r| r.names.len() == 2).unwrap();
        assert_eq!(merged.names, ["a.mp4", "copy.mkv"]);
        assert_eq!(merged.size_bytes, 10);
        assert_eq!(merged.num_chunks, 1);
        assert_eq!(merged.local_path.as_deref(), Some(dir.path().join("a.mp4").as_path()));
    }

    #[test]
    fn missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(build_local_catalog(&dir.path().join("absent")).unwrap().is_empty());
    }

    #[test]
    fn file_root_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("clip.mp4");
        std::fs::write(&file, b"x").unwrap();
        assert!(matches!(build_local_catalog(&file), Err(CatalogError::NotADirectory(_))));
    }
}
