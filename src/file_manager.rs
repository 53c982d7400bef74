// vidswarm - file_manager.rs

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::metadata::{chunk_len, chunk_offset};

/// Output file of a transfer, sized up front so chunks land at their final offset in any order.
#[derive(Debug)]
pub struct FileManager {
    file: File,
}

impl FileManager {
    /// Creates (or truncates) `path` and extends it to `total_size` bytes.
    pub async fn new(path: &Path, total_size: u64) -> Result<Self, std::io::Error> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .read(true)
            .open(path)
            .await?;
        file.set_len(total_size).await?;

        Ok(FileManager { file })
    }

    pub async fn write_chunk(&mut self, offset: u64, data: &[u8]) -> Result<(), std::io::Error> {
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(data).await?;
        self.file.flush().await?;

        Ok(())
    }
}

/// Reads chunk `index` of a local file of `file_size` bytes. Past the end yields no bytes.
pub async fn read_chunk(path: &Path, index: u32, file_size: u64) -> Result<Vec<u8>, std::io::Error> {
    let len = chunk_len(index, file_size) as usize;
    if len == 0 {
        return Ok(Vec::new());
    }
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(chunk_offset(index))).await?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

/// `name` with every character outside `[A-Za-z0-9._-]` replaced by `_`.
pub fn safe_file_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
        .collect()
}

/// Where a transfer writes before it is complete: `<safe name>.<hash prefix>.buffer` in `dir`.
pub fn staging_path(dir: &Path, name: &str, content_hash: &str) -> PathBuf {
    let prefix: String = content_hash.chars().take(8).collect();
    dir.join(format!("{}.{}.buffer", safe_file_name(name), prefix))
}

/// Moves a finished staging file to `<safe name>` next to it and returns the new path.
pub async fn finalize(staging: &Path, name: &str) -> Result<PathBuf, std::io::Error> {
    let target = staging
        .parent()
        .map(|dir| dir.join(safe_file_name(name)))
        .unwrap_or_else(|| PathBuf::from(safe_file_name(name)));
    tokio::fs::rename(staging, &target).await?;
    Ok(target)
}
