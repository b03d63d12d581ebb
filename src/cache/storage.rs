//! Local filesystem adapter for cached media
//!
//! Files are stored flat under a single root directory. Writes go to a
//! `.part` sibling first and are renamed into place once fully flushed, so a
//! file that exists under its final name is always complete.

use crate::error::{Error, Result};
use crate::remote::BlobStream;
use async_trait::async_trait;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Flat blob storage keyed by filename
#[async_trait]
pub trait LocalStorage: Send + Sync {
    /// Absolute path a filename maps to
    fn path_for(&self, filename: &str) -> Result<PathBuf>;

    /// Whether a complete file exists under `filename`
    async fn exists(&self, filename: &str) -> bool;

    /// Read a stored file
    async fn read(&self, filename: &str) -> Result<Vec<u8>>;

    /// Drain `stream` into `filename`, replacing it atomically.
    /// Returns the number of bytes written.
    async fn install(&self, filename: &str, stream: BlobStream) -> Result<u64>;

    /// Names of all complete files
    async fn list(&self) -> Result<Vec<String>>;
}

/// `LocalStorage` backed by a directory on disk
#[derive(Debug, Clone)]
pub struct DiskStorage {
    root: PathBuf,
}

impl DiskStorage {
    /// Open (creating if needed) a storage directory
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn validate_filename(filename: &str) -> Result<()> {
    if filename.is_empty()
        || filename == "."
        || filename == ".."
        || filename.contains(['/', '\\'])
    {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid cache filename: {:?}", filename),
        )));
    }
    Ok(())
}

#[async_trait]
impl LocalStorage for DiskStorage {
    fn path_for(&self, filename: &str) -> Result<PathBuf> {
        validate_filename(filename)?;
        Ok(self.root.join(filename))
    }

    async fn exists(&self, filename: &str) -> bool {
        let Ok(path) = self.path_for(filename) else {
            return false;
        };
        tokio::fs::metadata(&path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    async fn read(&self, filename: &str) -> Result<Vec<u8>> {
        let path = self.path_for(filename)?;
        Ok(tokio::fs::read(&path).await?)
    }

    async fn install(&self, filename: &str, mut stream: BlobStream) -> Result<u64> {
        let path = self.path_for(filename)?;
        let part = self
            .root
            .join(format!(".{}.{}.part", filename, uuid::Uuid::new_v4()));

        let result = async {
            let mut file = tokio::fs::File::create(&part).await?;
            let mut written = 0u64;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            file.flush().await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&part, &path).await?;
            Ok::<u64, Error>(written)
        }
        .await;

        if result.is_err() {
            if let Err(e) = tokio::fs::remove_file(&part).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("Failed to remove partial file {}: {}", part.display(), e);
                }
            }
        }
        result
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') && name.ends_with(".part") {
                continue;
            }
            if entry.file_type().await?.is_file() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}
