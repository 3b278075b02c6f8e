//! Directory-backed blob store
//!
//! Blobs are files, uri prefixes are directories. Writes land in a hidden
//! temp file next to the target and are renamed into place, so a reader
//! sees either the old blob or the new one, never a partial write.

use super::{BlobStore, BlobUri};
use crate::error::{MemoError, MemoResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

/// Prefix of in-flight temp files; never listed as children
const TEMP_PREFIX: &str = ".blobmemo-tmp-";

/// Blob store rooted at a local (or network-mounted) directory
#[derive(Debug, Clone)]
pub struct LocalDiskStore {
    root: PathBuf,
}

impl LocalDiskStore {
    /// Open a store, creating the root directory if needed
    pub async fn open(root: impl Into<PathBuf>) -> MemoResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| MemoError::io(format!("creating store root {}", root.display()), e))?;

        let root = fs::canonicalize(&root)
            .await
            .map_err(|e| MemoError::io(format!("resolving store root {}", root.display()), e))?;

        debug!("Opened local blob store at {}", root.display());
        Ok(Self { root })
    }

    /// The directory this store lives in
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem path for a uri
    pub fn path_for(&self, uri: &BlobUri) -> PathBuf {
        uri.segments()
            .iter()
            .fold(self.root.clone(), |path, segment| path.join(segment))
    }
}

#[async_trait]
impl BlobStore for LocalDiskStore {
    async fn exists(&self, uri: &BlobUri) -> MemoResult<bool> {
        let path = self.path_for(uri);
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(MemoError::io(format!("checking {}", path.display()), e)),
        }
    }

    async fn read(&self, uri: &BlobUri) -> MemoResult<Bytes> {
        let path = self.path_for(uri);
        match fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(MemoError::BlobNotFound(uri.to_string())),
            Err(_) if path.is_dir() => Err(MemoError::BlobNotFound(uri.to_string())),
            Err(e) => Err(MemoError::io(format!("reading blob {}", path.display()), e)),
        }
    }

    async fn write(&self, uri: &BlobUri, data: Bytes, overwrite: bool) -> MemoResult<()> {
        let name = uri
            .name()
            .ok_or_else(|| MemoError::store(uri, "cannot write to the store root"))?;
        let path = self.path_for(uri);

        if !overwrite && self.exists(uri).await? {
            return Err(MemoError::BlobExists(uri.to_string()));
        }

        let parent = path
            .parent()
            .ok_or_else(|| MemoError::store(uri, "blob has no parent directory"))?;
        fs::create_dir_all(parent)
            .await
            .map_err(|e| MemoError::io(format!("creating directory {}", parent.display()), e))?;

        let temp = parent.join(format!("{}{}-{}", TEMP_PREFIX, name, Uuid::new_v4().simple()));
        fs::write(&temp, &data)
            .await
            .map_err(|e| MemoError::io(format!("writing temp file {}", temp.display()), e))?;

        if let Err(e) = fs::rename(&temp, &path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(MemoError::io(format!("replacing blob {}", path.display()), e));
        }

        debug!("Wrote {} bytes to {}", data.len(), uri);
        Ok(())
    }

    async fn list_children(&self, uri: &BlobUri) -> MemoResult<Vec<BlobUri>> {
        let path = self.path_for(uri);
        let mut entries = match fs::read_dir(&path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(_) if path.is_file() => return Ok(vec![]),
            Err(e) => return Err(MemoError::io(format!("listing {}", path.display()), e)),
        };

        let mut children = vec![];
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| MemoError::io(format!("listing {}", path.display()), e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(TEMP_PREFIX) {
                continue;
            }
            children.push(uri.child(&name)?);
        }

        children.sort();
        Ok(children)
    }

    async fn remove(&self, uri: &BlobUri) -> MemoResult<()> {
        let path = self.path_for(uri);
        let meta = match fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(MemoError::io(format!("checking {}", path.display()), e)),
        };

        let result = if meta.is_dir() {
            fs::remove_dir_all(&path).await
        } else {
            fs::remove_file(&path).await
        };

        match result {
            Ok(()) => {
                debug!("Removed {}", uri);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MemoError::io(format!("removing {}", path.display()), e)),
        }
    }

    fn store_name(&self) -> &'static str {
        "local-disk"
    }
}
