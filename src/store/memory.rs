//! In-memory blob store

use super::{BlobStore, BlobUri};
use crate::error::{MemoError, MemoResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

/// Process-local blob store backed by an ordered map
///
/// Share it between tasks with `Arc<InMemoryStore>`; every operation takes
/// the map lock once, so individual reads and writes are atomic.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    blobs: Mutex<BTreeMap<BlobUri, Bytes>>,
}

impl InMemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blobs currently stored
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<BlobUri, Bytes>> {
        // A panic while holding the guard cannot leave the map half-updated
        self.blobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl BlobStore for InMemoryStore {
    async fn exists(&self, uri: &BlobUri) -> MemoResult<bool> {
        Ok(self.lock().contains_key(uri))
    }

    async fn read(&self, uri: &BlobUri) -> MemoResult<Bytes> {
        self.lock()
            .get(uri)
            .cloned()
            .ok_or_else(|| MemoError::BlobNotFound(uri.to_string()))
    }

    async fn write(&self, uri: &BlobUri, data: Bytes, overwrite: bool) -> MemoResult<()> {
        if uri.is_root() {
            return Err(MemoError::store(uri, "cannot write to the store root"));
        }

        let mut blobs = self.lock();
        if !overwrite && blobs.contains_key(uri) {
            return Err(MemoError::BlobExists(uri.to_string()));
        }
        blobs.insert(uri.clone(), data);
        Ok(())
    }

    async fn list_children(&self, uri: &BlobUri) -> MemoResult<Vec<BlobUri>> {
        let depth = uri.segments().len();
        let blobs = self.lock();

        let children: BTreeSet<BlobUri> = blobs
            .keys()
            .filter(|key| key.segments().len() > depth && key.segments().starts_with(uri.segments()))
            .map(|key| uri.child(&key.segments()[depth]))
            .collect::<MemoResult<_>>()?;

        Ok(children.into_iter().collect())
    }

    async fn remove(&self, uri: &BlobUri) -> MemoResult<()> {
        self.lock().retain(|key, _| !key.segments().starts_with(uri.segments()));
        Ok(())
    }

    fn store_name(&self) -> &'static str {
        "in-memory"
    }
}
