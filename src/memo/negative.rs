//! Short-lived local cache of "this blob does not exist" answers
//!
//! Markers are plain files named after the SHA-256 of the blob uri and
//! holding the RFC 3339 time they were written. A marker only ever shortens
//! the path to a Miss; once it expires the next check goes back to the store.

use crate::error::{MemoError, MemoResult};
use crate::store::BlobUri;
use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs;
use tracing::debug;

/// Process-local negative-result cache
#[derive(Debug, Clone)]
pub struct NegativeCache {
    dir: PathBuf,
    ttl: Duration,
}

impl NegativeCache {
    /// Create a cache in `dir`; a zero TTL disables it
    pub fn new(dir: impl Into<PathBuf>, ttl: std::time::Duration) -> Self {
        Self {
            dir: dir.into(),
            ttl: Duration::from_std(ttl).unwrap_or_else(|_| Duration::days(36_500)),
        }
    }

    /// A cache that never remembers anything
    pub fn disabled() -> Self {
        Self {
            dir: PathBuf::new(),
            ttl: Duration::zero(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.ttl > Duration::zero()
    }

    /// Whether `uri` was recently confirmed missing
    pub async fn is_known_missing(&self, uri: &BlobUri) -> bool {
        if !self.is_enabled() {
            return false;
        }

        let path = self.marker_path(uri);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(_) => return false,
        };

        let fresh = DateTime::parse_from_rfc3339(content.trim())
            .map(|marked| Utc::now() - marked.with_timezone(&Utc) < self.ttl)
            .unwrap_or(false);

        if !fresh {
            let _ = fs::remove_file(&path).await;
        }
        fresh
    }

    /// Remember that `uri` does not exist right now
    pub async fn mark_missing(&self, uri: &BlobUri) -> MemoResult<()> {
        if !self.is_enabled() {
            return Ok(());
        }

        fs::create_dir_all(&self.dir).await.map_err(|e| {
            MemoError::io(format!("creating negative cache dir {}", self.dir.display()), e)
        })?;

        let path = self.marker_path(uri);
        fs::write(&path, Utc::now().to_rfc3339())
            .await
            .map_err(|e| MemoError::io(format!("writing negative cache marker {}", path.display()), e))?;

        debug!("Negative cache: {} marked missing", uri);
        Ok(())
    }

    /// Drop the marker for `uri`, if any
    pub async fn forget(&self, uri: &BlobUri) -> MemoResult<()> {
        if !self.is_enabled() {
            return Ok(());
        }

        let path = self.marker_path(uri);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MemoError::io(format!("removing negative cache marker {}", path.display()), e)),
        }
    }

    /// Remove every marker
    pub async fn clear(&self) -> MemoResult<()> {
        match fs::remove_dir_all(&self.dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MemoError::io(format!("clearing negative cache {}", self.dir.display()), e)),
        }
    }

    fn marker_path(&self, uri: &BlobUri) -> PathBuf {
        let digest = Sha256::digest(uri.to_string().as_bytes());
        self.dir.join(hex::encode(digest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn uri(s: &str) -> BlobUri {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn marks_and_expires() {
        let temp = TempDir::new().unwrap();
        let cache = NegativeCache::new(temp.path(), std::time::Duration::from_millis(150));

        assert!(!cache.is_known_missing(&uri("a/result")).await);
        cache.mark_missing(&uri("a/result")).await.unwrap();
        assert!(cache.is_known_missing(&uri("a/result")).await);
        assert!(!cache.is_known_missing(&uri("b/result")).await);

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert!(!cache.is_known_missing(&uri("a/result")).await);
    }

    #[tokio::test]
    async fn forget_drops_marker() {
        let temp = TempDir::new().unwrap();
        let cache = NegativeCache::new(temp.path(), std::time::Duration::from_secs(60));

        cache.mark_missing(&uri("a/result")).await.unwrap();
        cache.forget(&uri("a/result")).await.unwrap();
        assert!(!cache.is_known_missing(&uri("a/result")).await);

        // Forgetting twice is fine
        cache.forget(&uri("a/result")).await.unwrap();
    }

    #[tokio::test]
    async fn disabled_cache_remembers_nothing() {
        let cache = NegativeCache::disabled();
        cache.mark_missing(&uri("a/result")).await.unwrap();
        assert!(!cache.is_known_missing(&uri("a/result")).await);
    }

    #[tokio::test]
    async fn corrupt_marker_is_ignored() {
        let temp = TempDir::new().unwrap();
        let cache = NegativeCache::new(temp.path(), std::time::Duration::from_secs(60));
        cache.mark_missing(&uri("a/result")).await.unwrap();
        std::fs::write(cache.marker_path(&uri("a/result")), "garbage").unwrap();

        assert!(!cache.is_known_missing(&uri("a/result")).await);
    }
}
