//! Blob store abstraction
//!
//! Everything blobmemo coordinates goes through a [`BlobStore`]: a durable
//! key to bytes map with existence checks and directory-style listing.
//! There is no compare-and-swap; `write` with `overwrite = true` is a plain
//! last-writer-wins replace.

mod local;
mod memory;

pub use local::LocalDiskStore;
pub use memory::InMemoryStore;

use crate::error::{MemoError, MemoResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::str::FromStr;

/// Hierarchical blob address made of `/`-separated segments
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct BlobUri {
    segments: Vec<String>,
}

impl BlobUri {
    /// The empty (root) uri
    pub fn root() -> Self {
        Self::default()
    }

    /// Build a uri from segments, validating each one
    pub fn from_segments<I, S>(segments: I) -> MemoResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::root().join(segments)
    }

    /// Append segments; a part containing `/` is split into several segments
    pub fn join<I, S>(&self, parts: I) -> MemoResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut segments = self.segments.clone();
        for part in parts {
            let part: String = part.into();
            for segment in part.split('/').filter(|s| !s.is_empty()) {
                validate_segment(segment)?;
                segments.push(segment.to_string());
            }
        }
        Ok(Self { segments })
    }

    /// Append a single known-valid child segment
    pub fn child(&self, name: &str) -> MemoResult<Self> {
        self.join([name])
    }

    /// Split into the parent and the final segment
    pub fn split(&self) -> (BlobUri, Vec<String>) {
        match self.segments.split_last() {
            Some((last, rest)) => (
                Self {
                    segments: rest.to_vec(),
                },
                vec![last.clone()],
            ),
            None => (Self::root(), Vec::new()),
        }
    }

    /// Parent uri (root stays root)
    pub fn parent(&self) -> BlobUri {
        self.split().0
    }

    /// Final segment, if any
    pub fn name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// All segments in order
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }
}

impl fmt::Display for BlobUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("/"))
    }
}

impl FromStr for BlobUri {
    type Err = MemoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::root().join([s])
    }
}

/// Check that a single path segment is safe to map onto any backend
pub fn validate_segment(segment: &str) -> MemoResult<()> {
    let reason = if segment.is_empty() {
        Some("empty segment")
    } else if segment == "." || segment == ".." {
        Some("relative segment")
    } else if segment.contains('/') || segment.contains('\\') {
        Some("segment contains a path separator")
    } else if segment.contains('\0') {
        Some("segment contains a NUL byte")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(MemoError::InvalidUri {
            uri: segment.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

/// Durable key to bytes storage shared by every coordinating process
///
/// Implementations:
/// - [`LocalDiskStore`]: a directory tree, shared between processes on one host
///   or through a network filesystem
/// - [`InMemoryStore`]: process-local, for tests and single-process use
///
/// Remote object stores implement this trait outside the crate.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Check whether a blob exists at `uri`
    async fn exists(&self, uri: &BlobUri) -> MemoResult<bool>;

    /// Read a blob; fails with [`MemoError::BlobNotFound`] when absent
    async fn read(&self, uri: &BlobUri) -> MemoResult<Bytes>;

    /// Write a blob; with `overwrite = false` fails with
    /// [`MemoError::BlobExists`] when something is already there
    async fn write(&self, uri: &BlobUri, data: Bytes, overwrite: bool) -> MemoResult<()>;

    /// Immediate children of `uri`, sorted; empty when nothing is there
    async fn list_children(&self, uri: &BlobUri) -> MemoResult<Vec<BlobUri>>;

    /// Remove a blob or everything below `uri`; no-op when absent
    async fn remove(&self, uri: &BlobUri) -> MemoResult<()>;

    /// Human-readable backend name for display
    fn store_name(&self) -> &'static str;
}

/// Read a blob, mapping not-found to `None`
pub async fn read_optional(store: &dyn BlobStore, uri: &BlobUri) -> MemoResult<Option<Bytes>> {
    match store.read(uri).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}
