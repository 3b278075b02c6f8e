//! Control-file protocol
//!
//! Three blobs live under every memospace address:
//!
//! | Blob | Written | Meaning |
//! |------|---------|---------|
//! | `invocation` | before computing | audit trail, replay input |
//! | `result` | on success | memoized value |
//! | `exception` | on failure | memoized failure, replayed on hit |
//!
//! `invocation` is never a reservation. Two callers that both miss will
//! both compute; callers needing at-most-one computation take the lease
//! lock on the address first.

use crate::error::{MemoError, MemoResult};
use crate::host;
use crate::memo::identity::{CanonicalArgs, MemospaceAddress};
use crate::memo::negative::NegativeCache;
use crate::store::{read_optional, BlobStore, BlobUri};
use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Control file names under an address
pub mod names {
    pub const INVOCATION: &str = "invocation";
    pub const RESULT: &str = "result";
    pub const EXCEPTION: &str = "exception";
}

const CRATE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// What to do when an invocation was written but never finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrphanPolicy {
    /// Treat as a plain miss and recompute
    #[default]
    Recompute,
    /// Report `Orphaned`; the runner logs it and recomputes
    Warn,
    /// Report `Orphaned`; the runner refuses to recompute
    Fail,
}

impl fmt::Display for OrphanPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Recompute => write!(f, "recompute"),
            Self::Warn => write!(f, "warn"),
            Self::Fail => write!(f, "fail"),
        }
    }
}

/// Everything needed to replay or audit one call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub address: MemospaceAddress,
    pub args: CanonicalArgs,
    pub invoked_at: DateTime<Utc>,
    pub writer: String,
}

impl Invocation {
    pub fn new(address: MemospaceAddress, args: CanonicalArgs) -> Self {
        Self {
            address,
            args,
            invoked_at: Utc::now(),
            writer: host::writer_identity(),
        }
    }

    /// Pipeline id the call was made under
    pub fn pipeline_id(&self) -> &str {
        &self.address.pipeline_id
    }
}

/// Diagnostic header written in front of every terminal control file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlHeader {
    pub written_at: DateTime<Utc>,
    pub writer: String,
    pub crate_version: String,
    pub function: String,
    pub logic_key: String,
}

impl ControlHeader {
    fn for_address(address: &MemospaceAddress) -> Self {
        Self {
            written_at: Utc::now(),
            writer: host::writer_identity(),
            crate_version: CRATE_VERSION.to_string(),
            function: address.function.clone(),
            logic_key: address.logic_key.clone(),
        }
    }
}

/// Decoded `result` or `exception` blob
#[derive(Debug, Clone, PartialEq)]
pub struct ControlRecord {
    pub header: ControlHeader,
    pub payload: Bytes,
}

impl ControlRecord {
    /// One line of JSON header, a newline, then the raw payload
    pub fn encode(&self) -> MemoResult<Bytes> {
        let header = serde_json::to_vec(&self.header)?;
        let mut buf = BytesMut::with_capacity(header.len() + 1 + self.payload.len());
        buf.put_slice(&header);
        buf.put_u8(b'\n');
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    pub fn decode(uri: &BlobUri, data: Bytes) -> MemoResult<Self> {
        let newline = data
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| MemoError::CorruptControlFile {
                uri: uri.to_string(),
                reason: "missing header line".to_string(),
            })?;

        let header: ControlHeader =
            serde_json::from_slice(&data[..newline]).map_err(|e| MemoError::CorruptControlFile {
                uri: uri.to_string(),
                reason: format!("bad header: {}", e),
            })?;

        Ok(Self {
            header,
            payload: data.slice(newline + 1..),
        })
    }
}

/// Result of checking an address
#[derive(Debug, Clone, PartialEq)]
pub enum MemoStatus {
    /// A memoized value
    Result(ControlRecord),
    /// A memoized failure
    Exception(ControlRecord),
    /// Nothing recorded
    Miss,
    /// `invocation` exists without a terminal file (only reported when the
    /// orphan policy asks for it)
    Orphaned,
}

impl MemoStatus {
    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Result(_) | Self::Exception(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Result(_) => "result",
            Self::Exception(_) => "exception",
            Self::Miss => "miss",
            Self::Orphaned => "orphaned",
        }
    }
}

/// Control-file operations for memospace addresses
#[derive(Clone)]
pub struct ControlFiles {
    store: Arc<dyn BlobStore>,
    negative: NegativeCache,
    orphan_policy: OrphanPolicy,
}

impl ControlFiles {
    pub fn new(store: Arc<dyn BlobStore>, negative: NegativeCache) -> Self {
        Self {
            store,
            negative,
            orphan_policy: OrphanPolicy::default(),
        }
    }

    pub fn with_orphan_policy(mut self, policy: OrphanPolicy) -> Self {
        self.orphan_policy = policy;
        self
    }

    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    pub fn orphan_policy(&self) -> OrphanPolicy {
        self.orphan_policy
    }

    /// Look for a memoized outcome, consulting the negative cache first
    pub async fn check(&self, address: &MemospaceAddress) -> MemoResult<MemoStatus> {
        let base = address.uri()?;

        for (name, is_result) in [(names::RESULT, true), (names::EXCEPTION, false)] {
            let uri = base.child(name)?;
            if self.negative.is_known_missing(&uri).await {
                continue;
            }

            match self.read_record(&uri).await? {
                Some(record) if is_result => return Ok(MemoStatus::Result(record)),
                Some(record) => return Ok(MemoStatus::Exception(record)),
                None => self.negative.mark_missing(&uri).await?,
            }
        }

        if self.orphan_policy != OrphanPolicy::Recompute
            && self.store.exists(&base.child(names::INVOCATION)?).await?
        {
            debug!("Orphaned invocation at {}", base);
            return Ok(MemoStatus::Orphaned);
        }

        Ok(MemoStatus::Miss)
    }

    /// Read the terminal files straight from the store
    ///
    /// Used right after a shim returns, when a negative cache entry from the
    /// preceding `check` would hide the fresh outcome.
    pub async fn read_outcome(&self, address: &MemospaceAddress) -> MemoResult<MemoStatus> {
        let base = address.uri()?;

        let result = self.read_record(&base.child(names::RESULT)?).await?;
        let exception = self.read_record(&base.child(names::EXCEPTION)?).await?;

        match (result, exception) {
            (Some(result), Some(_)) => {
                warn!("Both result and exception exist at {}, using result", base);
                Ok(MemoStatus::Result(result))
            }
            (Some(result), None) => Ok(MemoStatus::Result(result)),
            (None, Some(exception)) => Ok(MemoStatus::Exception(exception)),
            (None, None) => Ok(MemoStatus::Miss),
        }
    }

    /// Record the start of a computation
    pub async fn begin(&self, invocation: &Invocation) -> MemoResult<()> {
        let uri = invocation.address.uri()?.child(names::INVOCATION)?;
        let data = serde_json::to_vec_pretty(invocation)?;
        self.store.write(&uri, Bytes::from(data), true).await?;
        debug!("Wrote invocation {}", uri);
        Ok(())
    }

    /// Load the invocation recorded at an address
    pub async fn load_invocation(&self, address_uri: &BlobUri) -> MemoResult<Invocation> {
        let uri = address_uri.child(names::INVOCATION)?;
        let data = self.store.read(&uri).await?;
        serde_json::from_slice(&data).map_err(|e| MemoError::CorruptControlFile {
            uri: uri.to_string(),
            reason: e.to_string(),
        })
    }

    /// Record a successful outcome; store errors propagate
    pub async fn complete(&self, address: &MemospaceAddress, payload: Bytes) -> MemoResult<()> {
        self.write_terminal(address, names::RESULT, payload).await
    }

    /// Record a failed outcome; store errors propagate
    pub async fn fail(&self, address: &MemospaceAddress, payload: Bytes) -> MemoResult<()> {
        self.write_terminal(address, names::EXCEPTION, payload).await
    }

    /// Delete every control file under an address
    pub async fn invalidate(&self, address_uri: &BlobUri) -> MemoResult<()> {
        for name in [names::RESULT, names::EXCEPTION, names::INVOCATION] {
            let uri = address_uri.child(name)?;
            self.store.remove(&uri).await?;
            self.negative.forget(&uri).await?;
        }
        Ok(())
    }

    async fn write_terminal(
        &self,
        address: &MemospaceAddress,
        name: &str,
        payload: Bytes,
    ) -> MemoResult<()> {
        let base = address.uri()?;
        let uri = base.child(name)?;
        let record = ControlRecord {
            header: ControlHeader::for_address(address),
            payload,
        };

        self.store.write(&uri, record.encode()?, true).await?;
        self.negative.forget(&base.child(names::RESULT)?).await?;
        self.negative.forget(&base.child(names::EXCEPTION)?).await?;
        debug!("Wrote {} for {}", name, base);
        Ok(())
    }

    async fn read_record(&self, uri: &BlobUri) -> MemoResult<Option<ControlRecord>> {
        match read_optional(self.store.as_ref(), uri).await? {
            Some(data) => Ok(Some(ControlRecord::decode(uri, data)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use tempfile::TempDir;

    fn address(arg_key: &str) -> MemospaceAddress {
        MemospaceAddress {
            root: "memo".to_string(),
            pipeline_id: "test".to_string(),
            function: "app::f".to_string(),
            logic_key: "v1".to_string(),
            call_graph_suffix: "000000000000".to_string(),
            argument_key: arg_key.to_string(),
        }
    }

    fn control(temp: &TempDir) -> ControlFiles {
        ControlFiles::new(
            Arc::new(InMemoryStore::new()),
            NegativeCache::new(temp.path(), std::time::Duration::from_secs(60)),
        )
    }

    #[tokio::test]
    async fn miss_before_begin() {
        let temp = TempDir::new().unwrap();
        let files = control(&temp);
        assert_eq!(files.check(&address("a")).await.unwrap(), MemoStatus::Miss);
    }

    #[tokio::test]
    async fn complete_then_hit_with_identical_payload() {
        let temp = TempDir::new().unwrap();
        let files = control(&temp);
        let addr = address("a");

        files
            .begin(&Invocation::new(addr.clone(), CanonicalArgs::new()))
            .await
            .unwrap();
        assert_eq!(files.check(&addr).await.unwrap(), MemoStatus::Miss);

        let payload = Bytes::from_static(b"{\"x\":\n1}\x00\xff");
        files.complete(&addr, payload.clone()).await.unwrap();

        match files.check(&addr).await.unwrap() {
            MemoStatus::Result(record) => {
                assert_eq!(record.payload, payload);
                assert_eq!(record.header.function, "app::f");
                assert_eq!(record.header.logic_key, "v1");
            }
            other => panic!("expected result, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn fail_then_exception_hit() {
        let temp = TempDir::new().unwrap();
        let files = control(&temp);
        let addr = address("b");

        files.fail(&addr, Bytes::from_static(b"boom")).await.unwrap();
        match files.check(&addr).await.unwrap() {
            MemoStatus::Exception(record) => assert_eq!(record.payload, Bytes::from_static(b"boom")),
            other => panic!("expected exception, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn negative_cache_hides_outcome_written_elsewhere() {
        let temp = TempDir::new().unwrap();
        let store: Arc<dyn BlobStore> = Arc::new(InMemoryStore::new());
        let here = ControlFiles::new(
            store.clone(),
            NegativeCache::new(temp.path().join("here"), std::time::Duration::from_secs(60)),
        );
        let elsewhere = ControlFiles::new(store, NegativeCache::disabled());
        let addr = address("c");

        assert_eq!(here.check(&addr).await.unwrap(), MemoStatus::Miss);
        elsewhere.complete(&addr, Bytes::from_static(b"1")).await.unwrap();

        // Still a miss locally until the marker expires
        assert_eq!(here.check(&addr).await.unwrap(), MemoStatus::Miss);
        assert!(here.read_outcome(&addr).await.unwrap().is_hit());
    }

    #[tokio::test]
    async fn orphan_policy_reports_orphans() {
        let temp = TempDir::new().unwrap();
        let files = control(&temp).with_orphan_policy(OrphanPolicy::Warn);
        let addr = address("d");

        files
            .begin(&Invocation::new(addr.clone(), CanonicalArgs::new()))
            .await
            .unwrap();
        assert_eq!(files.check(&addr).await.unwrap(), MemoStatus::Orphaned);

        let silent = control(&temp);
        assert_eq!(silent.check(&address("e")).await.unwrap(), MemoStatus::Miss);
    }

    #[tokio::test]
    async fn invocation_roundtrips_and_invalidate_clears() {
        let temp = TempDir::new().unwrap();
        let files = control(&temp);
        let addr = address("f");
        let mut args = CanonicalArgs::new();
        args.insert("x".to_string(), serde_json::json!(4));

        files.begin(&Invocation::new(addr.clone(), args.clone())).await.unwrap();
        files.complete(&addr, Bytes::from_static(b"4")).await.unwrap();

        let loaded = files.load_invocation(&addr.uri().unwrap()).await.unwrap();
        assert_eq!(loaded.args, args);
        assert_eq!(loaded.address, addr);

        files.invalidate(&addr.uri().unwrap()).await.unwrap();
        assert_eq!(files.read_outcome(&addr).await.unwrap(), MemoStatus::Miss);
        assert!(files.load_invocation(&addr.uri().unwrap()).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn corrupt_terminal_file_is_reported() {
        let temp = TempDir::new().unwrap();
        let files = control(&temp);
        let addr = address("g");
        let uri = addr.uri().unwrap().child(names::RESULT).unwrap();
        files
            .store()
            .write(&uri, Bytes::from_static(b"no header"), true)
            .await
            .unwrap();

        let err = files.check(&addr).await.unwrap_err();
        assert!(matches!(err, MemoError::CorruptControlFile { .. }));
    }
}
