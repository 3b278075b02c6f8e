//! Lease acquisition, heartbeat and release
//!
//! The store has no compare-and-swap, so acquisition is write-then-verify:
//! a writer that finds the lock free writes its own record, waits
//! `acquire_margin`, and reads the record back. Of several racing writers
//! only the last one to land still sees its own `writer_id`.

use super::record::{epoch_now, LockRecord, LOCK_FILE};
use crate::error::{MemoError, MemoResult};
use crate::store::{read_optional, BlobStore, BlobUri};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};
use uuid::Uuid;

/// Shortest heartbeat interval a maintainer will use
const MIN_HEARTBEAT: Duration = Duration::from_millis(10);

/// Lease parameters
#[derive(Debug, Clone, PartialEq)]
pub struct LockOptions {
    /// Lease duration in seconds
    pub expire_secs: f64,
    /// Seconds to wait before confirming a write, and the extra age a
    /// lease must reach before it counts as abandoned
    pub acquire_margin_secs: f64,
    /// How long to keep polling a held lock; `None` gives up immediately
    pub block: Option<Duration>,
    /// First polling delay, doubled after each attempt
    pub poll_interval: Duration,
    pub max_poll_interval: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            expire_secs: 30.0,
            acquire_margin_secs: 1.0,
            block: None,
            poll_interval: Duration::from_millis(250),
            max_poll_interval: Duration::from_secs(5),
        }
    }
}

impl LockOptions {
    /// Options with the given lease duration and margin, in seconds
    pub fn new(expire_secs: f64, acquire_margin_secs: f64) -> Self {
        Self {
            expire_secs,
            acquire_margin_secs,
            ..Self::default()
        }
    }

    pub fn blocking(mut self, block: Duration) -> Self {
        self.block = Some(block);
        self
    }

    pub fn poll_every(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self.max_poll_interval = self.max_poll_interval.max(interval);
        self
    }

    /// Reject configurations that can never give a usable lease
    pub fn validate(&self) -> MemoResult<()> {
        if !self.expire_secs.is_finite() || self.expire_secs <= 0.0 {
            return Err(MemoError::Configuration(format!(
                "expire must be positive, got {}s",
                self.expire_secs
            )));
        }
        if !self.acquire_margin_secs.is_finite() || self.acquire_margin_secs < 0.0 {
            return Err(MemoError::Configuration(format!(
                "acquire_margin must not be negative, got {}s",
                self.acquire_margin_secs
            )));
        }
        if self.acquire_margin_secs * 2.0 >= self.expire_secs {
            return Err(MemoError::Configuration(format!(
                "acquire_margin ({}s) must be less than half of expire ({}s)",
                self.acquire_margin_secs, self.expire_secs
            )));
        }
        Ok(())
    }

    /// Heartbeat cadence: a third of the lease, so two beats can be missed
    /// before it lapses
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs_f64(self.expire_secs / 3.0).max(MIN_HEARTBEAT)
    }

    fn margin(&self) -> Duration {
        Duration::from_secs_f64(self.acquire_margin_secs)
    }
}

/// Proof of a successful acquisition
///
/// Holding a handle is a belief, not a guarantee: once the lease lapses a
/// racing writer may take over, which [`LockHandle::maintain`] detects.
#[derive(Clone)]
pub struct LockHandle {
    store: Arc<dyn BlobStore>,
    address: BlobUri,
    uri: BlobUri,
    writer_id: String,
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("address", &self.address)
            .field("writer_id", &self.writer_id)
            .finish()
    }
}

impl LockHandle {
    pub fn writer_id(&self) -> &str {
        &self.writer_id
    }

    pub fn address(&self) -> &BlobUri {
        &self.address
    }

    /// Extend the lease, or fail with [`MemoError::LockStolen`] if another
    /// writer owns the record now
    pub async fn maintain(&self) -> MemoResult<()> {
        let mut record = match read_lock_record(self.store.as_ref(), &self.address).await? {
            Some(record) if record.writer_id == self.writer_id => record,
            other => {
                let current = other
                    .map(|r| r.writer_id)
                    .unwrap_or_else(|| "<none>".to_string());
                info!("Lock at {} stolen by {}", self.address, current);
                return Err(MemoError::LockStolen {
                    address: self.address.to_string(),
                    current,
                });
            }
        };

        if record.is_released() {
            return Err(MemoError::Internal(format!(
                "lock at {} was already released by this holder",
                self.address
            )));
        }

        record.heartbeat(epoch_now());
        write_lock_record(self.store.as_ref(), &self.uri, &record).await?;
        debug!("Lock at {} maintained (write {})", self.address, record.write_count);
        Ok(())
    }

    /// Mark the lock released if this handle still owns it; a no-op otherwise
    pub async fn release(&self) -> MemoResult<()> {
        let mut record = match read_lock_record(self.store.as_ref(), &self.address).await? {
            Some(record) if record.writer_id == self.writer_id => record,
            _ => {
                debug!("Lock at {} no longer ours, nothing to release", self.address);
                return Ok(());
            }
        };

        if record.is_released() {
            return Ok(());
        }

        record.released_at = Some(epoch_now());
        write_lock_record(self.store.as_ref(), &self.uri, &record).await?;
        info!("Released lock at {}", self.address);
        Ok(())
    }
}

/// Try to take the lock at `address`
///
/// Returns `None` on contention (after polling until `options.block`
/// elapses, if set). Invalid options fail before the store is touched.
pub async fn acquire(
    store: Arc<dyn BlobStore>,
    address: &BlobUri,
    options: &LockOptions,
) -> MemoResult<Option<LockHandle>> {
    options.validate()?;

    let uri = address.child(LOCK_FILE)?;
    let deadline = options.block.map(|block| Instant::now() + block);
    let mut delay = options.poll_interval;

    loop {
        if let Some(handle) = try_acquire(&store, address, &uri, options).await? {
            return Ok(Some(handle));
        }

        let Some(deadline) = deadline else {
            return Ok(None);
        };
        let now = Instant::now();
        if now >= deadline {
            debug!("Gave up waiting for lock at {}", address);
            return Ok(None);
        }

        sleep(delay.min(deadline - now)).await;
        delay = (delay * 2).min(options.max_poll_interval);
    }
}

async fn try_acquire(
    store: &Arc<dyn BlobStore>,
    address: &BlobUri,
    uri: &BlobUri,
    options: &LockOptions,
) -> MemoResult<Option<LockHandle>> {
    let now = epoch_now();
    if let Some(current) = read_lock_record(store.as_ref(), address).await? {
        if !current.is_available(now, options.acquire_margin_secs) {
            debug!(
                "Lock at {} held by {} until {:.3}",
                address,
                current.writer_id,
                current.expires_at()
            );
            return Ok(None);
        }
    }

    let writer_id = Uuid::new_v4().to_string();
    let record = LockRecord::acquired(writer_id.clone(), options.expire_secs, now);
    write_lock_record(store.as_ref(), uri, &record).await?;

    sleep(options.margin()).await;

    match read_lock_record(store.as_ref(), address).await? {
        Some(confirmed) if confirmed.writer_id == writer_id => {
            info!("Acquired lock at {} as {}", address, writer_id);
            Ok(Some(LockHandle {
                store: store.clone(),
                address: address.clone(),
                uri: uri.clone(),
                writer_id,
            }))
        }
        _ => {
            debug!("Lost acquisition race for lock at {}", address);
            Ok(None)
        }
    }
}

/// Read the lock record at `address`, if any
pub async fn read_lock_record(
    store: &dyn BlobStore,
    address: &BlobUri,
) -> MemoResult<Option<LockRecord>> {
    let uri = address.child(LOCK_FILE)?;
    match read_optional(store, &uri).await? {
        Some(data) => {
            let record = serde_json::from_slice(&data).map_err(|e| MemoError::CorruptControlFile {
                uri: uri.to_string(),
                reason: e.to_string(),
            })?;
            Ok(Some(record))
        }
        None => Ok(None),
    }
}

async fn write_lock_record(store: &dyn BlobStore, uri: &BlobUri, record: &LockRecord) -> MemoResult<()> {
    let data = serde_json::to_vec(record)?;
    store.write(uri, Bytes::from(data), true).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn address() -> BlobUri {
        "locks/shared".parse().unwrap()
    }

    fn fast(expire: f64) -> LockOptions {
        LockOptions::new(expire, 0.05).poll_every(Duration::from_millis(20))
    }

    #[tokio::test]
    async fn rejects_bad_margins_before_touching_store() {
        let store = Arc::new(InMemoryStore::new());

        let err = acquire(store.clone(), &address(), &LockOptions::new(21.0, 20.0))
            .await
            .unwrap_err();
        assert!(matches!(err, MemoError::Configuration(_)));

        let err = acquire(store.clone(), &address(), &LockOptions::new(30.0, -2.0))
            .await
            .unwrap_err();
        assert!(matches!(err, MemoError::Configuration(_)));

        assert!(LockOptions::new(0.0, 0.0).validate().is_err());
        assert!(LockOptions::new(10.0, 10.0).validate().is_err());
        assert!(store.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn exactly_one_of_many_racers_wins() {
        let store: Arc<dyn BlobStore> = Arc::new(InMemoryStore::new());
        let options = LockOptions::new(30.0, 0.2);

        let racers: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let options = options.clone();
                tokio::spawn(async move { acquire(store, &address(), &options).await.unwrap() })
            })
            .collect();

        let mut winners = 0;
        for racer in racers {
            if racer.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn release_allows_immediate_reacquire() {
        let store: Arc<dyn BlobStore> = Arc::new(InMemoryStore::new());
        let options = fast(30.0);

        let first = acquire(store.clone(), &address(), &options).await.unwrap().unwrap();
        assert!(acquire(store.clone(), &address(), &options).await.unwrap().is_none());

        first.release().await.unwrap();
        let second = acquire(store.clone(), &address(), &options).await.unwrap();
        assert!(second.is_some());
        assert_ne!(second.unwrap().writer_id(), first.writer_id());
    }

    #[tokio::test]
    async fn unmaintained_lock_expires_only_after_lease() {
        let store: Arc<dyn BlobStore> = Arc::new(InMemoryStore::new());
        let options = fast(0.6);

        let started = Instant::now();
        let _abandoned = acquire(store.clone(), &address(), &options).await.unwrap().unwrap();

        // Well inside the lease
        assert!(acquire(store.clone(), &address(), &options).await.unwrap().is_none());

        let waiting = options.clone().blocking(Duration::from_secs(5));
        let taken = acquire(store.clone(), &address(), &waiting).await.unwrap();
        assert!(taken.is_some());
        assert!(started.elapsed() >= Duration::from_secs_f64(0.6));
    }

    #[tokio::test]
    async fn maintain_extends_lease() {
        let store: Arc<dyn BlobStore> = Arc::new(InMemoryStore::new());
        let options = fast(0.5);

        let handle = acquire(store.clone(), &address(), &options).await.unwrap().unwrap();
        for _ in 0..4 {
            sleep(Duration::from_millis(200)).await;
            handle.maintain().await.unwrap();
            assert!(acquire(store.clone(), &address(), &options).await.unwrap().is_none());
        }

        let record = read_lock_record(store.as_ref(), &address()).await.unwrap().unwrap();
        assert_eq!(record.write_count, 5);
        assert_eq!(record.writer_id, handle.writer_id());
    }

    #[tokio::test]
    async fn maintain_after_takeover_reports_theft() {
        let store: Arc<dyn BlobStore> = Arc::new(InMemoryStore::new());
        let options = fast(0.3);

        let stale = acquire(store.clone(), &address(), &options).await.unwrap().unwrap();
        sleep(Duration::from_millis(450)).await;
        let thief = acquire(store.clone(), &address(), &options).await.unwrap().unwrap();

        let err = stale.maintain().await.unwrap_err();
        match err {
            MemoError::LockStolen { current, .. } => assert_eq!(current, thief.writer_id()),
            other => panic!("expected LockStolen, got {:?}", other),
        }

        // Releasing a stolen lock leaves the new holder alone
        stale.release().await.unwrap();
        let record = read_lock_record(store.as_ref(), &address()).await.unwrap().unwrap();
        assert_eq!(record.writer_id, thief.writer_id());
        assert!(record.released_at.is_none());
        thief.maintain().await.unwrap();
    }

    #[tokio::test]
    async fn blocking_acquire_times_out() {
        let store: Arc<dyn BlobStore> = Arc::new(InMemoryStore::new());
        let options = fast(30.0);

        let _held = acquire(store.clone(), &address(), &options).await.unwrap().unwrap();
        let started = Instant::now();
        let waiting = options.clone().blocking(Duration::from_millis(200));
        assert!(acquire(store.clone(), &address(), &waiting).await.unwrap().is_none());
        assert!(started.elapsed() >= Duration::from_millis(200));
    }
}
