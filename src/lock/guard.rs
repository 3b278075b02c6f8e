//! Background heartbeats and scoped acquisition

use super::lease::{acquire, LockHandle, LockOptions};
use crate::error::{MemoError, MemoResult};
use crate::store::{BlobStore, BlobUri};
use futures_util::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

/// Heartbeat task keeping a lease alive
///
/// Stops on drop. Theft ends the task and is reported through
/// [`Maintainer::stolen`]; other store errors are logged and retried on the
/// next beat.
pub struct Maintainer {
    address: BlobUri,
    task: JoinHandle<()>,
    stolen: watch::Receiver<Option<String>>,
}

impl Maintainer {
    /// Start heartbeating `handle` every `interval`
    pub fn spawn(handle: LockHandle, interval: Duration) -> Self {
        let (tx, rx) = watch::channel(None);
        let address = handle.address().clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match handle.maintain().await {
                    Ok(()) => {}
                    Err(MemoError::LockStolen { current, .. }) => {
                        let _ = tx.send(Some(current));
                        return;
                    }
                    Err(e) => warn!("Heartbeat for lock at {} failed: {}", handle.address(), e),
                }
            }
        });

        Self {
            address,
            task,
            stolen: rx,
        }
    }

    /// Resolves only if the lease is taken over by another writer
    pub async fn stolen(&mut self) -> MemoError {
        let current = self
            .stolen
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|current| (*current).clone());

        match current {
            Some(current) => MemoError::LockStolen {
                address: self.address.to_string(),
                current,
            },
            // Sender gone without reporting theft: the task was stopped
            None => std::future::pending().await,
        }
    }

    /// Stop heartbeating
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for Maintainer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Run `body` while holding the lock at `address`
///
/// Acquires (honoring `options.block`), heartbeats in the background, and
/// releases on every exit path, including a panic inside `body`. If the
/// lease is stolen mid-flight, `body` is dropped and
/// [`MemoError::LockStolen`] returned. Contention ends in
/// [`MemoError::LockUnavailable`].
pub async fn locked<F, Fut, T>(
    store: Arc<dyn BlobStore>,
    address: &BlobUri,
    options: &LockOptions,
    body: F,
) -> MemoResult<T>
where
    F: FnOnce(LockHandle) -> Fut,
    Fut: Future<Output = MemoResult<T>>,
{
    let handle = acquire(store, address, options)
        .await?
        .ok_or_else(|| MemoError::LockUnavailable {
            address: address.to_string(),
        })?;

    let mut maintainer = Maintainer::spawn(handle.clone(), options.heartbeat_interval());
    let guarded = AssertUnwindSafe(body(handle.clone())).catch_unwind();

    let outcome = tokio::select! {
        outcome = guarded => Ok(outcome),
        stolen = maintainer.stolen() => Err(stolen),
    };
    maintainer.stop();

    let released = handle.release().await;
    match outcome {
        Err(stolen) => Err(stolen),
        Ok(Ok(Ok(value))) => released.map(|()| value),
        Ok(Ok(Err(e))) => {
            if let Err(release_err) = released {
                warn!("Failed to release lock at {}: {}", address, release_err);
            }
            Err(e)
        }
        Ok(Err(panic)) => {
            if let Err(release_err) = released {
                warn!("Failed to release lock at {}: {}", address, release_err);
            }
            std::panic::resume_unwind(panic)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::lease::read_lock_record;
    use crate::store::InMemoryStore;
    use tokio::time::sleep;

    fn address() -> BlobUri {
        "locks/guarded".parse().unwrap()
    }

    fn options(expire: f64) -> LockOptions {
        LockOptions::new(expire, 0.02).poll_every(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn releases_after_success() {
        let store: Arc<dyn BlobStore> = Arc::new(InMemoryStore::new());

        let value = locked(store.clone(), &address(), &options(5.0), |_| async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);

        let record = read_lock_record(store.as_ref(), &address()).await.unwrap().unwrap();
        assert!(record.released_at.is_some());
    }

    #[tokio::test]
    async fn releases_after_error() {
        let store: Arc<dyn BlobStore> = Arc::new(InMemoryStore::new());

        let err = locked(store.clone(), &address(), &options(5.0), |_| async {
            Err::<(), _>(MemoError::User("guarded work failed".to_string()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, MemoError::User(_)));

        let record = read_lock_record(store.as_ref(), &address()).await.unwrap().unwrap();
        assert!(record.released_at.is_some());
    }

    #[tokio::test]
    async fn releases_after_panic() {
        let store: Arc<dyn BlobStore> = Arc::new(InMemoryStore::new());
        let task_store = store.clone();

        let joined = tokio::spawn(async move {
            locked(task_store, &address(), &options(5.0), |_| async {
                if true {
                    panic!("guarded work panicked");
                }
                Ok(())
            })
            .await
        })
        .await;
        assert!(joined.unwrap_err().is_panic());

        let record = read_lock_record(store.as_ref(), &address()).await.unwrap().unwrap();
        assert!(record.released_at.is_some());
    }

    #[tokio::test]
    async fn heartbeat_outlives_lease() {
        let store: Arc<dyn BlobStore> = Arc::new(InMemoryStore::new());
        let opts = options(0.3);

        let contender = store.clone();
        let contender_opts = opts.clone();
        let result = locked(store.clone(), &address(), &opts, |_| async move {
            sleep(Duration::from_millis(900)).await;
            let stolen = acquire(contender, &address(), &contender_opts).await?;
            Ok(stolen.is_none())
        })
        .await
        .unwrap();

        assert!(result, "lease lapsed while being maintained");
    }

    #[tokio::test]
    async fn contention_is_unavailable() {
        let store: Arc<dyn BlobStore> = Arc::new(InMemoryStore::new());
        let _held = acquire(store.clone(), &address(), &options(5.0)).await.unwrap().unwrap();

        let err = locked(store, &address(), &options(5.0), |_| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, MemoError::LockUnavailable { .. }));
    }

    #[tokio::test]
    async fn theft_aborts_guarded_work() {
        let store: Arc<dyn BlobStore> = Arc::new(InMemoryStore::new());
        let opts = options(5.0);

        let thief_store = store.clone();
        let err = locked(store.clone(), &address(), &opts, |handle| async move {
            // Simulate a racing writer overwriting the record after a lapse
            let mut record = read_lock_record(thief_store.as_ref(), handle.address())
                .await?
                .unwrap();
            record.writer_id = "thief".to_string();
            let uri = handle.address().child(crate::lock::LOCK_FILE)?;
            thief_store
                .write(&uri, bytes::Bytes::from(serde_json::to_vec(&record)?), true)
                .await?;

            sleep(Duration::from_secs(30)).await;
            Ok(())
        })
        .await
        .unwrap_err();

        match err {
            MemoError::LockStolen { current, .. } => assert_eq!(current, "thief"),
            other => panic!("expected LockStolen, got {:?}", other),
        }

        // The thief's record is untouched by our release
        let record = read_lock_record(store.as_ref(), &address()).await.unwrap().unwrap();
        assert_eq!(record.writer_id, "thief");
        assert!(record.released_at.is_none());
    }
}
