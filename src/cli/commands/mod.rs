//! CLI command implementations

pub mod call;
pub mod config;
pub mod lock;
pub mod memo;
pub mod worker;

pub use call::execute as call;
pub use config::execute as config;
pub use lock::execute as lock;
pub use memo::execute as memo;
pub use worker::execute as worker;

use crate::config::{Config, ConfigManager};
use crate::error::MemoResult;
use crate::store::{BlobStore, LocalDiskStore};
use std::sync::Arc;

/// Open the local disk store a config points at
pub(crate) async fn open_store(config: &Config) -> MemoResult<Arc<dyn BlobStore>> {
    let store = LocalDiskStore::open(ConfigManager::store_root(config)).await?;
    Ok(Arc::new(store))
}
