//! Memoized function execution
//!
//! [`Runner`] derives an address for each call, returns memoized outcomes
//! when present, and otherwise records an invocation and hands it to a
//! [`Shim`]. The shim's worker writes the terminal control file; the runner
//! reads it back from the store.

mod dispatch;
mod function;
mod shim;
mod worker;

pub use dispatch::{Called, Runner, RunnerBuilder, Source, DEFAULT_ROOT};
pub use function::{
    arg, CallContext, CallError, FnFunction, FunctionError, FunctionRegistry, MemoFunction,
};
pub(crate) use shim::output_tail;
pub use shim::{
    Shim, ShimJob, SubprocessShim, ThreadShim, ADDRESS_ENV, CONFIG_ENV, STORE_ROOT_ENV,
};
pub use worker::execute_invocation;

use crate::audit::AuditLog;
use crate::config::schema::{Config, ShimKind};
use crate::config::ConfigManager;
use crate::error::{MemoError, MemoResult};
use crate::lock::LockOptions;
use crate::memo::{ControlFiles, NegativeCache};
use crate::store::{BlobStore, LocalDiskStore};
use std::sync::Arc;
use std::time::Duration;

/// Build a runner over a local disk store from configuration
///
/// `config` may carry command-line overrides on top of the file `manager`
/// points at; subprocess workers get the file path plus the overrides that
/// change nested calls.
pub async fn runner_from_config(
    config: &Config,
    manager: &ConfigManager,
    registry: FunctionRegistry,
) -> MemoResult<Runner> {
    let store_root = ConfigManager::store_root(config);
    let store: Arc<dyn BlobStore> = Arc::new(LocalDiskStore::open(&store_root).await?);

    let negative = NegativeCache::new(
        ConfigManager::negative_cache_dir(config),
        Duration::from_secs(config.memo.negative_cache_ttl_secs),
    );
    let control = ControlFiles::new(store, negative).with_orphan_policy(config.memo.orphan_policy);

    let mut builder = Runner::builder(registry, control)
        .root(config.memo.root.clone())
        .audit(AuditLog::new(config));

    builder = match config.shim.kind {
        ShimKind::Thread => builder.shim(ThreadShim),
        ShimKind::Subprocess => {
            // Without a program, this executable's hidden `worker` command
            let (program, args) = match &config.shim.program {
                Some(program) => (program.clone(), config.shim.args.clone()),
                None => (
                    std::env::current_exe()
                        .map_err(|e| MemoError::io("locating current executable", e))?,
                    worker_args(config),
                ),
            };
            builder.shim(
                SubprocessShim::new(program)
                    .args(args)
                    .store_root(store_root)
                    .config_path(manager.path()),
            )
        }
    };

    if config.memo.lock_invocations {
        builder = builder.lock(
            lock_options(config).blocking(Duration::from_secs(config.memo.lock_wait_secs)),
        );
    }

    builder.build()
}

/// Arguments for this executable's `worker` command
fn worker_args(config: &Config) -> Vec<String> {
    let mut args = vec!["worker".to_string()];
    if config.memo.lock_invocations {
        args.push("--lock".to_string());
    }
    args
}

/// Lease options from the `[lock]` section
pub fn lock_options(config: &Config) -> LockOptions {
    let mut options = LockOptions::new(config.lock.expire_secs, config.lock.acquire_margin_secs)
        .poll_every(Duration::from_millis(config.lock.poll_interval_ms));
    options.max_poll_interval = Duration::from_millis(
        config.lock.max_poll_interval_ms.max(config.lock.poll_interval_ms),
    );
    options
}
