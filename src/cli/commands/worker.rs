//! Worker command - compute one recorded invocation for the subprocess shim

use crate::cli::args::WorkerArgs;
use crate::cli::builtins;
use crate::config::{Config, ConfigManager};
use crate::error::MemoResult;
use crate::runner::{execute_invocation, runner_from_config};
use crate::store::BlobUri;
use tracing::debug;

/// Execute the worker command
pub async fn execute(args: WorkerArgs, config: &Config, manager: &ConfigManager) -> MemoResult<()> {
    let address: BlobUri = args.address.parse()?;
    debug!("Worker picked up {}", address);

    let mut config = config.clone();
    if args.lock {
        config.memo.lock_invocations = true;
    }

    let runner = runner_from_config(&config, manager, builtins::registry()).await?;
    execute_invocation(&runner, &address).await
}
