//! Execution shims
//!
//! A shim runs one recorded invocation to completion somewhere: a tokio task
//! in this process, or a child process that reads `invocation` back from the
//! store. Either way the outcome comes back through the control files, never
//! through the shim's return value.

use crate::error::{MemoError, MemoResult};
use crate::memo::{Invocation, MemospaceAddress};
use crate::runner::dispatch::Runner;
use crate::runner::worker::execute_invocation;
use crate::store::BlobUri;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::debug;

/// Env var carrying the address uri to a subprocess worker
pub const ADDRESS_ENV: &str = "BLOBMEMO_ADDRESS";

/// Env var carrying the local store root to a subprocess worker
pub const STORE_ROOT_ENV: &str = "BLOBMEMO_STORE_ROOT";

/// Env var carrying the config file path to a subprocess worker
pub const CONFIG_ENV: &str = "BLOBMEMO_CONFIG";

/// Max number of output lines kept in a worker failure message
const FAILURE_TAIL_LINES: usize = 50;

/// One invocation handed to a shim
pub struct ShimJob {
    pub runner: Runner,
    pub address: MemospaceAddress,
    pub address_uri: BlobUri,
    pub invocation: Invocation,
}

/// Runs invocations that are already recorded in the store
#[async_trait]
pub trait Shim: Send + Sync {
    /// Run the job and return once a terminal file is written or the
    /// attempt failed
    async fn execute(&self, job: &ShimJob) -> MemoResult<()>;

    /// Short name for logs
    fn shim_name(&self) -> &'static str;
}

/// Runs the function on a tokio task in this process
///
/// Dropping the `execute` future aborts the task, so a caller that gives up
/// (for instance on lock theft) stops the computation instead of leaving it
/// to write a terminal file later.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadShim;

#[async_trait]
impl Shim for ThreadShim {
    async fn execute(&self, job: &ShimJob) -> MemoResult<()> {
        let runner = job.runner.clone();
        let address_uri = job.address_uri.clone();

        let mut task = AbortOnDrop(tokio::spawn(async move {
            execute_invocation(&runner, &address_uri).await
        }));
        (&mut task.0).await.map_err(|e| MemoError::ShimFailed {
            address: job.address.to_string(),
            reason: if e.is_panic() {
                "function panicked".to_string()
            } else {
                e.to_string()
            },
        })?
    }

    fn shim_name(&self) -> &'static str {
        "thread"
    }
}

/// Aborts the task when dropped; a no-op once it has finished
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Runs a worker program per invocation
///
/// The program gets the address uri both as its last argument and in
/// `BLOBMEMO_ADDRESS`. It must read `invocation` from the same store and
/// write `result` or `exception` before exiting.
#[derive(Debug, Clone)]
pub struct SubprocessShim {
    program: PathBuf,
    args: Vec<String>,
    store_root: Option<PathBuf>,
    config_path: Option<PathBuf>,
}

impl SubprocessShim {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            store_root: None,
            config_path: None,
        }
    }

    /// Extra arguments placed before the address
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Local store root exported to the worker
    pub fn store_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.store_root = Some(root.into());
        self
    }

    /// Config file exported to the worker, so nested calls derive the same
    /// addresses as the parent
    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }
}

#[async_trait]
impl Shim for SubprocessShim {
    async fn execute(&self, job: &ShimJob) -> MemoResult<()> {
        let address_uri = job.address_uri.to_string();
        debug!("Spawning {} {:?} {}", self.program.display(), self.args, address_uri);

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(&address_uri)
            .env(ADDRESS_ENV, &address_uri)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(root) = &self.store_root {
            command.env(STORE_ROOT_ENV, root);
        }
        if let Some(path) = &self.config_path {
            command.env(CONFIG_ENV, path);
        }

        let output = command
            .output()
            .await
            .map_err(|e| MemoError::command_failed(self.program.display().to_string(), e))?;

        if output.status.success() {
            return Ok(());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(MemoError::ShimFailed {
            address: job.address.to_string(),
            reason: format!(
                "worker exited with {}\n{}",
                output.status,
                output_tail(&stdout, &stderr)
            ),
        })
    }

    fn shim_name(&self) -> &'static str {
        "subprocess"
    }
}

/// Last lines of a worker's combined output
pub(crate) fn output_tail(stdout: &str, stderr: &str) -> String {
    let lines: Vec<&str> = stdout.lines().chain(stderr.lines()).collect();
    let skip = lines.len().saturating_sub(FAILURE_TAIL_LINES);
    lines[skip..].join("\n")
}
