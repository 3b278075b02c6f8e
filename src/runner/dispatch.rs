//! Memoized call dispatch

use crate::audit::AuditLog;
use crate::error::{MemoError, MemoResult};
use crate::lock::{locked, LockOptions};
use crate::memo::{
    Args, CanonicalArgs, ControlFiles, ControlRecord, IdentityDeriver, Invocation, MemoStatus,
    MemospaceAddress, OrphanPolicy, PipelineContext,
};
use crate::runner::function::{FunctionError, FunctionRegistry};
use crate::runner::shim::{Shim, ShimJob, ThreadShim};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// Default memospace root under the store
pub const DEFAULT_ROOT: &str = "memo";

/// Where a returned value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Cached,
    Computed,
}

/// A successful memoized call
#[derive(Debug, Clone, Serialize)]
pub struct Called {
    pub address: String,
    pub source: Source,
    pub value: Value,
}

struct RunnerInner {
    deriver: IdentityDeriver,
    registry: FunctionRegistry,
    control: ControlFiles,
    shim: Arc<dyn Shim>,
    lock: Option<LockOptions>,
    audit: AuditLog,
}

/// Checks control files before every call and computes only on a miss
///
/// Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct Runner {
    inner: Arc<RunnerInner>,
}

/// Builder for [`Runner`]
pub struct RunnerBuilder {
    registry: FunctionRegistry,
    control: ControlFiles,
    root: String,
    shim: Arc<dyn Shim>,
    lock: Option<LockOptions>,
    audit: AuditLog,
}

impl RunnerBuilder {
    /// Memospace root under the store
    pub fn root(mut self, root: impl Into<String>) -> Self {
        self.root = root.into();
        self
    }

    pub fn shim(mut self, shim: impl Shim + 'static) -> Self {
        self.shim = Arc::new(shim);
        self
    }

    /// Hold the lease lock on an address while computing it
    pub fn lock(mut self, options: LockOptions) -> Self {
        self.lock = Some(options);
        self
    }

    pub fn audit(mut self, audit: AuditLog) -> Self {
        self.audit = audit;
        self
    }

    pub fn build(self) -> MemoResult<Runner> {
        if let Some(options) = &self.lock {
            options.validate()?;
        }
        let deriver = IdentityDeriver::new(self.root, self.registry.graph().clone())?;

        Ok(Runner {
            inner: Arc::new(RunnerInner {
                deriver,
                registry: self.registry,
                control: self.control,
                shim: self.shim,
                lock: self.lock,
                audit: self.audit,
            }),
        })
    }
}

impl Runner {
    /// Start building a runner with the in-process shim and no locking
    pub fn builder(registry: FunctionRegistry, control: ControlFiles) -> RunnerBuilder {
        RunnerBuilder {
            registry,
            control,
            root: DEFAULT_ROOT.to_string(),
            shim: Arc::new(ThreadShim),
            lock: None,
            audit: AuditLog::disabled(),
        }
    }

    pub fn registry(&self) -> &FunctionRegistry {
        &self.inner.registry
    }

    pub fn control(&self) -> &ControlFiles {
        &self.inner.control
    }

    pub fn deriver(&self) -> &IdentityDeriver {
        &self.inner.deriver
    }

    /// Call `function` under the pipeline namespace `pipeline` is in
    pub async fn call(
        &self,
        pipeline: &PipelineContext,
        function: &str,
        args: Args,
    ) -> MemoResult<Value> {
        self.call_detailed(pipeline, function, args)
            .await
            .map(|called| called.value)
    }

    /// Like [`Runner::call`], deserializing the value
    pub async fn call_as<T: DeserializeOwned>(
        &self,
        pipeline: &PipelineContext,
        function: &str,
        args: Args,
    ) -> MemoResult<T> {
        let value = self.call(pipeline, function, args).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Like [`Runner::call`], also reporting the address and whether the
    /// value was computed
    pub async fn call_detailed(
        &self,
        pipeline: &PipelineContext,
        function: &str,
        args: Args,
    ) -> MemoResult<Called> {
        let inner = &self.inner;
        let (address, canonical) = inner.deriver.derive(function, pipeline.current(), &args)?;

        let status = inner.control.check(&address).await?;
        if let Some(value) = self.replay(&address, status).await? {
            return Ok(Called {
                address: address.to_string(),
                source: Source::Cached,
                value,
            });
        }

        let (source, value) = match &inner.lock {
            None => (Source::Computed, self.compute(&address, canonical).await?),
            Some(options) => {
                let lock_address = address.uri()?;
                locked(
                    inner.control.store().clone(),
                    &lock_address,
                    options,
                    |_| async {
                        // A previous holder may have finished while we waited
                        let status = inner.control.read_outcome(&address).await?;
                        match self.replay(&address, status).await? {
                            Some(value) => Ok((Source::Cached, value)),
                            None => Ok((Source::Computed, self.compute(&address, canonical).await?)),
                        }
                    },
                )
                .await?
            }
        };

        Ok(Called {
            address: address.to_string(),
            source,
            value,
        })
    }

    /// Turn a memoized status into a value, a replayed failure, or `None`
    /// when the call must be computed
    async fn replay(&self, address: &MemospaceAddress, status: MemoStatus) -> MemoResult<Option<Value>> {
        match status {
            MemoStatus::Result(record) => {
                let value = decode_value(address, &record)?;
                debug!("Memo hit at {}", address);
                self.audit("memo.hit", address).await;
                Ok(Some(value))
            }
            MemoStatus::Exception(record) => {
                let err = decode_failure(address, &record)?;
                debug!("Replaying memoized failure at {}", address);
                self.audit("memo.replayed", address).await;
                Err(MemoError::Function(err))
            }
            MemoStatus::Orphaned => match self.inner.control.orphan_policy() {
                OrphanPolicy::Fail => Err(MemoError::Orphaned {
                    address: address.to_string(),
                }),
                _ => {
                    warn!("Recomputing orphaned invocation at {}", address);
                    Ok(None)
                }
            },
            MemoStatus::Miss => Ok(None),
        }
    }

    async fn compute(&self, address: &MemospaceAddress, args: CanonicalArgs) -> MemoResult<Value> {
        let inner = &self.inner;
        let invocation = Invocation::new(address.clone(), args);
        inner.control.begin(&invocation).await?;

        let job = ShimJob {
            runner: self.clone(),
            address: address.clone(),
            address_uri: address.uri()?,
            invocation,
        };
        debug!("Dispatching {} to {} shim", address, inner.shim.shim_name());
        inner.shim.execute(&job).await?;

        match inner.control.read_outcome(address).await? {
            MemoStatus::Result(record) => {
                self.audit("memo.computed", address).await;
                decode_value(address, &record)
            }
            MemoStatus::Exception(record) => {
                self.audit("memo.failed", address).await;
                Err(MemoError::Function(decode_failure(address, &record)?))
            }
            _ => Err(MemoError::ShimIncomplete {
                address: address.to_string(),
            }),
        }
    }

    async fn audit(&self, event: &str, address: &MemospaceAddress) {
        self.inner
            .audit
            .log(
                event,
                &json!({
                    "address": address.to_string(),
                    "function": address.function,
                    "pipeline_id": address.pipeline_id,
                }),
            )
            .await;
    }
}

fn decode_value(address: &MemospaceAddress, record: &ControlRecord) -> MemoResult<Value> {
    serde_json::from_slice(&record.payload).map_err(|e| MemoError::CorruptControlFile {
        uri: format!("{}/result", address),
        reason: e.to_string(),
    })
}

fn decode_failure(address: &MemospaceAddress, record: &ControlRecord) -> MemoResult<FunctionError> {
    serde_json::from_slice(&record.payload).map_err(|e| MemoError::CorruptControlFile {
        uri: format!("{}/exception", address),
        reason: e.to_string(),
    })
}
