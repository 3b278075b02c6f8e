//! Memoized functions and their registry

use crate::error::{MemoError, MemoResult};
use crate::memo::{Args, CallGraph, CanonicalArgs, FunctionInfo, MemospaceAddress, PipelineContext};
use crate::runner::dispatch::Runner;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Failure of a memoized function, stored verbatim in `exception`
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct FunctionError {
    /// Short machine-readable category
    pub kind: String,
    pub message: String,
}

impl FunctionError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for FunctionError {
    fn from(err: serde_json::Error) -> Self {
        Self::new("serialization", err.to_string())
    }
}

/// Why a function body stopped without a value
///
/// Only [`CallError::Function`] is an outcome: it is written to `exception`
/// and replayed. [`CallError::Memo`] comes from the machinery around the
/// function (a nested call hitting a held lock, a store or shim error) and
/// leaves the invocation without a terminal file, so a later call computes
/// it again.
#[derive(Error, Debug)]
pub enum CallError {
    #[error(transparent)]
    Function(FunctionError),

    #[error(transparent)]
    Memo(MemoError),
}

impl From<FunctionError> for CallError {
    fn from(err: FunctionError) -> Self {
        Self::Function(err)
    }
}

impl From<MemoError> for CallError {
    fn from(err: MemoError) -> Self {
        match err {
            // A nested function's own failure is as deterministic as ours
            MemoError::Function(inner) => Self::Function(inner),
            other => Self::Memo(other),
        }
    }
}

impl From<serde_json::Error> for CallError {
    fn from(err: serde_json::Error) -> Self {
        Self::Function(err.into())
    }
}

/// Deserialize one bound argument
pub fn arg<T: DeserializeOwned>(args: &CanonicalArgs, name: &str) -> Result<T, FunctionError> {
    let value = args
        .get(name)
        .ok_or_else(|| FunctionError::new("arguments", format!("missing argument '{}'", name)))?;
    serde_json::from_value(value.clone())
        .map_err(|e| FunctionError::new("arguments", format!("argument '{}': {}", name, e)))
}

/// What a running function can see of its surroundings
///
/// Nested memoized calls go through [`CallContext::call`] and land in the
/// same pipeline namespace as the outer call.
#[derive(Clone)]
pub struct CallContext {
    runner: Runner,
    pipeline: PipelineContext,
    address: MemospaceAddress,
}

impl CallContext {
    pub(crate) fn new(runner: Runner, pipeline: PipelineContext, address: MemospaceAddress) -> Self {
        Self {
            runner,
            pipeline,
            address,
        }
    }

    /// Address of the invocation being computed
    pub fn address(&self) -> &MemospaceAddress {
        &self.address
    }

    pub fn pipeline(&self) -> &PipelineContext {
        &self.pipeline
    }

    pub fn runner(&self) -> &Runner {
        &self.runner
    }

    /// Call another memoized function
    pub async fn call(&self, function: &str, args: Args) -> MemoResult<Value> {
        self.runner.call(&self.pipeline, function, args).await
    }
}

/// A function whose results are memoized
#[async_trait]
pub trait MemoFunction: Send + Sync {
    async fn call(&self, cx: CallContext, args: CanonicalArgs) -> Result<Value, CallError>;
}

/// Adapts an async closure into a [`MemoFunction`]
pub struct FnFunction<F>(pub F);

#[async_trait]
impl<F, Fut> MemoFunction for FnFunction<F>
where
    F: Fn(CallContext, CanonicalArgs) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, CallError>> + Send + 'static,
{
    async fn call(&self, cx: CallContext, args: CanonicalArgs) -> Result<Value, CallError> {
        (self.0)(cx, args).await
    }
}

/// Every function the runner knows, plus the call graph built from them
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    graph: CallGraph,
    functions: HashMap<String, Arc<dyn MemoFunction>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a memoized function
    pub fn register(&mut self, info: FunctionInfo, function: impl MemoFunction + 'static) -> &mut Self {
        self.functions.insert(info.name.clone(), Arc::new(function));
        self.graph.insert(info);
        self
    }

    /// Register an async closure as a memoized function
    pub fn register_fn<F, Fut>(&mut self, info: FunctionInfo, function: F) -> &mut Self
    where
        F: Fn(CallContext, CanonicalArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, CallError>> + Send + 'static,
    {
        self.register(info, FnFunction(function))
    }

    /// Add a plain helper to the call graph so its logic key propagates to
    /// callers
    pub fn declare(&mut self, info: FunctionInfo) -> &mut Self {
        self.graph.insert(info);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn MemoFunction>> {
        self.functions.get(name).cloned()
    }

    pub fn graph(&self) -> &CallGraph {
        &self.graph
    }

    /// Names of registered memoized functions, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn function_error_display_and_json() {
        let err = FunctionError::new("ValueError", "x must be positive");
        assert_eq!(err.to_string(), "ValueError: x must be positive");

        let json = serde_json::to_string(&err).unwrap();
        let parsed: FunctionError = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, err);
    }

    #[test]
    fn nested_function_errors_stay_outcomes() {
        let inner = FunctionError::new("ZeroDivision", "b is zero");
        match CallError::from(MemoError::Function(inner.clone())) {
            CallError::Function(err) => assert_eq!(err, inner),
            other => panic!("expected a function failure, got {:?}", other),
        }
    }

    #[test]
    fn infrastructure_errors_are_not_outcomes() {
        let held = CallError::from(MemoError::LockUnavailable {
            address: "memo/p/t.inner@v1".to_string(),
        });
        assert!(matches!(held, CallError::Memo(MemoError::LockUnavailable { .. })));

        let store = CallError::from(MemoError::store("memo/p", "disk full"));
        assert!(matches!(store, CallError::Memo(MemoError::Store { .. })));
        assert!(store.to_string().contains("disk full"));
    }

    #[test]
    fn arg_extracts_typed_values() {
        let mut args = CanonicalArgs::new();
        args.insert("x".to_string(), json!(4));
        assert_eq!(arg::<i64>(&args, "x").unwrap(), 4);
        assert!(arg::<String>(&args, "x").is_err());
        assert!(arg::<i64>(&args, "y").is_err());
    }

    #[test]
    fn registry_tracks_graph_and_functions() {
        let mut registry = FunctionRegistry::new();
        registry
            .register_fn(FunctionInfo::new("m::f", "v1").calls("m::helper"), |_, _| async {
                Ok(json!(1))
            })
            .declare(FunctionInfo::new("m::helper", "h1"));

        assert!(registry.get("m::f").is_some());
        assert!(registry.get("m::helper").is_none());
        assert_eq!(registry.graph().reachable_logic_keys("m::f"), vec!["m::helper@h1"]);
        assert_eq!(registry.names(), vec!["m::f"]);
    }
}
