//! Memospace address derivation
//!
//! Turns a function plus its arguments into a stable, hierarchical address:
//!
//! ```text
//! <root>/<pipeline-id>/<function>@<logic-key>/cg-<call-graph-suffix>/<argument-key>
//! ```
//!
//! The call-graph suffix folds in the logic keys of everything the function
//! reaches through its declared calls, so bumping a helper's key moves every
//! caller to a fresh address without touching the callers.

use crate::error::{MemoError, MemoResult};
use crate::store::{validate_segment, BlobUri};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use tracing::debug;

/// Documentation label that introduces a logic key
const LOGIC_KEY_LABEL: &str = "function-logic-key:";

/// Hex characters kept from the call-graph digest
const CALL_GRAPH_SUFFIX_LEN: usize = 12;

/// Hex characters kept from the argument digest
const ARGUMENT_KEY_LEN: usize = 32;

/// Extract the logic key from function documentation
///
/// Looks for a line of the form `function-logic-key: v3` (label matched
/// case-insensitively, leading comment markers ignored).
pub fn parse_logic_key(doc: &str) -> Option<String> {
    doc.lines().find_map(|line| {
        let line = line.trim_start_matches(|c: char| c.is_whitespace() || c == '/' || c == '!' || c == '*');
        let lower = line.to_ascii_lowercase();
        let rest = lower.strip_prefix(LOGIC_KEY_LABEL)?;
        let offset = line.len() - rest.len();
        let key = line[offset..].trim();
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        valid.then(|| key.to_string())
    })
}

/// A declared parameter of a memoized function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    /// Value used when the caller omits the parameter
    pub default: Option<Value>,
}

impl Param {
    /// A parameter the caller must supply
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
        }
    }

    /// A parameter with a default value
    pub fn with_default(name: impl Into<String>, default: Value) -> Self {
        Self {
            name: name.into(),
            default: Some(default),
        }
    }
}

/// Static description of a memoized function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionInfo {
    /// Fully-qualified name, `::`-separated
    pub name: String,
    /// Human-assigned version tag, bumped whenever behavior changes
    pub logic_key: Option<String>,
    /// Parameters in positional order
    pub params: Vec<Param>,
    /// Fully-qualified names of functions this one calls
    pub calls: Vec<String>,
}

impl FunctionInfo {
    /// Describe a function with an explicit logic key
    pub fn new(name: impl Into<String>, logic_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            logic_key: Some(logic_key.into()),
            params: vec![],
            calls: vec![],
        }
    }

    /// Describe a function, taking the logic key from its documentation
    pub fn from_doc(name: impl Into<String>, doc: &str) -> Self {
        Self {
            name: name.into(),
            logic_key: parse_logic_key(doc),
            params: vec![],
            calls: vec![],
        }
    }

    pub fn param(mut self, param: Param) -> Self {
        self.params.push(param);
        self
    }

    pub fn calls(mut self, callee: impl Into<String>) -> Self {
        self.calls.push(callee.into());
        self
    }

    /// The logic key, or the fail-fast error for memoized functions without one
    pub fn require_logic_key(&self) -> MemoResult<&str> {
        self.logic_key
            .as_deref()
            .ok_or_else(|| MemoError::MissingLogicKey {
                function: self.name.clone(),
            })
    }

    /// Name as rendered in a memospace address (`a::b::c` -> `a.b.c`)
    pub fn address_name(&self) -> String {
        self.name.replace("::", ".")
    }
}

/// Static call graph of every known function, built once at startup
#[derive(Debug, Clone, Default)]
pub struct CallGraph {
    functions: HashMap<String, FunctionInfo>,
}

impl CallGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a function description
    pub fn insert(&mut self, info: FunctionInfo) {
        self.functions.insert(info.name.clone(), info);
    }

    pub fn get(&self, name: &str) -> Option<&FunctionInfo> {
        self.functions.get(name)
    }

    /// `name@key` for every function reachable from `root` (excluding `root`)
    /// that declares a logic key, sorted
    ///
    /// Each node is visited once, so cycles terminate.
    pub fn reachable_logic_keys(&self, root: &str) -> Vec<String> {
        let mut visited = BTreeSet::new();
        let mut stack = vec![root.to_string()];
        let mut keys = BTreeSet::new();

        while let Some(name) = stack.pop() {
            if !visited.insert(name.clone()) {
                continue;
            }

            let Some(info) = self.functions.get(&name) else {
                debug!("Call graph: {} is not registered, skipping", name);
                continue;
            };

            if name != root {
                if let Some(ref key) = info.logic_key {
                    keys.insert(format!("{}@{}", name, key));
                }
            }

            stack.extend(info.calls.iter().filter(|c| !visited.contains(*c)).cloned());
        }

        keys.into_iter().collect()
    }

    /// Short digest of the reachable logic keys
    pub fn suffix(&self, root: &str) -> String {
        let keys = self.reachable_logic_keys(root);
        let digest = Sha256::digest(keys.join("\n").as_bytes());
        hex::encode(digest)[..CALL_GRAPH_SUFFIX_LEN].to_string()
    }
}

/// Call arguments as supplied by the caller
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Args {
    pub positional: Vec<Value>,
    pub keyword: BTreeMap<String, Value>,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional argument
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    /// Set a keyword argument
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.keyword.insert(name.into(), value.into());
        self
    }
}

/// Arguments bound to parameter names with defaults applied
pub type CanonicalArgs = BTreeMap<String, Value>;

/// Bind positional and keyword arguments onto a function's parameters
///
/// Every equivalent way of supplying the same values produces the same map.
pub fn canonicalize(info: &FunctionInfo, args: &Args) -> MemoResult<CanonicalArgs> {
    let invalid = |reason: String| MemoError::InvalidArguments {
        function: info.name.clone(),
        reason,
    };

    if args.positional.len() > info.params.len() {
        return Err(invalid(format!(
            "takes {} arguments but {} positional were given",
            info.params.len(),
            args.positional.len()
        )));
    }

    let mut bound = CanonicalArgs::new();
    for (param, value) in info.params.iter().zip(&args.positional) {
        bound.insert(param.name.clone(), value.clone());
    }

    for (name, value) in &args.keyword {
        if !info.params.iter().any(|p| &p.name == name) {
            return Err(invalid(format!("unexpected keyword argument '{}'", name)));
        }
        if bound.insert(name.clone(), value.clone()).is_some() {
            return Err(invalid(format!("multiple values for argument '{}'", name)));
        }
    }

    for param in &info.params {
        if bound.contains_key(&param.name) {
            continue;
        }
        match param.default {
            Some(ref default) => {
                bound.insert(param.name.clone(), default.clone());
            }
            None => return Err(invalid(format!("missing required argument '{}'", param.name))),
        }
    }

    Ok(bound)
}

/// Rebuild a JSON value with every object's keys in sorted order
fn sorted_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, sorted_value(v))).collect();
            Value::Object(sorted.into_iter().map(|(k, v)| (k.clone(), v)).collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted_value).collect()),
        other => other.clone(),
    }
}

/// Fixed-width digest of canonical arguments
pub fn argument_key(args: &CanonicalArgs) -> MemoResult<String> {
    let canonical: BTreeMap<&String, Value> = args.iter().map(|(k, v)| (k, sorted_value(v))).collect();
    let encoded = serde_json::to_vec(&canonical)?;
    let digest = Sha256::digest(&encoded);
    Ok(hex::encode(digest)[..ARGUMENT_KEY_LEN].to_string())
}

/// Fully-derived identity of one invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemospaceAddress {
    pub root: String,
    pub pipeline_id: String,
    pub function: String,
    pub logic_key: String,
    pub call_graph_suffix: String,
    pub argument_key: String,
}

impl MemospaceAddress {
    /// Blob uri the control files live under
    pub fn uri(&self) -> MemoResult<BlobUri> {
        BlobUri::from_segments([
            self.root.clone(),
            self.pipeline_id.clone(),
            format!("{}@{}", self.function.replace("::", "."), self.logic_key),
            format!("cg-{}", self.call_graph_suffix),
            self.argument_key.clone(),
        ])
    }
}

impl fmt::Display for MemospaceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}@{}/cg-{}/{}",
            self.root,
            self.pipeline_id,
            self.function.replace("::", "."),
            self.logic_key,
            self.call_graph_suffix,
            self.argument_key
        )
    }
}

/// Derives memospace addresses from a call graph
#[derive(Debug, Clone)]
pub struct IdentityDeriver {
    root: String,
    graph: CallGraph,
}

impl IdentityDeriver {
    pub fn new(root: impl Into<String>, graph: CallGraph) -> MemoResult<Self> {
        let root = root.into();
        for segment in root.split('/') {
            validate_segment(segment)?;
        }
        Ok(Self { root, graph })
    }

    pub fn graph(&self) -> &CallGraph {
        &self.graph
    }

    /// Derive the address and canonical arguments for a call
    pub fn derive(
        &self,
        function: &str,
        pipeline_id: &str,
        args: &Args,
    ) -> MemoResult<(MemospaceAddress, CanonicalArgs)> {
        let info = self
            .graph
            .get(function)
            .ok_or_else(|| MemoError::UnknownFunction(function.to_string()))?;
        let logic_key = info.require_logic_key()?.to_string();
        validate_segment(pipeline_id)?;
        validate_segment(&info.address_name())?;

        let canonical = canonicalize(info, args)?;
        let address = MemospaceAddress {
            root: self.root.clone(),
            pipeline_id: pipeline_id.to_string(),
            function: info.name.clone(),
            logic_key,
            call_graph_suffix: self.graph.suffix(function),
            argument_key: argument_key(&canonical)?,
        };

        debug!("Derived memospace address {}", address);
        Ok((address, canonical))
    }
}
