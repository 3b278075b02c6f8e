//! Call command - run a built-in function through the memoizing runner

use crate::cli::args::CallArgs;
use crate::cli::builtins::{self, parse_value};
use crate::config::{Config, ConfigManager};
use crate::error::{MemoError, MemoResult};
use crate::memo::{Args, PipelineContext};
use crate::runner::runner_from_config;
use tracing::info;

/// Execute the call command
///
/// Prints the outcome as one JSON object on stdout. A memoized failure is
/// printed too and then returned as the command's error.
pub async fn execute(args: CallArgs, config: &Config, manager: &ConfigManager) -> MemoResult<()> {
    let mut config = config.clone();
    if let Some(shim) = args.shim {
        config.shim.kind = shim.into();
    }
    if args.lock {
        config.memo.lock_invocations = true;
    }

    let call_args = build_args(&args)?;
    let pipeline_id = args
        .pipeline
        .clone()
        .unwrap_or_else(|| config.memo.pipeline_id.clone());
    let pipeline = PipelineContext::new(pipeline_id)?;

    let runner = runner_from_config(&config, manager, builtins::registry()).await?;
    match runner.call_detailed(&pipeline, &args.function, call_args).await {
        Ok(called) => {
            info!("{} {} ({:?})", args.function, called.address, called.source);
            println!("{}", serde_json::to_string(&called)?);
            Ok(())
        }
        Err(MemoError::Function(err)) => {
            println!("{}", serde_json::json!({ "function": args.function, "error": err }));
            Err(MemoError::Function(err))
        }
        Err(e) => Err(e),
    }
}

fn build_args(args: &CallArgs) -> MemoResult<Args> {
    let mut call_args = Args::new();
    for raw in &args.args {
        call_args = call_args.arg(parse_value(raw));
    }
    for pair in &args.kwargs {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| MemoError::User(format!("Expected KEY=VALUE, got '{}'", pair)))?;
        call_args = call_args.kwarg(key.trim(), parse_value(value));
    }
    Ok(call_args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call_args(args: &[&str], kwargs: &[&str]) -> CallArgs {
        CallArgs {
            function: "demo::divide".to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            kwargs: kwargs.iter().map(|s| s.to_string()).collect(),
            pipeline: None,
            shim: None,
            lock: false,
        }
    }

    #[test]
    fn builds_positional_and_keyword_args() {
        let args = build_args(&call_args(&["6", "x"], &["b=3", "label=\"three\""])).unwrap();
        assert_eq!(args.positional, vec![json!(6), json!("x")]);
        assert_eq!(args.keyword.get("b"), Some(&json!(3)));
        assert_eq!(args.keyword.get("label"), Some(&json!("three")));
    }

    #[test]
    fn rejects_malformed_kwarg() {
        let err = build_args(&call_args(&[], &["oops"])).unwrap_err();
        assert!(err.to_string().contains("KEY=VALUE"));
    }
}
