//! Functions the command line can call and its workers can compute

use crate::memo::{Args, FunctionInfo, Param};
use crate::runner::{arg, FunctionError, FunctionRegistry};
use serde_json::{json, Value};
use std::time::Duration;

const SQUARE_DOC: &str = "
    Multiply a number by itself.

    function-logic-key: v1
";

/// Registry of built-in demo functions
pub fn registry() -> FunctionRegistry {
    let mut registry = FunctionRegistry::new();

    registry
        .declare(FunctionInfo::new("demo::multiply", "v1"))
        .register_fn(
            FunctionInfo::from_doc("demo::square", SQUARE_DOC)
                .param(Param::required("x"))
                .calls("demo::multiply"),
            |_, args| async move {
                let x: f64 = arg(&args, "x")?;
                Ok(number(multiply(x, x)))
            },
        )
        .register_fn(
            FunctionInfo::new("demo::sum_of_squares", "v1")
                .param(Param::required("values"))
                .calls("demo::square"),
            |cx, args| async move {
                let values: Vec<Value> = arg(&args, "values")?;
                let mut total = 0.0;
                for value in values {
                    let squared = cx.call("demo::square", Args::new().arg(value)).await?;
                    total += squared.as_f64().unwrap_or_default();
                }
                Ok(number(total))
            },
        )
        .register_fn(
            FunctionInfo::new("demo::divide", "v1")
                .param(Param::required("a"))
                .param(Param::required("b")),
            |_, args| async move {
                let a: f64 = arg(&args, "a")?;
                let b: f64 = arg(&args, "b")?;
                if b == 0.0 {
                    return Err(FunctionError::new(
                        "ZeroDivision",
                        format!("cannot divide {} by zero", a),
                    )
                    .into());
                }
                Ok(number(a / b))
            },
        )
        .register_fn(
            FunctionInfo::new("demo::sleep", "v1")
                .param(Param::required("ms"))
                .param(Param::with_default("value", Value::Null)),
            |_, args| async move {
                let ms: u64 = arg(&args, "ms")?;
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(args.get("value").cloned().unwrap_or(Value::Null))
            },
        );

    registry
}

fn multiply(a: f64, b: f64) -> f64 {
    a * b
}

/// Integral results print as integers
fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        json!(n as i64)
    } else {
        json!(n)
    }
}

/// Parse a command-line argument as JSON, falling back to a string
pub fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memo::{ControlFiles, NegativeCache, PipelineContext};
    use crate::runner::Runner;
    use crate::store::{BlobStore, InMemoryStore};
    use crate::MemoError;
    use std::sync::Arc;

    fn runner() -> Runner {
        let store: Arc<dyn BlobStore> = Arc::new(InMemoryStore::new());
        Runner::builder(registry(), ControlFiles::new(store, NegativeCache::disabled()))
            .build()
            .unwrap()
    }

    #[test]
    fn parse_value_prefers_json() {
        assert_eq!(parse_value("4"), json!(4));
        assert_eq!(parse_value("[1,2]"), json!([1, 2]));
        assert_eq!(parse_value("hello"), json!("hello"));
    }

    #[test]
    fn square_inherits_helper_key() {
        let registry = registry();
        assert_eq!(
            registry.graph().reachable_logic_keys("demo::sum_of_squares"),
            vec!["demo::multiply@v1", "demo::square@v1"]
        );
    }

    #[tokio::test]
    async fn builtins_compute() {
        let runner = runner();
        let pipeline = PipelineContext::new("test").unwrap();

        let squared = runner.call(&pipeline, "demo::square", Args::new().arg(4)).await.unwrap();
        assert_eq!(squared, json!(16));

        let total = runner
            .call(&pipeline, "demo::sum_of_squares", Args::new().arg(json!([1, 2, 3])))
            .await
            .unwrap();
        assert_eq!(total, json!(14));

        let half = runner
            .call(&pipeline, "demo::divide", Args::new().arg(1).kwarg("b", 2))
            .await
            .unwrap();
        assert_eq!(half, json!(0.5));
    }

    #[tokio::test]
    async fn divide_by_zero_is_memoized_failure() {
        let runner = runner();
        let pipeline = PipelineContext::new("test").unwrap();

        let err = runner
            .call(&pipeline, "demo::divide", Args::new().arg(1).arg(0))
            .await
            .unwrap_err();
        match err {
            MemoError::Function(err) => assert_eq!(err.kind, "ZeroDivision"),
            other => panic!("expected function error, got {:?}", other),
        }
    }
}
