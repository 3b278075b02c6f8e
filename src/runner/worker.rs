//! Worker side of a shim: compute one recorded invocation

use crate::error::{MemoError, MemoResult};
use crate::memo::PipelineContext;
use crate::runner::dispatch::Runner;
use crate::runner::function::{CallContext, CallError};
use crate::store::BlobUri;
use bytes::Bytes;
use tracing::{debug, info, warn};

/// Load the invocation at `address_uri`, run its function, and write the
/// terminal control file
///
/// A function failure is an outcome, not an error: it lands in `exception`
/// and this returns `Ok`. Errors here mean nothing terminal was written,
/// including store or lock errors raised by nested calls.
pub async fn execute_invocation(runner: &Runner, address_uri: &BlobUri) -> MemoResult<()> {
    let control = runner.control();
    let invocation = control.load_invocation(address_uri).await?;
    let address = invocation.address.clone();

    let function = runner
        .registry()
        .get(&address.function)
        .ok_or_else(|| MemoError::UnknownFunction(address.function.clone()))?;

    let pipeline = PipelineContext::new(invocation.pipeline_id())?;
    let cx = CallContext::new(runner.clone(), pipeline, address.clone());

    debug!("Computing {}", address);
    match function.call(cx, invocation.args).await {
        Ok(value) => {
            control
                .complete(&address, Bytes::from(serde_json::to_vec(&value)?))
                .await?;
            info!("Computed {}", address);
        }
        Err(CallError::Function(err)) => {
            control
                .fail(&address, Bytes::from(serde_json::to_vec(&err)?))
                .await?;
            info!("Recorded failure at {}: {}", address, err);
        }
        Err(CallError::Memo(err)) => {
            warn!("Abandoned {} without recording: {}", address, err);
            return Err(err);
        }
    }
    Ok(())
}
