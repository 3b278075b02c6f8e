//! Pipeline namespace stack
//!
//! The pipeline id is the namespace new invocations are stored under. It is
//! an explicit value the caller passes to the runner; [`PipelineContext::scoped`]
//! gives nested code a temporary override that is popped when the guard
//! drops, so scopes unwind in LIFO order.

use crate::error::MemoResult;
use crate::store::validate_segment;
use std::ops::{Deref, DerefMut};

/// Default pipeline id plus a stack of scoped overrides
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineContext {
    base: String,
    stack: Vec<String>,
}

impl PipelineContext {
    /// Create a context whose outermost pipeline id is `base`
    pub fn new(base: impl Into<String>) -> MemoResult<Self> {
        let base = base.into();
        validate_segment(&base)?;
        Ok(Self {
            base,
            stack: vec![],
        })
    }

    /// The pipeline id new invocations use right now
    pub fn current(&self) -> &str {
        self.stack.last().unwrap_or(&self.base)
    }

    /// Number of active overrides
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Push an override for the lifetime of the returned guard
    pub fn scoped(&mut self, pipeline_id: impl Into<String>) -> MemoResult<PipelineScope<'_>> {
        let pipeline_id = pipeline_id.into();
        validate_segment(&pipeline_id)?;
        self.stack.push(pipeline_id);
        let depth = self.stack.len();
        Ok(PipelineScope { ctx: self, depth })
    }
}

/// Guard returned by [`PipelineContext::scoped`]; pops on drop
#[derive(Debug)]
pub struct PipelineScope<'a> {
    ctx: &'a mut PipelineContext,
    depth: usize,
}

impl Deref for PipelineScope<'_> {
    type Target = PipelineContext;

    fn deref(&self) -> &Self::Target {
        self.ctx
    }
}

impl DerefMut for PipelineScope<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.ctx
    }
}

impl Drop for PipelineScope<'_> {
    fn drop(&mut self) {
        // Inner guards borrow through this one, so they are gone by now
        self.ctx.stack.truncate(self.depth - 1);
    }
}
