// SPDX-License-Identifier: MIT OR Apache-2.0
//! The tool seam and its workflow-tracking adapter.

use crate::context::ExecutionContext;
use aidp_error::AidpError;
use aidp_model::ToolDescriptor;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;

/// A tool an agent can execute.
///
/// The signature string should be the canonical logical signature; the
/// checksum layer strips framework wrapper parameters anyway, so an
/// as-written signature is acceptable.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name, unique within an agent.
    fn name(&self) -> &str;
    /// Signature string (`name(params) -> ret`).
    fn signature(&self) -> &str;
    /// Human-readable description.
    fn description(&self) -> &str;
    /// Source text, for deep-checksum tools.
    fn source(&self) -> Option<&str> {
        None
    }
    /// Execute the tool.
    async fn invoke(&self, ctx: &ExecutionContext, args: Value) -> Result<Value, AidpError>;
}

/// Future type produced by [`FnTool`] closures.
pub type ToolFuture = BoxFuture<'static, Result<Value, AidpError>>;

/// A [`Tool`] backed by a closure, for declaration-site registration.
pub struct FnTool {
    name: String,
    signature: String,
    description: String,
    source: Option<String>,
    func: Arc<dyn Fn(Value) -> ToolFuture + Send + Sync>,
}

impl FnTool {
    /// Build a tool from an async closure.
    pub fn new(
        name: &str,
        signature: &str,
        description: &str,
        func: impl Fn(Value) -> ToolFuture + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.to_string(),
            signature: signature.to_string(),
            description: description.to_string(),
            source: None,
            func: Arc::new(func),
        }
    }

    /// Attach source text, opting the tool into deep checksums.
    #[must_use]
    pub fn with_source(mut self, source: &str) -> Self {
        self.source = Some(source.to_string());
        self
    }
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }
    fn signature(&self) -> &str {
        &self.signature
    }
    fn description(&self) -> &str {
        &self.description
    }
    fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    async fn invoke(&self, _ctx: &ExecutionContext, args: Value) -> Result<Value, AidpError> {
        (self.func)(args).await
    }
}

/// Wraps a tool for one owning agent, recording workflow steps around
/// every invocation.
///
/// The wrapper is what makes runtime detection possible without stack
/// inspection: before the inner tool runs, the owning agent is stamped on
/// the execution context, and the step is STARTED; afterwards it moves to
/// COMPLETED or FAILED.
pub struct TrackedTool {
    inner: Arc<dyn Tool>,
    agent_id: String,
    step_id: String,
    descriptor: ToolDescriptor,
}

impl TrackedTool {
    /// Wrap `inner` for `agent_id`, recording steps under `step_id`.
    ///
    /// The descriptor should already carry normalized source for deep
    /// tools and the `is_agent` flag for sub-agent tools.
    #[must_use]
    pub fn new(
        inner: Arc<dyn Tool>,
        agent_id: impl Into<String>,
        step_id: impl Into<String>,
        descriptor: ToolDescriptor,
    ) -> Self {
        Self {
            inner,
            agent_id: agent_id.into(),
            step_id: step_id.into(),
            descriptor,
        }
    }

    /// The owning agent.
    #[must_use]
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// The workflow step id this tool reports under.
    #[must_use]
    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    /// The registered descriptor (identity pre-image fragment).
    #[must_use]
    pub fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    /// The wrapped tool.
    #[must_use]
    pub fn inner(&self) -> &Arc<dyn Tool> {
        &self.inner
    }

    /// Invoke with workflow tracking.
    ///
    /// # Errors
    ///
    /// The inner tool's error (after the step is recorded FAILED), or a
    /// trace error if another step is already in flight.
    pub async fn invoke(&self, ctx: &ExecutionContext, args: Value) -> Result<Value, AidpError> {
        ctx.set_current_agent(&self.agent_id);
        ctx.begin_step(&self.step_id, &self.agent_id, self.inner.name())?;

        match self.inner.invoke(ctx, args).await {
            Ok(value) => {
                ctx.complete_step(&self.step_id);
                Ok(value)
            }
            Err(err) => {
                ctx.fail_step(&self.step_id, &err.to_string());
                Err(err)
            }
        }
    }
}
