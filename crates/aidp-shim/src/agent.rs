// SPDX-License-Identifier: MIT OR Apache-2.0
//! Live agents rebuilt from IDP registrations.
//!
//! An [`AgentHandle`] holds the prompt, wrapped tools, and configuration
//! of one agent. The checksum is always recomputed from the *current*
//! state, so runtime mutation of the prompt or configuration is visible
//! the moment the next identity check runs.

use crate::context::ExecutionContext;
use crate::tool::{Tool, TrackedTool};
use aidp_checksum::compute_agent_checksum;
use aidp_error::{AidpError, ErrorCode};
use aidp_model::{AgentComponents, ToolDescriptor};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

/// The external agent runtime (the LLM reasoning loop).
///
/// The plane never runs the loop itself; this trait is the seam a host
/// application implements to let sub-agent tools delegate into it.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Run `agent` on `input` to completion and return its output.
    async fn run(
        &self,
        agent: Arc<AgentHandle>,
        ctx: &ExecutionContext,
        input: Value,
    ) -> Result<Value, AidpError>;
}

/// A runner for deployments without an agent runtime: sub-agent
/// invocations fail cleanly instead of pretending to reason.
pub struct NoRuntime;

#[async_trait]
impl AgentRunner for NoRuntime {
    async fn run(
        &self,
        agent: Arc<AgentHandle>,
        _ctx: &ExecutionContext,
        _input: Value,
    ) -> Result<Value, AidpError> {
        Err(AidpError::new(
            ErrorCode::Internal,
            "no agent runtime is configured for sub-agent invocation",
        )
        .with_context("agent_id", agent.id()))
    }
}

/// One live agent: prompt, tracked tools, configuration.
pub struct AgentHandle {
    id: String,
    prompt: RwLock<String>,
    tools: Vec<Arc<TrackedTool>>,
    configuration: BTreeMap<String, Value>,
}

impl AgentHandle {
    /// Assemble a handle.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        prompt: impl Into<String>,
        tools: Vec<Arc<TrackedTool>>,
        configuration: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            id: id.into(),
            prompt: RwLock::new(prompt.into()),
            tools,
            configuration,
        }
    }

    /// The agent id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The current prompt.
    #[must_use]
    pub fn prompt(&self) -> String {
        self.prompt.read().expect("prompt lock poisoned").clone()
    }

    /// Replace the prompt.
    ///
    /// Identity is derived from live state, so this moves the checksum,
    /// which is exactly how unauthorized runtime modification gets caught.
    pub fn set_prompt(&self, prompt: impl Into<String>) {
        *self.prompt.write().expect("prompt lock poisoned") = prompt.into();
    }

    /// The agent's tracked tools.
    #[must_use]
    pub fn tools(&self) -> &[Arc<TrackedTool>] {
        &self.tools
    }

    /// Find a tracked tool by name.
    #[must_use]
    pub fn tool(&self, name: &str) -> Option<&Arc<TrackedTool>> {
        self.tools
            .iter()
            .find(|tool| tool.descriptor().name == name)
    }

    /// The identity pre-image of the agent's *current* state.
    #[must_use]
    pub fn components(&self) -> AgentComponents {
        AgentComponents {
            agent_id: self.id.clone(),
            prompt_template: self.prompt(),
            tools: self
                .tools
                .iter()
                .map(|tool| tool.descriptor().clone())
                .collect(),
            configuration: self.configuration.clone(),
        }
    }

    /// The checksum of the agent's current state.
    #[must_use]
    pub fn checksum(&self) -> String {
        compute_agent_checksum(&self.components())
    }

    /// Invoke a tool by name with workflow tracking.
    ///
    /// # Errors
    ///
    /// `BAD_REQUEST` for unknown tools, otherwise the tool's error.
    pub async fn invoke_tool(
        &self,
        ctx: &ExecutionContext,
        name: &str,
        args: Value,
    ) -> Result<Value, AidpError> {
        let tool = self.tool(name).ok_or_else(|| {
            AidpError::new(ErrorCode::BadRequest, "agent has no such tool")
                .with_context("agent_id", &self.id)
                .with_context("tool", name)
        })?;
        tool.invoke(ctx, args).await
    }
}

/// A registered agent exposed as another agent's tool.
pub struct AgentTool {
    agent: Arc<AgentHandle>,
    runner: Arc<dyn AgentRunner>,
    descriptor: ToolDescriptor,
}

impl AgentTool {
    /// Wrap `agent` as an invocable tool delegating to `runner`.
    #[must_use]
    pub fn new(
        agent: Arc<AgentHandle>,
        runner: Arc<dyn AgentRunner>,
        descriptor: ToolDescriptor,
    ) -> Self {
        Self {
            agent,
            runner,
            descriptor,
        }
    }
}

#[async_trait]
impl Tool for AgentTool {
    fn name(&self) -> &str {
        &self.descriptor.name
    }
    fn signature(&self) -> &str {
        &self.descriptor.signature
    }
    fn description(&self) -> &str {
        &self.descriptor.description
    }

    async fn invoke(&self, ctx: &ExecutionContext, args: Value) -> Result<Value, AidpError> {
        self.runner.run(self.agent.clone(), ctx, args).await
    }
}
