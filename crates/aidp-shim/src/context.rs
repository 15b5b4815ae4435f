// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-execution workflow trace state.
//!
//! Each top-level workflow run gets a fresh [`ExecutionContext`]; contexts
//! are explicit values passed through the call graph, so concurrent
//! executions never see each other's steps. Within one execution exactly
//! one step may be STARTED at a time; concurrent tool calls in a single
//! execution are a contract violation, not a scheduling hiccup.

use aidp_error::{AidpError, ErrorCode};
use aidp_model::{ActiveStep, DelegationContext, StepRecord};
use std::sync::Mutex;
use tracing::{debug, error};
use uuid::Uuid;

struct TraceState {
    completed: Vec<StepRecord>,
    failed: Vec<StepRecord>,
    history: Vec<StepRecord>,
    active: Option<ActiveStep>,
    current_agent: Option<String>,
}

/// The runtime state of one workflow execution.
pub struct ExecutionContext {
    execution_id: String,
    workflow_id: String,
    started_at: i64,
    state: Mutex<TraceState>,
}

impl ExecutionContext {
    /// Start a fresh execution of `workflow_id`.
    #[must_use]
    pub fn new(workflow_id: impl Into<String>) -> Self {
        let execution_id = format!("exec_{}", &Uuid::new_v4().simple().to_string()[..8]);
        let workflow_id = workflow_id.into();
        debug!(execution_id, workflow_id, "new workflow execution");
        Self {
            execution_id,
            workflow_id,
            started_at: chrono::Utc::now().timestamp_millis(),
            state: Mutex::new(TraceState {
                completed: Vec::new(),
                failed: Vec::new(),
                history: Vec::new(),
                active: None,
                current_agent: None,
            }),
        }
    }

    /// The execution id.
    #[must_use]
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// The workflow this execution runs.
    #[must_use]
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Execution start time, unix milliseconds.
    #[must_use]
    pub fn started_at(&self) -> i64 {
        self.started_at
    }

    /// The agent currently executing, as stamped by the tracking wrapper.
    #[must_use]
    pub fn current_agent(&self) -> Option<String> {
        self.state
            .lock()
            .expect("trace lock poisoned")
            .current_agent
            .clone()
    }

    /// Stamp the currently executing agent.
    pub fn set_current_agent(&self, agent_id: &str) {
        self.state
            .lock()
            .expect("trace lock poisoned")
            .current_agent = Some(agent_id.to_string());
    }

    /// Record a step STARTED.
    ///
    /// # Errors
    ///
    /// `INTERNAL` if another step is already in flight; one step at a
    /// time per execution.
    pub fn begin_step(
        &self,
        step_id: &str,
        agent_id: &str,
        tool_name: &str,
    ) -> Result<(), AidpError> {
        let mut state = self.state.lock().expect("trace lock poisoned");
        if let Some(active) = &state.active {
            return Err(AidpError::new(
                ErrorCode::Internal,
                "another step is already in flight in this execution",
            )
            .with_context("active_step", &active.step_id)
            .with_context("requested_step", step_id));
        }
        state.active = Some(ActiveStep {
            step_id: step_id.to_string(),
            agent_id: agent_id.to_string(),
            tool_name: tool_name.to_string(),
            started_at: chrono::Utc::now().timestamp_millis(),
        });
        debug!(
            execution_id = %self.execution_id,
            step_id, agent_id, tool_name, "step started"
        );
        Ok(())
    }

    /// Move the active step to COMPLETED.
    pub fn complete_step(&self, step_id: &str) {
        let mut state = self.state.lock().expect("trace lock poisoned");
        let Some(active) = state.active.take_if(|a| a.step_id == step_id) else {
            return;
        };
        let now = chrono::Utc::now().timestamp_millis();
        let record = StepRecord {
            step_id: active.step_id,
            agent_id: active.agent_id,
            tool_name: active.tool_name,
            started_at: active.started_at,
            completed_at: Some(now),
            failed_at: None,
            duration_ms: Some(now - active.started_at),
            error: None,
        };
        debug!(
            execution_id = %self.execution_id,
            step_id,
            duration_ms = record.duration_ms.unwrap_or(0),
            "step completed"
        );
        state.history.push(record.clone());
        state.completed.push(record);
    }

    /// Move the active step to FAILED.
    pub fn fail_step(&self, step_id: &str, error_message: &str) {
        let mut state = self.state.lock().expect("trace lock poisoned");
        let Some(active) = state.active.take_if(|a| a.step_id == step_id) else {
            return;
        };
        let now = chrono::Utc::now().timestamp_millis();
        let record = StepRecord {
            step_id: active.step_id,
            agent_id: active.agent_id,
            tool_name: active.tool_name,
            started_at: active.started_at,
            completed_at: None,
            failed_at: Some(now),
            duration_ms: None,
            error: Some(error_message.to_string()),
        };
        error!(
            execution_id = %self.execution_id,
            step_id, error = error_message, "step failed"
        );
        state.history.push(record.clone());
        state.failed.push(record);
    }

    /// Snapshot the trace: the in-flight step plus the delegation context
    /// an intent-token request ships to the IDP.
    #[must_use]
    pub fn snapshot(&self) -> (Option<ActiveStep>, DelegationContext) {
        let state = self.state.lock().expect("trace lock poisoned");
        (
            state.active.clone(),
            DelegationContext {
                workflow_id: Some(self.workflow_id.clone()),
                execution_id: Some(self.execution_id.clone()),
                chain: state.history.clone(),
                completed_steps: state.completed.clone(),
            },
        )
    }

    /// The failed steps recorded so far.
    #[must_use]
    pub fn failed_steps(&self) -> Vec<StepRecord> {
        self.state
            .lock()
            .expect("trace lock poisoned")
            .failed
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_context_is_empty() {
        let ctx = ExecutionContext::new("wf1");
        assert!(ctx.execution_id().starts_with("exec_"));
        assert_eq!(ctx.workflow_id(), "wf1");
        assert!(ctx.current_agent().is_none());

        let (active, delegation) = ctx.snapshot();
        assert!(active.is_none());
        assert!(delegation.chain.is_empty());
        assert_eq!(delegation.workflow_id.as_deref(), Some("wf1"));
        assert_eq!(
            delegation.execution_id.as_deref(),
            Some(ctx.execution_id())
        );
    }

    #[test]
    fn step_lifecycle_started_completed() {
        let ctx = ExecutionContext::new("wf1");
        ctx.begin_step("s1", "planner", "list_files").unwrap();

        let (active, _) = ctx.snapshot();
        assert_eq!(active.unwrap().step_id, "s1");

        ctx.complete_step("s1");
        let (active, delegation) = ctx.snapshot();
        assert!(active.is_none());
        assert_eq!(delegation.completed_steps.len(), 1);
        let record = &delegation.completed_steps[0];
        assert!(record.completed_at.is_some());
        assert!(record.duration_ms.is_some());
        assert!(record.error.is_none());
    }

    #[test]
    fn step_lifecycle_started_failed() {
        let ctx = ExecutionContext::new("wf1");
        ctx.begin_step("s1", "planner", "list_files").unwrap();
        ctx.fail_step("s1", "io error");

        let (active, delegation) = ctx.snapshot();
        assert!(active.is_none());
        assert!(delegation.completed_steps.is_empty());
        assert_eq!(ctx.failed_steps().len(), 1);
        assert_eq!(ctx.failed_steps()[0].error.as_deref(), Some("io error"));
        // Failures stay in the chain.
        assert_eq!(delegation.chain.len(), 1);
    }

    #[test]
    fn second_concurrent_step_rejected() {
        let ctx = ExecutionContext::new("wf1");
        ctx.begin_step("s1", "planner", "list_files").unwrap();
        let err = ctx.begin_step("s2", "planner", "other").unwrap_err();
        assert!(err.message.contains("in flight"));

        // Finishing the first unblocks the second.
        ctx.complete_step("s1");
        assert!(ctx.begin_step("s2", "planner", "other").is_ok());
    }

    #[test]
    fn completing_wrong_step_is_ignored() {
        let ctx = ExecutionContext::new("wf1");
        ctx.begin_step("s1", "planner", "list_files").unwrap();
        ctx.complete_step("other");

        let (active, delegation) = ctx.snapshot();
        assert!(active.is_some());
        assert!(delegation.completed_steps.is_empty());
    }

    #[test]
    fn executions_are_isolated() {
        let a = ExecutionContext::new("wf1");
        let b = ExecutionContext::new("wf1");
        a.begin_step("s1", "planner", "t").unwrap();
        a.complete_step("s1");

        let (_, delegation_b) = b.snapshot();
        assert!(delegation_b.completed_steps.is_empty());
        assert_ne!(a.execution_id(), b.execution_id());
    }

    #[test]
    fn current_agent_tracks_last_stamp() {
        let ctx = ExecutionContext::new("wf1");
        ctx.set_current_agent("planner");
        assert_eq!(ctx.current_agent().as_deref(), Some("planner"));
        ctx.set_current_agent("patcher");
        assert_eq!(ctx.current_agent().as_deref(), Some("patcher"));
    }
}
