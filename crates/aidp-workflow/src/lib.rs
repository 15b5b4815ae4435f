// SPDX-License-Identifier: MIT OR Apache-2.0
//! aidp-workflow
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Pure workflow authorization rules.
//!
//! The IDP's intent subsystem calls [`authorize_step`] at token-issuance
//! time; nothing here performs I/O, so every rule is unit-testable and a
//! given workflow state always evaluates to the same decision.
//!
//! Scope handling is strict: a step's declared scopes must be a subset of
//! the caller's requested-plus-granted scopes. Callers holding a superset
//! of what they request gain nothing; the step's own declaration is the
//! ceiling.

use aidp_model::{ActiveStep, DelegationContext, WorkflowDefinition, WorkflowStep};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tracing::warn;

// ---------------------------------------------------------------------------
// Denial reasons
// ---------------------------------------------------------------------------

/// Why a workflow step was denied.
///
/// Every rule failure is distinguishable; callers map all of them onto the
/// `WORKFLOW_DENIED` wire error but log the concrete reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DenyReason {
    /// The referenced workflow is not registered.
    WorkflowNotFound {
        /// The workflow that was requested.
        workflow_id: String,
    },
    /// No active step was supplied with the request.
    MissingActiveStep,
    /// The active step id is not defined in the workflow.
    StepNotFound {
        /// The step that was requested.
        step_id: String,
    },
    /// The step is bound to a different agent.
    AgentMismatch {
        /// Agent the workflow binds the step to.
        expected: String,
        /// Agent that actually called.
        actual: String,
    },
    /// The step executes a different action.
    ActionMismatch {
        /// Action the workflow binds the step to.
        expected: String,
        /// Tool that was actually invoked.
        actual: String,
    },
    /// The caller's scopes do not cover the step's declared scopes.
    MissingScopes {
        /// Declared scopes the caller lacks.
        missing: Vec<String>,
    },
    /// The request carried no delegation context at all.
    MissingDelegationContext,
    /// Declared dependencies have not been completed.
    UnmetDependencies {
        /// Dependency step ids absent from the completed set.
        missing: Vec<String>,
    },
    /// Earlier required steps are not all on the completed path.
    RequiredPrefixIncomplete {
        /// Required step ids absent from the completed set.
        missing: Vec<String>,
    },
    /// The step requires approval but no approval gate is declared before
    /// it.
    ApprovalGateMissing {
        /// The step that demanded approval.
        step_id: String,
    },
    /// The nearest preceding approval gate has not been completed.
    ApprovalNotCompleted {
        /// The gate that must complete first.
        gate: String,
    },
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WorkflowNotFound { workflow_id } => {
                write!(f, "workflow '{workflow_id}' is not registered")
            }
            Self::MissingActiveStep => write!(f, "no active step in request"),
            Self::StepNotFound { step_id } => {
                write!(f, "step '{step_id}' is not defined in the workflow")
            }
            Self::AgentMismatch { expected, actual } => {
                write!(f, "step is bound to agent '{expected}', called by '{actual}'")
            }
            Self::ActionMismatch { expected, actual } => {
                write!(f, "step executes '{expected}', caller invoked '{actual}'")
            }
            Self::MissingScopes { missing } => {
                write!(f, "caller lacks step scopes: {}", missing.join(", "))
            }
            Self::MissingDelegationContext => write!(f, "request carried no delegation context"),
            Self::UnmetDependencies { missing } => {
                write!(f, "uncompleted dependencies: {}", missing.join(", "))
            }
            Self::RequiredPrefixIncomplete { missing } => {
                write!(f, "uncompleted required steps: {}", missing.join(", "))
            }
            Self::ApprovalGateMissing { step_id } => {
                write!(f, "step '{step_id}' requires approval but no gate precedes it")
            }
            Self::ApprovalNotCompleted { gate } => {
                write!(f, "approval gate '{gate}' has not been completed")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Definition validation
// ---------------------------------------------------------------------------

/// Structural problems in a workflow definition, rejected at registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefinitionError {
    /// Only `dag` workflows are supported.
    UnsupportedType {
        /// The declared type.
        workflow_type: String,
    },
    /// The definition has no steps.
    EmptySteps,
    /// A dependency references a step not defined in this workflow.
    UnknownDependency {
        /// Step declaring the dependency.
        step_id: String,
        /// The missing referent.
        dependency: String,
    },
    /// A `requires_approval` step has no earlier `approval_gate` step.
    NoGateBefore {
        /// The offending step.
        step_id: String,
    },
}

impl fmt::Display for DefinitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedType { workflow_type } => {
                write!(f, "unsupported workflow type '{workflow_type}'")
            }
            Self::EmptySteps => write!(f, "workflow defines no steps"),
            Self::UnknownDependency {
                step_id,
                dependency,
            } => write!(
                f,
                "step '{step_id}' depends on undefined step '{dependency}'"
            ),
            Self::NoGateBefore { step_id } => write!(
                f,
                "step '{step_id}' requires approval but no approval gate is declared before it"
            ),
        }
    }
}

impl std::error::Error for DefinitionError {}

/// Validate a workflow definition's structural invariants.
///
/// Every dependency must reference a defined step, and every
/// `requires_approval` step must have at least one `approval_gate` step
/// declared earlier in enumeration order.
///
/// # Errors
///
/// The first violated invariant, as a [`DefinitionError`].
pub fn validate_definition(workflow: &WorkflowDefinition) -> Result<(), DefinitionError> {
    if workflow.workflow_type != "dag" {
        return Err(DefinitionError::UnsupportedType {
            workflow_type: workflow.workflow_type.clone(),
        });
    }
    if workflow.steps.is_empty() {
        return Err(DefinitionError::EmptySteps);
    }

    for (step_id, step) in &workflow.steps {
        for dependency in &step.dependencies {
            if !workflow.steps.contains_key(dependency) {
                return Err(DefinitionError::UnknownDependency {
                    step_id: step_id.clone(),
                    dependency: dependency.clone(),
                });
            }
        }
    }

    let mut gate_seen = false;
    for (step_id, step) in &workflow.steps {
        if step.requires_approval && !gate_seen {
            return Err(DefinitionError::NoGateBefore {
                step_id: step_id.clone(),
            });
        }
        if step.approval_gate {
            gate_seen = true;
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Step authorization
// ---------------------------------------------------------------------------

/// Authorize an active step against its workflow, the caller's scopes, and
/// the execution history. All rules must pass.
///
/// `granted_scopes` are the scopes the caller's OAuth gate already
/// established; `requested_scopes` come from the token request. The step's
/// declared scopes must be covered by their union.
///
/// # Errors
///
/// The first violated rule, as a [`DenyReason`]. The reason is also logged
/// at `warn`.
pub fn authorize_step(
    workflow: Option<&WorkflowDefinition>,
    workflow_id: &str,
    active: Option<&ActiveStep>,
    requested_scopes: &[String],
    granted_scopes: &BTreeSet<String>,
    context: Option<&DelegationContext>,
) -> Result<(), DenyReason> {
    let decision = evaluate(
        workflow,
        workflow_id,
        active,
        requested_scopes,
        granted_scopes,
        context,
    );
    if let Err(reason) = &decision {
        warn!(workflow_id, %reason, "workflow step denied");
    }
    decision
}

fn evaluate(
    workflow: Option<&WorkflowDefinition>,
    workflow_id: &str,
    active: Option<&ActiveStep>,
    requested_scopes: &[String],
    granted_scopes: &BTreeSet<String>,
    context: Option<&DelegationContext>,
) -> Result<(), DenyReason> {
    let workflow = workflow.ok_or_else(|| DenyReason::WorkflowNotFound {
        workflow_id: workflow_id.to_string(),
    })?;
    let active = active.ok_or(DenyReason::MissingActiveStep)?;

    let step = workflow
        .steps
        .get(&active.step_id)
        .ok_or_else(|| DenyReason::StepNotFound {
            step_id: active.step_id.clone(),
        })?;

    if active.agent_id != step.agent {
        return Err(DenyReason::AgentMismatch {
            expected: step.agent.clone(),
            actual: active.agent_id.clone(),
        });
    }

    if active.tool_name != step.action {
        return Err(DenyReason::ActionMismatch {
            expected: step.action.clone(),
            actual: active.tool_name.clone(),
        });
    }

    check_scopes(step, requested_scopes, granted_scopes)?;

    let context = context.ok_or(DenyReason::MissingDelegationContext)?;
    let completed: BTreeSet<&str> = context
        .completed_steps
        .iter()
        .map(|s| s.step_id.as_str())
        .collect();

    check_dependencies(step, &completed)?;
    check_required_prefix(workflow, &active.step_id, &completed)?;
    check_approval(workflow, &active.step_id, step, &completed)?;

    Ok(())
}

/// `step.scopes ⊆ requested ∪ granted`, strictly.
fn check_scopes(
    step: &WorkflowStep,
    requested_scopes: &[String],
    granted_scopes: &BTreeSet<String>,
) -> Result<(), DenyReason> {
    let missing: Vec<String> = step
        .scopes
        .iter()
        .filter(|s| !requested_scopes.contains(s) && !granted_scopes.contains(*s))
        .cloned()
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(DenyReason::MissingScopes { missing })
    }
}

/// Every declared dependency must already be completed. With an empty
/// history, only dependency-free steps may run.
fn check_dependencies(step: &WorkflowStep, completed: &BTreeSet<&str>) -> Result<(), DenyReason> {
    let missing: Vec<String> = step
        .dependencies
        .iter()
        .filter(|d| !completed.contains(d.as_str()))
        .cloned()
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(DenyReason::UnmetDependencies { missing })
    }
}

/// Every step declared before the active one and marked `required` must be
/// on the completed path.
fn check_required_prefix(
    workflow: &WorkflowDefinition,
    active_step_id: &str,
    completed: &BTreeSet<&str>,
) -> Result<(), DenyReason> {
    let mut missing = Vec::new();
    for (step_id, step) in &workflow.steps {
        if step_id == active_step_id {
            break;
        }
        if step.required && !completed.contains(step_id.as_str()) {
            missing.push(step_id.clone());
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(DenyReason::RequiredPrefixIncomplete { missing })
    }
}

/// For `requires_approval` steps, the *nearest* preceding approval gate (in
/// enumeration order) must be completed. A missing gate is a denial too:
/// definition validation should have caught it, but issuance fails closed.
fn check_approval(
    workflow: &WorkflowDefinition,
    active_step_id: &str,
    step: &WorkflowStep,
    completed: &BTreeSet<&str>,
) -> Result<(), DenyReason> {
    if !step.requires_approval {
        return Ok(());
    }

    let mut nearest_gate: Option<&str> = None;
    for (step_id, candidate) in &workflow.steps {
        if step_id == active_step_id {
            break;
        }
        if candidate.approval_gate {
            nearest_gate = Some(step_id);
        }
    }

    match nearest_gate {
        None => Err(DenyReason::ApprovalGateMissing {
            step_id: active_step_id.to_string(),
        }),
        Some(gate) if !completed.contains(gate) => Err(DenyReason::ApprovalNotCompleted {
            gate: gate.to_string(),
        }),
        Some(_) => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use aidp_model::StepRecord;
    use indexmap::IndexMap;

    fn step(agent: &str, action: &str) -> WorkflowStep {
        WorkflowStep {
            agent: agent.into(),
            action: action.into(),
            scopes: vec![],
            dependencies: vec![],
            required: false,
            approval_gate: false,
            requires_approval: false,
        }
    }

    /// prepare → review (required, approval gate) → deploy (depends on
    /// review, requires approval).
    fn release_workflow() -> WorkflowDefinition {
        let mut steps = IndexMap::new();
        steps.insert(
            "prepare".to_string(),
            WorkflowStep {
                scopes: vec!["read:repo".into()],
                ..step("planner", "prepare_env")
            },
        );
        steps.insert(
            "review".to_string(),
            WorkflowStep {
                required: true,
                approval_gate: true,
                ..step("reviewer", "review_patch")
            },
        );
        steps.insert(
            "deploy".to_string(),
            WorkflowStep {
                dependencies: vec!["review".into()],
                requires_approval: true,
                scopes: vec!["write:repo".into()],
                ..step("patcher", "apply_patch")
            },
        );
        WorkflowDefinition {
            workflow_id: "release".into(),
            workflow_type: "dag".into(),
            steps,
        }
    }

    fn active(step_id: &str, agent_id: &str, tool_name: &str) -> ActiveStep {
        ActiveStep {
            step_id: step_id.into(),
            agent_id: agent_id.into(),
            tool_name: tool_name.into(),
            started_at: 0,
        }
    }

    fn completed(step_ids: &[&str]) -> DelegationContext {
        let records: Vec<StepRecord> = step_ids
            .iter()
            .map(|id| StepRecord {
                step_id: (*id).into(),
                agent_id: "any".into(),
                tool_name: "any".into(),
                started_at: 0,
                completed_at: Some(1),
                failed_at: None,
                duration_ms: Some(1),
                error: None,
            })
            .collect();
        DelegationContext {
            workflow_id: Some("release".into()),
            execution_id: Some("exec_1".into()),
            chain: records.clone(),
            completed_steps: records,
        }
    }

    fn granted(scopes: &[&str]) -> BTreeSet<String> {
        scopes.iter().map(|s| (*s).to_string()).collect()
    }

    fn authorize(
        wf: &WorkflowDefinition,
        active_step: &ActiveStep,
        requested: &[&str],
        have: &[&str],
        ctx: &DelegationContext,
    ) -> Result<(), DenyReason> {
        let requested: Vec<String> = requested.iter().map(|s| (*s).to_string()).collect();
        authorize_step(
            Some(wf),
            &wf.workflow_id,
            Some(active_step),
            &requested,
            &granted(have),
            Some(ctx),
        )
    }

    // -- Happy paths ------------------------------------------------------

    #[test]
    fn first_step_with_empty_history_allowed() {
        let wf = release_workflow();
        let result = authorize(
            &wf,
            &active("prepare", "planner", "prepare_env"),
            &["read:repo"],
            &[],
            &completed(&[]),
        );
        assert_eq!(result, Ok(()));
    }

    #[test]
    fn full_path_allows_deploy() {
        let wf = release_workflow();
        let result = authorize(
            &wf,
            &active("deploy", "patcher", "apply_patch"),
            &["write:repo"],
            &[],
            &completed(&["prepare", "review"]),
        );
        assert_eq!(result, Ok(()));
    }

    #[test]
    fn granted_scopes_count_toward_subset() {
        let wf = release_workflow();
        let result = authorize(
            &wf,
            &active("prepare", "planner", "prepare_env"),
            &[],
            &["read:repo"],
            &completed(&[]),
        );
        assert_eq!(result, Ok(()));
    }

    #[test]
    fn idempotent_decision() {
        let wf = release_workflow();
        let ctx = completed(&["prepare"]);
        let step = active("deploy", "patcher", "apply_patch");
        let first = authorize(&wf, &step, &["write:repo"], &[], &ctx);
        let second = authorize(&wf, &step, &["write:repo"], &[], &ctx);
        assert_eq!(first, second);
    }

    // -- Existence --------------------------------------------------------

    #[test]
    fn unknown_workflow_denied() {
        let result = authorize_step(
            None,
            "ghost",
            Some(&active("s", "a", "t")),
            &[],
            &granted(&[]),
            Some(&completed(&[])),
        );
        assert_eq!(
            result,
            Err(DenyReason::WorkflowNotFound {
                workflow_id: "ghost".into()
            })
        );
    }

    #[test]
    fn missing_active_step_denied() {
        let wf = release_workflow();
        let result = authorize_step(
            Some(&wf),
            "release",
            None,
            &[],
            &granted(&[]),
            Some(&completed(&[])),
        );
        assert_eq!(result, Err(DenyReason::MissingActiveStep));
    }

    #[test]
    fn unknown_step_denied() {
        let wf = release_workflow();
        let result = authorize(
            &wf,
            &active("ghost", "planner", "prepare_env"),
            &[],
            &[],
            &completed(&[]),
        );
        assert_eq!(
            result,
            Err(DenyReason::StepNotFound {
                step_id: "ghost".into()
            })
        );
    }

    // -- Binding ----------------------------------------------------------

    #[test]
    fn wrong_agent_denied() {
        let wf = release_workflow();
        let result = authorize(
            &wf,
            &active("prepare", "patcher", "prepare_env"),
            &["read:repo"],
            &[],
            &completed(&[]),
        );
        assert_eq!(
            result,
            Err(DenyReason::AgentMismatch {
                expected: "planner".into(),
                actual: "patcher".into()
            })
        );
    }

    #[test]
    fn wrong_tool_denied() {
        let wf = release_workflow();
        let result = authorize(
            &wf,
            &active("prepare", "planner", "delete_everything"),
            &["read:repo"],
            &[],
            &completed(&[]),
        );
        assert_eq!(
            result,
            Err(DenyReason::ActionMismatch {
                expected: "prepare_env".into(),
                actual: "delete_everything".into()
            })
        );
    }

    // -- Scopes -----------------------------------------------------------

    #[test]
    fn scope_inflation_denied() {
        // Step declares read:repo; caller asks for an unrelated write scope.
        let wf = release_workflow();
        let result = authorize(
            &wf,
            &active("prepare", "planner", "prepare_env"),
            &["write:files:all"],
            &[],
            &completed(&[]),
        );
        assert_eq!(
            result,
            Err(DenyReason::MissingScopes {
                missing: vec!["read:repo".into()]
            })
        );
    }

    // -- Dependencies -----------------------------------------------------

    #[test]
    fn missing_context_denied() {
        let wf = release_workflow();
        let result = authorize_step(
            Some(&wf),
            "release",
            Some(&active("prepare", "planner", "prepare_env")),
            &["read:repo".to_string()],
            &granted(&[]),
            None,
        );
        assert_eq!(result, Err(DenyReason::MissingDelegationContext));
    }

    #[test]
    fn dependency_skip_denied() {
        // prepare completed, review skipped, deploy attempted.
        let wf = release_workflow();
        let result = authorize(
            &wf,
            &active("deploy", "patcher", "apply_patch"),
            &["write:repo"],
            &[],
            &completed(&["prepare"]),
        );
        assert_eq!(
            result,
            Err(DenyReason::UnmetDependencies {
                missing: vec!["review".into()]
            })
        );
    }

    #[test]
    fn dependencies_with_empty_history_denied() {
        let wf = release_workflow();
        let result = authorize(
            &wf,
            &active("deploy", "patcher", "apply_patch"),
            &["write:repo"],
            &[],
            &completed(&[]),
        );
        assert!(matches!(
            result,
            Err(DenyReason::UnmetDependencies { .. })
        ));
    }

    // -- Required prefix --------------------------------------------------

    #[test]
    fn required_prefix_enforced() {
        let mut wf = release_workflow();
        // Make deploy dependency-free so only the required-prefix rule fires.
        wf.steps.get_mut("deploy").unwrap().dependencies.clear();
        wf.steps.get_mut("deploy").unwrap().requires_approval = false;

        let result = authorize(
            &wf,
            &active("deploy", "patcher", "apply_patch"),
            &["write:repo"],
            &[],
            &completed(&["prepare"]),
        );
        assert_eq!(
            result,
            Err(DenyReason::RequiredPrefixIncomplete {
                missing: vec!["review".into()]
            })
        );
    }

    #[test]
    fn required_steps_after_active_ignored() {
        let wf = release_workflow();
        // review itself runs fine with only prepare done; the required
        // marker binds later steps, not itself.
        let result = authorize(
            &wf,
            &active("review", "reviewer", "review_patch"),
            &[],
            &[],
            &completed(&["prepare"]),
        );
        assert_eq!(result, Ok(()));
    }

    // -- Approval ---------------------------------------------------------

    #[test]
    fn approval_gate_not_completed_denied() {
        let mut wf = release_workflow();
        // Clear the dependency so the approval rule is what fires.
        wf.steps.get_mut("deploy").unwrap().dependencies.clear();
        wf.steps.get_mut("review").unwrap().required = false;

        let result = authorize(
            &wf,
            &active("deploy", "patcher", "apply_patch"),
            &["write:repo"],
            &[],
            &completed(&["prepare"]),
        );
        assert_eq!(
            result,
            Err(DenyReason::ApprovalNotCompleted {
                gate: "review".into()
            })
        );
    }

    #[test]
    fn no_gate_before_step_denied() {
        let mut steps = IndexMap::new();
        steps.insert(
            "deploy".to_string(),
            WorkflowStep {
                requires_approval: true,
                ..step("patcher", "apply_patch")
            },
        );
        let wf = WorkflowDefinition {
            workflow_id: "gateless".into(),
            workflow_type: "dag".into(),
            steps,
        };
        let result = authorize(
            &wf,
            &active("deploy", "patcher", "apply_patch"),
            &[],
            &[],
            &completed(&[]),
        );
        assert_eq!(
            result,
            Err(DenyReason::ApprovalGateMissing {
                step_id: "deploy".into()
            })
        );
    }

    #[test]
    fn nearest_gate_wins_with_multiple_gates() {
        // gate_a → mid → gate_b → act: completing only gate_a must not
        // satisfy act's approval requirement.
        let mut steps = IndexMap::new();
        steps.insert(
            "gate_a".to_string(),
            WorkflowStep {
                approval_gate: true,
                ..step("reviewer", "approve_a")
            },
        );
        steps.insert("mid".to_string(), step("planner", "analyze"));
        steps.insert(
            "gate_b".to_string(),
            WorkflowStep {
                approval_gate: true,
                ..step("reviewer", "approve_b")
            },
        );
        steps.insert(
            "act".to_string(),
            WorkflowStep {
                requires_approval: true,
                ..step("patcher", "apply_patch")
            },
        );
        let wf = WorkflowDefinition {
            workflow_id: "gates".into(),
            workflow_type: "dag".into(),
            steps,
        };

        let denied = authorize(
            &wf,
            &active("act", "patcher", "apply_patch"),
            &[],
            &[],
            &completed(&["gate_a", "mid"]),
        );
        assert_eq!(
            denied,
            Err(DenyReason::ApprovalNotCompleted {
                gate: "gate_b".into()
            })
        );

        let allowed = authorize(
            &wf,
            &active("act", "patcher", "apply_patch"),
            &[],
            &[],
            &completed(&["gate_a", "mid", "gate_b"]),
        );
        assert_eq!(allowed, Ok(()));
    }

    // -- Definition validation --------------------------------------------

    #[test]
    fn valid_definition_accepted() {
        assert_eq!(validate_definition(&release_workflow()), Ok(()));
    }

    #[test]
    fn non_dag_type_rejected() {
        let mut wf = release_workflow();
        wf.workflow_type = "sequence".into();
        assert!(matches!(
            validate_definition(&wf),
            Err(DefinitionError::UnsupportedType { .. })
        ));
    }

    #[test]
    fn empty_steps_rejected() {
        let wf = WorkflowDefinition {
            workflow_id: "empty".into(),
            workflow_type: "dag".into(),
            steps: IndexMap::new(),
        };
        assert_eq!(validate_definition(&wf), Err(DefinitionError::EmptySteps));
    }

    #[test]
    fn unknown_dependency_rejected() {
        let mut wf = release_workflow();
        wf.steps
            .get_mut("deploy")
            .unwrap()
            .dependencies
            .push("ghost".into());
        assert_eq!(
            validate_definition(&wf),
            Err(DefinitionError::UnknownDependency {
                step_id: "deploy".into(),
                dependency: "ghost".into()
            })
        );
    }

    #[test]
    fn approval_without_gate_rejected() {
        let mut steps = IndexMap::new();
        steps.insert(
            "deploy".to_string(),
            WorkflowStep {
                requires_approval: true,
                ..step("patcher", "apply_patch")
            },
        );
        steps.insert(
            "late_gate".to_string(),
            WorkflowStep {
                approval_gate: true,
                ..step("reviewer", "approve")
            },
        );
        let wf = WorkflowDefinition {
            workflow_id: "bad".into(),
            workflow_type: "dag".into(),
            steps,
        };
        assert_eq!(
            validate_definition(&wf),
            Err(DefinitionError::NoGateBefore {
                step_id: "deploy".into()
            })
        );
    }

    // -- Serialization of reasons -----------------------------------------

    #[test]
    fn deny_reason_serializes_with_tag() {
        let reason = DenyReason::UnmetDependencies {
            missing: vec!["review".into()],
        };
        let json = serde_json::to_value(&reason).unwrap();
        assert_eq!(json["reason"], "unmet_dependencies");
        assert_eq!(json["missing"][0], "review");
    }
}
