// SPDX-License-Identifier: MIT OR Apache-2.0
//! aidp-model
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The stable contract for the Agent Identity Plane.
//!
//! Everything that crosses a process boundary (registration requests,
//! workflow definitions, token requests, JWT claim sets) lives here,
//! together with the canonical-JSON and hashing helpers the rest of the
//! workspace builds on.

/// JWT claim structures for access and intent tokens.
pub mod claims;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Tools and agent components
// ---------------------------------------------------------------------------

/// A single tool exposed by an agent.
///
/// The `signature` string is the canonical form produced by the checksum
/// crate: function name, retained parameters with annotations, and the
/// return annotation. `source_code`, when present, is the *normalized*
/// source of a deep-checksum tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Tool name, unique within the owning agent.
    pub name: String,
    /// Canonical signature string.
    pub signature: String,
    /// Human-readable description.
    pub description: String,
    /// Normalized source, present only for deep-checksum tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_code: Option<String>,
    /// True when this tool is another registered agent used as a sub-agent.
    #[serde(default)]
    pub is_agent: bool,
}

/// The pre-image of an agent checksum.
///
/// Identity is a pure function of these fields; see the checksum crate for
/// the exact serialization that gets hashed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentComponents {
    /// Stable agent identifier.
    pub agent_id: String,
    /// Prompt template (normalized before hashing).
    pub prompt_template: String,
    /// Tools, in any order; the checksum sorts by name.
    pub tools: Vec<ToolDescriptor>,
    /// Configuration mapping. `BTreeMap` keeps serialization deterministic.
    #[serde(default)]
    pub configuration: BTreeMap<String, serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// Request body for `POST /intent/register/agent`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationRequest {
    /// Application the agent belongs to.
    pub app_id: String,
    /// The identity pre-image.
    pub agent_components: AgentComponents,
    /// PoP public key, PEM-encoded.
    pub public_key: String,
}

/// Request body for `POST /intent/batch_register/agent`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRegistrationRequest {
    /// Individual registrations, processed in order.
    pub registration_requests: Vec<RegistrationRequest>,
}

/// An IDP-side agent registration record.
///
/// Registrations are immutable; a changed agent gets a new record with a
/// bumped version. The latest record per `agent_id` is authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    /// Owning application.
    pub app_id: String,
    /// Agent identifier.
    pub agent_id: String,
    /// Server-generated id: `reg_<agent_id>_<unix_seconds>`.
    pub registration_id: String,
    /// Hex SHA-256 checksum over the agent components.
    pub checksum: String,
    /// Prompt as registered.
    pub prompt: String,
    /// Tools as registered.
    pub tools: Vec<ToolDescriptor>,
    /// PoP public key PEM, if one was supplied.
    pub public_key: Option<String>,
    /// Registration time, unix milliseconds.
    pub registered_at: i64,
    /// Semver version string; `1.0.0` for the first registration.
    #[serde(default)]
    pub version: Option<String>,
}

/// Response body for a successful agent registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationReceipt {
    /// The registered agent.
    pub agent_id: String,
    /// Server-assigned registration id.
    pub registration_id: String,
    /// The computed checksum.
    pub checksum: String,
}

// ---------------------------------------------------------------------------
// Workflows
// ---------------------------------------------------------------------------

/// One step of a DAG workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// The agent that must execute this step.
    pub agent: String,
    /// Tool (or sub-agent) name the step executes.
    pub action: String,
    /// Scopes the step requires.
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Step ids that must be completed before this one may start.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Required steps must appear on the completed path before any later
    /// required step runs.
    #[serde(default)]
    pub required: bool,
    /// Marks this step as an approval point.
    #[serde(default)]
    pub approval_gate: bool,
    /// This step demands the nearest preceding approval gate be completed.
    #[serde(default)]
    pub requires_approval: bool,
}

/// A registered DAG workflow.
///
/// Step order matters: the required-prefix and approval rules are defined
/// over the *declaration* order, so the step map preserves insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Workflow identifier.
    pub workflow_id: String,
    /// Always `"dag"` for now.
    #[serde(default = "default_workflow_type")]
    pub workflow_type: String,
    /// Ordered mapping `step_id → step`.
    pub steps: IndexMap<String, WorkflowStep>,
}

fn default_workflow_type() -> String {
    "dag".to_string()
}

/// Request body for `POST /intent/batch_register/workflow`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinitionBatch {
    /// Definitions, registered in order.
    pub workflow_definitions: Vec<WorkflowDefinition>,
}

/// Request body for `POST /intent/deregister/workflow`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDeregistration {
    /// The workflow to remove.
    pub workflow_id: String,
}

/// Response body for workflow registration/deregistration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowReceipt {
    /// `"registered"`, `"skipped"`, or `"deregistered"`.
    pub status: String,
    /// The workflow in question.
    pub workflow_id: String,
}

// ---------------------------------------------------------------------------
// Runtime workflow state
// ---------------------------------------------------------------------------

/// The single in-flight step of an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveStep {
    /// Step identifier (defaults to the lower-cased tool name).
    pub step_id: String,
    /// Agent executing the step.
    pub agent_id: String,
    /// Tool being invoked.
    pub tool_name: String,
    /// Start time, unix milliseconds.
    pub started_at: i64,
}

/// A finished (completed or failed) step record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Step identifier.
    pub step_id: String,
    /// Agent that executed the step.
    pub agent_id: String,
    /// Tool that was invoked.
    pub tool_name: String,
    /// Start time, unix milliseconds.
    pub started_at: i64,
    /// Completion time, unix milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    /// Failure time, unix milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<i64>,
    /// Wall-clock duration in milliseconds, for completed steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    /// Error message, for failed steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Delegation context shipped with an intent-token request: the execution's
/// history so far.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DelegationContext {
    /// Workflow this execution runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    /// Client-generated execution id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    /// Full history (completed and failed steps, in order).
    #[serde(default)]
    pub chain: Vec<StepRecord>,
    /// Completed steps only, in completion order.
    #[serde(default)]
    pub completed_steps: Vec<StepRecord>,
}

// ---------------------------------------------------------------------------
// Token request / response
// ---------------------------------------------------------------------------

/// Grant type string for the intent-token endpoint.
pub const GRANT_AGENT_CHECKSUM: &str = "agent_checksum";

/// Grant type string for the OAuth token endpoint.
pub const GRANT_CLIENT_CREDENTIALS: &str = "client_credentials";

/// Request body for `POST /intent/token`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRequest {
    /// Must be [`GRANT_AGENT_CHECKSUM`].
    pub grant_type: String,
    /// The calling agent.
    pub agent_id: String,
    /// Checksum the client computed over its live agent.
    pub computed_checksum: String,
    /// Workflow the call happens within.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    /// The in-flight step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_step: Option<ActiveStep>,
    /// Scopes the caller asks for.
    pub requested_scopes: Vec<String>,
    /// Audience the token is minted for.
    pub audience: String,
    /// Execution history backing the workflow validation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegation_context: Option<DelegationContext>,
    /// When false, workflow validation is skipped entirely.
    #[serde(default = "default_true")]
    pub workflow_enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Response body for both token endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenResponse {
    /// The signed JWT.
    pub access_token: String,
    /// Always `"Bearer"`.
    pub token_type: String,
    /// Lifetime in seconds.
    pub expires_in: u64,
    /// Space-delimited granted scopes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl TokenResponse {
    /// Build a bearer response with the given token, lifetime, and scopes.
    pub fn bearer(access_token: impl Into<String>, expires_in: u64, scopes: &[String]) -> Self {
        Self {
            access_token: access_token.into(),
            token_type: "Bearer".to_string(),
            expires_in,
            scope: if scopes.is_empty() {
                None
            } else {
                Some(scopes.join(" "))
            },
        }
    }
}

// ---------------------------------------------------------------------------
// PoP payload
// ---------------------------------------------------------------------------

/// The canonical proof-of-possession payload.
///
/// Both sides (the shim when signing and the resource server when
/// verifying) serialize this through [`canonical_json`] so the signed
/// bytes are identical for the exact same request tuple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopPayload {
    /// HTTP method, upper-case.
    pub method: String,
    /// Full request URL.
    pub url: String,
    /// Hex SHA-256 of the request body; empty string for bodyless requests.
    pub data: String,
    /// The calling agent's checksum.
    pub checksum: String,
    /// Signing time, integer unix seconds.
    pub timestamp: i64,
}

impl PopPayload {
    /// The exact bytes that get signed.
    ///
    /// # Errors
    ///
    /// Returns [`ContractError::Json`] if serialization fails.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, ContractError> {
        Ok(canonical_json(self)?.into_bytes())
    }
}

// ---------------------------------------------------------------------------
// Canonical serialization and hashing
// ---------------------------------------------------------------------------

/// Errors from contract-level operations (serialization, hashing).
#[derive(Debug, thiserror::Error)]
pub enum ContractError {
    /// JSON serialization or deserialization failed.
    #[error("failed to serialize JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Produce a deterministic JSON string for hashing and signing.
///
/// Not a full JCS implementation, but stable for our types: going through
/// `serde_json::Value` sorts keys (its map is a `BTreeMap`), and numbers are
/// serialized consistently.
///
/// # Errors
///
/// Returns [`ContractError::Json`] if the value cannot be serialized.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, ContractError> {
    let v = serde_json::to_value(value)?;
    Ok(serde_json::to_string(&v)?)
}

/// Compute the hex-encoded SHA-256 digest of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Length, in hex characters, of the truncated sequence hashes carried in
/// intent tokens.
pub const SEQUENCE_HASH_LEN: usize = 16;

/// Hash a `"|"`-joined stringified sequence down to a short digest.
///
/// Intent tokens carry these instead of literal chains: the token stays
/// small and intermediate chain content stays hidden, while any party
/// holding the same records can recompute and compare.
///
/// # Examples
///
/// ```
/// let h = aidp_model::truncated_sequence_hash(&["a".into(), "b".into()]);
/// assert_eq!(h.len(), aidp_model::SEQUENCE_HASH_LEN);
/// assert_ne!(h, aidp_model::truncated_sequence_hash(&["b".into(), "a".into()]));
/// ```
#[must_use]
pub fn truncated_sequence_hash(parts: &[String]) -> String {
    let joined = parts.join("|");
    let mut h = sha256_hex(joined.as_bytes());
    h.truncate(SEQUENCE_HASH_LEN);
    h
}

/// Stringify a sequence of step records (plus an optional trailing element)
/// and hash it.
///
/// Each element is rendered through [`canonical_json`] so the digest is
/// insensitive to struct field order but sensitive to every value.
///
/// # Errors
///
/// Returns [`ContractError::Json`] if any element fails to serialize.
pub fn sequence_hash_over<T: Serialize, U: Serialize>(
    items: &[T],
    tail: Option<&U>,
) -> Result<String, ContractError> {
    let mut parts = Vec::with_capacity(items.len() + 1);
    for item in items {
        parts.push(canonical_json(item)?);
    }
    if let Some(t) = tail {
        parts.push(canonical_json(t)?);
    }
    Ok(truncated_sequence_hash(&parts))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
