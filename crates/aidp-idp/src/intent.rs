// SPDX-License-Identifier: MIT OR Apache-2.0
//! The intent subsystem: agent registration, workflow registration, and
//! intent-token minting.
//!
//! Everything here is pure with respect to the registries passed in; the
//! HTTP layer owns locking and persistence, so each operation can be
//! exercised directly in tests.

use crate::oauth::IdpSigningKey;
use crate::registry::{AgentRegistry, WorkflowRegistry};
use crate::versioning::next_version;
use aidp_checksum::compute_agent_checksum;
use aidp_error::{AidpError, ErrorCode};
use aidp_keys::{jwk_from_public_key, public_key_from_pem};
use aidp_model::claims::{AgentProof, Audience, Confirmation, IntentClaim, TokenClaims};
use aidp_model::{
    GRANT_AGENT_CHECKSUM, Registration, RegistrationReceipt, RegistrationRequest, TokenRequest,
    TokenResponse, WorkflowDefinition, WorkflowReceipt, sequence_hash_over,
    truncated_sequence_hash,
};
use aidp_workflow::{authorize_step, validate_definition};
use std::collections::BTreeSet;
use tracing::info;
use uuid::Uuid;

/// Lifetime of intent tokens, seconds. Deliberately much shorter than any
/// human workflow timescale.
pub const INTENT_TOKEN_TTL_SECS: u64 = 5 * 60;

// ---------------------------------------------------------------------------
// Agent registration
// ---------------------------------------------------------------------------

/// Register an agent, recomputing its checksum from the submitted
/// components.
///
/// A checksum matching *any* existing registration is rejected: under
/// another agent id it is an impersonation attempt, under the same id it
/// is a duplicate the client should have skipped. Clients that want
/// idempotent re-registration check first (the shim does).
///
/// # Errors
///
/// `CHECKSUM_COLLISION` on any checksum reuse.
pub fn register_agent(
    agents: &mut AgentRegistry,
    request: &RegistrationRequest,
) -> Result<RegistrationReceipt, AidpError> {
    let components = &request.agent_components;
    let checksum = compute_agent_checksum(components);

    if let Some(owner) = agents.checksum_owner_other_than(&checksum, &components.agent_id) {
        return Err(AidpError::new(
            ErrorCode::ChecksumCollision,
            "agent with identical checksum already exists",
        )
        .with_context("agent_id", &components.agent_id)
        .with_context("owner", owner));
    }

    if agents.has_checksum(&components.agent_id, &checksum) {
        return Err(AidpError::new(
            ErrorCode::ChecksumCollision,
            "agent with identical checksum already exists",
        )
        .with_context("agent_id", &components.agent_id)
        .with_context("owner", &components.agent_id));
    }

    let now = chrono::Utc::now();
    let registration_id = format!("reg_{}_{}", components.agent_id, now.timestamp());

    let mut registration = Registration {
        app_id: request.app_id.clone(),
        agent_id: components.agent_id.clone(),
        registration_id: registration_id.clone(),
        checksum: checksum.clone(),
        prompt: components.prompt_template.clone(),
        tools: components.tools.clone(),
        public_key: Some(request.public_key.clone()),
        registered_at: now.timestamp_millis(),
        version: None,
    };
    registration.version = Some(next_version(
        agents.history(&components.agent_id),
        &registration,
    ));

    info!(
        agent_id = %components.agent_id,
        registration_id,
        version = registration.version.as_deref().unwrap_or("?"),
        "agent registered"
    );
    agents.insert(registration);

    Ok(RegistrationReceipt {
        agent_id: components.agent_id.clone(),
        registration_id,
        checksum,
    })
}

/// Fold a batch of registrations over [`register_agent`].
///
/// The first failing element aborts the whole batch; the caller commits
/// nothing unless every element succeeded.
///
/// # Errors
///
/// The first element's error.
pub fn register_agents_batch(
    agents: &mut AgentRegistry,
    requests: &[RegistrationRequest],
) -> Result<Vec<RegistrationReceipt>, AidpError> {
    let mut receipts = Vec::with_capacity(requests.len());
    for request in requests {
        receipts.push(register_agent(agents, request)?);
    }
    Ok(receipts)
}

// ---------------------------------------------------------------------------
// Workflow registration
// ---------------------------------------------------------------------------

/// Register a workflow definition.
///
/// Re-registering an existing id is skipped idempotently. A *different* id
/// with an identical step map is rejected; two names for one workflow
/// would let a caller shop for the laxer registration.
///
/// # Errors
///
/// `BAD_REQUEST` for structurally invalid definitions,
/// `DUPLICATE_WORKFLOW` for identical steps under another id.
pub fn register_workflow(
    workflows: &mut WorkflowRegistry,
    workflow: WorkflowDefinition,
) -> Result<WorkflowReceipt, AidpError> {
    validate_definition(&workflow).map_err(|err| {
        AidpError::new(ErrorCode::BadRequest, "invalid workflow definition")
            .with_context("workflow_id", &workflow.workflow_id)
            .with_context("detail", err.to_string())
    })?;

    if workflows.contains(&workflow.workflow_id) {
        info!(workflow_id = %workflow.workflow_id, "workflow already registered, skipping");
        return Ok(WorkflowReceipt {
            status: "skipped".into(),
            workflow_id: workflow.workflow_id,
        });
    }

    if let Some(other) = workflows.identical_steps_other_than(&workflow) {
        return Err(AidpError::new(
            ErrorCode::DuplicateWorkflow,
            "workflow with identical steps already exists",
        )
        .with_context("workflow_id", &workflow.workflow_id)
        .with_context("existing", other));
    }

    let workflow_id = workflow.workflow_id.clone();
    workflows.insert(workflow);
    info!(workflow_id, "workflow registered");
    Ok(WorkflowReceipt {
        status: "registered".into(),
        workflow_id,
    })
}

/// Fold a batch of workflow definitions over [`register_workflow`].
///
/// # Errors
///
/// The first element's error; the caller commits nothing on failure.
pub fn register_workflows_batch(
    workflows: &mut WorkflowRegistry,
    definitions: Vec<WorkflowDefinition>,
) -> Result<Vec<WorkflowReceipt>, AidpError> {
    let mut receipts = Vec::with_capacity(definitions.len());
    for definition in definitions {
        receipts.push(register_workflow(workflows, definition)?);
    }
    Ok(receipts)
}

/// Remove a workflow. Removing an unknown id still reports success; the
/// end state is the same.
pub fn deregister_workflow(workflows: &mut WorkflowRegistry, workflow_id: &str) -> WorkflowReceipt {
    let existed = workflows.remove(workflow_id);
    info!(workflow_id, existed, "workflow deregistered");
    WorkflowReceipt {
        status: "deregistered".into(),
        workflow_id: workflow_id.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Intent token minting
// ---------------------------------------------------------------------------

/// Mint an intent token using the `agent_checksum` grant.
///
/// Validation order (each failure distinguishable):
/// 1. grant type: `BAD_REQUEST`
/// 2. agent registered: `UNKNOWN_AGENT`
/// 3. checksum equals the latest registration: `CODE_INTEGRITY_VIOLATION`
/// 4. workflow step authorized (when workflow mode is on):
///    `WORKFLOW_DENIED`
///
/// `granted_scopes` come from the caller's already-verified OAuth gate.
///
/// # Errors
///
/// One of the codes above, or `INTERNAL` if the stored registration is
/// unusable for claim building.
pub fn mint_intent_token(
    agents: &AgentRegistry,
    workflows: &WorkflowRegistry,
    key: &IdpSigningKey,
    issuer: &str,
    request: &TokenRequest,
    granted_scopes: &BTreeSet<String>,
) -> Result<TokenResponse, AidpError> {
    if request.grant_type != GRANT_AGENT_CHECKSUM {
        return Err(AidpError::new(ErrorCode::BadRequest, "unsupported grant type")
            .with_context("grant_type", &request.grant_type));
    }

    let registration = agents.latest(&request.agent_id).ok_or_else(|| {
        AidpError::new(ErrorCode::UnknownAgent, "agent is not registered")
            .with_context("agent_id", &request.agent_id)
    })?;

    if request.computed_checksum != registration.checksum {
        return Err(AidpError::new(
            ErrorCode::CodeIntegrityViolation,
            "agent checksum mismatch",
        )
        .with_context("agent_id", &request.agent_id))
    }

    if request.workflow_enabled {
        let workflow_id = request.workflow_id.as_deref().unwrap_or("");
        let workflow = request
            .workflow_id
            .as_deref()
            .and_then(|id| workflows.latest(id));
        authorize_step(
            workflow,
            workflow_id,
            request.workflow_step.as_ref(),
            &request.requested_scopes,
            granted_scopes,
            request.delegation_context.as_ref(),
        )
        .map_err(|reason| {
            AidpError::new(
                ErrorCode::WorkflowDenied,
                "agent not authorized for workflow step",
            )
            .with_context("workflow_id", workflow_id)
            .with_context("denial", &reason)
        })?;
    }

    let claims = build_intent_claims(registration, issuer, request)?;
    let token = key.sign(&claims)?;

    Ok(TokenResponse::bearer(
        token,
        INTENT_TOKEN_TTL_SECS,
        &request.requested_scopes,
    ))
}

fn build_intent_claims(
    registration: &Registration,
    issuer: &str,
    request: &TokenRequest,
) -> Result<TokenClaims, AidpError> {
    let public_pem = registration.public_key.as_deref().ok_or_else(|| {
        AidpError::new(
            ErrorCode::Internal,
            "registration carries no PoP public key",
        )
        .with_context("agent_id", &registration.agent_id)
    })?;
    let public_key = public_key_from_pem(public_pem).map_err(|err| {
        AidpError::new(ErrorCode::Internal, "stored PoP public key is unusable")
            .with_context("agent_id", &registration.agent_id)
            .with_source(err)
    })?;

    // The token carries truncated hashes, not the chains themselves: the
    // token stays small and intermediate chain content stays hidden while
    // any party holding the records can recompute and compare.
    let hash_error = |err| {
        AidpError::new(ErrorCode::Internal, "delegation hash computation failed").with_source(err)
    };
    let (delegation_chain, step_sequence_hash) = match &request.delegation_context {
        Some(context) => (
            sequence_hash_over(&context.chain, request.workflow_step.as_ref())
                .map_err(hash_error)?,
            sequence_hash_over(&context.completed_steps, request.workflow_step.as_ref())
                .map_err(hash_error)?,
        ),
        None => {
            let mut chain_parts = vec![request.agent_id.clone()];
            let mut step_parts = Vec::new();
            if let Some(step) = &request.workflow_step {
                let rendered = aidp_model::canonical_json(step).map_err(hash_error)?;
                chain_parts.push(rendered.clone());
                step_parts.push(rendered);
            }
            (
                truncated_sequence_hash(&chain_parts),
                truncated_sequence_hash(&step_parts),
            )
        }
    };

    let now = chrono::Utc::now().timestamp();
    Ok(TokenClaims {
        iss: issuer.to_string(),
        sub: request.agent_id.clone(),
        aud: Audience::One(request.audience.clone()),
        iat: now,
        exp: now + INTENT_TOKEN_TTL_SECS as i64,
        jti: format!("token_{}", &Uuid::new_v4().simple().to_string()[..8]),
        scope: Some(request.requested_scopes.join(" ")),
        scp: None,
        tenant: None,
        cnf: Some(Confirmation {
            jwk: jwk_from_public_key(&public_key, None),
        }),
        intent: Some(IntentClaim {
            workflow_id: request.workflow_id.clone(),
            workflow_step: request.workflow_step.clone(),
            executed_by: request.agent_id.clone(),
            delegation_chain,
            step_sequence_hash,
        }),
        agent_proof: Some(AgentProof {
            agent_checksum: request.computed_checksum.clone(),
            registration_id: registration.registration_id.clone(),
        }),
    })
}
