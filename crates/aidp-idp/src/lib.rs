// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! The identity provider: OAuth client-credentials issuance plus the
//! intent subsystem (agent/workflow registration and intent-token
//! minting), served over HTTP.
//!
//! The IDP guards its own mutating endpoints with the same two-phase
//! verification resource servers use: phase 1 as middleware over a local
//! key source, phase 2 as per-route scope/audience guards.

/// Agent/workflow registration and intent-token minting.
pub mod intent;
/// OAuth subsystem: clients, signing key, token endpoint, introspection.
pub mod oauth;
/// File-backed registries.
pub mod registry;
/// Registration version bumping.
pub mod versioning;

use crate::intent::{
    deregister_workflow, mint_intent_token, register_agent, register_agents_batch,
    register_workflow, register_workflows_batch,
};
use crate::oauth::{IdpSigningKey, IntrospectForm, OAuthService, OAuthTokenForm};
use crate::registry::{AgentRegistry, WorkflowRegistry};
use aidp_config::Settings;
use aidp_error::{AidpError, ErrorCode};
use aidp_model::{
    BatchRegistrationRequest, Registration, RegistrationRequest, TokenRequest, WorkflowDefinition,
    WorkflowDefinitionBatch, WorkflowDeregistration,
};
use aidp_resource::layer::{AuthLayerState, VerifiedToken, error_response, jwt_auth_middleware};
use aidp_resource::{KeySource, RouteAuth, TokenVerifier};
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Form, Json, Router, middleware};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{error, info};

/// Shared state of a running IDP instance.
pub struct IdpState {
    /// OAuth issuance service.
    pub oauth: OAuthService,
    /// The instance signing key.
    pub signing: Arc<IdpSigningKey>,
    /// Agent registrations, persisted to [`IdpState::registry_path`].
    pub agents: RwLock<AgentRegistry>,
    /// Workflow definitions, persisted to
    /// [`IdpState::workflow_registry_path`].
    pub workflows: RwLock<WorkflowRegistry>,
    /// Agent registry file.
    pub registry_path: PathBuf,
    /// Workflow registry file.
    pub workflow_registry_path: PathBuf,
    /// Issuer stamped into every token.
    pub issuer: String,
    /// Audience protecting the IDP's own endpoints.
    pub idp_audience: String,
    /// Verifier for the IDP's own tokens (local key source).
    pub verifier: Arc<TokenVerifier>,
}

impl IdpState {
    /// Assemble state from settings plus a client directory.
    ///
    /// Loads both registries from their configured files.
    ///
    /// # Errors
    ///
    /// Key generation or registry-load failures.
    pub fn initialize(
        settings: &Settings,
        clients: oauth::ClientDirectory,
        idp_audience: impl Into<String>,
    ) -> Result<Self, AidpError> {
        let signing = Arc::new(IdpSigningKey::generate()?);
        let registry_path = PathBuf::from(&settings.registry_file);
        let workflow_registry_path = PathBuf::from(&settings.workflow_registry_file);

        let agents = AgentRegistry::load(&registry_path).map_err(|err| {
            AidpError::new(ErrorCode::ConfigInvalid, "agent registry unreadable")
                .with_context("path", &settings.registry_file)
                .with_source(err)
        })?;
        let workflows = WorkflowRegistry::load(&workflow_registry_path).map_err(|err| {
            AidpError::new(ErrorCode::ConfigInvalid, "workflow registry unreadable")
                .with_context("path", &settings.workflow_registry_file)
                .with_source(err)
        })?;

        let verifier = Arc::new(TokenVerifier::new(
            KeySource::Local {
                kid: Some(signing.kid().to_string()),
                key: signing.decoding_key().clone(),
            },
            settings.issuer.clone(),
            settings.clock_skew_secs,
        ));

        Ok(Self {
            oauth: OAuthService::new(clients, settings.issuer.clone()),
            signing,
            agents: RwLock::new(agents),
            workflows: RwLock::new(workflows),
            registry_path,
            workflow_registry_path,
            issuer: settings.issuer.clone(),
            idp_audience: idp_audience.into(),
            verifier,
        })
    }
}

/// Build the IDP router.
///
/// OAuth endpoints are public (exempted in the middleware); everything
/// under `/intent` requires a bearer with the route's scope at the IDP
/// audience.
pub fn build_app(state: Arc<IdpState>, settings: &Settings) -> Router {
    let auth_state = AuthLayerState::new(state.verifier.clone(), settings.auth_exempt_paths.clone());

    Router::new()
        .route("/health", get(cmd_health))
        .route("/oauth/.well-known/jwks.json", get(cmd_jwks))
        .route("/oauth/token", post(cmd_oauth_token))
        .route("/oauth/introspect", post(cmd_introspect))
        .route("/oauth/whoami", get(cmd_whoami))
        .route("/intent/register/agent", post(cmd_register_agent))
        .route("/intent/batch_register/agent", post(cmd_batch_register_agent))
        .route("/intent/register/workflow", post(cmd_register_workflow))
        .route(
            "/intent/batch_register/workflow",
            post(cmd_batch_register_workflow),
        )
        .route("/intent/deregister/workflow", post(cmd_deregister_workflow))
        .route("/intent/token", post(cmd_intent_token))
        .route("/intent/agents/{app_id}", get(cmd_agents_by_app))
        .route("/intent/agents/{app_id}/{agent_id}", get(cmd_single_agent))
        .layer(middleware::from_fn_with_state(auth_state, jwt_auth_middleware))
        .layer(middleware::from_fn(log_requests))
        .with_state(state)
}

/// Request logger: method, path, status, duration as structured fields.
async fn log_requests(req: axum::extract::Request, next: axum::middleware::Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let start = Instant::now();

    let resp = next.run(req).await;

    info!(
        http.method = %method,
        http.path = %path,
        http.status = resp.status().as_u16(),
        http.duration_ms = start.elapsed().as_millis() as u64,
        "request completed"
    );
    resp
}

// ---------------------------------------------------------------------------
// Public handlers
// ---------------------------------------------------------------------------

async fn cmd_health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "time": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn cmd_jwks(State(state): State<Arc<IdpState>>) -> impl IntoResponse {
    Json(state.signing.jwks().clone())
}

async fn cmd_oauth_token(
    State(state): State<Arc<IdpState>>,
    Form(form): Form<OAuthTokenForm>,
) -> Response {
    match state.oauth.token(&form, &state.signing) {
        Ok(token) => Json(token).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn cmd_introspect(
    State(state): State<Arc<IdpState>>,
    Form(form): Form<IntrospectForm>,
) -> impl IntoResponse {
    Json(state.oauth.introspect(&form.token))
}

/// Diagnostic endpoint verifying the presented bearer against this
/// instance's own key.
async fn cmd_whoami(State(state): State<Arc<IdpState>>, headers: HeaderMap) -> Response {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split_once(' '))
        .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("bearer"))
        .map(|(_, token)| token.trim().to_string());
    let Some(token) = token else {
        return error_response(&AidpError::new(
            ErrorCode::InvalidToken,
            "missing bearer token",
        ));
    };
    match state.verifier.verify(&token).await {
        Ok(claims) => Json(json!({
            "sub": claims.sub,
            "scope": claims.scope,
            "aud": claims.aud,
            "tenant": claims.tenant,
        }))
        .into_response(),
        Err(err) => error_response(&err),
    }
}

// ---------------------------------------------------------------------------
// Intent handlers (guarded)
// ---------------------------------------------------------------------------

fn guard(state: &IdpState, scopes: &[&str], token: &VerifiedToken) -> Result<(), AidpError> {
    RouteAuth::new(scopes, &state.idp_audience).authorize(token)
}

/// Persist `registry` to `path`, mapping failures to 500s.
fn persist<T, F>(value: &T, path: &std::path::Path, save: F) -> Result<(), AidpError>
where
    F: Fn(&T, &std::path::Path) -> std::io::Result<()>,
{
    save(value, path).map_err(|err| {
        error!(path = %path.display(), error = %err, "registry persistence failed");
        AidpError::new(ErrorCode::Internal, "registry persistence failed").with_source(err)
    })
}

async fn cmd_register_agent(
    State(state): State<Arc<IdpState>>,
    Extension(token): Extension<VerifiedToken>,
    Json(request): Json<RegistrationRequest>,
) -> Response {
    if let Err(err) = guard(&state, &["register:intent"], &token) {
        return error_response(&err);
    }

    let mut agents = state.agents.write().await;
    // Stage on a copy so a persistence failure leaves memory untouched.
    let mut staged = agents.clone();
    let outcome = register_agent(&mut staged, &request)
        .and_then(|receipt| {
            persist(&staged, &state.registry_path, AgentRegistry::save)?;
            Ok(receipt)
        });
    match outcome {
        Ok(receipt) => {
            *agents = staged;
            Json(receipt).into_response()
        }
        Err(err) => error_response(&err),
    }
}

async fn cmd_batch_register_agent(
    State(state): State<Arc<IdpState>>,
    Extension(token): Extension<VerifiedToken>,
    Json(batch): Json<BatchRegistrationRequest>,
) -> Response {
    if let Err(err) = guard(&state, &["register:intent"], &token) {
        return error_response(&err);
    }

    let mut agents = state.agents.write().await;
    let mut staged = agents.clone();
    let outcome = register_agents_batch(&mut staged, &batch.registration_requests)
        .and_then(|receipts| {
            persist(&staged, &state.registry_path, AgentRegistry::save)?;
            Ok(receipts)
        });
    match outcome {
        Ok(receipts) => {
            *agents = staged;
            Json(receipts).into_response()
        }
        Err(err) => error_response(&err),
    }
}

async fn cmd_register_workflow(
    State(state): State<Arc<IdpState>>,
    Extension(token): Extension<VerifiedToken>,
    Json(workflow): Json<WorkflowDefinition>,
) -> Response {
    if let Err(err) = guard(&state, &["register:workflow"], &token) {
        return error_response(&err);
    }

    let mut workflows = state.workflows.write().await;
    let mut staged = workflows.clone();
    let outcome = register_workflow(&mut staged, workflow).and_then(|receipt| {
        persist(&staged, &state.workflow_registry_path, WorkflowRegistry::save)?;
        Ok(receipt)
    });
    match outcome {
        Ok(receipt) => {
            *workflows = staged;
            Json(receipt).into_response()
        }
        Err(err) => error_response(&err),
    }
}

async fn cmd_batch_register_workflow(
    State(state): State<Arc<IdpState>>,
    Extension(token): Extension<VerifiedToken>,
    Json(batch): Json<WorkflowDefinitionBatch>,
) -> Response {
    if let Err(err) = guard(&state, &["register:workflow"], &token) {
        return error_response(&err);
    }

    let mut workflows = state.workflows.write().await;
    let mut staged = workflows.clone();
    let outcome =
        register_workflows_batch(&mut staged, batch.workflow_definitions).and_then(|receipts| {
            persist(&staged, &state.workflow_registry_path, WorkflowRegistry::save)?;
            Ok(receipts)
        });
    match outcome {
        Ok(receipts) => {
            *workflows = staged;
            Json(receipts).into_response()
        }
        Err(err) => error_response(&err),
    }
}

async fn cmd_deregister_workflow(
    State(state): State<Arc<IdpState>>,
    Extension(token): Extension<VerifiedToken>,
    Json(request): Json<WorkflowDeregistration>,
) -> Response {
    if let Err(err) = guard(&state, &["register:workflow"], &token) {
        return error_response(&err);
    }

    let mut workflows = state.workflows.write().await;
    let mut staged = workflows.clone();
    let receipt = deregister_workflow(&mut staged, &request.workflow_id);
    match persist(&staged, &state.workflow_registry_path, WorkflowRegistry::save) {
        Ok(()) => {
            *workflows = staged;
            Json(receipt).into_response()
        }
        Err(err) => error_response(&err),
    }
}

async fn cmd_intent_token(
    State(state): State<Arc<IdpState>>,
    Extension(token): Extension<VerifiedToken>,
    Json(request): Json<TokenRequest>,
) -> Response {
    if let Err(err) = guard(&state, &["generate:intent-token"], &token) {
        return error_response(&err);
    }

    let agents = state.agents.read().await;
    let workflows = state.workflows.read().await;
    let granted = token.claims.scopes();
    match mint_intent_token(
        &agents,
        &workflows,
        &state.signing,
        &state.issuer,
        &request,
        &granted,
    ) {
        Ok(response) => Json(response).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn cmd_agents_by_app(
    State(state): State<Arc<IdpState>>,
    Extension(token): Extension<VerifiedToken>,
    Path(app_id): Path<String>,
) -> Response {
    if let Err(err) = guard(&state, &["read:agents"], &token) {
        return error_response(&err);
    }

    let agents = state.agents.read().await;
    let mut by_app: BTreeMap<String, Vec<Registration>> = BTreeMap::new();
    by_app.insert(app_id.clone(), agents.latest_by_app(&app_id));
    Json(by_app).into_response()
}

async fn cmd_single_agent(
    State(state): State<Arc<IdpState>>,
    Extension(token): Extension<VerifiedToken>,
    Path((app_id, agent_id)): Path<(String, String)>,
) -> Response {
    if let Err(err) = guard(&state, &["read:agents"], &token) {
        return error_response(&err);
    }

    let agents = state.agents.read().await;
    let registration = agents
        .latest(&agent_id)
        .filter(|reg| reg.app_id == app_id)
        .cloned();
    Json(registration).into_response()
}
