// SPDX-License-Identifier: MIT OR Apache-2.0
//! The secure client: bootstrap, detection, minting, and the
//! authenticated-request scope.

use crate::agent::{AgentHandle, AgentRunner, AgentTool};
use crate::cache::{TokenCache, cache_key};
use crate::context::ExecutionContext;
use crate::identity::AgentIdentity;
use crate::profiles::AuthProfile;
use crate::registry::{ChecksumLevel, ToolRegistry};
use crate::retry::send_with_retry;
use crate::tool::{Tool, TrackedTool};
use aidp_checksum::normalize::normalize_source;
use aidp_config::Settings;
use aidp_error::{AidpError, AidpErrorDto, ErrorCode};
use aidp_keys::{AgentKeyManager, sign_sha256};
use aidp_model::{
    BatchRegistrationRequest, GRANT_AGENT_CHECKSUM, PopPayload, Registration, RegistrationReceipt,
    RegistrationRequest, TokenRequest, TokenResponse, ToolDescriptor, WorkflowDefinition,
    WorkflowDefinitionBatch, WorkflowReceipt, sha256_hex,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT};
use serde_json::Value;
use std::collections::BTreeMap;
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Which token the request scope attaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// Agent-bound intent token (requires an execution context).
    Intent,
    /// Plain OAuth client-credentials token.
    OAuth,
}

/// Request description for PoP signing.
#[derive(Debug, Clone)]
pub struct PopData {
    /// HTTP method, upper-case.
    pub method: String,
    /// Full request URL as it will be sent.
    pub url: String,
    /// Hex SHA-256 of the body; empty string for bodyless requests.
    pub body_hash: String,
}

impl PopData {
    /// Describe a request, hashing its body.
    #[must_use]
    pub fn new(method: &str, url: &str, body: &[u8]) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            url: url.to_string(),
            body_hash: if body.is_empty() {
                String::new()
            } else {
                sha256_hex(body)
            },
        }
    }
}

/// Options for one authenticated-request scope.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    scopes: Vec<String>,
    audience: Option<String>,
    workflow_id: Option<String>,
    auth_profile: Option<String>,
    mode: AuthMode,
    workflow_enabled: bool,
    pop_data: Option<PopData>,
}

impl RequestOptions {
    /// Intent-mode options with the given scopes.
    #[must_use]
    pub fn intent(scopes: &[&str]) -> Self {
        Self {
            scopes: scopes.iter().map(|s| (*s).to_string()).collect(),
            audience: None,
            workflow_id: None,
            auth_profile: None,
            mode: AuthMode::Intent,
            workflow_enabled: true,
            pop_data: None,
        }
    }

    /// OAuth-mode options with the given scopes.
    #[must_use]
    pub fn oauth(scopes: &[&str]) -> Self {
        Self {
            mode: AuthMode::OAuth,
            ..Self::intent(scopes)
        }
    }

    /// Target audience.
    #[must_use]
    pub fn audience(mut self, audience: &str) -> Self {
        self.audience = Some(audience.to_string());
        self
    }

    /// Override the workflow id (defaults to the execution context's).
    #[must_use]
    pub fn workflow_id(mut self, workflow_id: &str) -> Self {
        self.workflow_id = Some(workflow_id.to_string());
        self
    }

    /// Use a named OAuth profile for IDP-facing calls.
    #[must_use]
    pub fn auth_profile(mut self, name: &str) -> Self {
        self.auth_profile = Some(name.to_string());
        self
    }

    /// Disable workflow validation for this mint.
    #[must_use]
    pub fn workflow_enabled(mut self, enabled: bool) -> Self {
        self.workflow_enabled = enabled;
        self
    }

    /// Attach a PoP description; the scope will sign it in intent mode.
    #[must_use]
    pub fn pop_data(mut self, pop: PopData) -> Self {
        self.pop_data = Some(pop);
        self
    }
}

/// An HTTP client pre-loaded with `Authorization` (and PoP) headers.
///
/// Dropping the value ends the scope.
#[derive(Debug)]
pub struct AuthenticatedClient {
    inner: reqwest::Client,
}

impl Deref for AuthenticatedClient {
    type Target = reqwest::Client;
    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for [`SecureClient`].
pub struct SecureClientBuilder {
    app_id: String,
    idp_url: String,
    idp_audience: String,
    intent_mode: bool,
    pop_enabled: bool,
    timeout: Duration,
    max_retries: u32,
    key_dir: PathBuf,
    registry: Arc<ToolRegistry>,
    profiles: BTreeMap<String, AuthProfile>,
    default_profile: Option<String>,
    step_overrides: BTreeMap<String, String>,
}

impl SecureClientBuilder {
    /// Base URL of the IDP.
    #[must_use]
    pub fn idp_url(mut self, url: &str) -> Self {
        self.idp_url = url.trim_end_matches('/').to_string();
        self
    }

    /// Audience of the IDP's own endpoints.
    #[must_use]
    pub fn idp_audience(mut self, audience: &str) -> Self {
        self.idp_audience = audience.to_string();
        self
    }

    /// Whether intent mode is on (off forces plain OAuth everywhere).
    #[must_use]
    pub fn intent_mode(mut self, on: bool) -> Self {
        self.intent_mode = on;
        self
    }

    /// Whether PoP headers are attached in intent mode.
    #[must_use]
    pub fn pop_enabled(mut self, on: bool) -> Self {
        self.pop_enabled = on;
        self
    }

    /// Outbound request timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Retry budget for transport-level failures.
    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Directory holding per-agent PoP key PEMs.
    #[must_use]
    pub fn key_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.key_dir = dir.into();
        self
    }

    /// Use a specific tool registry (defaults to the process-wide one).
    #[must_use]
    pub fn registry(mut self, registry: Arc<ToolRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Register a named OAuth profile. The first becomes the default.
    #[must_use]
    pub fn profile(mut self, name: &str, profile: AuthProfile) -> Self {
        if self.default_profile.is_none() {
            self.default_profile = Some(name.to_string());
        }
        self.profiles.insert(name.to_string(), profile);
        self
    }

    /// Map `agent.tool` (or bare `tool`) to an explicit workflow step id.
    #[must_use]
    pub fn step_override(mut self, key: &str, step_id: &str) -> Self {
        self.step_overrides
            .insert(key.to_string(), step_id.to_string());
        self
    }

    /// Build the client.
    ///
    /// # Errors
    ///
    /// `KEY_UNAVAILABLE` when the key directory cannot be opened,
    /// `CONFIG_INVALID` when no OAuth profile was configured.
    pub fn build(self) -> Result<SecureClient, AidpError> {
        if self.profiles.is_empty() {
            return Err(AidpError::new(
                ErrorCode::ConfigInvalid,
                "at least one OAuth profile is required",
            ));
        }
        let keys = AgentKeyManager::open(&self.key_dir).map_err(|err| {
            AidpError::new(ErrorCode::KeyUnavailable, "PoP key directory unusable")
                .with_context("dir", self.key_dir.display().to_string())
                .with_source(err)
        })?;
        let http = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|err| {
                AidpError::new(ErrorCode::Internal, "http client construction failed")
                    .with_source(err)
            })?;

        info!(app_id = %self.app_id, idp_url = %self.idp_url, "secure client initialized");
        Ok(SecureClient {
            app_id: self.app_id,
            idp_url: self.idp_url,
            idp_audience: self.idp_audience,
            intent_mode: self.intent_mode,
            pop_enabled: self.pop_enabled,
            timeout: self.timeout,
            max_retries: self.max_retries,
            http,
            keys,
            registry: self.registry,
            identities: RwLock::new(BTreeMap::new()),
            checksum_index: RwLock::new(BTreeMap::new()),
            live_agents: RwLock::new(BTreeMap::new()),
            cache: TokenCache::new(),
            profiles: self.profiles,
            default_profile: self.default_profile.expect("set with first profile"),
            step_overrides: self.step_overrides,
        })
    }
}

// ---------------------------------------------------------------------------
// SecureClient
// ---------------------------------------------------------------------------

/// The per-process enforcement client. One instance per application.
pub struct SecureClient {
    app_id: String,
    idp_url: String,
    idp_audience: String,
    intent_mode: bool,
    pop_enabled: bool,
    timeout: Duration,
    max_retries: u32,
    http: reqwest::Client,
    keys: AgentKeyManager,
    registry: Arc<ToolRegistry>,
    identities: RwLock<BTreeMap<String, Arc<AgentIdentity>>>,
    checksum_index: RwLock<BTreeMap<String, String>>,
    live_agents: RwLock<BTreeMap<String, Arc<AgentHandle>>>,
    cache: TokenCache,
    profiles: BTreeMap<String, AuthProfile>,
    default_profile: String,
    step_overrides: BTreeMap<String, String>,
}

impl SecureClient {
    /// Start building a client for `app_id`.
    #[must_use]
    pub fn builder(app_id: &str) -> SecureClientBuilder {
        SecureClientBuilder {
            app_id: app_id.to_string(),
            idp_url: "http://idp.localhost".to_string(),
            idp_audience: "idp.localhost".to_string(),
            intent_mode: true,
            pop_enabled: true,
            timeout: Duration::from_secs(30),
            max_retries: 3,
            key_dir: PathBuf::from(".runtime"),
            registry: ToolRegistry::global(),
            profiles: BTreeMap::new(),
            default_profile: None,
            step_overrides: BTreeMap::new(),
        }
    }

    /// Builder pre-filled from [`Settings`].
    #[must_use]
    pub fn builder_from_settings(settings: &Settings) -> SecureClientBuilder {
        Self::builder(&settings.app_id)
            .idp_url(&settings.idp_url)
            .intent_mode(settings.intent_auth_mode)
            .pop_enabled(settings.api_pop_enabled)
            .key_dir(&settings.pop_key_dir)
    }

    /// The application id.
    #[must_use]
    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// The key manager (keys are generated on registration).
    #[must_use]
    pub fn keys(&self) -> &AgentKeyManager {
        &self.keys
    }

    /// A live agent by id.
    #[must_use]
    pub fn agent(&self, agent_id: &str) -> Option<Arc<AgentHandle>> {
        self.live_agents
            .read()
            .expect("agents lock poisoned")
            .get(agent_id)
            .cloned()
    }

    /// A verified identity by id.
    #[must_use]
    pub fn identity(&self, agent_id: &str) -> Option<Arc<AgentIdentity>> {
        self.identities
            .read()
            .expect("identities lock poisoned")
            .get(agent_id)
            .cloned()
    }

    // -- Execution lifecycle ------------------------------------------------

    /// Start a fresh workflow execution.
    #[must_use]
    pub fn start_workflow_execution(&self, workflow_id: &str) -> Arc<ExecutionContext> {
        let ctx = Arc::new(ExecutionContext::new(workflow_id));
        info!(
            execution_id = %ctx.execution_id(),
            workflow_id,
            "workflow execution started"
        );
        ctx
    }

    /// End an execution. Contexts are plain values; this logs the close so
    /// traces line up.
    pub fn end_workflow_execution(&self, ctx: &ExecutionContext) {
        let (_, delegation) = ctx.snapshot();
        info!(
            execution_id = %ctx.execution_id(),
            workflow_id = %ctx.workflow_id(),
            completed = delegation.completed_steps.len(),
            "workflow execution ended"
        );
    }

    // -- Bootstrap ----------------------------------------------------------

    /// Rebuild and verify every agent registered for this app.
    ///
    /// Agents without sub-agent tools are processed first so that
    /// sub-agent references resolve to already-rebuilt agents.
    ///
    /// # Errors
    ///
    /// `REGISTRATION_INTEGRITY_VIOLATION`, `POP_KEY_MISMATCH`, or
    /// `CHECKSUM_COLLISION` from verification; transport errors from the
    /// fetch.
    pub async fn bootstrap_from_idp(
        &self,
        runner: Arc<dyn AgentRunner>,
    ) -> Result<usize, AidpError> {
        let registrations = self.fetch_registrations().await?;

        let (plain, with_sub_agents): (Vec<_>, Vec<_>) = registrations
            .into_iter()
            .partition(|reg| !reg.tools.iter().any(|tool| tool.is_agent));

        let mut adopted = 0usize;
        for registration in plain.iter().chain(with_sub_agents.iter()) {
            self.adopt_registration(registration, runner.clone())?;
            adopted += 1;
        }
        info!(count = adopted, "agents rebuilt and verified from IDP");
        Ok(adopted)
    }

    /// Rebuild one registration into a live, verified agent.
    ///
    /// # Errors
    ///
    /// See [`SecureClient::bootstrap_from_idp`].
    pub fn adopt_registration(
        &self,
        registration: &Registration,
        runner: Arc<dyn AgentRunner>,
    ) -> Result<(), AidpError> {
        let agent_id = &registration.agent_id;

        if self.agent(agent_id).is_some() {
            return Err(AidpError::new(
                ErrorCode::RegistrationIntegrityViolation,
                "duplicate agent id in registration",
            )
            .with_context("agent_id", agent_id));
        }
        if registration.tools.is_empty() {
            return Err(AidpError::new(
                ErrorCode::RegistrationIntegrityViolation,
                "registration declares no tools",
            )
            .with_context("agent_id", agent_id));
        }

        let mut tracked = Vec::with_capacity(registration.tools.len());
        for tool_ref in &registration.tools {
            tracked.push(self.rebuild_tool(agent_id, tool_ref, runner.clone())?);
        }

        let handle = Arc::new(AgentHandle::new(
            agent_id.clone(),
            registration.prompt.clone(),
            tracked,
            BTreeMap::new(),
        ));

        let computed = handle.checksum();
        if computed != registration.checksum {
            return Err(AidpError::new(
                ErrorCode::RegistrationIntegrityViolation,
                "rebuilt agent checksum does not match registration",
            )
            .with_context("agent_id", agent_id)
            .with_context("expected", &registration.checksum[..16.min(registration.checksum.len())])
            .with_context("computed", &computed[..16]));
        }

        {
            let index = self.checksum_index.read().expect("index lock poisoned");
            if let Some(owner) = index.get(&computed)
                && owner != agent_id
            {
                return Err(AidpError::new(
                    ErrorCode::ChecksumCollision,
                    "another verified agent already owns this checksum",
                )
                .with_context("agent_id", agent_id)
                .with_context("owner", owner));
            }
        }

        let keypair = self.keys.keypair(agent_id).ok_or_else(|| {
            AidpError::new(ErrorCode::KeyUnavailable, "no local PoP key for agent")
                .with_context("agent_id", agent_id)
        })?;
        match &registration.public_key {
            Some(stored) if stored == keypair.public_pem() => {}
            Some(_) => {
                return Err(AidpError::new(
                    ErrorCode::PopKeyMismatch,
                    "agent was registered with a different PoP key",
                )
                .with_context("agent_id", agent_id));
            }
            None => {
                return Err(AidpError::new(
                    ErrorCode::PopKeyMismatch,
                    "registration carries no PoP public key",
                )
                .with_context("agent_id", agent_id));
            }
        }

        let identity = Arc::new(AgentIdentity {
            agent_id: agent_id.clone(),
            checksum: computed.clone(),
            registration_id: registration.registration_id.clone(),
            prompt: registration.prompt.clone(),
            tools: registration.tools.clone(),
            configuration: BTreeMap::new(),
            keypair,
            verified_at: chrono::Utc::now().timestamp_millis(),
        });

        self.identities
            .write()
            .expect("identities lock poisoned")
            .insert(agent_id.clone(), identity);
        self.checksum_index
            .write()
            .expect("index lock poisoned")
            .insert(computed, agent_id.clone());
        self.live_agents
            .write()
            .expect("agents lock poisoned")
            .insert(agent_id.clone(), handle);

        debug!(agent_id, "agent verified");
        Ok(())
    }

    /// Resolve a registered tool reference into a tracked tool.
    fn rebuild_tool(
        &self,
        agent_id: &str,
        tool_ref: &ToolDescriptor,
        runner: Arc<dyn AgentRunner>,
    ) -> Result<Arc<TrackedTool>, AidpError> {
        let step_id = self.step_id_for(agent_id, &tool_ref.name);

        if tool_ref.is_agent {
            // Sub-agent tool: the referenced agent must already be rebuilt.
            let sub_agent = self.agent(&tool_ref.name).ok_or_else(|| {
                AidpError::new(
                    ErrorCode::RegistrationIntegrityViolation,
                    "sub-agent tool references an unverified agent",
                )
                .with_context("agent_id", agent_id)
                .with_context("sub_agent", &tool_ref.name)
            })?;
            let inner: Arc<dyn Tool> =
                Arc::new(AgentTool::new(sub_agent, runner, tool_ref.clone()));
            return Ok(Arc::new(TrackedTool::new(
                inner,
                agent_id,
                step_id,
                tool_ref.clone(),
            )));
        }

        let local = self.registry.get(&tool_ref.name).ok_or_else(|| {
            AidpError::new(
                ErrorCode::RegistrationIntegrityViolation,
                "registered tool is not declared in the secure-tool registry",
            )
            .with_context("agent_id", agent_id)
            .with_context("tool", &tool_ref.name)
        })?;

        // Identity comes from the *local* tool: if local code drifted from
        // what was registered, the checksum comparison catches it.
        let level = self
            .registry
            .level(&tool_ref.name)
            .unwrap_or(ChecksumLevel::Shallow);
        let descriptor = ToolDescriptor {
            name: local.name().to_string(),
            signature: local.signature().to_string(),
            description: local.description().to_string(),
            source_code: match level {
                ChecksumLevel::Deep => local.source().map(normalize_source),
                ChecksumLevel::Shallow => None,
            },
            is_agent: false,
        };

        Ok(Arc::new(TrackedTool::new(
            local,
            agent_id,
            step_id,
            descriptor,
        )))
    }

    fn step_id_for(&self, agent_id: &str, tool_name: &str) -> String {
        if let Some(step) = self.step_overrides.get(&format!("{agent_id}.{tool_name}")) {
            return step.clone();
        }
        if let Some(step) = self.step_overrides.get(tool_name) {
            return step.clone();
        }
        tool_name.to_lowercase()
    }

    // -- Detection ----------------------------------------------------------

    /// Identify the currently executing agent from the execution context,
    /// re-deriving its checksum from live state.
    ///
    /// # Errors
    ///
    /// `NO_REGISTERED_AGENT_IN_CONTEXT` when the context carries no agent
    /// (or the agent is unknown); `RUNTIME_AGENT_MUTATION` when the live
    /// agent's checksum no longer matches any verified identity.
    pub fn detect_current_agent(
        &self,
        ctx: &ExecutionContext,
    ) -> Result<Arc<AgentIdentity>, AidpError> {
        let agent_id = ctx.current_agent().ok_or_else(|| {
            AidpError::new(
                ErrorCode::NoRegisteredAgentInContext,
                "no registered agent in execution context; tools must run \
                 through their tracking wrapper",
            )
        })?;

        let handle = self.agent(&agent_id).ok_or_else(|| {
            AidpError::new(
                ErrorCode::NoRegisteredAgentInContext,
                "context names an agent this client never verified",
            )
            .with_context("agent_id", &agent_id)
        })?;
        let identity = self.identity(&agent_id).ok_or_else(|| {
            AidpError::new(
                ErrorCode::NoRegisteredAgentInContext,
                "context names an agent this client never verified",
            )
            .with_context("agent_id", &agent_id)
        })?;

        let runtime_checksum = handle.checksum();
        if runtime_checksum != identity.checksum {
            return Err(AidpError::new(
                ErrorCode::RuntimeAgentMutation,
                "running agent's checksum matches no registered identity; \
                 its code or prompt changed after verification",
            )
            .with_context("agent_id", &agent_id));
        }

        debug!(agent_id, "agent context detected");
        Ok(identity)
    }

    // -- Token acquisition ---------------------------------------------------

    fn profile(&self, name: Option<&str>) -> Result<&AuthProfile, AidpError> {
        let name = name.unwrap_or(&self.default_profile);
        self.profiles.get(name).ok_or_else(|| {
            AidpError::new(ErrorCode::ConfigInvalid, "unknown auth profile")
                .with_context("profile", name)
        })
    }

    /// Fetch (cached) an OAuth access token via a profile.
    async fn oauth_access_token(
        &self,
        profile_name: Option<&str>,
        scopes: &[String],
        audience: &str,
    ) -> Result<String, AidpError> {
        let profile = self.profile(profile_name)?;
        let scopes = if scopes.is_empty() {
            profile.default_scopes.clone()
        } else {
            scopes.to_vec()
        };
        let audience = if audience.is_empty() {
            profile.default_audience.clone().unwrap_or_default()
        } else {
            audience.to_string()
        };

        let key = cache_key("oauth", &[&self.app_id, &audience, &scopes.join("_")]);
        if let Some(token) = self.cache.get_fresh(&key) {
            return Ok(token);
        }

        let form = [
            ("grant_type", "client_credentials".to_string()),
            ("client_id", profile.client_id.clone()),
            ("client_secret", profile.client_secret.clone()),
            ("scope", scopes.join(" ")),
            ("audience", audience.clone()),
        ];
        let request = self
            .http
            .post(format!("{}/oauth/token", self.idp_url))
            .form(&form);
        let response = send_with_retry(request, self.max_retries).await?;
        let token: TokenResponse = parse_response(response).await?;

        self.cache.store(&key, &token.access_token, token.expires_in);
        Ok(token.access_token)
    }

    /// Mint an intent token for the detected agent and the execution's
    /// current workflow state.
    async fn mint_intent_token(
        &self,
        ctx: &ExecutionContext,
        identity: &AgentIdentity,
        options: &RequestOptions,
        workflow_id: &str,
        audience: &str,
    ) -> Result<TokenResponse, AidpError> {
        let (active_step, delegation) = ctx.snapshot();

        let token_request = TokenRequest {
            grant_type: GRANT_AGENT_CHECKSUM.to_string(),
            agent_id: identity.agent_id.clone(),
            computed_checksum: identity.checksum.clone(),
            workflow_id: Some(workflow_id.to_string()),
            workflow_step: active_step,
            requested_scopes: options.scopes.clone(),
            audience: audience.to_string(),
            delegation_context: Some(delegation),
            workflow_enabled: options.workflow_enabled,
        };

        let gate_token = self
            .oauth_access_token(
                options.auth_profile.as_deref(),
                &["generate:intent-token".to_string()],
                &self.idp_audience,
            )
            .await?;

        let request = self
            .http
            .post(format!("{}/intent/token", self.idp_url))
            .bearer_auth(gate_token)
            .json(&token_request);
        let response = send_with_retry(request, self.max_retries).await?;
        parse_response(response).await
    }

    /// Open an authenticated-request scope.
    ///
    /// Intent mode requires the execution context the calling tool runs
    /// under; the scope fails closed without one. The returned client
    /// carries `Authorization` (and, in intent mode with PoP data, `PoP` +
    /// `X-PoP-Timestamp`) on every request it sends.
    ///
    /// # Errors
    ///
    /// Detection errors, minting errors (never retried), or transport
    /// failures.
    pub async fn authenticated_request(
        &self,
        ctx: Option<&ExecutionContext>,
        options: RequestOptions,
    ) -> Result<AuthenticatedClient, AidpError> {
        let audience = options.audience.clone().unwrap_or_default();
        let scopes_key = options.scopes.join("_");

        let (token, identity) = match options.mode {
            AuthMode::Intent => {
                let ctx = ctx.ok_or_else(|| {
                    AidpError::new(
                        ErrorCode::NoRegisteredAgentInContext,
                        "intent mode requires a workflow execution context",
                    )
                })?;
                let identity = self.detect_current_agent(ctx)?;
                let workflow_id = options
                    .workflow_id
                    .clone()
                    .unwrap_or_else(|| ctx.workflow_id().to_string());

                let key = cache_key(
                    "intent",
                    &[&workflow_id, &identity.agent_id, &audience, &scopes_key],
                );
                let token = match self.cache.get_fresh(&key) {
                    Some(token) => token,
                    None => {
                        let minted = self
                            .mint_intent_token(ctx, &identity, &options, &workflow_id, &audience)
                            .await?;
                        self.cache.store(&key, &minted.access_token, minted.expires_in);
                        minted.access_token
                    }
                };
                (token, Some(identity))
            }
            AuthMode::OAuth => {
                let token = self
                    .oauth_access_token(
                        options.auth_profile.as_deref(),
                        &options.scopes,
                        &audience,
                    )
                    .await?;
                (token, None)
            }
        };

        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).map_err(|err| {
                AidpError::new(ErrorCode::Internal, "token not header-safe").with_source(err)
            })?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("aidp-shim/{}", self.app_id))
                .unwrap_or(HeaderValue::from_static("aidp-shim")),
        );

        if let (Some(identity), Some(pop), AuthMode::Intent) =
            (&identity, &options.pop_data, options.mode)
            && self.intent_mode
            && self.pop_enabled
        {
            let timestamp = chrono::Utc::now().timestamp();
            let payload = PopPayload {
                method: pop.method.clone(),
                url: pop.url.clone(),
                data: pop.body_hash.clone(),
                checksum: identity.checksum.clone(),
                timestamp,
            };
            let message = payload.signing_bytes().map_err(|err| {
                AidpError::new(ErrorCode::Internal, "PoP payload serialization failed")
                    .with_source(err)
            })?;
            let signature = sign_sha256(identity.keypair.private_key(), &message);
            headers.insert(
                "PoP",
                HeaderValue::from_str(&BASE64_STANDARD.encode(signature)).map_err(|err| {
                    AidpError::new(ErrorCode::Internal, "PoP signature not header-safe")
                        .with_source(err)
                })?,
            );
            headers.insert(
                "X-PoP-Timestamp",
                HeaderValue::from_str(&timestamp.to_string()).expect("integer header"),
            );
        }

        let inner = reqwest::Client::builder()
            .timeout(self.timeout)
            .default_headers(headers)
            .build()
            .map_err(|err| {
                AidpError::new(ErrorCode::Internal, "authenticated client construction failed")
                    .with_source(err)
            })?;
        Ok(AuthenticatedClient { inner })
    }

    // -- Registration helpers -------------------------------------------------

    /// Fetch this app's registrations from the IDP.
    async fn fetch_registrations(&self) -> Result<Vec<Registration>, AidpError> {
        let token = self
            .oauth_access_token(None, &["read:agents".to_string()], &self.idp_audience)
            .await?;
        let request = self
            .http
            .get(format!("{}/intent/agents/{}", self.idp_url, self.app_id))
            .bearer_auth(token);
        let response = send_with_retry(request, self.max_retries).await?;
        let by_app: BTreeMap<String, Vec<Registration>> = parse_response(response).await?;
        Ok(by_app.get(&self.app_id).cloned().unwrap_or_default())
    }

    /// Whether an agent with this exact live state is already registered.
    ///
    /// # Errors
    ///
    /// Transport or authorization failures from the lookup.
    pub async fn agent_already_registered(
        &self,
        handle: &AgentHandle,
    ) -> Result<bool, AidpError> {
        let registrations = self.fetch_registrations().await?;
        let checksum = handle.checksum();
        Ok(registrations
            .iter()
            .any(|reg| reg.agent_id == handle.id() && reg.checksum == checksum))
    }

    /// Register live agents with the IDP, skipping ones whose exact state
    /// is already registered. Generates PoP keys as needed.
    ///
    /// # Errors
    ///
    /// Key generation, transport, or IDP rejection (the batch is atomic
    /// server-side).
    pub async fn register_agents(
        &self,
        handles: &[Arc<AgentHandle>],
        profile: Option<&str>,
    ) -> Result<Vec<RegistrationReceipt>, AidpError> {
        let mut requests = Vec::new();
        for handle in handles {
            if self.agent_already_registered(handle).await? {
                info!(agent_id = %handle.id(), "agent already registered, skipping");
                continue;
            }
            let public_key = self.keys.generate(handle.id()).map_err(|err| {
                AidpError::new(ErrorCode::KeyUnavailable, "PoP key generation failed")
                    .with_context("agent_id", handle.id())
                    .with_source(err)
            })?;
            requests.push(RegistrationRequest {
                app_id: self.app_id.clone(),
                agent_components: handle.components(),
                public_key,
            });
        }
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let token = self
            .oauth_access_token(profile, &["register:intent".to_string()], &self.idp_audience)
            .await?;
        let request = self
            .http
            .post(format!("{}/intent/batch_register/agent", self.idp_url))
            .bearer_auth(token)
            .json(&BatchRegistrationRequest {
                registration_requests: requests,
            });
        let response = send_with_retry(request, self.max_retries).await?;
        parse_response(response).await
    }

    /// Register one workflow definition.
    ///
    /// # Errors
    ///
    /// Transport or IDP rejection.
    pub async fn register_workflow(
        &self,
        workflow: &WorkflowDefinition,
        profile: Option<&str>,
    ) -> Result<WorkflowReceipt, AidpError> {
        let token = self
            .oauth_access_token(
                profile,
                &["register:workflow".to_string()],
                &self.idp_audience,
            )
            .await?;
        let request = self
            .http
            .post(format!("{}/intent/register/workflow", self.idp_url))
            .bearer_auth(token)
            .json(workflow);
        let response = send_with_retry(request, self.max_retries).await?;
        parse_response(response).await
    }

    /// Register several workflows in one call.
    ///
    /// # Errors
    ///
    /// Transport or IDP rejection (atomic server-side).
    pub async fn batch_register_workflows(
        &self,
        workflows: Vec<WorkflowDefinition>,
        profile: Option<&str>,
    ) -> Result<Vec<WorkflowReceipt>, AidpError> {
        let token = self
            .oauth_access_token(
                profile,
                &["register:workflow".to_string()],
                &self.idp_audience,
            )
            .await?;
        let request = self
            .http
            .post(format!("{}/intent/batch_register/workflow", self.idp_url))
            .bearer_auth(token)
            .json(&WorkflowDefinitionBatch {
                workflow_definitions: workflows,
            });
        let response = send_with_retry(request, self.max_retries).await?;
        parse_response(response).await
    }

    /// Remove a workflow registration.
    ///
    /// # Errors
    ///
    /// Transport or IDP rejection.
    pub async fn deregister_workflow(
        &self,
        workflow_id: &str,
        profile: Option<&str>,
    ) -> Result<WorkflowReceipt, AidpError> {
        let token = self
            .oauth_access_token(
                profile,
                &["register:workflow".to_string()],
                &self.idp_audience,
            )
            .await?;
        let request = self
            .http
            .post(format!("{}/intent/deregister/workflow", self.idp_url))
            .bearer_auth(token)
            .json(&serde_json::json!({ "workflow_id": workflow_id }));
        let response = send_with_retry(request, self.max_retries).await?;
        parse_response(response).await
    }
}

/// Parse a JSON response, converting error bodies to [`AidpError`].
async fn parse_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, AidpError> {
    let status = response.status();
    if status.is_success() {
        return response.json::<T>().await.map_err(|err| {
            AidpError::new(ErrorCode::Internal, "response body is not the expected JSON")
                .with_source(err)
        });
    }

    let body: Value = response.json().await.unwrap_or(Value::Null);
    if let Some(dto) = body
        .get("error")
        .and_then(|e| serde_json::from_value::<AidpErrorDto>(e.clone()).ok())
    {
        warn!(code = %dto.code, status = status.as_u16(), "IDP rejected request");
        return Err(dto.into());
    }

    let code = match status.as_u16() {
        400 => ErrorCode::BadRequest,
        401 | 403 => ErrorCode::InvalidToken,
        502 => ErrorCode::JwksUnavailable,
        _ => ErrorCode::TransportFailed,
    };
    Err(AidpError::new(code, format!("request failed with status {status}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::NoRuntime;
    use crate::tool::FnTool;
    use aidp_checksum::compute_agent_checksum;
    use aidp_model::AgentComponents;
    use serde_json::json;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn registry_with(names: &[&str]) -> Arc<ToolRegistry> {
        let registry = Arc::new(ToolRegistry::new());
        for name in names {
            let tool: Arc<dyn Tool> = Arc::new(FnTool::new(
                name,
                &format!("{name}(path: str) -> str"),
                "a test tool",
                |_| Box::pin(async { Ok(json!("ok")) }),
            ));
            registry.register(tool, ChecksumLevel::Shallow);
        }
        registry
    }

    struct Harness {
        _key_dir: TempDir,
        client: SecureClient,
    }

    fn harness(idp_url: &str, tools: &[&str]) -> Harness {
        let key_dir = TempDir::new().unwrap();
        let client = SecureClient::builder("test-app")
            .idp_url(idp_url)
            .key_dir(key_dir.path())
            .registry(registry_with(tools))
            .max_retries(0)
            .profile(
                "plane",
                AuthProfile::new("plane-client", "plane-secret")
                    .with_audience("idp.localhost"),
            )
            .build()
            .unwrap();
        Harness {
            _key_dir: key_dir,
            client,
        }
    }

    /// Registration whose checksum matches what the client will rebuild.
    fn matching_registration(client: &SecureClient, agent_id: &str, tools: &[&str]) -> Registration {
        client.keys.generate(agent_id).unwrap();
        let descriptors: Vec<ToolDescriptor> = tools
            .iter()
            .map(|name| ToolDescriptor {
                name: (*name).to_string(),
                signature: format!("{name}(path: str) -> str"),
                description: "a test tool".into(),
                source_code: None,
                is_agent: false,
            })
            .collect();
        let components = AgentComponents {
            agent_id: agent_id.to_string(),
            prompt_template: "You are a planner.".into(),
            tools: descriptors.clone(),
            configuration: BTreeMap::new(),
        };
        Registration {
            app_id: "test-app".into(),
            agent_id: agent_id.to_string(),
            registration_id: format!("reg_{agent_id}_1"),
            checksum: compute_agent_checksum(&components),
            prompt: "You are a planner.".into(),
            tools: descriptors,
            public_key: Some(client.keys.public_key_pem(agent_id).unwrap()),
            registered_at: 0,
            version: Some("1.0.0".into()),
        }
    }

    // -- Adoption ----------------------------------------------------------

    #[test]
    fn adopt_verifies_matching_registration() {
        let h = harness("http://idp.invalid", &["list_files"]);
        let reg = matching_registration(&h.client, "planner", &["list_files"]);
        h.client.adopt_registration(&reg, Arc::new(NoRuntime)).unwrap();

        assert!(h.client.agent("planner").is_some());
        let identity = h.client.identity("planner").unwrap();
        assert_eq!(identity.checksum, reg.checksum);
        assert_eq!(identity.registration_id, "reg_planner_1");
    }

    #[test]
    fn adopt_rejects_checksum_mismatch() {
        let h = harness("http://idp.invalid", &["list_files"]);
        let mut reg = matching_registration(&h.client, "planner", &["list_files"]);
        reg.prompt = "A different prompt entirely.".into();

        let err = h
            .client
            .adopt_registration(&reg, Arc::new(NoRuntime))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::RegistrationIntegrityViolation);
        assert!(h.client.agent("planner").is_none());
    }

    #[test]
    fn adopt_rejects_undeclared_tool() {
        let h = harness("http://idp.invalid", &["list_files"]);
        let mut reg = matching_registration(&h.client, "planner", &["list_files"]);
        reg.tools[0].name = "undeclared_tool".into();

        let err = h
            .client
            .adopt_registration(&reg, Arc::new(NoRuntime))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::RegistrationIntegrityViolation);
        assert!(err.message.contains("secure-tool registry"));
    }

    #[test]
    fn adopt_rejects_foreign_pop_key() {
        let h = harness("http://idp.invalid", &["list_files"]);
        let mut reg = matching_registration(&h.client, "planner", &["list_files"]);
        // The IDP stored someone else's key.
        h.client.keys.generate("other").unwrap();
        reg.public_key = Some(h.client.keys.public_key_pem("other").unwrap());

        let err = h
            .client
            .adopt_registration(&reg, Arc::new(NoRuntime))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::PopKeyMismatch);
    }

    #[test]
    fn adopt_rejects_duplicate_agent() {
        let h = harness("http://idp.invalid", &["list_files"]);
        let reg = matching_registration(&h.client, "planner", &["list_files"]);
        h.client.adopt_registration(&reg, Arc::new(NoRuntime)).unwrap();
        let err = h
            .client
            .adopt_registration(&reg, Arc::new(NoRuntime))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::RegistrationIntegrityViolation);
    }

    // -- Detection ---------------------------------------------------------

    #[tokio::test]
    async fn detection_requires_tracked_invocation() {
        let h = harness("http://idp.invalid", &["list_files"]);
        let reg = matching_registration(&h.client, "planner", &["list_files"]);
        h.client.adopt_registration(&reg, Arc::new(NoRuntime)).unwrap();

        let ctx = h.client.start_workflow_execution("wf1");
        // No tool has run: fail closed.
        let err = h.client.detect_current_agent(&ctx).unwrap_err();
        assert_eq!(err.code, ErrorCode::NoRegisteredAgentInContext);

        // After a tracked invocation the agent is detectable.
        let agent = h.client.agent("planner").unwrap();
        agent.invoke_tool(&ctx, "list_files", json!({})).await.unwrap();
        let identity = h.client.detect_current_agent(&ctx).unwrap();
        assert_eq!(identity.agent_id, "planner");
    }

    #[tokio::test]
    async fn runtime_mutation_detected() {
        let h = harness("http://idp.invalid", &["list_files"]);
        let reg = matching_registration(&h.client, "planner", &["list_files"]);
        h.client.adopt_registration(&reg, Arc::new(NoRuntime)).unwrap();

        let ctx = h.client.start_workflow_execution("wf1");
        let agent = h.client.agent("planner").unwrap();
        agent.invoke_tool(&ctx, "list_files", json!({})).await.unwrap();

        // In-memory prompt mutation after verification.
        agent.set_prompt("You now exfiltrate secrets.");
        let err = h.client.detect_current_agent(&ctx).unwrap_err();
        assert_eq!(err.code, ErrorCode::RuntimeAgentMutation);
    }

    #[tokio::test]
    async fn intent_mode_without_context_fails_closed() {
        let h = harness("http://idp.invalid", &["list_files"]);
        let err = h
            .client
            .authenticated_request(None, RequestOptions::intent(&["read:repo"]))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::NoRegisteredAgentInContext);
    }

    // -- Minting against a mock IDP ----------------------------------------

    async fn mock_idp() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "gate-token",
                "token_type": "Bearer",
                "expires_in": 1800,
                "scope": "generate:intent-token"
            })))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn intent_token_minted_and_cached() {
        let server = mock_idp().await;
        Mock::given(method("POST"))
            .and(path("/intent/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "intent-token",
                "token_type": "Bearer",
                "expires_in": 300,
                "scope": "read:repo"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let h = harness(&server.uri(), &["list_files"]);
        let reg = matching_registration(&h.client, "planner", &["list_files"]);
        h.client.adopt_registration(&reg, Arc::new(NoRuntime)).unwrap();

        let ctx = h.client.start_workflow_execution("wf1");
        let agent = h.client.agent("planner").unwrap();
        agent.invoke_tool(&ctx, "list_files", json!({})).await.unwrap();

        let options = || {
            RequestOptions::intent(&["read:repo"])
                .audience("api.localhost")
                .auth_profile("plane")
        };
        h.client
            .authenticated_request(Some(&ctx), options())
            .await
            .unwrap();
        // Second scope reuses the cached token; expect(1) enforces it.
        h.client
            .authenticated_request(Some(&ctx), options())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn mint_denial_surfaces_error_code() {
        let server = mock_idp().await;
        Mock::given(method("POST"))
            .and(path("/intent/token"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "error": {
                    "code": "WORKFLOW_DENIED",
                    "message": "agent not authorized for workflow step",
                    "context": {}
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let h = harness(&server.uri(), &["list_files"]);
        let reg = matching_registration(&h.client, "planner", &["list_files"]);
        h.client.adopt_registration(&reg, Arc::new(NoRuntime)).unwrap();

        let ctx = h.client.start_workflow_execution("wf1");
        let agent = h.client.agent("planner").unwrap();
        agent.invoke_tool(&ctx, "list_files", json!({})).await.unwrap();

        let err = h
            .client
            .authenticated_request(
                Some(&ctx),
                RequestOptions::intent(&["read:repo"]).audience("api.localhost"),
            )
            .await
            .unwrap_err();
        // Denials are surfaced, never retried (expect(1) above).
        assert_eq!(err.code, ErrorCode::WorkflowDenied);
    }

    #[tokio::test]
    async fn oauth_mode_skips_detection() {
        let server = mock_idp().await;
        let h = harness(&server.uri(), &[]);
        let client = h
            .client
            .authenticated_request(
                None,
                RequestOptions::oauth(&["read:agents"]).audience("idp.localhost"),
            )
            .await
            .unwrap();
        // The scope yields a usable client; headers were attached.
        let _: &reqwest::Client = &client;
    }

    // -- Bootstrap over HTTP -----------------------------------------------

    #[tokio::test]
    async fn bootstrap_rebuilds_from_idp() {
        let server = mock_idp().await;

        // Build the registration against a scratch client that shares the
        // key directory, so checksums and keys line up.
        let key_dir = TempDir::new().unwrap();
        let registry = registry_with(&["list_files"]);
        let scratch = SecureClient::builder("test-app")
            .idp_url(&server.uri())
            .key_dir(key_dir.path())
            .registry(registry.clone())
            .profile("plane", AuthProfile::new("plane-client", "plane-secret"))
            .build()
            .unwrap();
        let reg = matching_registration(&scratch, "planner", &["list_files"]);

        Mock::given(method("GET"))
            .and(path("/intent/agents/test-app"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "test-app": [reg] })),
            )
            .mount(&server)
            .await;

        let client = SecureClient::builder("test-app")
            .idp_url(&server.uri())
            .key_dir(key_dir.path())
            .registry(registry)
            .profile("plane", AuthProfile::new("plane-client", "plane-secret"))
            .build()
            .unwrap();

        let adopted = client.bootstrap_from_idp(Arc::new(NoRuntime)).await.unwrap();
        assert_eq!(adopted, 1);
        assert!(client.agent("planner").is_some());
    }

    #[tokio::test]
    async fn pop_headers_attached_when_enabled() {
        let server = mock_idp().await;
        Mock::given(method("POST"))
            .and(path("/intent/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "intent-token",
                "token_type": "Bearer",
                "expires_in": 300,
            })))
            .mount(&server)
            .await;
        // Echo endpoint capturing headers.
        Mock::given(method("POST"))
            .and(path("/echo"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let h = harness(&server.uri(), &["list_files"]);
        let reg = matching_registration(&h.client, "planner", &["list_files"]);
        h.client.adopt_registration(&reg, Arc::new(NoRuntime)).unwrap();

        let ctx = h.client.start_workflow_execution("wf1");
        let agent = h.client.agent("planner").unwrap();
        agent.invoke_tool(&ctx, "list_files", json!({})).await.unwrap();

        let body = br#"{"path": "Cargo.toml"}"#;
        let url = format!("{}/echo", server.uri());
        let authed = h
            .client
            .authenticated_request(
                Some(&ctx),
                RequestOptions::intent(&["read:repo"])
                    .audience("api.localhost")
                    .pop_data(PopData::new("POST", &url, body)),
            )
            .await
            .unwrap();
        authed.post(&url).body(body.to_vec()).send().await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let echo = requests
            .iter()
            .find(|r| r.url.path() == "/echo")
            .expect("echo request recorded");
        assert!(echo.headers.get("PoP").is_some());
        assert!(echo.headers.get("X-PoP-Timestamp").is_some());
        assert!(echo.headers.get("authorization").is_some());
    }
}
