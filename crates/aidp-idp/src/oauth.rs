// SPDX-License-Identifier: MIT OR Apache-2.0
//! The OAuth subsystem: client-credentials issuance, JWKS publication,
//! and diagnostic introspection.

use aidp_error::{AidpError, ErrorCode};
use aidp_keys::jwk_from_public_key;
use aidp_model::claims::{Audience, JwksDocument, TokenClaims};
use aidp_model::{GRANT_CLIENT_CREDENTIALS, TokenResponse};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use rsa::RsaPrivateKey;
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;
use uuid::Uuid;

/// Lifetime of OAuth access tokens, seconds.
pub const ACCESS_TOKEN_TTL_SECS: u64 = 30 * 60;

// ---------------------------------------------------------------------------
// Signing key
// ---------------------------------------------------------------------------

/// The IDP instance's RSA signing key, advertised via JWKS under a stable
/// `kid`.
pub struct IdpSigningKey {
    kid: String,
    encoding: EncodingKey,
    decoding: DecodingKey,
    jwks: JwksDocument,
}

impl IdpSigningKey {
    /// Generate a fresh 2048-bit signing key with a random `kid`.
    ///
    /// # Errors
    ///
    /// `KEY_UNAVAILABLE` if generation or encoding fails.
    pub fn generate() -> Result<Self, AidpError> {
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).map_err(|err| {
            AidpError::new(ErrorCode::KeyUnavailable, "signing key generation failed")
                .with_source(err)
        })?;
        let pem = private.to_pkcs8_pem(LineEnding::LF).map_err(|err| {
            AidpError::new(ErrorCode::KeyUnavailable, "signing key encoding failed")
                .with_source(err)
        })?;
        let encoding = EncodingKey::from_rsa_pem(pem.as_bytes()).map_err(|err| {
            AidpError::new(ErrorCode::KeyUnavailable, "signing key not usable for RS256")
                .with_source(err)
        })?;

        let kid = Uuid::new_v4().to_string();
        let jwk = jwk_from_public_key(&private.to_public_key(), Some(kid.clone()));
        let decoding = DecodingKey::from_rsa_components(&jwk.n, &jwk.e).map_err(|err| {
            AidpError::new(ErrorCode::KeyUnavailable, "signing key JWK rejected")
                .with_source(err)
        })?;

        info!(kid, "IDP signing key generated");
        Ok(Self {
            kid,
            encoding,
            decoding,
            jwks: JwksDocument { keys: vec![jwk] },
        })
    }

    /// The advertised key id.
    #[must_use]
    pub fn kid(&self) -> &str {
        &self.kid
    }

    /// The verification half, for verifying our own tokens.
    #[must_use]
    pub fn decoding_key(&self) -> &DecodingKey {
        &self.decoding
    }

    /// The published JWKS document.
    #[must_use]
    pub fn jwks(&self) -> &JwksDocument {
        &self.jwks
    }

    /// Sign a claim set as a compact RS256 JWT with this key's `kid`.
    ///
    /// # Errors
    ///
    /// `INTERNAL` if serialization fails.
    pub fn sign<T: Serialize>(&self, claims: &T) -> Result<String, AidpError> {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.kid.clone());
        encode(&header, claims, &self.encoding).map_err(|err| {
            AidpError::new(ErrorCode::Internal, "token signing failed").with_source(err)
        })
    }
}

// ---------------------------------------------------------------------------
// Client directory
// ---------------------------------------------------------------------------

/// One registered OAuth client.
#[derive(Debug, Clone)]
pub struct OAuthClient {
    /// Shared secret for `client_credentials`.
    pub client_secret: String,
    /// Scopes the client may request.
    pub scopes: Vec<String>,
    /// Audiences the client may mint tokens for.
    pub audiences: Vec<String>,
    /// Tenant identifier stamped into issued tokens.
    pub tenant: String,
}

/// In-memory client table.
#[derive(Debug, Clone, Default)]
pub struct ClientDirectory {
    clients: BTreeMap<String, OAuthClient>,
}

impl ClientDirectory {
    /// An empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a client, builder-style.
    #[must_use]
    pub fn with_client(mut self, client_id: impl Into<String>, client: OAuthClient) -> Self {
        self.clients.insert(client_id.into(), client);
        self
    }

    /// Look up a client.
    #[must_use]
    pub fn get(&self, client_id: &str) -> Option<&OAuthClient> {
        self.clients.get(client_id)
    }

    /// A development directory with the clients the shim profiles expect:
    /// a plane client for bootstrap/minting, a registration admin, and an
    /// API client with domain scopes.
    #[must_use]
    pub fn dev_defaults(idp_audience: &str, api_audience: &str) -> Self {
        Self::new()
            .with_client(
                "plane-client",
                OAuthClient {
                    client_secret: "plane-secret".into(),
                    scopes: vec!["read:agents".into(), "generate:intent-token".into()],
                    audiences: vec![idp_audience.to_string()],
                    tenant: "org:default".into(),
                },
            )
            .with_client(
                "registration-admin",
                OAuthClient {
                    client_secret: "registration-secret".into(),
                    scopes: vec!["register:intent".into(), "register:workflow".into()],
                    audiences: vec![idp_audience.to_string()],
                    tenant: "org:default".into(),
                },
            )
            .with_client(
                "api-client",
                OAuthClient {
                    client_secret: "api-secret".into(),
                    scopes: vec![
                        "read:repo".into(),
                        "write:repo".into(),
                        "read:sbom".into(),
                        "write:sbom".into(),
                    ],
                    audiences: vec![api_audience.to_string()],
                    tenant: "org:default".into(),
                },
            )
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Form body of `POST /oauth/token`.
#[derive(Debug, Deserialize)]
pub struct OAuthTokenForm {
    /// Must be `client_credentials`.
    pub grant_type: String,
    /// Client identifier.
    pub client_id: String,
    /// Client secret.
    pub client_secret: String,
    /// Space-delimited requested scopes; empty means all allowed scopes.
    #[serde(default)]
    pub scope: String,
    /// Space-delimited requested audiences; empty means all allowed.
    #[serde(default)]
    pub audience: String,
}

/// Form body of `POST /oauth/introspect`.
#[derive(Debug, Deserialize)]
pub struct IntrospectForm {
    /// The token to inspect.
    pub token: String,
}

/// Diagnostic introspection result. Claims are decoded *without*
/// verification; never use this for authorization decisions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntrospectResponse {
    /// Whether the token parsed at all.
    pub active: bool,
    /// Subject claim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    /// Scope claim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Expiry claim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    /// Audience claim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<Audience>,
    /// Issuer claim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    /// Token id claim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
}

// ---------------------------------------------------------------------------
// OAuth service
// ---------------------------------------------------------------------------

/// Issues OAuth access tokens for registered clients.
pub struct OAuthService {
    clients: ClientDirectory,
    issuer: String,
}

impl OAuthService {
    /// Create the service.
    #[must_use]
    pub fn new(clients: ClientDirectory, issuer: impl Into<String>) -> Self {
        Self {
            clients,
            issuer: issuer.into(),
        }
    }

    /// Handle a `client_credentials` token request.
    ///
    /// Requested scopes and audiences must be subsets of what the client is
    /// allowed; empty requests default to the full allowed sets.
    ///
    /// # Errors
    ///
    /// `BAD_REQUEST` for unsupported grant types or scope/audience
    /// violations, `INVALID_TOKEN` for bad credentials.
    pub fn token(
        &self,
        form: &OAuthTokenForm,
        key: &IdpSigningKey,
    ) -> Result<TokenResponse, AidpError> {
        if form.grant_type != GRANT_CLIENT_CREDENTIALS {
            return Err(AidpError::new(ErrorCode::BadRequest, "unsupported grant type")
                .with_context("grant_type", &form.grant_type));
        }

        let client = self
            .clients
            .get(&form.client_id)
            .filter(|c| c.client_secret == form.client_secret)
            .ok_or_else(|| AidpError::new(ErrorCode::InvalidToken, "invalid client credentials"))?;

        let requested_scopes: Vec<String> = if form.scope.trim().is_empty() {
            client.scopes.clone()
        } else {
            form.scope.split_whitespace().map(str::to_string).collect()
        };
        for scope in &requested_scopes {
            if !client.scopes.contains(scope) {
                return Err(AidpError::new(ErrorCode::BadRequest, "scope not allowed")
                    .with_context("scope", scope));
            }
        }

        let requested_audiences: Vec<String> = if form.audience.trim().is_empty() {
            client.audiences.clone()
        } else {
            form.audience
                .split_whitespace()
                .map(str::to_string)
                .collect()
        };
        for audience in &requested_audiences {
            if !client.audiences.contains(audience) {
                return Err(AidpError::new(ErrorCode::BadRequest, "audience not allowed")
                    .with_context("audience", audience));
            }
        }

        let now = chrono::Utc::now().timestamp();
        let claims = TokenClaims {
            iss: self.issuer.clone(),
            sub: format!("client:{}", form.client_id),
            aud: Audience::Many(requested_audiences),
            iat: now,
            exp: now + ACCESS_TOKEN_TTL_SECS as i64,
            jti: Uuid::new_v4().to_string(),
            scope: Some(requested_scopes.join(" ")),
            scp: None,
            tenant: Some(client.tenant.clone()),
            cnf: None,
            intent: None,
            agent_proof: None,
        };

        let token = key.sign(&claims)?;
        Ok(TokenResponse::bearer(
            token,
            ACCESS_TOKEN_TTL_SECS,
            &requested_scopes,
        ))
    }

    /// Decode a token without verification, for diagnostics only.
    #[must_use]
    pub fn introspect(&self, token: &str) -> IntrospectResponse {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        match decode::<TokenClaims>(token, &DecodingKey::from_secret(&[]), &validation) {
            Ok(data) => IntrospectResponse {
                active: true,
                sub: Some(data.claims.sub),
                scope: data.claims.scope,
                exp: Some(data.claims.exp),
                aud: Some(data.claims.aud),
                iss: Some(data.claims.iss),
                jti: Some(data.claims.jti),
            },
            Err(_) => IntrospectResponse::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> (OAuthService, IdpSigningKey) {
        let clients = ClientDirectory::dev_defaults("idp.localhost", "api.localhost");
        (
            OAuthService::new(clients, "http://idp.localhost"),
            IdpSigningKey::generate().unwrap(),
        )
    }

    fn form(client_id: &str, secret: &str, scope: &str, audience: &str) -> OAuthTokenForm {
        OAuthTokenForm {
            grant_type: GRANT_CLIENT_CREDENTIALS.into(),
            client_id: client_id.into(),
            client_secret: secret.into(),
            scope: scope.into(),
            audience: audience.into(),
        }
    }

    #[test]
    fn issues_token_for_valid_client() {
        let (service, key) = service();
        let response = service
            .token(
                &form("plane-client", "plane-secret", "read:agents", "idp.localhost"),
                &key,
            )
            .unwrap();
        assert_eq!(response.token_type, "Bearer");
        assert_eq!(response.expires_in, ACCESS_TOKEN_TTL_SECS);
        assert_eq!(response.scope.as_deref(), Some("read:agents"));
        // Three JWT segments.
        assert_eq!(response.access_token.split('.').count(), 3);
    }

    #[test]
    fn empty_scope_defaults_to_allowed_set() {
        let (service, key) = service();
        let response = service
            .token(&form("plane-client", "plane-secret", "", ""), &key)
            .unwrap();
        let scope = response.scope.unwrap();
        assert!(scope.contains("read:agents"));
        assert!(scope.contains("generate:intent-token"));
    }

    #[test]
    fn wrong_secret_rejected() {
        let (service, key) = service();
        let err = service
            .token(&form("plane-client", "wrong", "", ""), &key)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidToken);
    }

    #[test]
    fn unknown_client_rejected() {
        let (service, key) = service();
        let err = service.token(&form("ghost", "x", "", ""), &key).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidToken);
    }

    #[test]
    fn unsupported_grant_rejected() {
        let (service, key) = service();
        let mut f = form("plane-client", "plane-secret", "", "");
        f.grant_type = "password".into();
        let err = service.token(&f, &key).unwrap_err();
        assert_eq!(err.code, ErrorCode::BadRequest);
    }

    #[test]
    fn scope_escalation_rejected() {
        let (service, key) = service();
        let err = service
            .token(
                &form("plane-client", "plane-secret", "register:intent", ""),
                &key,
            )
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::BadRequest);
    }

    #[test]
    fn audience_escalation_rejected() {
        let (service, key) = service();
        let err = service
            .token(
                &form("plane-client", "plane-secret", "", "api.localhost"),
                &key,
            )
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::BadRequest);
    }

    #[test]
    fn jwks_contains_the_signing_kid() {
        let key = IdpSigningKey::generate().unwrap();
        let jwks = key.jwks();
        assert_eq!(jwks.keys.len(), 1);
        assert_eq!(jwks.keys[0].kid.as_deref(), Some(key.kid()));
        assert_eq!(jwks.keys[0].alg, "RS256");
    }

    #[test]
    fn introspect_reads_claims_without_verification() {
        let (service, key) = service();
        let response = service
            .token(&form("plane-client", "plane-secret", "", ""), &key)
            .unwrap();
        let introspection = service.introspect(&response.access_token);
        assert!(introspection.active);
        assert_eq!(introspection.sub.as_deref(), Some("client:plane-client"));
        assert_eq!(introspection.iss.as_deref(), Some("http://idp.localhost"));
    }

    #[test]
    fn introspect_garbage_is_inactive() {
        let (service, _) = service();
        let introspection = service.introspect("definitely.not.ajwt");
        assert!(!introspection.active);
        assert!(introspection.sub.is_none());
    }
}
