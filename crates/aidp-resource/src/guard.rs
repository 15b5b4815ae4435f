// SPDX-License-Identifier: MIT OR Apache-2.0
//! Phase-2 per-route checks: audience, scopes, and proof-of-possession.

use crate::layer::VerifiedToken;
use aidp_error::{AidpError, ErrorCode};
use aidp_keys::{public_key_from_jwk, verify_sha256};
use aidp_model::claims::TokenClaims;
use aidp_model::{PopPayload, sha256_hex};
use axum::http::HeaderMap;
use std::sync::Arc;
use tracing::warn;

/// Header carrying the base64 PoP signature.
pub const POP_HEADER: &str = "PoP";
/// Header echoing the signing timestamp.
pub const POP_TIMESTAMP_HEADER: &str = "X-PoP-Timestamp";

/// Extension point for deployments that cross-check the `intent` claim
/// against local policy. The default accepts everything.
pub trait IntentPolicy: Send + Sync {
    /// Return `false` to reject the request as intent drift.
    fn allow(&self, claims: &TokenClaims) -> bool;
}

/// The built-in allow-everything policy.
pub struct AllowAllIntents;

impl IntentPolicy for AllowAllIntents {
    fn allow(&self, _claims: &TokenClaims) -> bool {
        true
    }
}

/// PoP enforcement settings for a deployment.
#[derive(Clone)]
pub struct PopConfig {
    /// Whether PoP verification runs at all. Disabling it forfeits
    /// token-replay protection; intent mode deployments should keep it on.
    pub enabled: bool,
    /// Maximum accepted distance between the PoP timestamp and now.
    pub max_skew_secs: i64,
    /// Whether the intent claim is cross-checked after PoP.
    pub intent_mode: bool,
    /// The intent policy hook.
    pub intent_policy: Arc<dyn IntentPolicy>,
}

impl PopConfig {
    /// PoP on, intent mode on, default skew.
    #[must_use]
    pub fn enabled(max_skew_secs: i64) -> Self {
        Self {
            enabled: true,
            max_skew_secs,
            intent_mode: true,
            intent_policy: Arc::new(AllowAllIntents),
        }
    }

    /// PoP off entirely (bearer-only verification).
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            max_skew_secs: 60,
            intent_mode: false,
            intent_policy: Arc::new(AllowAllIntents),
        }
    }
}

/// Audience and scope requirements for one route.
#[derive(Debug, Clone)]
pub struct RouteAuth {
    scopes: Vec<String>,
    audience: Option<String>,
}

impl RouteAuth {
    /// Require the given scopes and audience.
    #[must_use]
    pub fn new(scopes: &[&str], audience: &str) -> Self {
        Self {
            scopes: scopes.iter().map(|s| (*s).to_string()).collect(),
            audience: Some(audience.to_string()),
        }
    }

    /// Require scopes only (no audience pin).
    #[must_use]
    pub fn scopes_only(scopes: &[&str]) -> Self {
        Self {
            scopes: scopes.iter().map(|s| (*s).to_string()).collect(),
            audience: None,
        }
    }

    /// Check audience and scopes against the verified claims.
    ///
    /// # Errors
    ///
    /// `INVALID_TOKEN` (403 semantics are carried by the code mapping) when
    /// the audience or a required scope is missing.
    pub fn authorize(&self, token: &VerifiedToken) -> Result<(), AidpError> {
        let claims = &token.claims;

        if let Some(expected) = &self.audience
            && !claims.aud.contains(expected)
        {
            return Err(
                AidpError::new(ErrorCode::InvalidToken, "audience mismatch")
                    .with_context("expected_aud", expected),
            );
        }

        let have = claims.scopes();
        let missing: Vec<&String> = self.scopes.iter().filter(|s| !have.contains(*s)).collect();
        if !missing.is_empty() {
            return Err(
                AidpError::new(ErrorCode::InvalidToken, "missing required scopes")
                    .with_context("missing", &missing),
            );
        }

        Ok(())
    }

    /// Full per-route authorization: audience + scopes + PoP.
    ///
    /// `method`/`url` describe the request as received; `body` is the raw
    /// received body (empty slice for bodyless requests).
    ///
    /// # Errors
    ///
    /// Audience/scope failures as in [`RouteAuth::authorize`];
    /// `POP_VERIFICATION_FAILED` for a missing, stale, or invalid proof;
    /// `WORKFLOW_DENIED` when the intent policy rejects the claims.
    pub fn authorize_request(
        &self,
        token: &VerifiedToken,
        method: &str,
        url: &str,
        headers: &HeaderMap,
        body: &[u8],
        pop: &PopConfig,
    ) -> Result<(), AidpError> {
        self.authorize(token)?;
        if pop.enabled {
            verify_pop(&token.claims, method, url, headers, body, pop)?;
            if pop.intent_mode && !pop.intent_policy.allow(&token.claims) {
                warn!(sub = %token.claims.sub, "intent drift detected");
                return Err(AidpError::new(
                    ErrorCode::WorkflowDenied,
                    "intent drift detected",
                )
                .with_context("sub", &token.claims.sub));
            }
        }
        Ok(())
    }
}

/// Verify the request's PoP signature against the token's `cnf.jwk`.
///
/// The canonical payload is rebuilt from the request as received plus the
/// `checksum` claim and the echoed timestamp, then checked against the
/// signature in the `PoP` header.
pub fn verify_pop(
    claims: &TokenClaims,
    method: &str,
    url: &str,
    headers: &HeaderMap,
    body: &[u8],
    pop: &PopConfig,
) -> Result<(), AidpError> {
    let proof = headers
        .get(POP_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            AidpError::new(ErrorCode::PopVerificationFailed, "missing PoP proof header")
        })?;
    let timestamp: i64 = headers
        .get(POP_TIMESTAMP_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| {
            AidpError::new(
                ErrorCode::PopVerificationFailed,
                "missing or malformed PoP timestamp",
            )
        })?;

    let now = chrono::Utc::now().timestamp();
    if (now - timestamp).abs() > pop.max_skew_secs {
        return Err(
            AidpError::new(ErrorCode::PopVerificationFailed, "stale PoP proof")
                .with_context("age_seconds", now - timestamp),
        );
    }

    let cnf = claims.cnf.as_ref().ok_or_else(|| {
        AidpError::new(
            ErrorCode::PopVerificationFailed,
            "token carries no cnf.jwk for PoP verification",
        )
    })?;
    let checksum = claims
        .agent_proof
        .as_ref()
        .map(|p| p.agent_checksum.clone())
        .ok_or_else(|| {
            AidpError::new(
                ErrorCode::PopVerificationFailed,
                "token carries no agent_proof checksum",
            )
        })?;

    let payload = PopPayload {
        method: method.to_ascii_uppercase(),
        url: url.to_string(),
        data: if body.is_empty() {
            String::new()
        } else {
            sha256_hex(body)
        },
        checksum,
        timestamp,
    };
    let message = payload.signing_bytes().map_err(|err| {
        AidpError::new(ErrorCode::Internal, "PoP payload serialization failed").with_source(err)
    })?;

    let public_key = public_key_from_jwk(&cnf.jwk).map_err(|err| {
        AidpError::new(ErrorCode::PopVerificationFailed, "cnf.jwk is not a usable key")
            .with_source(err)
    })?;

    use base64::Engine;
    let signature = base64::engine::general_purpose::STANDARD
        .decode(proof)
        .map_err(|err| {
            AidpError::new(ErrorCode::PopVerificationFailed, "PoP proof is not base64")
                .with_source(err)
        })?;

    if !verify_sha256(&public_key, &message, &signature) {
        return Err(AidpError::new(
            ErrorCode::PopVerificationFailed,
            "PoP signature does not match request",
        ));
    }
    Ok(())
}
