// SPDX-License-Identifier: MIT OR Apache-2.0
//! Phase-1 axum middleware: verify the bearer once per request and stash
//! the claims as a request extension.

use crate::verify::TokenVerifier;
use aidp_error::{AidpError, AidpErrorDto, ErrorCode};
use aidp_model::claims::TokenClaims;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::sync::Arc;

/// The verified token, available to handlers via `Extension<VerifiedToken>`.
#[derive(Clone)]
pub struct VerifiedToken {
    /// Verified claims.
    pub claims: Arc<TokenClaims>,
    /// The raw compact JWT, for audit logging.
    pub raw: Arc<str>,
}

/// State for [`jwt_auth_middleware`].
#[derive(Clone)]
pub struct AuthLayerState {
    /// Shared verifier (key source + issuer + leeway).
    pub verifier: Arc<TokenVerifier>,
    /// Paths (and their subtrees) that skip authentication.
    pub exempt_paths: Arc<Vec<String>>,
}

impl AuthLayerState {
    /// Create middleware state.
    #[must_use]
    pub fn new(verifier: Arc<TokenVerifier>, exempt_paths: Vec<String>) -> Self {
        Self {
            verifier,
            exempt_paths: Arc::new(exempt_paths),
        }
    }

    fn is_exempt(&self, path: &str) -> bool {
        self.exempt_paths
            .iter()
            .any(|p| path == p || path.starts_with(&format!("{p}/")))
    }
}

/// Turn a plane error into the JSON error response services emit.
#[must_use]
pub fn error_response(err: &AidpError) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let dto: AidpErrorDto = err.into();
    (status, Json(serde_json::json!({ "error": dto }))).into_response()
}

/// Axum middleware verifying signature, issuer, and expiry.
///
/// Install with `axum::middleware::from_fn_with_state`. Exempt paths pass
/// straight through; everything else must carry a valid
/// `Authorization: Bearer` or gets the mapped error status.
pub async fn jwt_auth_middleware(
    State(state): State<AuthLayerState>,
    mut req: Request,
    next: Next,
) -> Response {
    if state.is_exempt(req.uri().path()) {
        return next.run(req).await;
    }

    let token = match bearer_token(&req) {
        Some(token) => token,
        None => {
            return error_response(&AidpError::new(
                ErrorCode::InvalidToken,
                "missing bearer token",
            ));
        }
    };

    match state.verifier.verify(&token).await {
        Ok(claims) => {
            req.extensions_mut().insert(VerifiedToken {
                claims: Arc::new(claims),
                raw: Arc::from(token.as_str()),
            });
            next.run(req).await
        }
        Err(err) => error_response(&err),
    }
}

fn bearer_token(req: &Request) -> Option<String> {
    let header = req.headers().get(axum::http::header::AUTHORIZATION)?;
    let value = header.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}
