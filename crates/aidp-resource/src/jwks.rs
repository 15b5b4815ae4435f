// SPDX-License-Identifier: MIT OR Apache-2.0
//! Shared, TTL-refreshed JWKS cache.

use aidp_error::{AidpError, ErrorCode};
use aidp_model::claims::JwksDocument;
use jsonwebtoken::DecodingKey;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

struct CacheState {
    keys: HashMap<String, DecodingKey>,
    expires_at: Option<Instant>,
}

/// Caches an issuer's JWKS, keyed by `kid`.
///
/// The cache refreshes when the TTL lapses or a lookup misses (key
/// rotation). A failed upstream fetch is retried once; a second failure
/// surfaces as `JWKS_UNAVAILABLE`.
pub struct JwksCache {
    jwks_url: String,
    ttl: Duration,
    http: reqwest::Client,
    state: Mutex<CacheState>,
}

impl JwksCache {
    /// Create a cache over the given JWKS URL.
    #[must_use]
    pub fn new(jwks_url: impl Into<String>, ttl: Duration) -> Self {
        Self {
            jwks_url: jwks_url.into(),
            ttl,
            http: reqwest::Client::builder()
                .timeout(FETCH_TIMEOUT)
                .build()
                .expect("reqwest client"),
            state: Mutex::new(CacheState {
                keys: HashMap::new(),
                expires_at: None,
            }),
        }
    }

    /// Resolve the decoding key for `kid`.
    ///
    /// # Errors
    ///
    /// `JWKS_UNAVAILABLE` when the upstream cannot be fetched (after one
    /// retry), `INVALID_TOKEN` when the document has no such `kid`.
    pub async fn decoding_key(&self, kid: &str) -> Result<DecodingKey, AidpError> {
        let mut state = self.state.lock().await;

        let expired = state
            .expires_at
            .is_none_or(|deadline| Instant::now() >= deadline);
        if expired || !state.keys.contains_key(kid) {
            self.refresh(&mut state).await?;
        }

        state.keys.get(kid).cloned().ok_or_else(|| {
            AidpError::new(ErrorCode::InvalidToken, "no JWKS entry for token kid")
                .with_context("kid", kid)
        })
    }

    async fn refresh(&self, state: &mut CacheState) -> Result<(), AidpError> {
        let document = match self.fetch().await {
            Ok(doc) => doc,
            Err(first_err) => {
                warn!(error = %first_err, url = %self.jwks_url, "JWKS fetch failed, retrying once");
                self.fetch().await.map_err(|err| {
                    AidpError::new(ErrorCode::JwksUnavailable, "JWKS fetch failed after retry")
                        .with_context("url", &self.jwks_url)
                        .with_source(err)
                })?
            }
        };

        let mut keys = HashMap::new();
        for jwk in &document.keys {
            let Some(kid) = &jwk.kid else { continue };
            if jwk.kty != "RSA" {
                continue;
            }
            match DecodingKey::from_rsa_components(&jwk.n, &jwk.e) {
                Ok(key) => {
                    keys.insert(kid.clone(), key);
                }
                Err(err) => {
                    warn!(kid, error = %err, "skipping malformed JWKS entry");
                }
            }
        }

        if keys.is_empty() {
            return Err(AidpError::new(
                ErrorCode::JwksUnavailable,
                "JWKS document contained no usable RSA keys",
            )
            .with_context("url", &self.jwks_url));
        }

        debug!(url = %self.jwks_url, keys = keys.len(), "JWKS cache refreshed");
        state.keys = keys;
        state.expires_at = Some(Instant::now() + self.ttl);
        Ok(())
    }

    async fn fetch(&self) -> Result<JwksDocument, reqwest::Error> {
        self.http
            .get(&self.jwks_url)
            .send()
            .await?
            .error_for_status()?
            .json::<JwksDocument>()
            .await
    }
}
