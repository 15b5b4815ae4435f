// SPDX-License-Identifier: MIT OR Apache-2.0
//! Bearer token verification: signature, issuer, expiry.
//!
//! Audience and scopes are deliberately *not* checked here; they are
//! per-route concerns handled by the [`crate::guard`] module.

use aidp_error::{AidpError, ErrorCode};
use aidp_model::claims::TokenClaims;
use crate::jwks::JwksCache;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use std::sync::Arc;

/// Where verification keys come from.
pub enum KeySource {
    /// Fetch from a remote JWKS document (resource servers).
    Jwks(Arc<JwksCache>),
    /// A key held in-process (the IDP verifying its own tokens).
    Local {
        /// The kid the local key is advertised under, if any.
        kid: Option<String>,
        /// The verification key.
        key: DecodingKey,
    },
}

/// Verifies bearer tokens against a key source and an expected issuer.
pub struct TokenVerifier {
    key_source: KeySource,
    expected_iss: String,
    leeway_secs: u64,
}

impl TokenVerifier {
    /// Create a verifier.
    #[must_use]
    pub fn new(key_source: KeySource, expected_iss: impl Into<String>, leeway_secs: u64) -> Self {
        Self {
            key_source,
            expected_iss: expected_iss.into(),
            leeway_secs,
        }
    }

    /// Verify `token` and return its claims.
    ///
    /// # Errors
    ///
    /// `INVALID_TOKEN` for signature/issuer/expiry/kid failures;
    /// `JWKS_UNAVAILABLE` when the key source cannot be reached.
    pub async fn verify(&self, token: &str) -> Result<TokenClaims, AidpError> {
        let header = decode_header(token).map_err(|err| {
            AidpError::new(ErrorCode::InvalidToken, "token header is not valid JWT")
                .with_source(err)
        })?;
        if header.alg != Algorithm::RS256 {
            return Err(AidpError::new(
                ErrorCode::InvalidToken,
                "unsupported token algorithm",
            ));
        }
        let kid = header.kid.ok_or_else(|| {
            AidpError::new(ErrorCode::InvalidToken, "token header is missing kid")
        })?;

        let key = match &self.key_source {
            KeySource::Jwks(cache) => cache.decoding_key(&kid).await?,
            KeySource::Local { kid: local_kid, key } => {
                if let Some(expected) = local_kid
                    && expected != &kid
                {
                    return Err(AidpError::new(ErrorCode::InvalidToken, "unknown kid")
                        .with_context("kid", &kid));
                }
                key.clone()
            }
        };

        let mut validation = Validation::new(Algorithm::RS256);
        validation.leeway = self.leeway_secs;
        validation.validate_aud = false;
        validation.set_issuer(&[&self.expected_iss]);

        let data = decode::<TokenClaims>(token, &key, &validation).map_err(map_jwt_error)?;
        Ok(data.claims)
    }
}

fn map_jwt_error(err: jsonwebtoken::errors::Error) -> AidpError {
    let message = match err.kind() {
        ErrorKind::ExpiredSignature => "token expired",
        ErrorKind::InvalidIssuer => "issuer mismatch",
        ErrorKind::InvalidSignature => "signature verification failed",
        ErrorKind::ImmatureSignature => "token not yet valid",
        _ => "token verification failed",
    };
    AidpError::new(ErrorCode::InvalidToken, message).with_source(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aidp_model::claims::Audience;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use rsa::RsaPrivateKey;
    use rsa::pkcs8::{EncodePrivateKey, LineEnding};

    fn keypair() -> (EncodingKey, DecodingKey) {
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        let pem = private.to_pkcs8_pem(LineEnding::LF).unwrap();
        let encoding = EncodingKey::from_rsa_pem(pem.as_bytes()).unwrap();

        use base64::Engine;
        use base64::engine::general_purpose::URL_SAFE_NO_PAD;
        use rsa::traits::PublicKeyParts;
        let public = private.to_public_key();
        let decoding = DecodingKey::from_rsa_components(
            &URL_SAFE_NO_PAD.encode(public.n().to_bytes_be()),
            &URL_SAFE_NO_PAD.encode(public.e().to_bytes_be()),
        )
        .unwrap();
        (encoding, decoding)
    }

    fn claims(iss: &str, exp_offset: i64) -> TokenClaims {
        let now = chrono::Utc::now().timestamp();
        TokenClaims {
            iss: iss.into(),
            sub: "client:planner".into(),
            aud: Audience::One("api.localhost".into()),
            iat: now,
            exp: now + exp_offset,
            jti: "jti-1".into(),
            scope: Some("read:repo".into()),
            scp: None,
            tenant: None,
            cnf: None,
            intent: None,
            agent_proof: None,
        }
    }

    fn sign(claims: &TokenClaims, key: &EncodingKey, kid: &str) -> String {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(kid.into());
        encode(&header, claims, key).unwrap()
    }

    fn verifier(decoding: DecodingKey, kid: Option<&str>) -> TokenVerifier {
        TokenVerifier::new(
            KeySource::Local {
                kid: kid.map(str::to_string),
                key: decoding,
            },
            "http://idp.localhost",
            60,
        )
    }

    #[tokio::test]
    async fn valid_token_verifies() {
        let (enc, dec) = keypair();
        let token = sign(&claims("http://idp.localhost", 300), &enc, "k1");
        let verified = verifier(dec, Some("k1")).verify(&token).await.unwrap();
        assert_eq!(verified.sub, "client:planner");
    }

    #[tokio::test]
    async fn expired_token_rejected() {
        let (enc, dec) = keypair();
        let token = sign(&claims("http://idp.localhost", -600), &enc, "k1");
        let err = verifier(dec, Some("k1")).verify(&token).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidToken);
        assert!(err.message.contains("expired"));
    }

    #[tokio::test]
    async fn wrong_issuer_rejected() {
        let (enc, dec) = keypair();
        let token = sign(&claims("http://rogue.localhost", 300), &enc, "k1");
        let err = verifier(dec, Some("k1")).verify(&token).await.unwrap_err();
        assert!(err.message.contains("issuer"));
    }

    #[tokio::test]
    async fn wrong_key_rejected() {
        let (enc, _) = keypair();
        let (_, other_dec) = keypair();
        let token = sign(&claims("http://idp.localhost", 300), &enc, "k1");
        let err = verifier(other_dec, Some("k1"))
            .verify(&token)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidToken);
    }

    #[tokio::test]
    async fn missing_kid_rejected() {
        let (enc, dec) = keypair();
        let header = Header::new(Algorithm::RS256);
        let token = encode(&header, &claims("http://idp.localhost", 300), &enc).unwrap();
        let err = verifier(dec, None).verify(&token).await.unwrap_err();
        assert!(err.message.contains("kid"));
    }

    #[tokio::test]
    async fn kid_mismatch_rejected() {
        let (enc, dec) = keypair();
        let token = sign(&claims("http://idp.localhost", 300), &enc, "rotated");
        let err = verifier(dec, Some("k1")).verify(&token).await.unwrap_err();
        assert!(err.message.contains("kid"));
    }

    #[tokio::test]
    async fn garbage_token_rejected() {
        let (_, dec) = keypair();
        let err = verifier(dec, Some("k1"))
            .verify("not.a.jwt")
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidToken);
    }
}
