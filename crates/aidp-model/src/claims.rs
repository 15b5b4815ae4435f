// SPDX-License-Identifier: MIT OR Apache-2.0
//! JWT claim structures shared by the IDP, the shim, and resource servers.

use crate::ActiveStep;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// An RSA public key in JWK form (base64url-unpadded components).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    /// Key type; always `"RSA"` here.
    pub kty: String,
    /// Intended use; always `"sig"`.
    #[serde(rename = "use")]
    pub use_: String,
    /// Algorithm; always `"RS256"`.
    pub alg: String,
    /// Modulus, base64url without padding.
    pub n: String,
    /// Public exponent, base64url without padding.
    pub e: String,
    /// Key id, present in JWKS documents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
}

/// The document served under `/.well-known/jwks.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwksDocument {
    /// Published signing keys.
    pub keys: Vec<Jwk>,
}

/// RFC 7800 confirmation claim carrying the agent's PoP key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    /// The PoP public key.
    pub jwk: Jwk,
}

/// The `intent` claim of an intent token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentClaim {
    /// Workflow the token was minted for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    /// The step that was in flight at mint time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_step: Option<ActiveStep>,
    /// The agent executing the step.
    pub executed_by: String,
    /// Truncated hash over the delegation chain plus the new step.
    pub delegation_chain: String,
    /// Truncated hash over the completed steps plus the new step.
    pub step_sequence_hash: String,
}

/// The `agent_proof` claim binding a token to a registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentProof {
    /// Checksum the token was minted against.
    pub agent_checksum: String,
    /// The registration that owns the checksum.
    pub registration_id: String,
}

/// The `aud` claim, which the wire allows as a string or an array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    /// A single audience.
    One(String),
    /// Multiple audiences.
    Many(Vec<String>),
}

impl Audience {
    /// Returns `true` if `aud` names `wanted`.
    #[must_use]
    pub fn contains(&self, wanted: &str) -> bool {
        match self {
            Self::One(a) => a == wanted,
            Self::Many(list) => list.iter().any(|a| a == wanted),
        }
    }
}

impl From<Vec<String>> for Audience {
    fn from(list: Vec<String>) -> Self {
        Self::Many(list)
    }
}

impl From<&str> for Audience {
    fn from(a: &str) -> Self {
        Self::One(a.to_string())
    }
}

/// Claim set of every token this plane issues.
///
/// OAuth access tokens fill the base fields plus `tenant`; intent tokens
/// additionally carry `cnf`, `intent`, and `agent_proof`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Issuer.
    pub iss: String,
    /// Subject: `client:<id>` for OAuth tokens, the agent id for intent
    /// tokens.
    pub sub: String,
    /// Audience(s).
    pub aud: Audience,
    /// Issued-at, unix seconds.
    pub iat: i64,
    /// Expiry, unix seconds.
    pub exp: i64,
    /// Token id.
    pub jti: String,
    /// Space-delimited scopes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Alternative list-form scope claim some issuers emit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scp: Option<Vec<String>>,
    /// Tenant identifier (OAuth tokens).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
    /// PoP key confirmation (intent tokens).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cnf: Option<Confirmation>,
    /// Intent binding (intent tokens).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<IntentClaim>,
    /// Registration binding (intent tokens).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_proof: Option<AgentProof>,
}

impl TokenClaims {
    /// Collect the granted scopes from `scope` or `scp`, whichever is set.
    #[must_use]
    pub fn scopes(&self) -> BTreeSet<String> {
        if let Some(s) = &self.scope {
            return s.split_whitespace().map(str::to_string).collect();
        }
        if let Some(list) = &self.scp {
            return list.iter().cloned().collect();
        }
        BTreeSet::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_claims() -> TokenClaims {
        TokenClaims {
            iss: "http://idp.localhost".into(),
            sub: "client:planner".into(),
            aud: Audience::One("api.localhost".into()),
            iat: 0,
            exp: 300,
            jti: "token_1".into(),
            scope: Some("read:repo write:repo".into()),
            scp: None,
            tenant: None,
            cnf: None,
            intent: None,
            agent_proof: None,
        }
    }

    #[test]
    fn audience_string_or_list() {
        let one: Audience = serde_json::from_str(r#""api.localhost""#).unwrap();
        assert!(one.contains("api.localhost"));
        assert!(!one.contains("idp.localhost"));

        let many: Audience = serde_json::from_str(r#"["a", "b"]"#).unwrap();
        assert!(many.contains("b"));
        assert!(!many.contains("c"));
    }

    #[test]
    fn scopes_from_space_delimited_claim() {
        let claims = base_claims();
        let scopes = claims.scopes();
        assert!(scopes.contains("read:repo"));
        assert!(scopes.contains("write:repo"));
        assert_eq!(scopes.len(), 2);
    }

    #[test]
    fn scopes_fall_back_to_scp_list() {
        let mut claims = base_claims();
        claims.scope = None;
        claims.scp = Some(vec!["classify".into()]);
        assert!(claims.scopes().contains("classify"));
    }

    #[test]
    fn scopes_empty_when_no_claim() {
        let mut claims = base_claims();
        claims.scope = None;
        assert!(claims.scopes().is_empty());
    }

    #[test]
    fn optional_claims_omitted_from_wire() {
        let claims = base_claims();
        let json = serde_json::to_value(&claims).unwrap();
        assert!(json.get("cnf").is_none());
        assert!(json.get("intent").is_none());
        assert!(json.get("agent_proof").is_none());
    }

    #[test]
    fn jwk_use_field_renamed() {
        let jwk = Jwk {
            kty: "RSA".into(),
            use_: "sig".into(),
            alg: "RS256".into(),
            n: "AQAB".into(),
            e: "AQAB".into(),
            kid: None,
        };
        let json = serde_json::to_value(&jwk).unwrap();
        assert_eq!(json["use"], "sig");
        assert!(json.get("use_").is_none());
    }

    #[test]
    fn intent_claims_roundtrip() {
        let mut claims = base_claims();
        claims.intent = Some(IntentClaim {
            workflow_id: Some("wf1".into()),
            workflow_step: None,
            executed_by: "planner".into(),
            delegation_chain: "aaaa".into(),
            step_sequence_hash: "bbbb".into(),
        });
        claims.agent_proof = Some(AgentProof {
            agent_checksum: "c".repeat(64),
            registration_id: "reg_planner_1".into(),
        });
        let json = serde_json::to_string(&claims).unwrap();
        let back: TokenClaims = serde_json::from_str(&json).unwrap();
        assert_eq!(back, claims);
    }
}
