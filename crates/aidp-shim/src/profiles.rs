// SPDX-License-Identifier: MIT OR Apache-2.0
//! Named OAuth credential profiles.
//!
//! The shim talks to the IDP itself (bootstrap, registration, minting)
//! using plain OAuth client credentials. Deployments configure one profile
//! per concern and refer to them by name in request options.

use serde::{Deserialize, Serialize};

/// One set of OAuth client credentials plus its defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthProfile {
    /// OAuth client id.
    pub client_id: String,
    /// OAuth client secret.
    pub client_secret: String,
    /// Scopes requested when the caller specifies none.
    #[serde(default)]
    pub default_scopes: Vec<String>,
    /// Audience requested when the caller specifies none.
    #[serde(default)]
    pub default_audience: Option<String>,
}

impl AuthProfile {
    /// A profile with credentials only.
    #[must_use]
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            default_scopes: Vec::new(),
            default_audience: None,
        }
    }

    /// Set default scopes.
    #[must_use]
    pub fn with_scopes(mut self, scopes: &[&str]) -> Self {
        self.default_scopes = scopes.iter().map(|s| (*s).to_string()).collect();
        self
    }

    /// Set the default audience.
    #[must_use]
    pub fn with_audience(mut self, audience: &str) -> Self {
        self.default_audience = Some(audience.to_string());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_fills_defaults() {
        let profile = AuthProfile::new("plane-client", "secret")
            .with_scopes(&["read:agents"])
            .with_audience("idp.localhost");
        assert_eq!(profile.client_id, "plane-client");
        assert_eq!(profile.default_scopes, vec!["read:agents".to_string()]);
        assert_eq!(profile.default_audience.as_deref(), Some("idp.localhost"));
    }
}
