// SPDX-License-Identifier: MIT OR Apache-2.0
//! Environment-backed configuration for the Agent Identity Plane.
//!
//! This crate provides [`Settings`]: the runtime knobs shared by the IDP,
//! resource servers, and the client shim, together with validation and
//! advisory [`ConfigWarning`]s. All values come from environment variables
//! with documented defaults; nothing here reads files.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur while reading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable did not parse as the expected type.
    #[error("invalid value for {var}: {reason}")]
    InvalidValue {
        /// The offending variable.
        var: String,
        /// Human-readable parse failure.
        reason: String,
    },

    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

// ---------------------------------------------------------------------------
// Warnings
// ---------------------------------------------------------------------------

/// Advisory-level issues that do not prevent operation but deserve attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// Intent mode is on but PoP is disabled: bearer tokens become
    /// replayable.
    PopDisabledInIntentMode,
    /// The JWKS cache TTL is unusually large.
    LargeJwksTtl {
        /// TTL value in seconds.
        secs: u64,
    },
    /// Clock skew tolerance is unusually large.
    LargeClockSkew {
        /// Skew value in seconds.
        secs: u64,
    },
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigWarning::PopDisabledInIntentMode => {
                write!(f, "PoP disabled while intent mode is on: tokens are replayable")
            }
            ConfigWarning::LargeJwksTtl { secs } => {
                write!(f, "JWKS TTL is large ({secs}s); key rotation will lag")
            }
            ConfigWarning::LargeClockSkew { secs } => {
                write!(f, "clock skew tolerance is large ({secs}s)")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Runtime settings for every plane component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Base URL of the IDP (`IDP_URL`).
    pub idp_url: String,
    /// Base URL of the protected resource API (`API_URL`).
    pub api_url: String,
    /// Application identifier the shim registers under (`APP_ID`).
    pub app_id: String,
    /// Issuer string the IDP signs into tokens (`ISSUER`).
    pub issuer: String,
    /// Issuer resource servers require (`EXPECTED_ISS`).
    pub expected_iss: String,
    /// Audience resource servers require (`EXPECTED_AUD`).
    pub expected_aud: String,
    /// Whether intent mode is on (`INTENT_AUTH_MODE`).
    pub intent_auth_mode: bool,
    /// Whether resource servers enforce PoP (`API_POP_ENABLED`).
    pub api_pop_enabled: bool,
    /// JWKS cache TTL in seconds (`JWKS_TTL`, default 600).
    pub jwks_ttl_secs: u64,
    /// Clock skew tolerance in seconds (`CLOCK_SKEW_SECONDS`, default 60).
    pub clock_skew_secs: u64,
    /// Comma-separated auth-exempt path prefixes (`AUTH_EXEMPT_PATHS`).
    pub auth_exempt_paths: Vec<String>,
    /// Agent registry persistence file (`REGISTRY_FILE`).
    pub registry_file: String,
    /// Workflow registry persistence file (`WORKFLOW_REGISTRY_FILE`).
    pub workflow_registry_file: String,
    /// Directory holding per-agent PoP key PEMs (`POP_KEY_DIR`).
    pub pop_key_dir: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            idp_url: "http://idp.localhost".into(),
            api_url: "http://api.localhost".into(),
            app_id: "default-app".into(),
            issuer: "http://idp.localhost".into(),
            expected_iss: "http://idp.localhost".into(),
            expected_aud: "api.localhost".into(),
            intent_auth_mode: true,
            api_pop_enabled: true,
            jwks_ttl_secs: 600,
            clock_skew_secs: 60,
            auth_exempt_paths: vec![
                "/health".into(),
                "/docs".into(),
                "/openapi.json".into(),
                "/oauth/token".into(),
                "/oauth/.well-known/jwks.json".into(),
                "/oauth/introspect".into(),
                "/oauth/whoami".into(),
            ],
            registry_file: ".runtime/agent-registry.json".into(),
            workflow_registry_file: ".runtime/workflow-registry.json".into(),
            pop_key_dir: ".runtime".into(),
        }
    }
}

impl Settings {
    /// Load settings from the environment, falling back to defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for unparsable numeric or
    /// boolean variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            idp_url: env_string("IDP_URL", &defaults.idp_url),
            api_url: env_string("API_URL", &defaults.api_url),
            app_id: env_string("APP_ID", &defaults.app_id),
            issuer: env_string("ISSUER", &defaults.issuer),
            expected_iss: env_string("EXPECTED_ISS", &defaults.expected_iss),
            expected_aud: env_string("EXPECTED_AUD", &defaults.expected_aud),
            intent_auth_mode: env_bool("INTENT_AUTH_MODE", defaults.intent_auth_mode)?,
            api_pop_enabled: env_bool("API_POP_ENABLED", defaults.api_pop_enabled)?,
            jwks_ttl_secs: env_u64("JWKS_TTL", defaults.jwks_ttl_secs)?,
            clock_skew_secs: env_u64("CLOCK_SKEW_SECONDS", defaults.clock_skew_secs)?,
            auth_exempt_paths: match std::env::var("AUTH_EXEMPT_PATHS") {
                Ok(raw) => parse_paths(&raw),
                Err(_) => defaults.auth_exempt_paths,
            },
            registry_file: env_string("REGISTRY_FILE", &defaults.registry_file),
            workflow_registry_file: env_string(
                "WORKFLOW_REGISTRY_FILE",
                &defaults.workflow_registry_file,
            ),
            pop_key_dir: env_string("POP_KEY_DIR", &defaults.pop_key_dir),
        })
    }

    /// Check semantic invariants.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] listing every problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut reasons = Vec::new();
        for (name, value) in [
            ("IDP_URL", &self.idp_url),
            ("API_URL", &self.api_url),
            ("ISSUER", &self.issuer),
            ("EXPECTED_ISS", &self.expected_iss),
        ] {
            if !value.starts_with("http://") && !value.starts_with("https://") {
                reasons.push(format!("{name} must be an http(s) URL, got '{value}'"));
            }
        }
        if self.app_id.trim().is_empty() {
            reasons.push("APP_ID must not be empty".into());
        }
        if self.jwks_ttl_secs == 0 {
            reasons.push("JWKS_TTL must be positive".into());
        }
        if reasons.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::ValidationError { reasons })
        }
    }

    /// Advisory warnings for suspicious-but-legal settings.
    #[must_use]
    pub fn warnings(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        if self.intent_auth_mode && !self.api_pop_enabled {
            warnings.push(ConfigWarning::PopDisabledInIntentMode);
        }
        if self.jwks_ttl_secs > 3600 {
            warnings.push(ConfigWarning::LargeJwksTtl {
                secs: self.jwks_ttl_secs,
            });
        }
        if self.clock_skew_secs > 300 {
            warnings.push(ConfigWarning::LargeClockSkew {
                secs: self.clock_skew_secs,
            });
        }
        warnings
    }
}

fn env_string(var: &str, default: &str) -> String {
    std::env::var(var).unwrap_or_else(|_| default.to_string())
}

fn env_bool(var: &str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(var) {
        Err(_) => Ok(default),
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(ConfigError::InvalidValue {
                var: var.to_string(),
                reason: format!("expected a boolean, got '{other}'"),
            }),
        },
    }
}

fn env_u64(var: &str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(var) {
        Err(_) => Ok(default),
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            var: var.to_string(),
            reason: format!("expected an integer, got '{raw}'"),
        }),
    }
}

fn parse_paths(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
