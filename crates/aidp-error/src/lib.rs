//! Unified error taxonomy with stable error codes for the Agent Identity
//! Plane.
//!
//! Every plane error carries an [`ErrorCode`] (a machine-readable, stable
//! string tag with a fixed HTTP mapping), a human-readable message, an
//! optional cause chain, and arbitrary key-value context. Use the builder
//! returned by [`AidpError::new`] to construct errors fluently.
//!
//! Authorization failures must stay distinguishable on the wire; tests and
//! callers rely on the code, never on message text.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

/// Broad family that an [`ErrorCode`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Malformed or unsupported requests.
    Request,
    /// Agent registration and identity errors.
    Identity,
    /// Workflow authorization errors.
    Workflow,
    /// Token issuance and verification errors.
    Token,
    /// Proof-of-possession errors.
    Pop,
    /// Key material and JWKS errors.
    Key,
    /// Client-side enforcement errors (shim).
    Client,
    /// Configuration errors.
    Config,
    /// Outbound transport errors.
    Transport,
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Request => "request",
            Self::Identity => "identity",
            Self::Workflow => "workflow",
            Self::Token => "token",
            Self::Pop => "pop",
            Self::Key => "key",
            Self::Client => "client",
            Self::Config => "config",
            Self::Transport => "transport",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable, stable error code.
///
/// Each variant serialises to a `SCREAMING_SNAKE_CASE` string that is
/// guaranteed not to change across patch releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // -- Request --
    /// Malformed input or an unsupported grant type.
    BadRequest,

    // -- Identity --
    /// The agent id is not registered.
    UnknownAgent,
    /// Runtime checksum does not match the registered checksum.
    CodeIntegrityViolation,
    /// Another agent id already owns this checksum.
    ChecksumCollision,

    // -- Workflow --
    /// A workflow-validation rule failed.
    WorkflowDenied,
    /// Workflow id or identical step map already registered.
    DuplicateWorkflow,

    // -- Token --
    /// Signature, issuer, audience, expiry, or scope check failed.
    InvalidToken,

    // -- PoP --
    /// Stored public key does not match the locally-held private key.
    PopKeyMismatch,
    /// PoP header absent, stale, or signature invalid.
    PopVerificationFailed,

    // -- Key --
    /// Upstream JWKS fetch failed after one retry.
    JwksUnavailable,
    /// Key material could not be generated, loaded, or parsed.
    KeyUnavailable,

    // -- Client --
    /// The shim cannot identify the calling agent.
    NoRegisteredAgentInContext,
    /// A tool was invoked by an agent whose current checksum matches no
    /// registration.
    RuntimeAgentMutation,
    /// A registration fetched from the IDP failed client-side verification.
    RegistrationIntegrityViolation,

    // -- Config --
    /// Configuration value is missing or invalid.
    ConfigInvalid,

    // -- Transport --
    /// An outbound HTTP call failed after bounded retries.
    TransportFailed,

    // -- Internal --
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl ErrorCode {
    /// Returns the broad [`ErrorCategory`] this code belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::BadRequest => ErrorCategory::Request,

            Self::UnknownAgent | Self::CodeIntegrityViolation | Self::ChecksumCollision => {
                ErrorCategory::Identity
            }

            Self::WorkflowDenied | Self::DuplicateWorkflow => ErrorCategory::Workflow,

            Self::InvalidToken => ErrorCategory::Token,

            Self::PopKeyMismatch | Self::PopVerificationFailed => ErrorCategory::Pop,

            Self::JwksUnavailable | Self::KeyUnavailable => ErrorCategory::Key,

            Self::NoRegisteredAgentInContext
            | Self::RuntimeAgentMutation
            | Self::RegistrationIntegrityViolation => ErrorCategory::Client,

            Self::ConfigInvalid => ErrorCategory::Config,

            Self::TransportFailed => ErrorCategory::Transport,

            Self::Internal => ErrorCategory::Internal,
        }
    }

    /// Stable `&'static str` representation of the code (e.g.
    /// `"WORKFLOW_DENIED"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "BAD_REQUEST",
            Self::UnknownAgent => "UNKNOWN_AGENT",
            Self::CodeIntegrityViolation => "CODE_INTEGRITY_VIOLATION",
            Self::ChecksumCollision => "CHECKSUM_COLLISION",
            Self::WorkflowDenied => "WORKFLOW_DENIED",
            Self::DuplicateWorkflow => "DUPLICATE_WORKFLOW",
            Self::InvalidToken => "INVALID_TOKEN",
            Self::PopKeyMismatch => "POP_KEY_MISMATCH",
            Self::PopVerificationFailed => "POP_VERIFICATION_FAILED",
            Self::JwksUnavailable => "JWKS_UNAVAILABLE",
            Self::KeyUnavailable => "KEY_UNAVAILABLE",
            Self::NoRegisteredAgentInContext => "NO_REGISTERED_AGENT_IN_CONTEXT",
            Self::RuntimeAgentMutation => "RUNTIME_AGENT_MUTATION",
            Self::RegistrationIntegrityViolation => "REGISTRATION_INTEGRITY_VIOLATION",
            Self::ConfigInvalid => "CONFIG_INVALID",
            Self::TransportFailed => "TRANSPORT_FAILED",
            Self::Internal => "INTERNAL",
        }
    }

    /// The HTTP status this code maps to when it crosses the wire.
    ///
    /// Client-side-fatal codes never cross the wire as responses; they map
    /// to 500 if they somehow do.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::BadRequest | Self::ChecksumCollision | Self::DuplicateWorkflow => 400,
            Self::UnknownAgent
            | Self::CodeIntegrityViolation
            | Self::InvalidToken
            | Self::PopVerificationFailed => 401,
            Self::WorkflowDenied => 403,
            Self::JwksUnavailable => 502,
            Self::PopKeyMismatch
            | Self::KeyUnavailable
            | Self::NoRegisteredAgentInContext
            | Self::RuntimeAgentMutation
            | Self::RegistrationIntegrityViolation
            | Self::ConfigInvalid
            | Self::TransportFailed
            | Self::Internal => 500,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// AidpError
// ---------------------------------------------------------------------------

/// Unified plane error.
///
/// Carries a stable [`ErrorCode`], a human-readable message, an optional
/// source error for cause-chaining, and arbitrary structured context.
/// Messages never include secret material or token bodies.
///
/// # Builder usage
///
/// ```
/// use aidp_error::{AidpError, ErrorCode};
///
/// let err = AidpError::new(ErrorCode::WorkflowDenied, "dependency not completed")
///     .with_context("workflow_id", "wf1")
///     .with_context("step_id", "deploy");
/// ```
pub struct AidpError {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Arbitrary structured context for diagnostics.
    pub context: BTreeMap<String, serde_json::Value>,
}

impl AidpError {
    /// Create a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
        }
    }

    /// Attach a key-value pair to the diagnostic context.
    ///
    /// The value is converted via [`serde_json::to_value`]; if serialisation
    /// fails, the entry is silently skipped.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Shorthand for `self.code.category()`.
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }

    /// Shorthand for `self.code.http_status()`.
    pub fn http_status(&self) -> u16 {
        self.code.http_status()
    }
}

impl fmt::Debug for AidpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("AidpError");
        d.field("code", &self.code);
        d.field("message", &self.message);
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        d.finish()
    }
}

impl fmt::Display for AidpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)?;
        if !self.context.is_empty() {
            // Deterministic output thanks to BTreeMap.
            if let Ok(ctx) = serde_json::to_string(&self.context) {
                write!(f, " {ctx}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for AidpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

// ---------------------------------------------------------------------------
// Serialization support
// ---------------------------------------------------------------------------

/// Serialisable snapshot of an [`AidpError`] (without the opaque source).
///
/// This is the `{"error": {...}}` body services put on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AidpErrorDto {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Structured context.
    #[serde(default)]
    pub context: BTreeMap<String, serde_json::Value>,
}

impl From<&AidpError> for AidpErrorDto {
    fn from(err: &AidpError) -> Self {
        Self {
            code: err.code,
            message: err.message.clone(),
            context: err.context.clone(),
        }
    }
}

impl From<AidpErrorDto> for AidpError {
    fn from(dto: AidpErrorDto) -> Self {
        Self {
            code: dto.code,
            message: dto.message,
            source: None,
            context: dto.context,
        }
    }
}

/// Convenience alias used across the workspace.
pub type Result<T> = std::result::Result<T, AidpError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
