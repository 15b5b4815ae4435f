// SPDX-License-Identifier: MIT OR Apache-2.0
//! aidp-resource
#![deny(unsafe_code)]
//!
//! Resource-server verification for the Agent Identity Plane.
//!
//! Verification happens in two phases, mirroring how resource servers
//! actually deploy it:
//!
//! 1. **Once per request** ([`layer`]): extract the bearer token, resolve
//!    the signing key (JWKS cache or a local key), verify signature,
//!    issuer, and expiry, and stash the claims on the request.
//! 2. **Per route** ([`guard`]): check audience and scopes against the
//!    route's requirements, and, when enabled, verify the request's
//!    proof-of-possession signature against the token's `cnf.jwk`.

/// Per-route audience/scope/PoP checks.
pub mod guard;
/// TTL'd JWKS cache.
pub mod jwks;
/// Axum middleware wiring for phase 1.
pub mod layer;
/// Token verification (signature / issuer / expiry).
pub mod verify;

pub use guard::{IntentPolicy, PopConfig, RouteAuth};
pub use jwks::JwksCache;
pub use layer::{AuthLayerState, VerifiedToken, jwt_auth_middleware};
pub use verify::{KeySource, TokenVerifier};
