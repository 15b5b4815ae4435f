// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! aidp-shim
//!
//! The client-side enforcement shim. It sits between agent code and
//! protected APIs and is the only component allowed to mint tokens on an
//! agent's behalf:
//!
//! - tools are declared once in a process-wide [`registry::ToolRegistry`];
//! - agents are rebuilt from their IDP registrations at startup and
//!   verified (checksum, PoP key) before they may run;
//! - every tool invocation is wrapped by a [`tool::TrackedTool`] that
//!   records workflow steps on a per-execution [`context::ExecutionContext`];
//! - [`client::SecureClient::authenticated_request`] identifies the calling
//!   agent from the execution context, mints or reuses an intent token, and
//!   attaches `Authorization` plus PoP headers.
//!
//! There is no stack walking and no process-global mutable trace: the
//! execution context is an explicit value, and the shim fails closed when
//! it is absent.

/// Rebuildable live agents.
pub mod agent;
/// Token cache.
pub mod cache;
/// The secure client itself.
pub mod client;
/// Per-execution workflow trace state.
pub mod context;
/// Verified agent identities.
pub mod identity;
/// Named OAuth credential profiles.
pub mod profiles;
/// Process-wide secure-tool registry.
pub mod registry;
/// Bounded retry for outbound HTTP.
pub mod retry;
/// Tool trait and workflow-tracking adapter.
pub mod tool;

pub use agent::{AgentHandle, AgentRunner, NoRuntime};
pub use client::{AuthMode, AuthenticatedClient, PopData, RequestOptions, SecureClient,
    SecureClientBuilder};
pub use context::ExecutionContext;
pub use identity::AgentIdentity;
pub use profiles::AuthProfile;
pub use registry::{ChecksumLevel, ToolRegistry};
pub use tool::{FnTool, Tool, TrackedTool};
