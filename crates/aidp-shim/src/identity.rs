// SPDX-License-Identifier: MIT OR Apache-2.0
//! Verified agent identities.

use aidp_keys::AgentKeyPair;
use aidp_model::ToolDescriptor;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A verified identity: the outcome of matching a rebuilt agent against
/// its IDP registration at bootstrap.
///
/// The private key never leaves this process; everything else mirrors the
/// registration record.
#[derive(Debug)]
pub struct AgentIdentity {
    /// The agent id.
    pub agent_id: String,
    /// The verified checksum (registration == rebuilt state).
    pub checksum: String,
    /// The registration this identity was verified against.
    pub registration_id: String,
    /// Prompt as registered.
    pub prompt: String,
    /// Tools as registered.
    pub tools: Vec<ToolDescriptor>,
    /// Configuration as registered.
    pub configuration: BTreeMap<String, Value>,
    /// The agent's PoP keypair.
    pub keypair: Arc<AgentKeyPair>,
    /// When this identity was verified, unix milliseconds.
    pub verified_at: i64,
}

/// Outcome of one agent's bootstrap verification, for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationStatus {
    /// Rebuilt, checksum matched, PoP key matched.
    Verified,
    /// Verification failed; the agent is unusable.
    Failed,
}
