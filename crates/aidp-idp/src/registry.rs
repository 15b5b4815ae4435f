// SPDX-License-Identifier: MIT OR Apache-2.0
//! File-backed registries for agent registrations and workflow definitions.
//!
//! Dev persistence: one JSON file per registry, rewritten atomically
//! (tempfile + rename) after every successful mutation so a crash never
//! leaves a half-written registry behind.

use aidp_model::{Registration, WorkflowDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use tracing::info;

// ---------------------------------------------------------------------------
// Agent registry
// ---------------------------------------------------------------------------

/// All agent registrations, keyed by agent id. Each agent keeps its full
/// registration history; the last entry is authoritative.
#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    agents: BTreeMap<String, Vec<Registration>>,
}

impl AgentRegistry {
    /// Load from `path`, or start empty if the file does not exist.
    ///
    /// # Errors
    ///
    /// I/O or parse errors for an existing-but-unreadable file.
    pub fn load(path: &Path) -> io::Result<Self> {
        let agents: BTreeMap<String, Vec<Registration>> = load_json(path)?;
        if !agents.is_empty() {
            info!(count = agents.len(), path = %path.display(), "loaded agent registrations");
        }
        Ok(Self { agents })
    }

    /// Persist atomically to `path`.
    ///
    /// # Errors
    ///
    /// I/O errors from the temp write or the rename.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        save_json(path, &self.agents)
    }

    /// The authoritative (latest) registration for an agent.
    #[must_use]
    pub fn latest(&self, agent_id: &str) -> Option<&Registration> {
        self.agents.get(agent_id).and_then(|history| history.last())
    }

    /// Full registration history for an agent.
    #[must_use]
    pub fn history(&self, agent_id: &str) -> Option<&[Registration]> {
        self.agents.get(agent_id).map(Vec::as_slice)
    }

    /// Latest registrations of every agent belonging to `app_id`.
    #[must_use]
    pub fn latest_by_app(&self, app_id: &str) -> Vec<Registration> {
        self.agents
            .values()
            .filter_map(|history| history.last())
            .filter(|reg| reg.app_id == app_id)
            .cloned()
            .collect()
    }

    /// The id of a *different* agent already holding `checksum`, if any.
    #[must_use]
    pub fn checksum_owner_other_than(&self, checksum: &str, agent_id: &str) -> Option<&str> {
        self.agents
            .iter()
            .filter(|(id, _)| id.as_str() != agent_id)
            .find(|(_, history)| history.iter().any(|reg| reg.checksum == checksum))
            .map(|(id, _)| id.as_str())
    }

    /// Whether this agent already registered this exact checksum.
    #[must_use]
    pub fn has_checksum(&self, agent_id: &str, checksum: &str) -> bool {
        self.agents
            .get(agent_id)
            .is_some_and(|history| history.iter().any(|reg| reg.checksum == checksum))
    }

    /// Append a registration to the agent's history.
    pub fn insert(&mut self, registration: Registration) {
        self.agents
            .entry(registration.agent_id.clone())
            .or_default()
            .push(registration);
    }

    /// Number of registered agents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// Whether no agent is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Workflow registry
// ---------------------------------------------------------------------------

/// All workflow definitions, keyed by workflow id, with history.
#[derive(Debug, Clone, Default)]
pub struct WorkflowRegistry {
    workflows: BTreeMap<String, Vec<WorkflowDefinition>>,
}

impl WorkflowRegistry {
    /// Load from `path`, or start empty if the file does not exist.
    ///
    /// # Errors
    ///
    /// I/O or parse errors for an existing-but-unreadable file.
    pub fn load(path: &Path) -> io::Result<Self> {
        let workflows: BTreeMap<String, Vec<WorkflowDefinition>> = load_json(path)?;
        if !workflows.is_empty() {
            info!(count = workflows.len(), path = %path.display(), "loaded workflow definitions");
        }
        Ok(Self { workflows })
    }

    /// Persist atomically to `path`.
    ///
    /// # Errors
    ///
    /// I/O errors from the temp write or the rename.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        save_json(path, &self.workflows)
    }

    /// The authoritative (latest) definition for a workflow.
    #[must_use]
    pub fn latest(&self, workflow_id: &str) -> Option<&WorkflowDefinition> {
        self.workflows
            .get(workflow_id)
            .and_then(|history| history.last())
    }

    /// Whether the workflow id is registered.
    #[must_use]
    pub fn contains(&self, workflow_id: &str) -> bool {
        self.workflows.contains_key(workflow_id)
    }

    /// A different workflow id whose latest definition has an identical
    /// step map, if any.
    #[must_use]
    pub fn identical_steps_other_than(
        &self,
        workflow: &WorkflowDefinition,
    ) -> Option<&str> {
        self.workflows
            .iter()
            .filter(|(id, _)| id.as_str() != workflow.workflow_id)
            .find(|(_, history)| {
                history
                    .last()
                    .is_some_and(|existing| existing.steps == workflow.steps)
            })
            .map(|(id, _)| id.as_str())
    }

    /// Append a definition to the workflow's history.
    pub fn insert(&mut self, workflow: WorkflowDefinition) {
        self.workflows
            .entry(workflow.workflow_id.clone())
            .or_default()
            .push(workflow);
    }

    /// Remove a workflow entirely. Returns whether it existed.
    pub fn remove(&mut self, workflow_id: &str) -> bool {
        self.workflows.remove(workflow_id).is_some()
    }

    /// Number of registered workflows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    /// Whether no workflow is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }
}

// ---------------------------------------------------------------------------
// JSON persistence
// ---------------------------------------------------------------------------

fn load_json<T: DeserializeOwned + Default>(path: &Path) -> io::Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let raw = std::fs::read_to_string(path)?;
    serde_json::from_str(&raw).map_err(io::Error::other)
}

fn save_json<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    io::Write::write_all(&mut tmp, json.as_bytes())?;
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}
