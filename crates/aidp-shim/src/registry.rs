// SPDX-License-Identifier: MIT OR Apache-2.0
//! The process-wide secure-tool registry.
//!
//! Tools an agent may execute must be declared here during module
//! initialization, before the first registration fetch. The shim refuses
//! to rebuild an agent whose registered tool names are missing from the
//! registry; an unknown tool at bootstrap means the deployment and the
//! IDP disagree about what the agent can do.

use crate::tool::Tool;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock, RwLock};

/// How much of a tool participates in the agent checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumLevel {
    /// Name, signature, and description only.
    Shallow,
    /// Additionally the normalized source.
    Deep,
}

#[derive(Clone)]
struct RegisteredTool {
    tool: Arc<dyn Tool>,
    level: ChecksumLevel,
}

/// Registry of secure tools, keyed by name.
///
/// Writes happen at process init; reads everywhere after. The global
/// instance backs the declaration pattern; tests may use private
/// instances.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<BTreeMap<String, RegisteredTool>>,
}

impl ToolRegistry {
    /// A fresh, empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> Arc<ToolRegistry> {
        static GLOBAL: OnceLock<Arc<ToolRegistry>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(ToolRegistry::new())).clone()
    }

    /// Declare a secure tool. Re-registering a name replaces the entry
    /// (last write wins, matching module-init ordering).
    pub fn register(&self, tool: Arc<dyn Tool>, level: ChecksumLevel) {
        let name = tool.name().to_string();
        self.tools
            .write()
            .expect("tool registry lock poisoned")
            .insert(name, RegisteredTool { tool, level });
    }

    /// Look up a tool.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools
            .read()
            .expect("tool registry lock poisoned")
            .get(name)
            .map(|entry| entry.tool.clone())
    }

    /// The tool's checksum level, if registered.
    #[must_use]
    pub fn level(&self, name: &str) -> Option<ChecksumLevel> {
        self.tools
            .read()
            .expect("tool registry lock poisoned")
            .get(name)
            .map(|entry| entry.level)
    }

    /// Whether a tool name is declared.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.tools
            .read()
            .expect("tool registry lock poisoned")
            .contains_key(name)
    }

    /// All declared tool names.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.tools
            .read()
            .expect("tool registry lock poisoned")
            .keys()
            .cloned()
            .collect()
    }
}
