// SPDX-License-Identifier: MIT OR Apache-2.0
//! aidp-checksum
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Deterministic agent identity checksums.
//!
//! An agent's identity is a pure function of its components: id, prompt,
//! tools, and configuration. This crate normalizes the free-text parts
//! (prompt, tool source, signatures) so that formatting-only changes never
//! move the checksum, and any semantically meaningful change always does.

/// Prompt and source normalization.
pub mod normalize;
/// Tool signature canonicalization.
pub mod signature;

use aidp_model::{AgentComponents, canonical_json, sha256_hex};
use normalize::{normalize_prompt, normalize_source};
use serde_json::json;
use signature::canonical_signature;

/// Compute the deterministic hex SHA-256 checksum of an agent.
///
/// The hashed object is `{config, id, prompt, tools}` with keys sorted and
/// no insignificant whitespace; tools are sorted by name and carry
/// `source` only when the descriptor has normalized source attached
/// (deep-checksum tools). The `is_agent` flag is *not* part of identity;
/// whether a tool is a sub-agent is topology, not code.
///
/// Identical component sets always produce identical output; reformatting
/// the prompt or the source of a deep tool never changes it.
#[must_use]
pub fn compute_agent_checksum(components: &AgentComponents) -> String {
    let mut tools: Vec<&aidp_model::ToolDescriptor> = components.tools.iter().collect();
    tools.sort_by(|a, b| a.name.cmp(&b.name));

    let tool_values: Vec<serde_json::Value> = tools
        .iter()
        .map(|t| {
            let mut v = json!({
                "name": t.name,
                "signature": canonical_signature(&t.signature),
                "description": t.description,
            });
            if let Some(source) = &t.source_code {
                v["source"] = json!(normalize_source(source));
            }
            v
        })
        .collect();

    let pre_image = json!({
        "id": components.agent_id,
        "prompt": normalize_prompt(&components.prompt_template),
        "tools": tool_values,
        "config": components.configuration,
    });

    // canonical_json cannot fail for a Value we just built.
    let content = canonical_json(&pre_image).expect("pre-image is valid JSON");
    sha256_hex(content.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use aidp_model::ToolDescriptor;
    use std::collections::BTreeMap;

    fn tool(name: &str, signature: &str, description: &str) -> ToolDescriptor {
        ToolDescriptor {
            name: name.into(),
            signature: signature.into(),
            description: description.into(),
            source_code: None,
            is_agent: false,
        }
    }

    fn planner() -> AgentComponents {
        AgentComponents {
            agent_id: "planner".into(),
            prompt_template: "You are a planner.\n\nClassify findings first.".into(),
            tools: vec![
                tool("list_files", "list_files(path: str) -> list[str]", "List files"),
                tool("classify", "classify(finding: str) -> str", "Classify a finding"),
            ],
            configuration: BTreeMap::new(),
        }
    }

    // -- Determinism -----------------------------------------------------

    #[test]
    fn identical_components_identical_checksum() {
        assert_eq!(
            compute_agent_checksum(&planner()),
            compute_agent_checksum(&planner())
        );
    }

    #[test]
    fn checksum_is_hex_sha256() {
        let c = compute_agent_checksum(&planner());
        assert_eq!(c.len(), 64);
        assert!(c.chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn tool_order_does_not_matter() {
        let mut reordered = planner();
        reordered.tools.reverse();
        assert_eq!(
            compute_agent_checksum(&planner()),
            compute_agent_checksum(&reordered)
        );
    }

    // -- Sensitivity -----------------------------------------------------

    #[test]
    fn prompt_change_moves_checksum() {
        let mut changed = planner();
        changed.prompt_template = "You are a deployer.".into();
        assert_ne!(
            compute_agent_checksum(&planner()),
            compute_agent_checksum(&changed)
        );
    }

    #[test]
    fn tool_name_change_moves_checksum() {
        let mut changed = planner();
        changed.tools[0].name = "enumerate_files".into();
        assert_ne!(
            compute_agent_checksum(&planner()),
            compute_agent_checksum(&changed)
        );
    }

    #[test]
    fn tool_signature_change_moves_checksum() {
        let mut changed = planner();
        changed.tools[0].signature = "list_files(path: str, depth: int) -> list[str]".into();
        assert_ne!(
            compute_agent_checksum(&planner()),
            compute_agent_checksum(&changed)
        );
    }

    #[test]
    fn tool_description_change_moves_checksum() {
        let mut changed = planner();
        changed.tools[1].description = "Classify a CVE finding".into();
        assert_ne!(
            compute_agent_checksum(&planner()),
            compute_agent_checksum(&changed)
        );
    }

    #[test]
    fn config_change_moves_checksum() {
        let mut changed = planner();
        changed
            .configuration
            .insert("temperature".into(), serde_json::json!(0.2));
        assert_ne!(
            compute_agent_checksum(&planner()),
            compute_agent_checksum(&changed)
        );
    }

    #[test]
    fn deep_tool_source_change_moves_checksum() {
        let mut with_source = planner();
        with_source.tools[0].source_code = Some("fn list() { walk(path) }".into());
        let mut changed = with_source.clone();
        changed.tools[0].source_code = Some("fn list() { walk_all(path) }".into());
        assert_ne!(
            compute_agent_checksum(&with_source),
            compute_agent_checksum(&changed)
        );
    }

    #[test]
    fn agent_id_is_part_of_identity() {
        let mut other = planner();
        other.agent_id = "impersonator".into();
        assert_ne!(
            compute_agent_checksum(&planner()),
            compute_agent_checksum(&other)
        );
    }

    #[test]
    fn is_agent_flag_not_hashed() {
        let mut flagged = planner();
        flagged.tools[0].is_agent = true;
        assert_eq!(
            compute_agent_checksum(&planner()),
            compute_agent_checksum(&flagged)
        );
    }

    // -- Formatting insensitivity ----------------------------------------

    #[test]
    fn prompt_reformatting_keeps_checksum() {
        let mut reflowed = planner();
        reflowed.prompt_template =
            "  You are a planner.\r\n\r\n\r\n   Classify findings first.  \n".into();
        assert_eq!(
            compute_agent_checksum(&planner()),
            compute_agent_checksum(&reflowed)
        );
    }

    #[test]
    fn source_reindent_keeps_checksum() {
        let mut a = planner();
        a.tools[0].source_code = Some("fn list() {\n    walk(path)\n}".into());
        let mut b = planner();
        b.tools[0].source_code = Some("    fn list() {\n        walk(path)\n    }".into());
        assert_eq!(compute_agent_checksum(&a), compute_agent_checksum(&b));
    }

    #[test]
    fn wrapper_params_do_not_affect_checksum() {
        let mut framework_a = planner();
        framework_a.tools[0].signature =
            "list_files(path: str, config: RunnableConfig, **kwargs) -> list[str]".into();
        assert_eq!(
            compute_agent_checksum(&planner()),
            compute_agent_checksum(&framework_a)
        );
    }
}

#[cfg(test)]
mod properties {
    use super::*;
    use aidp_model::ToolDescriptor;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn arb_components() -> impl Strategy<Value = AgentComponents> {
        (
            "[a-z]{1,12}",
            ".{0,60}",
            proptest::collection::vec(("[a-z_]{1,10}", ".{0,30}"), 0..4),
        )
            .prop_map(|(id, prompt, tools)| AgentComponents {
                agent_id: id,
                prompt_template: prompt,
                tools: tools
                    .into_iter()
                    .enumerate()
                    .map(|(i, (name, desc))| ToolDescriptor {
                        // Suffix keeps names unique within the agent.
                        name: format!("{name}_{i}"),
                        signature: format!("{name}_{i}() -> str"),
                        description: desc,
                        source_code: None,
                        is_agent: false,
                    })
                    .collect(),
                configuration: BTreeMap::new(),
            })
    }

    proptest! {
        #[test]
        fn checksum_deterministic(components in arb_components()) {
            prop_assert_eq!(
                compute_agent_checksum(&components),
                compute_agent_checksum(&components)
            );
        }

        #[test]
        fn checksum_distinct_ids_distinct(components in arb_components()) {
            let mut other = components.clone();
            other.agent_id.push('x');
            prop_assert_ne!(
                compute_agent_checksum(&components),
                compute_agent_checksum(&other)
            );
        }
    }
}
