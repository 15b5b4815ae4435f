// SPDX-License-Identifier: MIT OR Apache-2.0
//! Registration versioning.
//!
//! Every re-registration of an existing agent bumps the version
//! deterministically. The change classifier is an explicit seam: today it
//! always reports [`ChangeKind::Patch`], so versions advance
//! `1.0.0 → 1.0.1 → …`; a future classifier can diff prompts and tool sets
//! to report minor/major changes without touching the bump logic.

use aidp_model::Registration;
use std::fmt;
use tracing::warn;

/// The first version ever assigned to an agent.
pub const INITIAL_VERSION: &str = "1.0.0";

/// How significant a re-registration is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Breaking change (prompt contract, tool removal).
    Major,
    /// Additive change (new tool).
    Minor,
    /// Everything else.
    Patch,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Major => "major",
            Self::Minor => "minor",
            Self::Patch => "patch",
        };
        f.write_str(s)
    }
}

/// Classify the change between the previous registration and the new one.
///
/// Always [`ChangeKind::Patch`] for now; the seam exists so the policy can
/// grow without changing the version arithmetic.
#[must_use]
pub fn detect_change_kind(_previous: &Registration, _next: &Registration) -> ChangeKind {
    ChangeKind::Patch
}

/// Compute the version for a new registration given the agent's history.
///
/// First registration gets [`INITIAL_VERSION`]; later ones bump the
/// component selected by [`detect_change_kind`]. An unparsable previous
/// version resets to the initial version (and logs).
#[must_use]
pub fn next_version(history: Option<&[Registration]>, next: &Registration) -> String {
    let Some(previous) = history.and_then(|h| h.last()) else {
        return INITIAL_VERSION.to_string();
    };
    let Some(version) = previous.version.as_deref() else {
        return INITIAL_VERSION.to_string();
    };

    let Some((major, minor, patch)) = parse_semver(version) else {
        warn!(
            agent_id = %next.agent_id,
            version,
            "previous registration has unparsable version, resetting"
        );
        return INITIAL_VERSION.to_string();
    };

    match detect_change_kind(previous, next) {
        ChangeKind::Major => format!("{}.0.0", major + 1),
        ChangeKind::Minor => format!("{major}.{}.0", minor + 1),
        ChangeKind::Patch => format!("{major}.{minor}.{}", patch + 1),
    }
}

fn parse_semver(version: &str) -> Option<(u64, u64, u64)> {
    let mut parts = version.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((major, minor, patch))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(version: Option<&str>) -> Registration {
        Registration {
            app_id: "app".into(),
            agent_id: "planner".into(),
            registration_id: "reg_planner_1".into(),
            checksum: "c".into(),
            prompt: "p".into(),
            tools: vec![],
            public_key: None,
            registered_at: 0,
            version: version.map(str::to_string),
        }
    }

    #[test]
    fn first_registration_is_initial() {
        assert_eq!(next_version(None, &registration(None)), "1.0.0");
        assert_eq!(next_version(Some(&[]), &registration(None)), "1.0.0");
    }

    #[test]
    fn patch_bump_by_default() {
        let history = [registration(Some("1.0.0"))];
        assert_eq!(next_version(Some(&history), &registration(None)), "1.0.1");
    }

    #[test]
    fn patch_bump_carries_major_minor() {
        let history = [registration(Some("2.3.7"))];
        assert_eq!(next_version(Some(&history), &registration(None)), "2.3.8");
    }

    #[test]
    fn missing_previous_version_resets() {
        let history = [registration(None)];
        assert_eq!(next_version(Some(&history), &registration(None)), "1.0.0");
    }

    #[test]
    fn garbage_previous_version_resets() {
        let history = [registration(Some("one.two"))];
        assert_eq!(next_version(Some(&history), &registration(None)), "1.0.0");
        let history = [registration(Some("1.2.3.4"))];
        assert_eq!(next_version(Some(&history), &registration(None)), "1.0.0");
    }

    #[test]
    fn bumping_is_deterministic() {
        let history = [registration(Some("1.4.9"))];
        let a = next_version(Some(&history), &registration(None));
        let b = next_version(Some(&history), &registration(None));
        assert_eq!(a, b);
    }

    #[test]
    fn classifier_reports_patch() {
        let prev = registration(Some("1.0.0"));
        let next = registration(None);
        assert_eq!(detect_change_kind(&prev, &next), ChangeKind::Patch);
    }
}
