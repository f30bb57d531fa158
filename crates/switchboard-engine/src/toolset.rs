use std::collections::BTreeSet;

use switchboard_core::config::ToolDelta;
use switchboard_core::tools::{ToolCategory, ToolDescriptor, ToolSet};
use switchboard_core::Mode;

/// Knobs for mode-based tool resolution.
#[derive(Clone, Copy, Debug)]
pub struct ToolPolicy {
    /// Quick mode drops deep delegates and their members.
    pub quick_excludes_deep_delegates: bool,
}

impl Default for ToolPolicy {
    fn default() -> Self {
        Self {
            quick_excludes_deep_delegates: true,
        }
    }
}

/// Compute the tools to add and remove for one request.
///
/// Deep mode removes every direct-answer tool. Quick mode keeps them and,
/// under the default policy, drops deep delegates together with their
/// members. Entitlement-gated base tools the user lacks are removed and
/// gated catalog tools the user holds are added, unless the mode removes
/// their category.
pub fn resolve(
    mode: Mode,
    base: &ToolSet,
    catalog: &[ToolDescriptor],
    entitlements: &BTreeSet<String>,
    policy: ToolPolicy,
) -> ToolDelta {
    let excluded = |tool: &ToolDescriptor| match mode {
        Mode::Deep => tool.category == ToolCategory::DirectAnswer,
        Mode::Quick => policy.quick_excludes_deep_delegates && tool.category == ToolCategory::DeepDelegate,
    };
    let entitled = |tool: &ToolDescriptor| {
        tool.entitlement
            .as_deref()
            .map_or(true, |e| entitlements.contains(e))
    };

    let mut removed: BTreeSet<String> = base
        .iter()
        .filter(|t| excluded(t) || !entitled(t))
        .map(|t| t.name.clone())
        .collect();

    // Members of a removed team go with it.
    let orphans: Vec<String> = base
        .iter()
        .filter(|t| t.parent.as_deref().is_some_and(|p| removed.contains(p)))
        .map(|t| t.name.clone())
        .collect();
    removed.extend(orphans);

    let added = catalog
        .iter()
        .filter(|t| t.entitlement.is_some() && entitled(t) && !excluded(t))
        .filter(|t| !base.contains(&t.name))
        .cloned()
        .collect();

    ToolDelta {
        added,
        removed: removed.into_iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ToolSet {
        vec![
            ToolDescriptor::new("duckduckgo_search", ToolCategory::DirectAnswer),
            ToolDescriptor::new("exa_search", ToolCategory::DirectAnswer),
            ToolDescriptor::new("think", ToolCategory::Reasoning),
            ToolDescriptor::agent("audio-specialist", None),
            ToolDescriptor::team("research-team", ToolCategory::DeepDelegate),
            ToolDescriptor::agent("web-researcher", Some("research-team")),
            ToolDescriptor::new("crm_lookup", ToolCategory::Integration).with_entitlement("crm"),
        ]
        .into()
    }

    fn catalog() -> Vec<ToolDescriptor> {
        vec![
            ToolDescriptor::new("gmail_send", ToolCategory::Integration).with_entitlement("google"),
            ToolDescriptor::new("notion_search", ToolCategory::Integration).with_entitlement("notion"),
        ]
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn deep_removes_direct_answer_tools() {
        let delta = resolve(Mode::Deep, &base(), &[], &set(&["crm"]), ToolPolicy::default());
        assert_eq!(delta.removed, vec!["duckduckgo_search", "exa_search"]);
        assert!(delta.added.is_empty());
    }

    #[test]
    fn quick_keeps_search_and_drops_deep_delegates() {
        let delta = resolve(Mode::Quick, &base(), &[], &set(&["crm"]), ToolPolicy::default());
        assert_eq!(delta.removed, vec!["research-team", "web-researcher"]);
    }

    #[test]
    fn quick_can_keep_deep_delegates() {
        let policy = ToolPolicy {
            quick_excludes_deep_delegates: false,
        };
        let delta = resolve(Mode::Quick, &base(), &[], &set(&["crm"]), policy);
        assert!(delta.is_empty());
    }

    #[test]
    fn entitlements_gate_tools() {
        let delta = resolve(Mode::Deep, &base(), &catalog(), &set(&["google"]), ToolPolicy::default());
        assert!(delta.removed.contains(&"crm_lookup".to_string()));
        let added: Vec<_> = delta.added.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(added, vec!["gmail_send"]);
    }

    #[test]
    fn removed_tools_never_reach_configuration() {
        let base = base();
        let delta = resolve(Mode::Deep, &base, &catalog(), &BTreeSet::new(), ToolPolicy::default());
        let ovr = switchboard_core::config::RequestOverride::builder(Mode::Deep)
            .delta(delta)
            .build();
        let cfg = ovr.compose(&switchboard_core::config::RuntimeBaseline::new(vec![], base));
        assert!(cfg.tools.by_category(ToolCategory::DirectAnswer).next().is_none());
        assert!(!cfg.tools.contains("crm_lookup"));
        assert!(cfg.tools.contains("research-team"));
    }
}
