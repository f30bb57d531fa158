use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Tool classification used by mode and entitlement resolution.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    #[default]
    General,
    /// Ad-hoc answers such as web search; removed in Deep mode.
    DirectAnswer,
    /// A delegate member (team or agent) reachable from the main assistant.
    Delegate,
    /// A delegate reserved for Deep mode (research team, law team).
    DeepDelegate,
    /// Internal delegation plumbing; recorded for audit, hidden from clients.
    Coordination,
    /// Think/analyze steps surfaced as reasoning.
    Reasoning,
    /// Third-party integrations, usually entitlement-gated.
    Integration,
}

impl ToolCategory {
    pub fn is_delegate(&self) -> bool {
        matches!(self, Self::Delegate | Self::DeepDelegate)
    }
}

/// Whether a delegate member is a team (which has members of its own) or a
/// single agent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberKind {
    Team,
    Agent,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: ToolCategory,
    /// Entitlement a user must hold for this tool to be available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entitlement: Option<String>,
    /// Set for delegate members.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_kind: Option<MemberKind>,
    /// Name of the team a delegate agent belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, category: ToolCategory) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            category,
            entitlement: None,
            member_kind: None,
            parent: None,
        }
    }

    pub fn team(name: impl Into<String>, category: ToolCategory) -> Self {
        Self {
            member_kind: Some(MemberKind::Team),
            ..Self::new(name, category)
        }
    }

    pub fn agent(name: impl Into<String>, parent: Option<&str>) -> Self {
        Self {
            member_kind: Some(MemberKind::Agent),
            parent: parent.map(str::to_owned),
            ..Self::new(name, ToolCategory::Delegate)
        }
    }

    pub fn with_entitlement(mut self, entitlement: impl Into<String>) -> Self {
        self.entitlement = Some(entitlement.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Ordered set of tools keyed by name. Serialized as a list.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<ToolDescriptor>", into = "Vec<ToolDescriptor>")]
pub struct ToolSet {
    tools: BTreeMap<String, ToolDescriptor>,
}

impl ToolSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tool: ToolDescriptor) {
        self.tools.insert(tool.name.clone(), tool);
    }

    pub fn remove(&mut self, name: &str) -> Option<ToolDescriptor> {
        self.tools.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolDescriptor> {
        self.tools.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }

    pub fn by_category(&self, category: ToolCategory) -> impl Iterator<Item = &ToolDescriptor> {
        self.tools.values().filter(move |t| t.category == category)
    }

    pub fn delegates(&self) -> impl Iterator<Item = &ToolDescriptor> {
        self.tools.values().filter(|t| t.category.is_delegate())
    }
}

impl FromIterator<ToolDescriptor> for ToolSet {
    fn from_iter<I: IntoIterator<Item = ToolDescriptor>>(iter: I) -> Self {
        let mut set = Self::new();
        for tool in iter {
            set.insert(tool);
        }
        set
    }
}

impl From<Vec<ToolDescriptor>> for ToolSet {
    fn from(tools: Vec<ToolDescriptor>) -> Self {
        tools.into_iter().collect()
    }
}

impl From<ToolSet> for Vec<ToolDescriptor> {
    fn from(set: ToolSet) -> Self {
        set.tools.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_replaces_same_name() {
        let mut set = ToolSet::new();
        set.insert(ToolDescriptor::new("exa_search", ToolCategory::General));
        set.insert(ToolDescriptor::new("exa_search", ToolCategory::DirectAnswer));
        assert_eq!(set.len(), 1);
        assert_eq!(set.get("exa_search").unwrap().category, ToolCategory::DirectAnswer);
    }

    #[test]
    fn delegates_filter() {
        let set: ToolSet = vec![
            ToolDescriptor::team("research-team", ToolCategory::DeepDelegate),
            ToolDescriptor::agent("audio-specialist", None),
            ToolDescriptor::new("think", ToolCategory::Reasoning),
        ]
        .into();
        let names: Vec<&str> = set.delegates().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["audio-specialist", "research-team"]);
    }

    #[test]
    fn serializes_as_list() {
        let set: ToolSet = vec![ToolDescriptor::new("think", ToolCategory::Reasoning)].into();
        let json = serde_json::to_value(&set).unwrap();
        assert!(json.is_array());
        assert_eq!(json[0]["name"], "think");
        assert_eq!(json[0]["category"], "reasoning");
        assert!(json[0].get("entitlement").is_none());

        let back: ToolSet = serde_json::from_value(json).unwrap();
        assert_eq!(back, set);
    }

    #[test]
    fn descriptor_defaults_on_deserialize() {
        let tool: ToolDescriptor = serde_json::from_str(r#"{"name":"calculator"}"#).unwrap();
        assert_eq!(tool.category, ToolCategory::General);
        assert!(tool.entitlement.is_none());
        assert!(tool.member_kind.is_none());
    }
}
