use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::mode::Mode;
use crate::tools::{ToolDescriptor, ToolSet};

/// How per-request configuration reaches the engine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationStrategy {
    /// Compose an immutable per-call configuration; nothing shared is mutated.
    #[default]
    Merge,
    /// Serialize calls and temporarily apply the configuration to an ambient runtime.
    Leased,
}

impl std::str::FromStr for IsolationStrategy {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "merge" => Ok(Self::Merge),
            "leased" => Ok(Self::Leased),
            other => Err(format!("unknown isolation strategy: {other}")),
        }
    }
}

/// Process-wide default configuration of the execution runtime.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeBaseline {
    #[serde(default)]
    pub base_instructions: Vec<String>,
    #[serde(default)]
    pub base_tools: ToolSet,
}

impl RuntimeBaseline {
    pub fn new(base_instructions: Vec<String>, base_tools: ToolSet) -> Self {
        Self {
            base_instructions,
            base_tools,
        }
    }

    /// The configuration the runtime carries when no request is in flight.
    pub fn to_configuration(&self) -> RuntimeConfiguration {
        RuntimeConfiguration {
            instructions: self.base_instructions.clone(),
            tools: self.base_tools.clone(),
            dependencies: Map::new(),
        }
    }
}

/// Tools to add and remove relative to the baseline.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ToolDelta {
    pub added: Vec<ToolDescriptor>,
    pub removed: Vec<String>,
}

impl ToolDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Per-request delta on top of the baseline. Built once, never mutated.
#[derive(Clone, Debug, PartialEq)]
pub struct RequestOverride {
    mode: Mode,
    extra_instructions: Option<String>,
    added_tools: Vec<ToolDescriptor>,
    removed_tools: Vec<String>,
    dependencies: Map<String, Value>,
}

impl RequestOverride {
    pub fn builder(mode: Mode) -> RequestOverrideBuilder {
        RequestOverrideBuilder {
            inner: RequestOverride {
                mode,
                extra_instructions: None,
                added_tools: Vec::new(),
                removed_tools: Vec::new(),
                dependencies: Map::new(),
            },
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn extra_instructions(&self) -> Option<&str> {
        self.extra_instructions.as_deref()
    }

    pub fn added_tools(&self) -> &[ToolDescriptor] {
        &self.added_tools
    }

    pub fn removed_tools(&self) -> &[String] {
        &self.removed_tools
    }

    pub fn dependencies(&self) -> &Map<String, Value> {
        &self.dependencies
    }

    /// `baseline ⊕ self`: instructions appended, tools `(base ∪ added) \ removed`
    /// with removal winning, dependencies taken from the override.
    pub fn compose(&self, baseline: &RuntimeBaseline) -> RuntimeConfiguration {
        let mut instructions = baseline.base_instructions.clone();
        if let Some(extra) = self.extra_instructions.as_deref() {
            if !extra.trim().is_empty() {
                instructions.push(extra.to_owned());
            }
        }

        let mut tools = baseline.base_tools.clone();
        for tool in &self.added_tools {
            tools.insert(tool.clone());
        }
        for name in &self.removed_tools {
            tools.remove(name);
        }

        RuntimeConfiguration {
            instructions,
            tools,
            dependencies: self.dependencies.clone(),
        }
    }
}

pub struct RequestOverrideBuilder {
    inner: RequestOverride,
}

impl RequestOverrideBuilder {
    pub fn instructions(mut self, extra: impl Into<String>) -> Self {
        self.inner.extra_instructions = Some(extra.into());
        self
    }

    pub fn delta(mut self, delta: ToolDelta) -> Self {
        self.inner.added_tools.extend(delta.added);
        self.inner.removed_tools.extend(delta.removed);
        self
    }

    pub fn dependency(mut self, key: impl Into<String>, value: Value) -> Self {
        self.inner.dependencies.insert(key.into(), value);
        self
    }

    pub fn build(self) -> RequestOverride {
        self.inner
    }
}

/// The effective configuration a single engine call observes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfiguration {
    pub instructions: Vec<String>,
    pub tools: ToolSet,
    #[serde(default)]
    pub dependencies: Map<String, Value>,
}
