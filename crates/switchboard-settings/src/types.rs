use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use switchboard_core::config::{IsolationStrategy, RuntimeBaseline};
use switchboard_core::tools::{ToolCategory, ToolDescriptor, ToolSet};
use switchboard_core::usage::TokenPricing;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchboardSettings {
    pub server: ServerSettings,
    pub engine: EngineSettings,
    pub summarizer: SummarizerSettings,
    pub orchestration: OrchestrationSettings,
    pub baseline: BaselineSettings,
    /// Entitlement-gated tools that may be added per user.
    pub catalog: Vec<ToolDescriptor>,
    pub storage: StorageSettings,
    pub telemetry: TelemetrySettings,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// SSE keep-alive comment interval.
    pub keep_alive_secs: u64,
    pub cors_allow_any: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8787,
            keep_alive_secs: 15,
            cors_allow_any: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Run endpoint of the remote execution engine.
    pub url: String,
    /// Environment variable holding the engine bearer token, if any.
    pub api_key_env: String,
    pub connect_timeout_secs: u64,
    /// Abort a stream that stays silent this long.
    pub idle_timeout_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:7777/runs".into(),
            api_key_env: "SWITCHBOARD_ENGINE_API_KEY".into(),
            connect_timeout_secs: 10,
            idle_timeout_secs: 90,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SummarizerSettings {
    /// Title endpoint. Naming is disabled when unset.
    pub url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for SummarizerSettings {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: 30,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestrationSettings {
    pub isolation: IsolationStrategy,
    pub delegation_window_ms: u64,
    pub run_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_base_secs: u64,
    pub retry_cap_secs: u64,
    /// Consecutive tool-unavailable errors before a fallback notice.
    pub tool_unavailable_threshold: u32,
    /// Quick mode drops the deep-research delegates.
    pub quick_excludes_deep_delegates: bool,
    pub memory_limit: usize,
    /// Prices for the per-run usage event.
    pub pricing: TokenPricing,
}

impl Default for OrchestrationSettings {
    fn default() -> Self {
        Self {
            isolation: IsolationStrategy::Merge,
            delegation_window_ms: 10_000,
            run_timeout_secs: 120,
            max_retries: 3,
            retry_base_secs: 5,
            retry_cap_secs: 60,
            tool_unavailable_threshold: 3,
            quick_excludes_deep_delegates: true,
            memory_limit: 20,
            pricing: TokenPricing::default(),
        }
    }
}

impl OrchestrationSettings {
    pub fn delegation_window(&self) -> Duration {
        Duration::from_millis(self.delegation_window_ms)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BaselineSettings {
    pub instructions: Vec<String>,
    pub tools: Vec<ToolDescriptor>,
}

impl Default for BaselineSettings {
    fn default() -> Self {
        Self {
            instructions: vec![
                "You are a personal assistant that coordinates a team of specialists.".into(),
                "Delegate media analysis to the matching specialist and answer everything else yourself.".into(),
            ],
            tools: default_tools(),
        }
    }
}

impl BaselineSettings {
    pub fn to_baseline(&self) -> RuntimeBaseline {
        RuntimeBaseline::new(self.instructions.clone(), self.tools.iter().cloned().collect::<ToolSet>())
    }
}

fn default_tools() -> Vec<ToolDescriptor> {
    vec![
        ToolDescriptor::new("duckduckgo_search", ToolCategory::DirectAnswer)
            .with_description("News, current events and quick facts"),
        ToolDescriptor::new("exa_search", ToolCategory::DirectAnswer).with_description("Semantic web search"),
        ToolDescriptor::new("tavily_search", ToolCategory::DirectAnswer).with_description("Deep web search"),
        ToolDescriptor::new("think", ToolCategory::Reasoning),
        ToolDescriptor::new("analyze", ToolCategory::Reasoning),
        ToolDescriptor::new("search_memories", ToolCategory::General),
        ToolDescriptor::new("delegate_task_to_member", ToolCategory::Coordination),
        ToolDescriptor::agent("audio-specialist", None),
        ToolDescriptor::agent("video-specialist", None),
        ToolDescriptor::agent("image-specialist", None),
        ToolDescriptor::agent("document-specialist", None),
        ToolDescriptor::team("research-team", ToolCategory::DeepDelegate)
            .with_description("Web researcher and research analyst"),
        ToolDescriptor::agent("web-researcher", Some("research-team")),
        ToolDescriptor::agent("research-analyst", Some("research-team")),
        ToolDescriptor::team("law-team", ToolCategory::DeepDelegate)
            .with_description("Legal researcher and legal analyst"),
        ToolDescriptor::agent("legal-researcher", Some("law-team")),
        ToolDescriptor::agent("legal-analyst", Some("law-team")),
    ]
}

fn default_catalog() -> Vec<ToolDescriptor> {
    vec![
        ToolDescriptor::new("gmail_send", ToolCategory::Integration).with_entitlement("google"),
        ToolDescriptor::new("gmail_search", ToolCategory::Integration).with_entitlement("google"),
        ToolDescriptor::new("google_calendar", ToolCategory::Integration).with_entitlement("google"),
        ToolDescriptor::new("google_sheets", ToolCategory::Integration).with_entitlement("google"),
        ToolDescriptor::new("notion_search", ToolCategory::Integration).with_entitlement("notion"),
        ToolDescriptor::new("notion_create_page", ToolCategory::Integration).with_entitlement("notion"),
    ]
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub db_path: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            db_path: switchboard_dir().join("switchboard.db"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    pub log_level: String,
    /// Per-module filter overrides, e.g. `{"switchboard_engine": "debug"}`.
    pub module_levels: BTreeMap<String, String>,
    pub json: bool,
    pub log_to_sqlite: bool,
    pub log_db_path: PathBuf,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            module_levels: BTreeMap::new(),
            json: true,
            log_to_sqlite: true,
            log_db_path: switchboard_dir().join("logs.db"),
        }
    }
}

/// `~/.switchboard`.
pub fn switchboard_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".switchboard")
}

impl Default for SwitchboardSettings {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            engine: EngineSettings::default(),
            summarizer: SummarizerSettings::default(),
            orchestration: OrchestrationSettings::default(),
            baseline: BaselineSettings::default(),
            catalog: default_catalog(),
            storage: StorageSettings::default(),
            telemetry: TelemetrySettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_orchestration_values() {
        let o = OrchestrationSettings::default();
        assert_eq!(o.delegation_window(), Duration::from_secs(10));
        assert_eq!(o.run_timeout(), Duration::from_secs(120));
        assert_eq!(o.max_retries, 3);
        assert_eq!(o.isolation, IsolationStrategy::Merge);
        assert_eq!(o.pricing, TokenPricing::default());
    }

    #[test]
    fn module_levels_from_json() {
        let s: SwitchboardSettings = serde_json::from_value(serde_json::json!({
            "telemetry": {"module_levels": {"switchboard_engine": "debug"}}
        }))
        .unwrap();
        assert_eq!(s.telemetry.module_levels.get("switchboard_engine").map(String::as_str), Some("debug"));
        assert_eq!(s.telemetry.log_level, "info");
    }

    #[test]
    fn partial_pricing_keeps_other_defaults() {
        let s: SwitchboardSettings =
            serde_json::from_value(serde_json::json!({"orchestration": {"pricing": {"output_per_million": 0.6}}}))
                .unwrap();
        assert_eq!(s.orchestration.pricing.output_per_million, 0.6);
        assert_eq!(s.orchestration.pricing.input_per_million, 0.075);
        assert_eq!(s.orchestration.max_retries, 3);
    }

    #[test]
    fn default_baseline_has_search_and_delegates() {
        let base = BaselineSettings::default().to_baseline();
        assert!(base.base_tools.by_category(ToolCategory::DirectAnswer).count() >= 2);
        assert!(base.base_tools.contains("research-team"));
        assert_eq!(
            base.base_tools.get("web-researcher").and_then(|t| t.parent.as_deref()),
            Some("research-team")
        );
    }

    #[test]
    fn catalog_entries_are_gated() {
        let s = SwitchboardSettings::default();
        assert!(!s.catalog.is_empty());
        assert!(s.catalog.iter().all(|t| t.entitlement.is_some()));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let s: SwitchboardSettings = serde_json::from_str(r#"{"server": {"port": 9000}}"#).unwrap();
        assert_eq!(s.server.port, 9000);
        assert_eq!(s.server.host, "127.0.0.1");
        assert_eq!(s.orchestration.run_timeout_secs, 120);
    }
}
