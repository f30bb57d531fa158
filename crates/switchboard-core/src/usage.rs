use serde::{Deserialize, Serialize};
use serde_json::Value;

/// USD per million tokens.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl Default for TokenPricing {
    fn default() -> Self {
        Self {
            input_per_million: 0.075,
            output_per_million: 0.30,
        }
    }
}

/// Token counts reported by the engine when a run completes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct UsageCost {
    pub input_cost: f64,
    pub output_cost: f64,
    pub total_cost: f64,
}

fn count(metrics: &Value, key: &str) -> u64 {
    match metrics.get(key) {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        // Some engines report per-message lists; sum them.
        Some(Value::Array(items)) => items.iter().filter_map(Value::as_u64).sum(),
        _ => 0,
    }
}

impl TokenUsage {
    /// Read a completion `metrics` object. `None` when it reports no tokens.
    pub fn from_metrics(metrics: &Value) -> Option<Self> {
        let input_tokens = count(metrics, "input_tokens");
        let output_tokens = match count(metrics, "output_tokens") {
            0 => count(metrics, "response_tokens"),
            n => n,
        };
        let total_tokens = match count(metrics, "total_tokens") {
            0 => input_tokens + output_tokens,
            n => n,
        };
        if total_tokens == 0 {
            return None;
        }
        Some(Self {
            input_tokens,
            output_tokens,
            total_tokens,
            model: metrics.get("model").and_then(Value::as_str).map(str::to_owned),
        })
    }

    pub fn cost(&self, pricing: &TokenPricing) -> UsageCost {
        let input_cost = round8(self.input_tokens as f64 / 1_000_000.0 * pricing.input_per_million);
        let output_cost = round8(self.output_tokens as f64 / 1_000_000.0 * pricing.output_per_million);
        UsageCost {
            input_cost,
            output_cost,
            total_cost: round8(input_cost + output_cost),
        }
    }
}

fn round8(v: f64) -> f64 {
    (v * 1e8).round() / 1e8
}
