use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Assistant,
}

impl TurnRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl std::str::FromStr for TurnRole {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            other => Err(format!("unknown turn role: {other}")),
        }
    }
}

/// One persisted conversation message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub content: String,
    pub created_at: String,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum SummarizerError {
    #[error("summarizer request failed: {0}")]
    Request(String),
    #[error("summarizer returned an unusable title: {0:?}")]
    EmptyTitle(String),
}

/// Produces a short conversation title.
#[async_trait]
pub trait TitleSummarizer: Send + Sync {
    async fn summarize_title(&self, turns: &[Turn]) -> Result<String, SummarizerError>;
}
