use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use switchboard_core::summarizer::{SummarizerError, TitleSummarizer, Turn};

pub const MAX_TITLE_WORDS: usize = 10;

/// Calls a completion endpoint that turns a conversation into a short title.
pub struct HttpSummarizer {
    client: Client,
    url: String,
}

#[derive(Serialize)]
struct TitleRequest {
    system: String,
    prompt: String,
    max_words: usize,
}

#[derive(Deserialize)]
struct TitleResponse {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

impl HttpSummarizer {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, SummarizerError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SummarizerError::Request(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, url: url.into() })
    }
}

pub fn system_prompt(max_words: usize) -> String {
    format!(
        "Generate a descriptive name for this conversation in maximum {max_words} words. \
         Be specific and capture the main topic or task. \
         NEVER use generic words like 'test', 'hey', 'hello', 'hi', or 'greeting'. \
         Focus on the actual content and purpose of the conversation."
    )
}

pub fn conversation_prompt(turns: &[Turn]) -> String {
    let mut prompt = String::from("Conversation:\n");
    for turn in turns {
        prompt.push_str(&turn.role.as_str().to_uppercase());
        prompt.push_str(": ");
        prompt.push_str(&turn.content);
        prompt.push('\n');
    }
    prompt.push_str("\nSession Name:");
    prompt
}

#[async_trait]
impl TitleSummarizer for HttpSummarizer {
    #[instrument(skip_all, fields(turns = turns.len()))]
    async fn summarize_title(&self, turns: &[Turn]) -> Result<String, SummarizerError> {
        let body = TitleRequest {
            system: system_prompt(MAX_TITLE_WORDS),
            prompt: conversation_prompt(turns),
            max_words: MAX_TITLE_WORDS,
        };

        let resp = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| SummarizerError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(SummarizerError::Request(format!("status {status}: {text}")));
        }

        let parsed: TitleResponse = resp
            .json()
            .await
            .map_err(|e| SummarizerError::Request(format!("invalid response body: {e}")))?;

        parsed
            .title
            .or(parsed.content)
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| SummarizerError::EmptyTitle(String::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};

    async fn title(Json(body): Json<Value>) -> axum::response::Response {
        let prompt = body["prompt"].as_str().unwrap_or("");
        if prompt.contains("fail") {
            return (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response();
        }
        if prompt.contains("blank") {
            return Json(json!({"title": "  "})).into_response();
        }
        if prompt.contains("legacy") {
            return Json(json!({"content": "Legacy Shape Title"})).into_response();
        }
        assert!(body["system"].as_str().unwrap_or("").contains("maximum 10 words"));
        Json(json!({"title": "Planning A Trip To Lisbon"})).into_response()
    }

    async fn spawn() -> String {
        let app = Router::new().route("/title", post(title));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/title")
    }

    fn turns(first: &str) -> Vec<Turn> {
        vec![Turn::user(first), Turn::assistant("Sure, here are some ideas.")]
    }

    #[test]
    fn prompt_layout() {
        let prompt = conversation_prompt(&turns("Plan a trip"));
        assert!(prompt.starts_with("Conversation:\nUSER: Plan a trip\nASSISTANT: "));
        assert!(prompt.ends_with("\n\nSession Name:"));
    }

    #[tokio::test]
    async fn returns_title() {
        let s = HttpSummarizer::new(spawn().await, Duration::from_secs(5)).unwrap();
        let title = s.summarize_title(&turns("Plan a trip to Lisbon")).await.unwrap();
        assert_eq!(title, "Planning A Trip To Lisbon");
    }

    #[tokio::test]
    async fn accepts_content_field() {
        let s = HttpSummarizer::new(spawn().await, Duration::from_secs(5)).unwrap();
        let title = s.summarize_title(&turns("legacy")).await.unwrap();
        assert_eq!(title, "Legacy Shape Title");
    }

    #[tokio::test]
    async fn failures_are_errors() {
        let s = HttpSummarizer::new(spawn().await, Duration::from_secs(5)).unwrap();
        assert!(matches!(
            s.summarize_title(&turns("fail")).await,
            Err(SummarizerError::Request(_))
        ));
        assert!(matches!(
            s.summarize_title(&turns("blank")).await,
            Err(SummarizerError::EmptyTitle(_))
        ));
    }
}
