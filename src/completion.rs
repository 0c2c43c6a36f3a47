//! Completion client for an OpenAI-compatible chat completions API.
//!
//! Two layers:
//!
//! - **[`CompletionService`]**: the raw transport. [`OpenAiCompatibleService`]
//!   POSTs `{model, messages, max_output_tokens, temperature}` with a bearer
//!   token and returns `choices[0].message.content`, or an error.
//! - **[`CompletionClient`]**: the "always respond" policy over any service.
//!   Blank content becomes a random fallback message; any error becomes a
//!   fixed apology. It never returns an empty string and never retries.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::config::CompletionConfig;

/// Canned replies used when the service answers with nothing.
pub const FALLBACK_MESSAGES: [&str; 4] = [
    "Hmm, I'm not sure about that, but I can help you figure it out!",
    "Good question! I don't have that info yet, but here's something useful…",
    "I don't know exactly, but let me give you a tip that might help!",
    "That's tricky! Let's explore together.",
];

/// Reply used when the request fails outright.
pub const APOLOGY: &str = "Oops! Something went wrong while fetching the answer. \
But I'm still here to help, feel free to ask anything!";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Request body sent to the completion endpoint.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_output_tokens: u32,
    pub temperature: f32,
}

/// Raw access to a completion backend.
#[async_trait]
pub trait CompletionService: Send + Sync {
    /// Returns the untrimmed content of the first choice. `null` content is
    /// returned as an empty string.
    async fn complete(&self, request: &CompletionRequest) -> Result<String>;
}

/// HTTP transport for OpenAI-compatible endpoints (OpenRouter by default).
pub struct OpenAiCompatibleService {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl OpenAiCompatibleService {
    pub fn new(config: &CompletionConfig, api_key: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key,
        })
    }
}

#[async_trait]
impl CompletionService for OpenAiCompatibleService {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await
            .context("completion request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("completion API error {}: {}", status, body_text);
        }

        let json: serde_json::Value = response
            .json()
            .await
            .context("completion response is not JSON")?;
        parse_completion_response(&json)
    }
}

/// Extracts `choices[0].message.content`.
///
/// A missing choice or message is an error; a `null` content is treated as
/// an empty reply.
pub fn parse_completion_response(json: &serde_json::Value) -> Result<String> {
    let message = json
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .ok_or_else(|| anyhow!("response has no choices[0].message"))?;

    match message.get("content") {
        Some(serde_json::Value::String(s)) => Ok(s.clone()),
        Some(serde_json::Value::Null) => Ok(String::new()),
        Some(other) => bail!("message.content is not a string: {}", other),
        None => bail!("response has no choices[0].message.content"),
    }
}

/// Where a reply came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplySource {
    Completion,
    Fallback,
    Apology,
    NoKnowledge,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
    pub source: ReplySource,
}

/// Policy wrapper that always yields a non-empty reply.
#[derive(Clone)]
pub struct CompletionClient {
    service: Arc<dyn CompletionService>,
    model: String,
    max_output_tokens: u32,
    temperature: f32,
}

impl CompletionClient {
    pub fn new(service: Arc<dyn CompletionService>, config: &CompletionConfig) -> Self {
        Self {
            service,
            model: config.model.clone(),
            max_output_tokens: config.max_output_tokens,
            temperature: config.temperature,
        }
    }

    /// Builds the HTTP-backed client from configuration.
    pub fn from_config(config: &CompletionConfig, api_key: String) -> Result<Self> {
        let service = OpenAiCompatibleService::new(config, api_key)?;
        Ok(Self::new(Arc::new(service), config))
    }

    pub fn build_request(&self, system_instruction: &str, content: &str) -> CompletionRequest {
        CompletionRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage::system(system_instruction), ChatMessage::user(content)],
            max_output_tokens: self.max_output_tokens,
            temperature: self.temperature,
        }
    }

    /// Sends one request. Never fails and never returns an empty reply.
    pub async fn respond(&self, system_instruction: &str, content: &str) -> Reply {
        let request = self.build_request(system_instruction, content);
        match self.service.complete(&request).await {
            Ok(raw) => {
                let text = raw.trim();
                if text.is_empty() {
                    Reply {
                        text: pick_fallback().to_string(),
                        source: ReplySource::Fallback,
                    }
                } else {
                    Reply {
                        text: text.to_string(),
                        source: ReplySource::Completion,
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %format!("{:#}", e), "completion failed");
                Reply {
                    text: APOLOGY.to_string(),
                    source: ReplySource::Apology,
                }
            }
        }
    }
}

fn pick_fallback() -> &'static str {
    FALLBACK_MESSAGES
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(FALLBACK_MESSAGES[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    struct Scripted {
        result: Mutex<Option<Result<String>>>,
        seen: Mutex<Vec<CompletionRequest>>,
    }

    impl Scripted {
        fn new(result: Result<String>) -> Arc<Self> {
            Arc::new(Self {
                result: Mutex::new(Some(result)),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CompletionService for Scripted {
        async fn complete(&self, request: &CompletionRequest) -> Result<String> {
            self.seen.lock().unwrap().push(request.clone());
            self.result
                .lock()
                .unwrap()
                .take()
                .unwrap_or_else(|| Err(anyhow!("called twice")))
        }
    }

    fn client(service: Arc<Scripted>) -> CompletionClient {
        CompletionClient::new(service, &CompletionConfig::default())
    }

    #[test]
    fn parses_first_choice_content() {
        let body = json!({"choices": [{"message": {"role": "assistant", "content": " hi "}}]});
        assert_eq!(parse_completion_response(&body).unwrap(), " hi ");
    }

    #[test]
    fn null_content_is_empty() {
        let body = json!({"choices": [{"message": {"content": null}}]});
        assert_eq!(parse_completion_response(&body).unwrap(), "");
    }

    #[test]
    fn missing_fields_are_errors() {
        assert!(parse_completion_response(&json!({})).is_err());
        assert!(parse_completion_response(&json!({"choices": []})).is_err());
        assert!(parse_completion_response(&json!({"choices": [{"message": {}}]})).is_err());
        assert!(parse_completion_response(&json!({"error": {"message": "quota"}})).is_err());
    }

    #[tokio::test]
    async fn trims_successful_reply() {
        let svc = Scripted::new(Ok("  He is a software engineer.\n".to_string()));
        let reply = client(svc.clone()).respond("sys", "content").await;
        assert_eq!(reply.text, "He is a software engineer.");
        assert_eq!(reply.source, ReplySource::Completion);

        let seen = svc.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].messages[0], ChatMessage::system("sys"));
        assert_eq!(seen[0].messages[1], ChatMessage::user("content"));
        assert_eq!(seen[0].max_output_tokens, 80);
    }

    #[tokio::test]
    async fn blank_reply_uses_fallback() {
        let reply = client(Scripted::new(Ok(" \n ".to_string())))
            .respond("sys", "c")
            .await;
        assert_eq!(reply.source, ReplySource::Fallback);
        assert!(FALLBACK_MESSAGES.contains(&reply.text.as_str()));
    }

    #[tokio::test]
    async fn errors_become_apology_without_retry() {
        let svc = Scripted::new(Err(anyhow!("timed out")));
        let reply = client(svc.clone()).respond("sys", "c").await;
        assert_eq!(reply.text, APOLOGY);
        assert_eq!(reply.source, ReplySource::Apology);
        assert_eq!(svc.seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn request_serializes_wire_fields() {
        let req = client(Scripted::new(Ok(String::new()))).build_request("s", "u");
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["model"], "nvidia/nemotron-3-nano-30b-a3b:free");
        assert_eq!(v["messages"][0]["role"], "system");
        assert_eq!(v["messages"][1]["role"], "user");
        assert_eq!(v["max_output_tokens"], 80);
        assert!(v.get("temperature").is_some());
    }
}
