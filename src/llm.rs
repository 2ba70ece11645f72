// Completion client for the OpenAI-compatible chat API.
//
// Every pipeline stage goes through `CompletionProvider::complete`. There is
// no internal retry: an upstream failure is propagated and fails the battle.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::config::Config;
use crate::metrics;

/// Model class picked per stage. Premium for generate/refine where output
/// quality matters, economy for the structured critique/judge stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelClass {
    Premium,
    Economy,
}

impl ModelClass {
    /// Output token ceiling. Fixed configuration, not user-controllable.
    pub fn max_tokens(self) -> u32 {
        match self {
            ModelClass::Premium => 900,
            ModelClass::Economy => 500,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ModelClass::Premium => "premium",
            ModelClass::Economy => "economy",
        }
    }
}

pub const DEFAULT_TEMPERATURE: f32 = 0.7;

/// One completion call: a system prompt, a user prompt, and sampling knobs.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: ModelClass,
    pub system_prompt: String,
    pub prompt: String,
    pub temperature: f32,
}

impl CompletionRequest {
    pub fn new(
        model: ModelClass,
        system_prompt: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            model,
            system_prompt: system_prompt.into(),
            prompt: prompt.into(),
            temperature: DEFAULT_TEMPERATURE,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

#[derive(Debug, Error)]
pub enum CompletionError {
    /// Non-success status from the completion API.
    #[error("completion API error: HTTP {status} - {body}")]
    Upstream { status: u16, body: String },

    /// Transport-level failure.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Missing or invalid client configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Seam between the orchestrator and the completion API. Tests substitute a
/// scripted provider here.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(&self, req: &CompletionRequest) -> Result<String, CompletionError>;
}

// ── OpenAI-compatible adapter ────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OpenAiProvider {
    client: reqwest::Client,
    base_url: String,
    model_premium: String,
    model_economy: String,
}

impl OpenAiProvider {
    pub fn new(
        api_key: &str,
        base_url: impl Into<String>,
        model_premium: impl Into<String>,
        model_economy: impl Into<String>,
    ) -> Result<Self, CompletionError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let auth_value = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|_| CompletionError::Config("Invalid API key format".to_string()))?;
        headers.insert(AUTHORIZATION, auth_value);

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .default_headers(headers)
            .build()
            .map_err(|e| CompletionError::Config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            model_premium: model_premium.into(),
            model_economy: model_economy.into(),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, CompletionError> {
        let api_key = config
            .openai_api_key
            .as_deref()
            .ok_or_else(|| CompletionError::Config("OPENAI_API_KEY not set".to_string()))?;
        Self::new(
            api_key,
            config.openai_base_url.clone(),
            config.model_premium.clone(),
            config.model_economy.clone(),
        )
    }

    fn model_id(&self, class: ModelClass) -> &str {
        match class {
            ModelClass::Premium => &self.model_premium,
            ModelClass::Economy => &self.model_economy,
        }
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[derive(Serialize)]
struct ChatApiRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    messages: [ApiMessage<'a>; 2],
}

#[derive(Serialize)]
struct ApiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatApiResponse {
    choices: Option<Vec<Choice>>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[async_trait]
impl CompletionProvider for OpenAiProvider {
    async fn complete(&self, req: &CompletionRequest) -> Result<String, CompletionError> {
        metrics::COMPLETION_CALLS_TOTAL
            .with_label_values(&[req.model.label()])
            .inc();

        let api_req = ChatApiRequest {
            model: self.model_id(req.model),
            max_tokens: req.model.max_tokens(),
            temperature: req.temperature,
            messages: [
                ApiMessage {
                    role: "system",
                    content: &req.system_prompt,
                },
                ApiMessage {
                    role: "user",
                    content: &req.prompt,
                },
            ],
        };

        let response = self
            .client
            .post(self.chat_url())
            .json(&api_req)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(CompletionError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatApiResponse = serde_json::from_str(&body).map_err(|e| {
            CompletionError::Upstream {
                status: status.as_u16(),
                body: format!("Invalid JSON in response: {e}"),
            }
        })?;

        let content = parsed
            .choices
            .and_then(|c| c.into_iter().next())
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .unwrap_or_default();

        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_ceilings_per_class() {
        assert_eq!(ModelClass::Premium.max_tokens(), 900);
        assert_eq!(ModelClass::Economy.max_tokens(), 500);
    }

    #[test]
    fn test_request_defaults_to_standard_temperature() {
        let req = CompletionRequest::new(ModelClass::Premium, "sys", "user");
        assert!((req.temperature - 0.7).abs() < f32::EPSILON);
        let cool = req.with_temperature(0.3);
        assert!((cool.temperature - 0.3).abs() < f32::EPSILON);
    }

    #[test]
    fn test_response_content_extraction() {
        let body = r#"{"choices":[{"message":{"content":"fn main() {}"}}]}"#;
        let parsed: ChatApiResponse = serde_json::from_str(body).unwrap();
        let content = parsed
            .choices
            .and_then(|c| c.into_iter().next())
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .unwrap_or_default();
        assert_eq!(content, "fn main() {}");
    }

    #[test]
    fn test_empty_choices_yield_empty_content() {
        let body = r#"{"choices":[]}"#;
        let parsed: ChatApiResponse = serde_json::from_str(body).unwrap();
        let content = parsed
            .choices
            .and_then(|c| c.into_iter().next())
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .unwrap_or_default();
        assert_eq!(content, "");
    }
}
