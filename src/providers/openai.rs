//! OpenAI-backed [`LlmProviderService`].
//!
//! Grounded on the teacher's `src/llm/providers/openai/client.rs` for header
//! construction, request/response shape, and status-code-to-error mapping.
//! Streaming is dropped: SPEC_FULL.md's bus contract only ever needs one
//! complete response per call (see `bus::base` module doc).

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::pricing::{PricingCalculator, ResourceUsage};
use crate::registry::{BaseProvider, LlmCallError, LlmProviderService, ProviderErrorKind};
use crate::types::{ChatMessage, LlmCallResponse, MessageRole, StructuredLlmRequest};
use std::sync::Arc;

const CALL_LLM_STRUCTURED_CAPABILITY: &str = "call_llm_structured";
const MAX_RETRIES: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
    pub default_model: String,
    pub timeout_seconds: u64,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            default_model: "gpt-4o-mini".to_string(),
            timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Serialize)]
struct OpenAiChatMessage {
    role: &'static str,
    content: String,
}

impl From<&ChatMessage> for OpenAiChatMessage {
    fn from(msg: &ChatMessage) -> Self {
        let role = match msg.role {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
        };
        Self { role, content: msg.content.clone() }
    }
}

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    model: String,
    choices: Vec<OpenAiChoice>,
    usage: OpenAiUsage,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponseMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct OpenAiErrorBody {
    error: OpenAiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct OpenAiErrorDetail {
    message: String,
}

pub struct OpenAiProvider {
    http: reqwest::Client,
    config: OpenAiConfig,
    pricing: Arc<PricingCalculator>,
}

impl OpenAiProvider {
    pub fn new(config: OpenAiConfig, pricing: Arc<PricingCalculator>) -> Self {
        Self { http: reqwest::Client::new(), config, pricing }
    }

    fn build_headers(&self) -> Result<HeaderMap, LlmCallError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let auth_value = HeaderValue::from_str(&format!("Bearer {}", self.config.api_key)).map_err(|e| LlmCallError {
            kind: ProviderErrorKind::Validation,
            message: format!("invalid API key format: {e}"),
        })?;
        headers.insert(AUTHORIZATION, auth_value);
        Ok(headers)
    }

    fn map_status_error(status: u16, body: &str) -> LlmCallError {
        let message = serde_json::from_str::<OpenAiErrorBody>(body)
            .map(|e| e.error.message)
            .unwrap_or_else(|_| body.to_string());

        let kind = match status {
            429 => ProviderErrorKind::Throttled,
            400 | 401 | 403 => ProviderErrorKind::Validation,
            413 => ProviderErrorKind::ContextLengthExceeded,
            _ => ProviderErrorKind::Transient,
        };
        LlmCallError { kind, message }
    }

    async fn attempt(&self, request: &StructuredLlmRequest) -> Result<(LlmCallResponse, ResourceUsage), LlmCallError> {
        let headers = self.build_headers()?;
        let body = OpenAiRequest {
            model: self.config.default_model.clone(),
            messages: request.messages.iter().map(OpenAiChatMessage::from).collect(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stream: false,
        };

        let url = format!("{}/chat/completions", self.config.base_url);
        let response = self
            .http
            .post(&url)
            .headers(headers)
            .json(&body)
            .timeout(Duration::from_secs(self.config.timeout_seconds))
            .send()
            .await
            .map_err(|e| LlmCallError { kind: ProviderErrorKind::Transient, message: format!("network error: {e}") })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(Self::map_status_error(status, &text));
        }

        let parsed: OpenAiResponse = response
            .json()
            .await
            .map_err(|e| LlmCallError { kind: ProviderErrorKind::Transient, message: format!("malformed response: {e}") })?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();

        let usage = self.pricing.calculate_cost_and_impact(
            &parsed.model,
            parsed.usage.prompt_tokens,
            parsed.usage.completion_tokens,
            Some("openai"),
            None,
        );

        Ok((
            LlmCallResponse {
                content,
                model: parsed.model,
                prompt_tokens: parsed.usage.prompt_tokens,
                completion_tokens: parsed.usage.completion_tokens,
            },
            usage,
        ))
    }
}

#[async_trait]
impl BaseProvider for OpenAiProvider {
    fn get_capabilities(&self) -> HashSet<String> {
        [CALL_LLM_STRUCTURED_CAPABILITY.to_string()].into_iter().collect()
    }
}

#[async_trait]
impl LlmProviderService for OpenAiProvider {
    async fn call_llm_structured(
        &self,
        request: &StructuredLlmRequest,
    ) -> Result<(LlmCallResponse, ResourceUsage), LlmCallError> {
        let mut backoff = BACKOFF_BASE;
        let mut last_error = None;

        for attempt in 0..MAX_RETRIES {
            match self.attempt(request).await {
                Ok(result) => return Ok(result),
                Err(e) if e.kind == ProviderErrorKind::Validation || e.kind == ProviderErrorKind::ContextLengthExceeded => {
                    return Err(e);
                }
                Err(e) => {
                    warn!(attempt, error = %e.message, "OpenAI call failed, retrying");
                    last_error = Some(e);
                    if attempt + 1 < MAX_RETRIES {
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(BACKOFF_CAP);
                    }
                }
            }
        }

        Err(last_error.unwrap_or(LlmCallError {
            kind: ProviderErrorKind::Transient,
            message: "exhausted retries with no recorded error".to_string(),
        }))
    }

    fn get_available_models(&self) -> Vec<String> {
        debug!("listing OpenAI models from pricing table");
        self.pricing
            .list_available_models(true, Some("openai"))
            .into_iter()
            .map(|(_, model_id)| model_id)
            .collect()
    }
}
