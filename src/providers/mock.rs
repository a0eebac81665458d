//! In-process mock LLM provider for tests and offline development.
//!
//! Grounded on CIRISAgent's `MockLLMProvider` convention (referenced from
//! `tests/test_prohibition_system.py` and friends): a provider registered with
//! `ProviderKind::Mock` that returns a scripted response without making a
//! network call, so test suites can exercise bus failover and registry
//! isolation without real credentials.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use crate::pricing::ResourceUsage;
use crate::registry::{BaseProvider, LlmCallError, LlmProviderService, ProviderErrorKind};
use crate::types::{LlmCallResponse, StructuredLlmRequest};

const CALL_LLM_STRUCTURED_CAPABILITY: &str = "call_llm_structured";

pub struct MockLlmProvider {
    pub canned_response: String,
    pub model_name: String,
    pub fail_after: Option<u64>,
    calls: AtomicU64,
}

impl MockLlmProvider {
    pub fn new(canned_response: impl Into<String>) -> Self {
        Self {
            canned_response: canned_response.into(),
            model_name: "mock-model".to_string(),
            fail_after: None,
            calls: AtomicU64::new(0),
        }
    }

    pub fn failing_after(mut self, calls: u64) -> Self {
        self.fail_after = Some(calls);
        self
    }
}

#[async_trait]
impl BaseProvider for MockLlmProvider {
    fn get_capabilities(&self) -> HashSet<String> {
        [CALL_LLM_STRUCTURED_CAPABILITY.to_string()].into_iter().collect()
    }
}

#[async_trait]
impl LlmProviderService for MockLlmProvider {
    async fn call_llm_structured(
        &self,
        request: &StructuredLlmRequest,
    ) -> Result<(LlmCallResponse, ResourceUsage), LlmCallError> {
        let call_number = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(limit) = self.fail_after {
            if call_number > limit {
                return Err(LlmCallError {
                    kind: ProviderErrorKind::Transient,
                    message: "mock provider scripted to fail after call limit".to_string(),
                });
            }
        }

        let prompt_tokens = request.messages.iter().map(|m| m.content.len() as u64 / 4).sum::<u64>().max(1);
        let completion_tokens = self.canned_response.len() as u64 / 4;

        Ok((
            LlmCallResponse {
                content: self.canned_response.clone(),
                model: self.model_name.clone(),
                prompt_tokens,
                completion_tokens,
            },
            ResourceUsage {
                tokens_input: prompt_tokens,
                tokens_output: completion_tokens,
                tokens_used: prompt_tokens + completion_tokens,
                cost_cents: 0.0,
                carbon_grams: 0.0,
                energy_kwh: 0.0,
                model_used: self.model_name.clone(),
            },
        ))
    }

    fn get_available_models(&self) -> Vec<String> {
        vec![self.model_name.clone()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returns_canned_response() {
        let provider = MockLlmProvider::new("hello there");
        let request = StructuredLlmRequest { messages: vec![], max_tokens: None, temperature: None };
        let (response, usage) = provider.call_llm_structured(&request).await.unwrap();
        assert_eq!(response.content, "hello there");
        assert_eq!(usage.cost_cents, 0.0);
    }

    #[tokio::test]
    async fn fails_after_configured_call_count() {
        let provider = MockLlmProvider::new("ok").failing_after(1);
        let request = StructuredLlmRequest { messages: vec![], max_tokens: None, temperature: None };
        assert!(provider.call_llm_structured(&request).await.is_ok());
        assert!(provider.call_llm_structured(&request).await.is_err());
    }
}
