//! Shared wire-level types used across buses and provider contracts.
//!
//! Grounded on `ciris_engine.schemas.services.authority_core` and
//! `ciris_engine.schemas.services.context` (CIRISAgent) for the guidance/deferral
//! shapes, and on `src/llm/mod.rs` (teacher) for the chat-message shape.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

/// `messages.iter().filter(...)`-normalized request body for a structured LLM call.
#[derive(Debug, Clone)]
pub struct StructuredLlmRequest {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmCallResponse {
    pub content: String,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

// --- Wise authority -------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeferralContext {
    pub task_id: String,
    pub thought_id: String,
    pub reason: String,
    /// Raw ISO-8601 timestamp, not pre-parsed: a missing value and a malformed
    /// value are distinct failure modes for `WiseBus::send_deferral` to handle
    /// (absent → now + 1h, unparseable → now, logged), so parsing is deferred
    /// to that call site instead of happening at deserialization time.
    pub defer_until: Option<String>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeferralRequest {
    pub task_id: String,
    pub thought_id: String,
    pub reason: String,
    pub defer_until: DateTime<Utc>,
    pub context: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuidanceContext {
    pub thought_id: String,
    pub task_id: String,
    pub question: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GuidanceRequest {
    pub context: String,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub capability: Option<String>,
    #[serde(default)]
    pub inputs: HashMap<String, String>,
    #[serde(default)]
    pub urgency: Option<String>,
    #[serde(default)]
    pub provider_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WisdomAdvice {
    pub capability: String,
    pub provider_type: String,
    pub provider_name: String,
    pub confidence: f64,
    pub explanation: String,
    #[serde(default)]
    pub data: HashMap<String, String>,
    #[serde(default)]
    pub disclaimer: Option<String>,
    #[serde(default)]
    pub requires_professional: bool,
    #[serde(default)]
    pub risk: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuidanceResponse {
    #[serde(default)]
    pub selected_option: Option<String>,
    #[serde(default)]
    pub custom_guidance: Option<String>,
    pub reasoning: String,
    pub wa_id: String,
    pub signature: String,
    #[serde(default)]
    pub advice: Vec<WisdomAdvice>,
}

// --- Communication ----------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchedMessage {
    pub author: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

// --- Memory -------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryNode {
    pub id: String,
    pub attributes: HashMap<String, String>,
}

// --- Tools ----------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolExecutionResult {
    pub success: bool,
    pub output: String,
}

// --- Observer credit gate (contract boundary only; see SPEC_FULL.md §4.10) -----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditCheckResult {
    pub has_credit: bool,
    #[serde(default)]
    pub reason: Option<String>,
}
