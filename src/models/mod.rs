use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Role of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

/// A single turn in a conversation, provider-agnostic.
///
/// The first message in a handler's history is always the system message.
/// An assistant message that carries `tool_calls` must be followed by one
/// tool-role message per call id before the next user turn; histories that
/// violate this are repaired by truncation, not rejected.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Assistant message that requests tool invocations.
    pub fn assistant_with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls,
            tool_call_id: None,
        }
    }

    /// Tool-role message carrying the result for one tool call.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

/// A structured request from the model to invoke a named tool.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionCall,
}

/// The function half of a tool call: name plus JSON-encoded arguments.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded argument object, exactly as the upstream produced it.
    pub arguments: String,
}

/// Where a usage record's numbers came from.
///
/// Estimated counters are a heuristic fallback for upstreams that omit
/// usage data; telemetry consumers must not treat them as provider-grade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageSource {
    Provider,
    Estimated,
}

/// Token usage counters for one exchange.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub source: UsageSource,
}

impl Usage {
    pub fn provider(prompt_tokens: u32, completion_tokens: u32, total_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens,
            source: UsageSource::Provider,
        }
    }

    pub fn estimated(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            source: UsageSource::Estimated,
        }
    }

    /// Add another round's counters to this one (tool loops span several
    /// upstream calls, billed as one exchange).
    pub fn accumulate(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

impl Default for Usage {
    fn default() -> Self {
        Self {
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
            source: UsageSource::Provider,
        }
    }
}

/// Full parameter set for one query.
///
/// Sampling parameters are passed through to the upstream verbatim; the
/// trace fields at the bottom are not interpreted by the gateway at all,
/// they are carried into the emitted [`UsageInfo`] so the billing side can
/// correlate the exchange.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct QueryOptions {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_completion_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub logit_bias: HashMap<String, i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default)]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,

    // Opaque trace identifiers, forwarded into usage telemetry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assistant_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_type: Option<String>,
}

impl QueryOptions {
    /// Options for a plain query against a named model.
    pub fn for_model(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }
}

/// Flattened record of one tool invocation, for usage telemetry.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolCallInfo {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// Immutable telemetry snapshot describing one logical exchange.
///
/// Built once per `query`/`query_stream` call, covering every upstream
/// round the tool loop made, and handed to the [`UsageEmitter`] - the
/// gateway never retries or persists it.
///
/// [`UsageEmitter`]: crate::usage::UsageEmitter
#[derive(Debug, Clone, Serialize)]
pub struct UsageInfo {
    /// Request parameters as supplied by the caller (includes trace ids).
    pub request: QueryOptions,

    // Response metadata, last non-empty value across loop iterations.
    pub response_id: String,
    pub object: String,
    pub created: i64,
    pub finish_reason: String,

    pub usage: Usage,

    pub system_prompt: String,
    pub message_count: usize,

    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: i64,

    pub has_tool_calls: bool,
    pub tool_call_count: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallInfo>,
}

/// Credential record as handed over by the external credential store.
///
/// `provider_type` is an open string; anything unrecognized falls back to
/// the OpenAI-compatible path. For Coze the `base_url` field may carry
/// either a bare bot id or JSON `{"botId": ..., "userId": ..., "baseUrl": ...}` -
/// the factory probes the JSON form first.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Credential {
    #[serde(default)]
    pub provider_type: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub system_prompt: String,
}

/// Streaming delivery callback: `(segment, is_complete)`.
///
/// Segments arrive in emission order and never concurrently for one
/// exchange; the final invocation is always `("", true)`.
pub type SegmentCallback = Box<dyn FnMut(&str, bool) -> anyhow::Result<()> + Send>;
