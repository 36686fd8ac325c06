//! LLM conversation gateway: one uniform conversational contract over
//! divergent upstream chat protocols (OpenAI-compatible, Coze, Ollama).
//!
//! Obtain a provider from a credential via [`providers::new_provider`],
//! then drive it through the [`providers::LlmProvider`] trait. One usage
//! telemetry event is emitted per logical exchange through
//! [`usage::UsageEmitter`].

pub mod models;
pub mod providers;
pub mod tools;
pub mod usage;

pub use models::{
    Credential, Message, QueryOptions, Role, SegmentCallback, ToolCall, ToolCallInfo, Usage,
    UsageInfo, UsageSource,
};
pub use providers::{
    new_provider, new_provider_from_config, CozeHandler, GatewayError, LlmProvider, OllamaHandler,
    OpenAICompatibleHandler, ProviderKind,
};
pub use tools::{FunctionToolCallback, FunctionToolDefinition, FunctionToolManager, ToolError};
pub use usage::{UsageEmitter, UsageEvent};
