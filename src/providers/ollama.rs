use super::error::GatewayError;
use super::openai::OpenAICompatibleHandler;
use super::LlmProvider;
use crate::models::{Message, QueryOptions, SegmentCallback, Usage};
use crate::tools::{FunctionToolCallback, FunctionToolDefinition, ToolSpec};
use crate::usage::UsageEmitter;
use async_trait::async_trait;

const DEFAULT_OLLAMA_BASE_URL: &str = "http://localhost:11434/v1";

/// Placeholder key: Ollama takes no authentication but the OpenAI-shaped
/// request path always sends a bearer token.
const OLLAMA_API_KEY_PLACEHOLDER: &str = "ollama";

/// Normalize a user-supplied Ollama URL onto the OpenAI-compatible `/v1`
/// endpoint.
fn normalize_base_url(base_url: &str) -> String {
    if base_url.is_empty() {
        return DEFAULT_OLLAMA_BASE_URL.to_string();
    }
    let trimmed = base_url.trim_end_matches('/');
    if trimmed.ends_with("/v1") || trimmed.contains("/v1/") {
        trimmed.to_string()
    } else {
        format!("{trimmed}/v1")
    }
}

/// Handler for a local (or remote) Ollama daemon.
///
/// Pure configuration adapter: Ollama speaks the OpenAI chat-completions
/// dialect, so beyond URL and key normalization every operation delegates
/// to an inner [`OpenAICompatibleHandler`].
#[derive(Debug)]
pub struct OllamaHandler {
    inner: OpenAICompatibleHandler,
}

impl OllamaHandler {
    pub fn new(
        api_key: impl Into<String>,
        base_url: &str,
        system_prompt: &str,
        emitter: Option<UsageEmitter>,
    ) -> Self {
        let api_key = {
            let key = api_key.into();
            if key.is_empty() {
                OLLAMA_API_KEY_PLACEHOLDER.to_string()
            } else {
                key
            }
        };
        let base_url = normalize_base_url(base_url);
        tracing::info!("Creating Ollama provider: base_url={}", base_url);

        Self {
            inner: OpenAICompatibleHandler::new(api_key, base_url, system_prompt, emitter),
        }
    }

    pub fn base_url(&self) -> &str {
        self.inner.base_url()
    }
}

#[async_trait]
impl LlmProvider for OllamaHandler {
    async fn query(&self, text: &str, model: &str) -> Result<String, GatewayError> {
        self.inner.query(text, model).await
    }

    async fn query_with_options(
        &self,
        text: &str,
        options: QueryOptions,
    ) -> Result<String, GatewayError> {
        self.inner.query_with_options(text, options).await
    }

    async fn query_stream(
        &self,
        text: &str,
        options: QueryOptions,
        callback: SegmentCallback,
    ) -> Result<String, GatewayError> {
        self.inner.query_stream(text, options, callback).await
    }

    fn register_function_tool(
        &self,
        name: &str,
        description: &str,
        parameters: serde_json::Value,
        callback: FunctionToolCallback,
    ) {
        self.inner
            .register_function_tool(name, description, parameters, callback);
    }

    fn register_function_tool_definition(&self, def: FunctionToolDefinition) {
        self.inner.register_function_tool_definition(def);
    }

    fn function_tools(&self) -> Vec<ToolSpec> {
        self.inner.function_tools()
    }

    fn list_function_tools(&self) -> Vec<String> {
        self.inner.list_function_tools()
    }

    fn last_usage(&self) -> Option<Usage> {
        self.inner.last_usage()
    }

    fn reset_messages(&self) {
        self.inner.reset_messages();
    }

    fn set_system_prompt(&self, system_prompt: &str) {
        self.inner.set_system_prompt(system_prompt);
    }

    fn messages(&self) -> Vec<Message> {
        self.inner.messages()
    }

    fn interrupt(&self) {
        self.inner.interrupt();
    }

    fn hangup(&self) {
        self.inner.hangup();
    }
}
