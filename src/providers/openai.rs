use super::error::GatewayError;
use super::streaming::{SegmentBuffer, SseStream};
use super::{deliver_segment as deliver, ConversationState, HandlerSignals, LlmProvider};
use crate::models::{
    Message, QueryOptions, Role, SegmentCallback, ToolCall, ToolCallInfo, Usage, UsageInfo,
};
use crate::tools::{FunctionToolCallback, FunctionToolDefinition, FunctionToolManager, ToolSpec};
use crate::usage::{estimate_tokens, UsageEmitter, UsageEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Iteration cap for the tool-resolution loop.
const MAX_TOOL_ITERATIONS: usize = 10;

/// Fallback model when the caller leaves `QueryOptions.model` empty.
const DEFAULT_MODEL: &str = "gpt-4o";

/// Some OpenAI-compatible backends (DashScope among them) reject a null or
/// empty system content, so an empty system message gets this placeholder.
const SYSTEM_CONTENT_PLACEHOLDER: &str = "You are a helpful assistant.";

/// Chat Completions request format.
#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_completion_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    n: Option<u32>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    logit_bias: HashMap<String, i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<String>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<OpenAIStreamOptions>,
}

#[derive(Debug, Serialize)]
struct OpenAIStreamOptions {
    include_usage: bool,
}

/// Outgoing message. `content` is always a string - never null - because
/// several compatible backends reject anything else.
#[derive(Debug, Serialize)]
struct OpenAIMessage {
    role: String,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

/// Chat Completions response format.
#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    object: String,
    #[serde(default)]
    created: i64,
    choices: Vec<OpenAIChoice>,
    #[serde(default)]
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

impl OpenAIUsage {
    fn into_usage(self) -> Usage {
        Usage::provider(self.prompt_tokens, self.completion_tokens, self.total_tokens)
    }
}

/// Streaming chunk format.
#[derive(Debug, Deserialize)]
struct OpenAIStreamChunk {
    #[serde(default)]
    id: String,
    #[serde(default)]
    object: String,
    #[serde(default)]
    created: i64,
    #[serde(default)]
    choices: Vec<OpenAIStreamChoice>,
    #[serde(default)]
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamChoice {
    #[serde(default)]
    delta: OpenAIStreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAIStreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<OpenAIToolCallDelta>,
}

/// One fragment of an incrementally-streamed tool call. The first fragment
/// for an index carries id and name; later fragments append to arguments.
#[derive(Debug, Deserialize)]
struct OpenAIToolCallDelta {
    #[serde(default)]
    index: Option<u32>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<OpenAIFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct OpenAIFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// Reassembles fragmented tool-call deltas into complete calls, keyed and
/// ultimately ordered by the upstream's index.
#[derive(Debug, Default)]
struct ToolCallAssembler {
    pending: BTreeMap<u32, PendingToolCall>,
}

#[derive(Debug, Default)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

impl ToolCallAssembler {
    fn push(&mut self, delta: &OpenAIToolCallDelta) {
        let Some(index) = delta.index else {
            return;
        };
        let entry = self.pending.entry(index).or_default();
        if let Some(id) = delta.id.as_deref() {
            if !id.is_empty() {
                entry.id = id.to_string();
            }
        }
        if let Some(function) = &delta.function {
            if let Some(name) = function.name.as_deref() {
                if !name.is_empty() {
                    entry.name = name.to_string();
                }
            }
            if let Some(arguments) = function.arguments.as_deref() {
                entry.arguments.push_str(arguments);
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn finish(self) -> Vec<ToolCall> {
        self.pending
            .into_values()
            .map(|pending| ToolCall {
                id: pending.id,
                kind: "function".to_string(),
                function: crate::models::FunctionCall {
                    name: pending.name,
                    arguments: pending.arguments,
                },
            })
            .collect()
    }
}

/// Response metadata accumulated across tool-loop rounds; the last
/// non-empty value wins.
#[derive(Debug, Default)]
struct ResponseMeta {
    id: String,
    object: String,
    created: i64,
    finish_reason: String,
}

impl ResponseMeta {
    fn absorb(&mut self, id: &str, object: &str, created: i64, finish_reason: Option<&str>) {
        if !id.is_empty() {
            self.id = id.to_string();
        }
        if !object.is_empty() {
            self.object = object.to_string();
        }
        if created != 0 {
            self.created = created;
        }
        if let Some(reason) = finish_reason {
            if !reason.is_empty() {
                self.finish_reason = reason.to_string();
            }
        }
    }
}

/// Handler for OpenAI and every OpenAI-shaped vendor (DashScope, DeepSeek,
/// Zhipu, ...; Ollama reuses it through a thin adapter).
///
/// Owns one conversation. Logical exchanges on a single handler are
/// serialized by an internal query gate; history is mutated only under a
/// short-lived lock, so `messages()` and `last_usage()` stay responsive
/// while a request is on the wire.
#[derive(Debug)]
pub struct OpenAICompatibleHandler {
    client: Client,
    api_key: SecretString,
    base_url: String,
    state: Mutex<ConversationState>,
    query_gate: tokio::sync::Mutex<()>,
    signals: HandlerSignals,
    tools: Arc<FunctionToolManager>,
    emitter: Option<UsageEmitter>,
}

impl OpenAICompatibleHandler {
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        system_prompt: &str,
        emitter: Option<UsageEmitter>,
    ) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            client: Client::new(),
            api_key: SecretString::new(api_key.into()),
            base_url,
            state: Mutex::new(ConversationState::new(system_prompt)),
            query_gate: tokio::sync::Mutex::new(()),
            signals: HandlerSignals::new(),
            tools: Arc::new(FunctionToolManager::new()),
            emitter,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Build the outgoing message list from history. Every content field is
    /// forced to a plain string and an empty system content gets the
    /// placeholder.
    fn sanitized_wire_messages(messages: &[Message]) -> Vec<OpenAIMessage> {
        messages
            .iter()
            .map(|msg| {
                let content = if msg.content.is_empty() && msg.role == Role::System {
                    SYSTEM_CONTENT_PLACEHOLDER.to_string()
                } else {
                    msg.content.clone()
                };
                OpenAIMessage {
                    role: msg.role.to_string(),
                    content,
                    tool_calls: if msg.tool_calls.is_empty() {
                        None
                    } else {
                        Some(msg.tool_calls.clone())
                    },
                    tool_call_id: msg.tool_call_id.clone(),
                }
            })
            .collect()
    }

    fn build_request(
        options: &QueryOptions,
        messages: Vec<OpenAIMessage>,
        tools: Vec<ToolSpec>,
        stream: bool,
    ) -> OpenAIRequest {
        let model = if options.model.is_empty() {
            DEFAULT_MODEL.to_string()
        } else {
            options.model.clone()
        };
        OpenAIRequest {
            model,
            messages,
            tools,
            max_tokens: options.max_tokens,
            max_completion_tokens: options.max_completion_tokens,
            temperature: options.temperature,
            top_p: options.top_p,
            frequency_penalty: options.frequency_penalty,
            presence_penalty: options.presence_penalty,
            stop: options.stop.clone(),
            n: options.n,
            logit_bias: options.logit_bias.clone(),
            user: options.user.clone(),
            stream,
            response_format: options.response_format.clone(),
            seed: options.seed,
            stream_options: if stream {
                Some(OpenAIStreamOptions { include_usage: true })
            } else {
                None
            },
        }
    }

    fn log_history_tail(messages: &[Message]) {
        let start = messages.len().saturating_sub(3);
        for (i, msg) in messages.iter().enumerate().skip(start) {
            let preview: String = msg.content.chars().take(50).collect();
            tracing::debug!("history[{}] {}: {}", i, msg.role, preview);
        }
    }

    async fn send_chat(&self, request: &OpenAIRequest) -> Result<reqwest::Response, GatewayError> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .header(
                "Authorization",
                format!("Bearer {}", self.api_key.expose_secret()),
            )
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            tracing::error!(
                "LLM API call failed: {} {} - {}",
                self.base_url,
                status,
                message
            );
            return Err(GatewayError::Api { status, message });
        }
        Ok(response)
    }

    async fn send_chat_completion(
        &self,
        request: &OpenAIRequest,
    ) -> Result<OpenAIResponse, GatewayError> {
        let response = self.send_chat(request).await?;
        let body = response.text().await?;
        tracing::debug!("chat completion response body: {}", body);
        serde_json::from_str(&body).map_err(|err| {
            tracing::error!("Failed to parse chat completion response: {}", err);
            GatewayError::Serialization(err)
        })
    }

    /// Run every call in `tool_calls` through the registry, appending the
    /// assistant round and one tool-result message per call to history.
    /// Dispatch failures become `"Error: ..."` results, never query errors.
    fn apply_tool_round(
        &self,
        content: String,
        tool_calls: Vec<ToolCall>,
        collected: &mut Vec<ToolCallInfo>,
    ) {
        for call in &tool_calls {
            collected.push(ToolCallInfo {
                id: call.id.clone(),
                name: call.function.name.clone(),
                arguments: call.function.arguments.clone(),
            });
        }

        {
            let mut state = self.state.lock().unwrap();
            state
                .messages
                .push(Message::assistant_with_tool_calls(content, tool_calls.clone()));
        }

        for call in &tool_calls {
            let result = match self.tools.dispatch(call) {
                Ok(result) => result,
                Err(err) => {
                    tracing::error!("Failed to handle tool call {}: {}", call.function.name, err);
                    format!("Error: {err}")
                }
            };
            let mut state = self.state.lock().unwrap();
            state
                .messages
                .push(Message::tool_result(call.id.as_str(), result));
        }
    }

    fn emit_usage(
        &self,
        options: &QueryOptions,
        meta: &ResponseMeta,
        usage: Usage,
        start_time: DateTime<Utc>,
        tool_calls: Vec<ToolCallInfo>,
        prompt: &str,
        response: &str,
    ) {
        let Some(emitter) = &self.emitter else {
            return;
        };

        let (system_prompt, message_count) = {
            let state = self.state.lock().unwrap();
            (state.system_prompt.clone(), state.messages.len())
        };
        let end_time = Utc::now();
        let info = UsageInfo {
            request: options.clone(),
            response_id: meta.id.clone(),
            object: meta.object.clone(),
            created: meta.created,
            finish_reason: meta.finish_reason.clone(),
            usage,
            system_prompt,
            message_count,
            start_time,
            end_time,
            duration_ms: (end_time - start_time).num_milliseconds(),
            has_tool_calls: !tool_calls.is_empty(),
            tool_call_count: tool_calls.len(),
            tool_calls,
        };
        emitter.emit(UsageEvent {
            info,
            prompt: prompt.to_string(),
            response: response.to_string(),
        });
    }
}

#[async_trait]
impl LlmProvider for OpenAICompatibleHandler {
    async fn query(&self, text: &str, model: &str) -> Result<String, GatewayError> {
        let mut options = QueryOptions::for_model(model);
        options.temperature = Some(0.7);
        self.query_with_options(text, options).await
    }

    async fn query_with_options(
        &self,
        text: &str,
        options: QueryOptions,
    ) -> Result<String, GatewayError> {
        let _gate = self.query_gate.lock().await;
        if self.signals.is_hung_up() {
            return Err(GatewayError::Hangup {
                partial: String::new(),
            });
        }
        self.signals.drain_stale_interrupts().await;
        let start_time = Utc::now();

        {
            let mut state = self.state.lock().unwrap();
            state.repair_dangling_tool_calls();
            state.messages.push(Message::user(text));
            tracing::debug!(
                "Added user message to history, total_messages={}",
                state.messages.len()
            );
        }

        let tools = self.tools.tools();
        let mut total_usage = Usage::default();
        let mut meta = ResponseMeta::default();
        let mut all_tool_calls: Vec<ToolCallInfo> = Vec::new();
        let mut final_response: Option<String> = None;

        for iteration in 0..MAX_TOOL_ITERATIONS {
            if self.signals.is_hung_up() {
                return Err(GatewayError::Hangup {
                    partial: String::new(),
                });
            }

            let wire_messages = {
                let state = self.state.lock().unwrap();
                Self::log_history_tail(&state.messages);
                Self::sanitized_wire_messages(&state.messages)
            };
            let request = Self::build_request(&options, wire_messages, tools.clone(), false);

            tracing::info!(
                "Sending request to LLM API: {} model={} messages={} iteration={}",
                self.base_url,
                request.model,
                request.messages.len(),
                iteration
            );
            let response = self.send_chat_completion(&request).await?;

            meta.absorb(&response.id, &response.object, response.created, None);
            if let Some(usage) = response.usage {
                total_usage.accumulate(&usage.into_usage());
            }

            let choice = response
                .choices
                .into_iter()
                .next()
                .ok_or(GatewayError::NoChoices)?;
            meta.absorb("", "", 0, choice.finish_reason.as_deref());

            let message = choice.message;
            tracing::info!(
                "LLM response received: content_length={} tool_calls={} finish_reason={:?}",
                message.content.as_deref().map(str::len).unwrap_or(0),
                message.tool_calls.len(),
                meta.finish_reason
            );

            if !message.tool_calls.is_empty() {
                tracing::info!("Tool calls detected: count={}", message.tool_calls.len());
                self.apply_tool_round(
                    message.content.unwrap_or_default(),
                    message.tool_calls,
                    &mut all_tool_calls,
                );
                continue;
            }

            let content = message.content.unwrap_or_default();
            if content.is_empty() {
                tracing::warn!(
                    "Empty response content from LLM, finish_reason={:?}",
                    meta.finish_reason
                );
                return Err(GatewayError::EmptyOrEcho { response: content });
            }
            if content == text {
                tracing::error!(
                    "LLM response exactly matches user input - upstream misconfiguration? base_url={}",
                    self.base_url
                );
                return Err(GatewayError::EmptyOrEcho { response: content });
            }

            final_response = Some(content);
            break;
        }

        let Some(answer) = final_response else {
            let mut state = self.state.lock().unwrap();
            state.repair_dangling_tool_calls();
            return Err(GatewayError::MaxIterations {
                limit: MAX_TOOL_ITERATIONS,
            });
        };

        {
            let mut state = self.state.lock().unwrap();
            state.messages.push(Message::assistant(answer.as_str()));
            state.last_usage = Some(total_usage.clone());
        }

        self.emit_usage(
            &options,
            &meta,
            total_usage,
            start_time,
            all_tool_calls,
            text,
            &answer,
        );

        Ok(answer)
    }

    async fn query_stream(
        &self,
        text: &str,
        options: QueryOptions,
        mut callback: SegmentCallback,
    ) -> Result<String, GatewayError> {
        let _gate = self.query_gate.lock().await;
        if self.signals.is_hung_up() {
            return Err(GatewayError::Hangup {
                partial: String::new(),
            });
        }
        self.signals.drain_stale_interrupts().await;
        let start_time = Utc::now();

        {
            let mut state = self.state.lock().unwrap();
            state.repair_dangling_tool_calls();
            state.messages.push(Message::user(text));
        }

        let tools = self.tools.tools();
        let wire_messages = {
            let state = self.state.lock().unwrap();
            Self::sanitized_wire_messages(&state.messages)
        };
        // First round always streams so speech can start on the first clause.
        let request = Self::build_request(&options, wire_messages, tools.clone(), true);

        let stream_id = format!("stream-{}", Uuid::new_v4());
        tracing::info!("Starting LLM stream {} model={}", stream_id, request.model);

        let response = self.send_chat(&request).await?;
        let mut sse = Box::pin(SseStream::new(response.bytes_stream()));

        let mut chunker = SegmentBuffer::new();
        let mut full_response = String::new();
        let mut assembler = ToolCallAssembler::default();
        let mut stream_usage: Option<Usage> = None;
        let mut meta = ResponseMeta::default();

        let mut interrupt_rx = self.signals.interrupt_rx.lock().await;

        loop {
            let event = tokio::select! {
                _ = self.signals.cancel.cancelled() => {
                    tracing::info!("LLM stream hangup requested: {}", stream_id);
                    return Err(GatewayError::Hangup { partial: full_response });
                }
                _ = interrupt_rx.recv() => {
                    tracing::info!("LLM stream interrupted: {}", stream_id);
                    return Err(GatewayError::Interrupted { partial: full_response });
                }
                next = sse.next() => match next {
                    None => break,
                    Some(Err(err)) => return Err(GatewayError::Http(err)),
                    Some(Ok(event)) => event,
                },
            };

            let data = event.data.trim();
            if data.is_empty() || data == "[DONE]" {
                continue;
            }

            let chunk: OpenAIStreamChunk = match serde_json::from_str(data) {
                Ok(chunk) => chunk,
                Err(err) => {
                    tracing::warn!("Failed to parse stream chunk: {} - data: {}", err, data);
                    continue;
                }
            };

            meta.absorb(&chunk.id, &chunk.object, chunk.created, None);
            if let Some(usage) = chunk.usage {
                stream_usage = Some(usage.into_usage());
            }

            for choice in &chunk.choices {
                meta.absorb("", "", 0, choice.finish_reason.as_deref());

                for delta in &choice.delta.tool_calls {
                    assembler.push(delta);
                }

                if let Some(content) = choice.delta.content.as_deref() {
                    if !content.is_empty() {
                        full_response.push_str(content);
                        for segment in chunker.push(content) {
                            deliver(&mut callback, &segment, false);
                        }
                    }
                }
            }
        }
        drop(interrupt_rx);

        if let Some(rest) = chunker.take_rest() {
            deliver(&mut callback, &rest, false);
        }

        if !assembler.is_empty() {
            // Streamed tool-argument deltas cannot be resolved mid-stream;
            // dispatch them now and fetch the final answer non-streaming.
            let collected = assembler.finish();
            tracing::info!(
                "Tool calls detected in stream {}: count={}",
                stream_id,
                collected.len()
            );

            let mut all_tool_calls: Vec<ToolCallInfo> = Vec::new();
            self.apply_tool_round(full_response.clone(), collected, &mut all_tool_calls);

            let wire_messages = {
                let state = self.state.lock().unwrap();
                Self::sanitized_wire_messages(&state.messages)
            };
            let followup = Self::build_request(&options, wire_messages, tools, false);
            let final_resp = self.send_chat_completion(&followup).await?;

            meta.absorb(&final_resp.id, &final_resp.object, final_resp.created, None);
            let mut total_usage = stream_usage.unwrap_or_default();
            if let Some(usage) = final_resp.usage {
                total_usage.accumulate(&usage.into_usage());
            }

            let choice = final_resp
                .choices
                .into_iter()
                .next()
                .ok_or(GatewayError::NoChoices)?;
            meta.absorb("", "", 0, choice.finish_reason.as_deref());
            let final_answer = choice.message.content.unwrap_or_default();

            {
                let mut state = self.state.lock().unwrap();
                state
                    .messages
                    .push(Message::assistant(final_answer.as_str()));
                state.last_usage = Some(total_usage.clone());
            }

            let combined = format!("{full_response}{final_answer}");
            self.emit_usage(
                &options,
                &meta,
                total_usage,
                start_time,
                all_tool_calls,
                text,
                &combined,
            );

            deliver(&mut callback, &final_answer, false);
            deliver(&mut callback, "", true);
            return Ok(combined);
        }

        // Plain text path: commit the streamed response as-is.
        let usage = stream_usage.unwrap_or_else(|| {
            Usage::estimated(estimate_tokens(text), estimate_tokens(&full_response))
        });
        {
            let mut state = self.state.lock().unwrap();
            state
                .messages
                .push(Message::assistant(full_response.as_str()));
            state.last_usage = Some(usage.clone());
        }

        tracing::info!(
            "LLM stream completed {}: response_length={} total_tokens={}",
            stream_id,
            full_response.len(),
            usage.total_tokens
        );
        self.emit_usage(
            &options,
            &meta,
            usage,
            start_time,
            Vec::new(),
            text,
            &full_response,
        );

        deliver(&mut callback, "", true);
        Ok(full_response)
    }

    fn register_function_tool(
        &self,
        name: &str,
        description: &str,
        parameters: serde_json::Value,
        callback: FunctionToolCallback,
    ) {
        self.tools.register_tool(name, description, parameters, callback);
    }

    fn register_function_tool_definition(&self, def: FunctionToolDefinition) {
        self.tools.register_definition(def);
    }

    fn function_tools(&self) -> Vec<ToolSpec> {
        self.tools.tools()
    }

    fn list_function_tools(&self) -> Vec<String> {
        self.tools.list()
    }

    fn last_usage(&self) -> Option<Usage> {
        self.state.lock().unwrap().last_usage.clone()
    }

    fn reset_messages(&self) {
        self.state.lock().unwrap().reset();
    }

    fn set_system_prompt(&self, system_prompt: &str) {
        self.state.lock().unwrap().set_system_prompt(system_prompt);
    }

    fn messages(&self) -> Vec<Message> {
        self.state.lock().unwrap().messages.clone()
    }

    fn interrupt(&self) {
        self.signals.interrupt();
    }

    fn hangup(&self) {
        self.signals.hangup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_empty_system_content() {
        let messages = vec![Message::system(""), Message::user("hi")];
        let wire = OpenAICompatibleHandler::sanitized_wire_messages(&messages);
        assert_eq!(wire[0].content, SYSTEM_CONTENT_PLACEHOLDER);
        assert_eq!(wire[1].content, "hi");
    }

    #[test]
    fn sanitize_keeps_tool_plumbing() {
        let call = ToolCall {
            id: "call_9".to_string(),
            kind: "function".to_string(),
            function: crate::models::FunctionCall {
                name: "t".to_string(),
                arguments: "{}".to_string(),
            },
        };
        let messages = vec![
            Message::assistant_with_tool_calls("", vec![call]),
            Message::tool_result("call_9", "ok"),
        ];
        let wire = OpenAICompatibleHandler::sanitized_wire_messages(&messages);
        assert_eq!(wire[0].tool_calls.as_ref().unwrap().len(), 1);
        // empty non-system content stays an empty string, never null
        assert_eq!(wire[0].content, "");
        assert_eq!(wire[1].tool_call_id.as_deref(), Some("call_9"));
    }

    #[test]
    fn build_request_defaults_the_model() {
        let request = OpenAICompatibleHandler::build_request(
            &QueryOptions::default(),
            Vec::new(),
            Vec::new(),
            false,
        );
        assert_eq!(request.model, DEFAULT_MODEL);
        assert!(request.stream_options.is_none());
    }

    #[test]
    fn build_request_streaming_requests_usage() {
        let request = OpenAICompatibleHandler::build_request(
            &QueryOptions::for_model("qwen-max"),
            Vec::new(),
            Vec::new(),
            true,
        );
        assert_eq!(request.model, "qwen-max");
        assert!(request.stream);
        assert!(request.stream_options.as_ref().unwrap().include_usage);
    }

    #[test]
    fn assembler_reassembles_fragmented_call() {
        let mut assembler = ToolCallAssembler::default();
        assembler.push(&OpenAIToolCallDelta {
            index: Some(0),
            id: Some("call_1".to_string()),
            function: Some(OpenAIFunctionDelta {
                name: Some("get_weather".to_string()),
                arguments: Some("{\"ci".to_string()),
            }),
        });
        assembler.push(&OpenAIToolCallDelta {
            index: Some(0),
            id: None,
            function: Some(OpenAIFunctionDelta {
                name: None,
                arguments: Some("ty\":\"Paris\"}".to_string()),
            }),
        });

        let calls = assembler.finish();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].function.name, "get_weather");
        assert_eq!(calls[0].function.arguments, "{\"city\":\"Paris\"}");
    }

    #[test]
    fn assembler_orders_calls_by_index() {
        let mut assembler = ToolCallAssembler::default();
        for (index, name) in [(1u32, "second"), (0u32, "first")] {
            assembler.push(&OpenAIToolCallDelta {
                index: Some(index),
                id: Some(format!("call_{index}")),
                function: Some(OpenAIFunctionDelta {
                    name: Some(name.to_string()),
                    arguments: Some("{}".to_string()),
                }),
            });
        }

        let calls = assembler.finish();
        assert_eq!(calls[0].function.name, "first");
        assert_eq!(calls[1].function.name, "second");
    }

    #[test]
    fn assembler_ignores_indexless_fragments() {
        let mut assembler = ToolCallAssembler::default();
        assembler.push(&OpenAIToolCallDelta {
            index: None,
            id: Some("call_x".to_string()),
            function: None,
        });
        assert!(assembler.is_empty());
    }

    #[test]
    fn response_meta_keeps_last_non_empty() {
        let mut meta = ResponseMeta::default();
        meta.absorb("id-1", "chat.completion", 100, None);
        meta.absorb("", "", 0, Some("tool_calls"));
        meta.absorb("id-2", "", 0, Some("stop"));

        assert_eq!(meta.id, "id-2");
        assert_eq!(meta.object, "chat.completion");
        assert_eq!(meta.created, 100);
        assert_eq!(meta.finish_reason, "stop");
    }
}
