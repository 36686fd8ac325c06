use super::error::GatewayError;
use super::streaming::{SseEvent, SseStream};
use super::{deliver_segment as deliver, ConversationState, HandlerSignals, LlmProvider};
use crate::models::{Message, QueryOptions, Role, SegmentCallback, Usage, UsageInfo};
use crate::tools::{FunctionToolCallback, FunctionToolDefinition, FunctionToolManager, ToolSpec};
use crate::usage::{estimate_tokens, UsageEmitter, UsageEvent};
use async_trait::async_trait;
use chrono::Utc;
use futures::{Stream, StreamExt};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// History bound applied before every send; Coze requests carry the whole
/// window, so an unbounded history makes every request slower.
pub const MAX_MESSAGE_HISTORY: usize = 20;

/// Overall per-request budget. Streamed answers can take a while.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Stall budget, measured from the last received event.
const STREAM_READ_TIMEOUT: Duration = Duration::from_secs(10);

const DEFAULT_COZE_BASE_URL: &str = "https://api.coze.com";

/// Coze v3 chat request. The API is stream-only from our side; the
/// non-streaming mode of the handler just collects events silently.
#[derive(Debug, Serialize)]
struct CozeChatRequest {
    bot_id: String,
    user_id: String,
    stream: bool,
    auto_save_history: bool,
    additional_messages: Vec<CozeWireMessage>,
}

#[derive(Debug, Serialize)]
struct CozeWireMessage {
    role: String,
    content: String,
    content_type: String,
}

#[derive(Debug, Deserialize)]
struct CozeEventMessage {
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct CozeChatObject {
    #[serde(default)]
    usage: Option<CozeUsage>,
    #[serde(default)]
    last_error: Option<CozeLastError>,
}

#[derive(Debug, Clone, Deserialize)]
struct CozeUsage {
    #[serde(default)]
    token_count: u32,
    #[serde(default)]
    output_count: u32,
    #[serde(default)]
    input_count: u32,
}

#[derive(Debug, Deserialize)]
struct CozeLastError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
}

/// Classified Coze stream event.
#[derive(Debug)]
enum CozeEvent {
    /// Incremental answer content.
    Delta(String),
    /// Final content of one answer message.
    Completed(String),
    /// Chat finished; may carry provider usage.
    ChatCompleted(Option<CozeUsage>),
    /// Chat failed upstream.
    ChatFailed { code: i64, message: String },
    /// Terminal marker.
    Done,
    /// Anything else (verbose sub-events, follow-ups, knowledge recalls).
    Ignored,
}

fn classify(event: &SseEvent) -> CozeEvent {
    match event.event.as_deref() {
        Some("conversation.message.delta") => {
            match serde_json::from_str::<CozeEventMessage>(&event.data) {
                Ok(msg) if msg.kind == "answer" && !msg.content.is_empty() => {
                    CozeEvent::Delta(msg.content)
                }
                _ => CozeEvent::Ignored,
            }
        }
        Some("conversation.message.completed") => {
            match serde_json::from_str::<CozeEventMessage>(&event.data) {
                Ok(msg) if msg.kind == "answer" => CozeEvent::Completed(msg.content),
                _ => CozeEvent::Ignored,
            }
        }
        Some("conversation.chat.completed") => {
            match serde_json::from_str::<CozeChatObject>(&event.data) {
                Ok(chat) => CozeEvent::ChatCompleted(chat.usage),
                Err(_) => CozeEvent::ChatCompleted(None),
            }
        }
        Some("conversation.chat.failed") => {
            match serde_json::from_str::<CozeChatObject>(&event.data) {
                Ok(chat) => {
                    let err = chat.last_error.unwrap_or(CozeLastError {
                        code: 0,
                        msg: "chat failed".to_string(),
                    });
                    CozeEvent::ChatFailed {
                        code: err.code,
                        message: err.msg,
                    }
                }
                Err(_) => CozeEvent::ChatFailed {
                    code: 0,
                    message: event.data.clone(),
                },
            }
        }
        Some("done") => CozeEvent::Done,
        _ if event.data.trim() == "[DONE]" => CozeEvent::Done,
        _ => CozeEvent::Ignored,
    }
}

/// What an answer stream produced.
#[derive(Debug)]
struct AnswerOutcome {
    content: String,
    usage: Option<CozeUsage>,
    /// A timeout cut the stream short but content had already arrived.
    partial: bool,
}

/// Drain a classified Coze event stream into the final answer text.
///
/// Both timeout layers are soft: once any content has been accumulated a
/// timeout returns the partial text as success. Only a timeout with nothing
/// accumulated is an error. Interrupt and hangup abort immediately,
/// carrying the partial text in the error.
async fn read_answer_stream<S>(
    events: S,
    cancel: &CancellationToken,
    interrupt_rx: &mut mpsc::Receiver<()>,
    mut on_delta: Option<&mut SegmentCallback>,
) -> Result<AnswerOutcome, GatewayError>
where
    S: Stream<Item = Result<SseEvent, GatewayError>>,
{
    let started = Instant::now();
    let deadline = started + REQUEST_TIMEOUT;
    let mut events = std::pin::pin!(events);

    let mut content = String::new();
    let mut usage: Option<CozeUsage> = None;
    let mut first_event: Option<Instant> = None;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return soft_timeout(content, usage, started, "request timeout");
        }
        let wait = remaining.min(STREAM_READ_TIMEOUT);

        let next = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Coze stream hangup requested");
                return Err(GatewayError::Hangup { partial: content });
            }
            _ = interrupt_rx.recv() => {
                tracing::info!("Coze stream interrupted");
                return Err(GatewayError::Interrupted { partial: content });
            }
            next = tokio::time::timeout(wait, events.next()) => next,
        };

        let event = match next {
            Err(_) => {
                return soft_timeout(content, usage, started, "no data received");
            }
            Ok(None) => break,
            Ok(Some(Err(err))) => return Err(err),
            Ok(Some(Ok(event))) => event,
        };

        if first_event.is_none() {
            first_event = Some(Instant::now());
            tracing::debug!(
                "Coze first event received after {}ms",
                started.elapsed().as_millis()
            );
        }

        match classify(&event) {
            CozeEvent::Delta(delta) => {
                content.push_str(&delta);
                if let Some(callback) = on_delta.as_mut() {
                    deliver(callback, &delta, false);
                }
            }
            CozeEvent::Completed(full) => {
                // The completed event repeats the full answer; only append
                // what the deltas did not already cover.
                if !full.is_empty() && !content.contains(&full) {
                    content.push_str(&full);
                    if let Some(callback) = on_delta.as_mut() {
                        deliver(callback, &full, false);
                    }
                }
            }
            CozeEvent::ChatCompleted(chat_usage) => {
                if chat_usage.is_some() {
                    usage = chat_usage;
                }
            }
            CozeEvent::ChatFailed { code, message } => {
                return Err(GatewayError::Api {
                    status: 0,
                    message: format!("Coze chat failed: code={code} {message}"),
                });
            }
            CozeEvent::Done => break,
            CozeEvent::Ignored => {}
        }
    }

    Ok(AnswerOutcome {
        content,
        usage,
        partial: false,
    })
}

fn soft_timeout(
    content: String,
    usage: Option<CozeUsage>,
    started: Instant,
    reason: &str,
) -> Result<AnswerOutcome, GatewayError> {
    if content.is_empty() {
        tracing::warn!("Coze stream timeout with no content: {}", reason);
        return Err(GatewayError::Timeout {
            waited_ms: started.elapsed().as_millis() as u64,
        });
    }
    tracing::warn!(
        "Coze stream timeout but partial response received ({} bytes): {}",
        content.len(),
        reason
    );
    Ok(AnswerOutcome {
        content,
        usage,
        partial: true,
    })
}

/// Handler for Coze's event-based chat API.
///
/// The bot id plays the role other providers give the model name; the
/// system prompt lives in the bot's own configuration, so the local system
/// message is kept for the uniform history contract but never sent. Coze
/// exposes no OpenAI-style tool-call contract here - tools can be
/// registered and listed but the upstream tool list is always empty.
#[derive(Debug)]
pub struct CozeHandler {
    client: Client,
    api_key: SecretString,
    base_url: String,
    bot_id: String,
    user_id: String,
    state: Mutex<ConversationState>,
    query_gate: tokio::sync::Mutex<()>,
    signals: HandlerSignals,
    tools: Arc<FunctionToolManager>,
    emitter: Option<UsageEmitter>,
}

impl CozeHandler {
    pub fn new(
        api_key: impl Into<String>,
        bot_id: impl Into<String>,
        user_id: impl Into<String>,
        system_prompt: &str,
        base_url: Option<String>,
        emitter: Option<UsageEmitter>,
    ) -> Result<Self, GatewayError> {
        let bot_id = bot_id.into();
        if bot_id.is_empty() {
            return Err(GatewayError::Configuration(
                "botID is required for Coze provider".to_string(),
            ));
        }
        let user_id = {
            let id = user_id.into();
            if id.is_empty() {
                "default_user".to_string()
            } else {
                id
            }
        };
        let base_url = base_url
            .filter(|url| !url.is_empty())
            .unwrap_or_else(|| DEFAULT_COZE_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            client: Client::new(),
            api_key: SecretString::new(api_key.into()),
            base_url,
            bot_id,
            user_id,
            state: Mutex::new(ConversationState::new(system_prompt)),
            query_gate: tokio::sync::Mutex::new(()),
            signals: HandlerSignals::new(),
            tools: Arc::new(FunctionToolManager::new()),
            emitter,
        })
    }

    pub fn bot_id(&self) -> &str {
        &self.bot_id
    }

    /// Append the user turn, bound the history and snapshot the window to
    /// send. The system message stays local.
    fn prepare_request(&self, text: &str) -> CozeChatRequest {
        let mut state = self.state.lock().unwrap();
        state.messages.push(Message::user(text));
        state.truncate_to(MAX_MESSAGE_HISTORY);

        let additional_messages = state
            .messages
            .iter()
            .filter(|msg| msg.role == Role::User || msg.role == Role::Assistant)
            .map(|msg| CozeWireMessage {
                role: msg.role.to_string(),
                content: msg.content.clone(),
                content_type: "text".to_string(),
            })
            .collect();

        CozeChatRequest {
            bot_id: self.bot_id.clone(),
            user_id: self.user_id.clone(),
            stream: true,
            auto_save_history: true,
            additional_messages,
        }
    }

    async fn open_stream(
        &self,
        request: &CozeChatRequest,
    ) -> Result<impl Stream<Item = Result<SseEvent, GatewayError>>, GatewayError> {
        let url = format!("{}/v3/chat", self.base_url);
        tracing::debug!(
            "Coze chat request: bot_id={} messages={}",
            request.bot_id,
            request.additional_messages.len()
        );

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
            tracing::error!("Coze API call failed: {} - {}", status, message);
            return Err(GatewayError::Api { status, message });
        }

        Ok(SseStream::new(response.bytes_stream()).map(|item| item.map_err(GatewayError::Http)))
    }

    /// Common exchange driver for both modes; `callback` decides whether
    /// deltas are forwarded (stream) or collected silently (non-stream).
    async fn run_exchange(
        &self,
        text: &str,
        options: &QueryOptions,
        mut callback: Option<SegmentCallback>,
    ) -> Result<String, GatewayError> {
        let _gate = self.query_gate.lock().await;
        if self.signals.is_hung_up() {
            return Err(GatewayError::Hangup {
                partial: String::new(),
            });
        }
        self.signals.drain_stale_interrupts().await;
        let start_time = Utc::now();
        let request_started = Instant::now();

        let request = self.prepare_request(text);
        let events = self.open_stream(&request).await?;
        tracing::debug!(
            "Coze stream created after {}ms",
            request_started.elapsed().as_millis()
        );

        let outcome = {
            let mut interrupt_rx = self.signals.interrupt_rx.lock().await;
            read_answer_stream(
                events,
                &self.signals.cancel,
                &mut interrupt_rx,
                callback.as_mut(),
            )
            .await?
        };

        if !outcome.content.is_empty() {
            let mut state = self.state.lock().unwrap();
            state
                .messages
                .push(Message::assistant(outcome.content.as_str()));
            // keep the bound after the exchange too, not just before sends
            state.truncate_to(MAX_MESSAGE_HISTORY);
        }

        let usage = match &outcome.usage {
            Some(coze_usage) => Usage::provider(
                coze_usage.input_count,
                coze_usage.output_count,
                coze_usage.token_count,
            ),
            None => Usage::estimated(estimate_tokens(text), estimate_tokens(&outcome.content)),
        };

        let (system_prompt, message_count) = {
            let mut state = self.state.lock().unwrap();
            state.last_usage = Some(usage.clone());
            (state.system_prompt.clone(), state.messages.len())
        };

        tracing::info!(
            "Coze request completed: duration={}ms response_length={} partial={}",
            request_started.elapsed().as_millis(),
            outcome.content.len(),
            outcome.partial
        );

        if let Some(emitter) = &self.emitter {
            let end_time = Utc::now();
            emitter.emit(UsageEvent {
                info: UsageInfo {
                    request: options.clone(),
                    response_id: String::new(),
                    object: String::new(),
                    created: 0,
                    finish_reason: String::new(),
                    usage,
                    system_prompt,
                    message_count,
                    start_time,
                    end_time,
                    duration_ms: (end_time - start_time).num_milliseconds(),
                    has_tool_calls: false,
                    tool_call_count: 0,
                    tool_calls: Vec::new(),
                },
                prompt: text.to_string(),
                response: outcome.content.clone(),
            });
        }

        if let Some(callback) = callback.as_mut() {
            deliver(callback, "", true);
        }

        Ok(outcome.content)
    }
}

#[async_trait]
impl LlmProvider for CozeHandler {
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
        self.run_exchange(text, &options, None).await
    }

    async fn query_stream(
        &self,
        text: &str,
        options: QueryOptions,
        callback: SegmentCallback,
    ) -> Result<String, GatewayError> {
        self.run_exchange(text, &options, Some(callback)).await
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

    /// Coze has no OpenAI-style tool-call contract; the upstream tool list
    /// is always empty even when tools are registered.
    fn function_tools(&self) -> Vec<ToolSpec> {
        Vec::new()
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
