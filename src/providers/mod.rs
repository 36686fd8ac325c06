pub mod coze;
pub mod error;
pub mod factory;
pub mod ollama;
pub mod openai;
pub mod streaming;

use crate::models::{Message, QueryOptions, Role, SegmentCallback, Usage};
use crate::tools::{FunctionToolCallback, FunctionToolDefinition, ToolSpec};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// The uniform conversational contract every upstream handler implements.
///
/// One handler instance owns one conversation: its history, its cancellation
/// signals and its last-usage snapshot. Handlers are created per session by
/// the [factory](crate::providers::factory) and discarded after
/// [`hangup`](LlmProvider::hangup); there is no pooling.
#[async_trait]
pub trait LlmProvider: Send + Sync + std::fmt::Debug {
    /// Non-streaming query against a named model with default sampling.
    async fn query(&self, text: &str, model: &str) -> Result<String, GatewayError>;

    /// Non-streaming query with the full parameter set.
    async fn query_with_options(
        &self,
        text: &str,
        options: QueryOptions,
    ) -> Result<String, GatewayError>;

    /// Streaming query; segments are delivered in emission order through
    /// `callback(segment, false)` and completion is signaled by
    /// `callback("", true)`. Returns the full response text.
    async fn query_stream(
        &self,
        text: &str,
        options: QueryOptions,
        callback: SegmentCallback,
    ) -> Result<String, GatewayError>;

    /// Register a function tool the model may call.
    fn register_function_tool(
        &self,
        name: &str,
        description: &str,
        parameters: serde_json::Value,
        callback: FunctionToolCallback,
    );

    fn register_function_tool_definition(&self, def: FunctionToolDefinition);

    /// Wire-format tool list as sent upstream (empty for providers without
    /// a tool-call contract).
    fn function_tools(&self) -> Vec<ToolSpec>;

    /// Names of every registered tool.
    fn list_function_tools(&self) -> Vec<String>;

    /// Usage counters from the most recent exchange, if one completed.
    fn last_usage(&self) -> Option<Usage>;

    /// Clear history back to just the system message.
    fn reset_messages(&self);

    /// Replace the system prompt, updating history's leading message.
    fn set_system_prompt(&self, system_prompt: &str);

    /// Defensive copy of the conversation history.
    fn messages(&self) -> Vec<Message>;

    /// Best-effort signal to abort the in-flight exchange; dropped silently
    /// when nothing is in flight.
    fn interrupt(&self);

    /// Idempotent teardown signal; the handler is not usable afterwards.
    fn hangup(&self);
}

/// Conversation history plus the last-usage snapshot, guarded by a std
/// mutex with short critical sections only - network I/O never runs under
/// this lock, so introspection stays responsive mid-exchange.
#[derive(Debug)]
pub(crate) struct ConversationState {
    pub system_prompt: String,
    pub messages: Vec<Message>,
    pub last_usage: Option<Usage>,
}

impl ConversationState {
    pub fn new(system_prompt: &str) -> Self {
        Self {
            system_prompt: system_prompt.to_string(),
            messages: vec![Message::system(system_prompt)],
            last_usage: None,
        }
    }

    pub fn reset(&mut self) {
        self.messages = vec![Message::system(self.system_prompt.clone())];
    }

    pub fn set_system_prompt(&mut self, system_prompt: &str) {
        self.system_prompt = system_prompt.to_string();
        match self.messages.first_mut() {
            Some(first) if first.role == Role::System => {
                first.content = system_prompt.to_string();
            }
            _ => {
                self.messages.insert(0, Message::system(system_prompt));
            }
        }
    }

    /// Remove assistant tool-call rounds whose tool results never arrived.
    ///
    /// A dangling round poisons the next upstream request (the wire format
    /// requires one tool message per call id), so the offending assistant
    /// message and everything after it are dropped.
    pub fn repair_dangling_tool_calls(&mut self) {
        loop {
            let mut truncate_at = None;
            for (i, msg) in self.messages.iter().enumerate().rev() {
                if msg.role != Role::Assistant || msg.tool_calls.is_empty() {
                    continue;
                }
                let incomplete = msg.tool_calls.iter().any(|call| {
                    !self.messages[i + 1..].iter().any(|later| {
                        later.role == Role::Tool
                            && later.tool_call_id.as_deref() == Some(call.id.as_str())
                    })
                });
                if incomplete {
                    truncate_at = Some(i);
                    break;
                }
            }
            match truncate_at {
                Some(i) => {
                    tracing::warn!(
                        "Found incomplete tool calls, removing {} message(s) from history",
                        self.messages.len() - i
                    );
                    self.messages.truncate(i);
                }
                None => break,
            }
        }
    }

    /// Bound history to `max` entries, always keeping the system message.
    pub fn truncate_to(&mut self, max: usize) {
        if self.messages.len() <= max {
            return;
        }
        let keep_tail = max.saturating_sub(1);
        let cut = self.messages.len() - keep_tail;
        let original = self.messages.len();
        self.messages.drain(1..cut);
        tracing::debug!(
            "Truncated message history: {} -> {}",
            original,
            self.messages.len()
        );
    }
}

/// Per-handler cancellation signals.
///
/// `interrupt` is a capacity-1 channel sent with `try_send`: a second
/// interrupt while one is pending, or an interrupt with no exchange to
/// observe it, is dropped. `hangup` is a cancellation token, so calling it
/// twice is a no-op rather than a fault.
#[derive(Debug)]
pub(crate) struct HandlerSignals {
    interrupt_tx: mpsc::Sender<()>,
    pub interrupt_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
    pub cancel: CancellationToken,
}

impl HandlerSignals {
    pub fn new() -> Self {
        let (interrupt_tx, interrupt_rx) = mpsc::channel(1);
        Self {
            interrupt_tx,
            interrupt_rx: tokio::sync::Mutex::new(interrupt_rx),
            cancel: CancellationToken::new(),
        }
    }

    pub fn interrupt(&self) {
        let _ = self.interrupt_tx.try_send(());
    }

    pub fn hangup(&self) {
        self.cancel.cancel();
    }

    pub fn is_hung_up(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Drop interrupts that arrived while no exchange was in flight.
    pub async fn drain_stale_interrupts(&self) {
        let mut rx = self.interrupt_rx.lock().await;
        while rx.try_recv().is_ok() {}
    }
}

/// Forward a segment to the caller's stream callback. Callback failures are
/// logged and swallowed; delivery problems must not kill the exchange.
pub(crate) fn deliver_segment(callback: &mut SegmentCallback, segment: &str, is_complete: bool) {
    if let Err(err) = callback(segment, is_complete) {
        tracing::warn!("Failed to process stream segment: {}", err);
    }
}

pub use coze::CozeHandler;
pub use error::GatewayError;
pub use factory::{new_provider, new_provider_from_config, ProviderKind};
pub use ollama::OllamaHandler;
pub use openai::OpenAICompatibleHandler;
