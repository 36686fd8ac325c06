use crate::models::UsageInfo;
use tokio::sync::mpsc;

/// One telemetry event per logical exchange, as delivered to the external
/// billing/observability listener: the full [`UsageInfo`] snapshot plus the
/// user prompt and the final response text.
#[derive(Debug, Clone)]
pub struct UsageEvent {
    pub info: UsageInfo,
    pub prompt: String,
    pub response: String,
}

/// Clonable handle onto the async usage event bus.
///
/// Handlers emit fire-and-forget; a dropped receiver only costs a debug
/// log, never an error on the query path.
#[derive(Debug, Clone)]
pub struct UsageEmitter {
    tx: mpsc::UnboundedSender<UsageEvent>,
}

impl UsageEmitter {
    /// Create the emitter and the receiver the external listener drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<UsageEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: UsageEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("usage event dropped: receiver no longer listening");
        }
    }
}

/// Heuristic token estimate for upstreams that do not report usage:
/// 2 tokens per CJK character plus 0.25 tokens per Latin letter.
///
/// A rough approximation by design; counters derived from it are tagged
/// [`UsageSource::Estimated`](crate::models::UsageSource).
pub fn estimate_tokens(text: &str) -> u32 {
    let mut cjk = 0u32;
    let mut latin = 0u32;
    for ch in text.chars() {
        if ('\u{4e00}'..='\u{9fff}').contains(&ch) {
            cjk += 1;
        } else if ch.is_ascii_alphabetic() {
            latin += 1;
        }
    }
    cjk * 2 + latin / 4
}
