use thiserror::Error;

/// Gateway-level errors, one variant per failure class.
///
/// Errors that can fire mid-stream (`Timeout`, `Interrupted`, `Hangup`)
/// carry whatever partial text had been accumulated, so callers can still
/// surface it. Nothing here is retried by the gateway itself.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Unusable provider configuration (e.g. missing Coze bot id). Fatal,
    /// surfaced immediately.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upstream API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("JSON serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Upstream returned no choices at all.
    #[error("no choices in response")]
    NoChoices,

    /// Upstream produced an empty answer or echoed the user's input back -
    /// a misconfiguration signal, not a valid response.
    #[error("upstream returned an empty or echoed response: {response:?}")]
    EmptyOrEcho { response: String },

    /// The tool-resolution loop hit its iteration cap without converging.
    /// History has been truncated back past the dangling tool round.
    #[error("max iterations ({limit}) reached without a final response")]
    MaxIterations { limit: usize },

    /// Request or stream timed out with nothing accumulated. Timeouts with
    /// partial content are returned as success, never as this error.
    #[error("request timed out after {waited_ms}ms with no content")]
    Timeout { waited_ms: u64 },

    /// The exchange was interrupted by the caller.
    #[error("stream interrupted")]
    Interrupted { partial: String },

    /// The handler was hung up while the exchange was in flight.
    #[error("hangup requested")]
    Hangup { partial: String },
}

impl GatewayError {
    /// Partial text accumulated before the exchange was cut short, if any.
    pub fn partial_text(&self) -> Option<&str> {
        match self {
            GatewayError::Interrupted { partial } | GatewayError::Hangup { partial } => {
                Some(partial.as_str())
            }
            _ => None,
        }
    }

    /// Client-side (4xx) upstream failures indicate a request that will not
    /// succeed on retry.
    pub fn is_client_error(&self) -> bool {
        match self {
            GatewayError::Api { status, .. } => (400..500).contains(status),
            _ => false,
        }
    }
}
