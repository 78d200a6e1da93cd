//! Agent error types.
//!
//! All orchestration subsystems surface errors through [`AgentError`].  The
//! variants fall into four families:
//!
//! - protocol violations (a stream that never delivers its terminal event),
//! - service-reported errors (carried in failure/error events),
//! - registry/barrier invariant violations (from the kernel),
//! - transport errors (propagated from the HTTP/WebSocket layer).

use turnloop_kernel::KernelError;
use turnloop_protocol::ServiceError;

/// Unified error type for the agent runtime.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    // -- Protocol violations -------------------------------------------------
    /// The event stream ended before a `completed`/`failed` event.
    #[error("event stream ended without a terminal event (response: {response_id:?})")]
    MissingTerminalEvent { response_id: Option<String> },

    // -- Service errors ------------------------------------------------------
    /// The service reported a failure.
    #[error("service error {code:?}: {message} (param: {param:?})")]
    Service {
        code: Option<String>,
        message: String,
        param: Option<String>,
    },

    // -- Tool errors ---------------------------------------------------------
    /// The model called a tool that no attached handler answers to.
    #[error("no handler attached for tool `{name}` (call {call_id})")]
    UnknownTool { name: String, call_id: String },

    /// A tool handler failed.
    #[error("tool execution failed for `{tool_name}`: {reason}")]
    ToolExecutionFailed { tool_name: String, reason: String },

    /// Auto-iteration exceeded the configured turn limit.
    #[error("turn limit exceeded ({max_turns})")]
    MaxTurnsExceeded { max_turns: u32 },

    // -- Session errors ------------------------------------------------------
    /// Only the handshake may happen before `session.created`.
    #[error("session is not ready")]
    SessionNotReady,

    /// The session controller has been disposed.
    #[error("session is closed")]
    SessionClosed,

    // -- Transport errors ----------------------------------------------------
    /// The underlying stream or connection failed.
    #[error("transport error: {reason}")]
    Transport { reason: String },

    /// An HTTP request failed before a response was received.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The WebSocket connection failed.
    #[error("websocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),

    // -- Configuration errors ------------------------------------------------
    /// Configuration validation or loading failed.
    #[error("config error: {reason}")]
    Config { reason: String },

    // -- Serialization -------------------------------------------------------
    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    // -- Upstream crate errors -----------------------------------------------
    /// A registry or barrier invariant was violated.
    #[error("kernel error: {0}")]
    Kernel(#[from] KernelError),

    // -- Generic -------------------------------------------------------------
    /// Catch-all for unexpected internal errors.  Prefer a typed variant
    /// whenever possible.
    #[error("internal agent error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the agent crate.
pub type Result<T> = std::result::Result<T, AgentError>;

impl From<ServiceError> for AgentError {
    fn from(err: ServiceError) -> Self {
        Self::Service {
            code: err.code,
            message: err.message,
            param: err.param,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for AgentError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}

impl AgentError {
    /// Whether this error was reported by the service (as opposed to a
    /// protocol, invariant or transport failure).
    pub fn is_service_error(&self) -> bool {
        matches!(self, Self::Service { .. })
    }
}
