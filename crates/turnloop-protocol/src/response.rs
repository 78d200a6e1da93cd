//! Model responses, requests, token usage and service-reported errors.

use std::fmt;
use std::ops::AddAssign;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::items::{ConversationItem, FunctionCallItem};
use crate::tools::ToolDescriptor;

// ---------------------------------------------------------------------------
// Service errors
// ---------------------------------------------------------------------------

/// An error reported by the model service itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceError {
    /// Error category (e.g. `"invalid_request_error"`).
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// Machine-readable error code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    /// Human-readable message.
    #[serde(default)]
    pub message: String,

    /// The request parameter the error relates to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,

    /// The client event that caused the error (persistent sessions only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{code}: {}", self.message)?,
            None => write!(f, "{}", self.message)?,
        }
        if let Some(param) = &self.param {
            write!(f, " (param: {param})")?;
        }
        Ok(())
    }
}

impl std::error::Error for ServiceError {}

// ---------------------------------------------------------------------------
// Usage
// ---------------------------------------------------------------------------

/// Token usage reported for a response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl AddAssign for Usage {
    fn add_assign(&mut self, rhs: Self) {
        self.input_tokens += rhs.input_tokens;
        self.output_tokens += rhs.output_tokens;
        self.total_tokens += rhs.total_tokens;
    }
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// Lifecycle status of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Queued,
    InProgress,
    Completed,
    Incomplete,
    Failed,
    Cancelled,
}

/// The result of one model invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Opaque id; referenced by the next request when relying on
    /// server-side conversation state.
    #[serde(default)]
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ResponseStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Items produced by the model, in order.
    #[serde(default)]
    pub output: Vec<ConversationItem>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ServiceError>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incomplete_details: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_response_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl Response {
    /// The final textual answer: all assistant text in output order, or
    /// `None` when the model produced no text at all.
    pub fn output_text(&self) -> Option<String> {
        let mut texts = self
            .output
            .iter()
            .filter_map(ConversationItem::output_text)
            .peekable();
        texts.peek()?;
        Some(texts.collect())
    }

    /// Function calls requested by the model in this response.
    pub fn function_calls(&self) -> impl Iterator<Item = &FunctionCallItem> {
        self.output.iter().filter_map(ConversationItem::as_function_call)
    }
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// A full model-invocation request.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResponseRequest {
    /// The model identifier.
    pub model: String,

    /// Input items for this turn.
    pub input: Vec<ConversationItem>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,

    /// Snapshot of the tool descriptors attached when the request was built.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDescriptor>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel_tool_calls: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,

    /// References the prior turn when relying on server-side state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_response_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<bool>,

    /// Whether the service should answer with an event stream.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
}
