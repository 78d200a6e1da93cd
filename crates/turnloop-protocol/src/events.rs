//! Server and client event unions.
//!
//! [`ServerEvent`] covers both the request/response stream (`response.*`) and
//! the persistent session stream (`session.*`, `conversation.*`,
//! `response.done`).  Event kinds this crate does not model decode to
//! [`ServerEvent::Unknown`] instead of failing the stream.

use serde::{Deserialize, Serialize};

use crate::items::{ConversationItem, FunctionCallItem};
use crate::response::{Response, ServiceError};
use crate::session::{ResponseParameters, SessionConfig};

// ---------------------------------------------------------------------------
// Server events
// ---------------------------------------------------------------------------

/// Everything the service can emit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "response.created")]
    ResponseCreated {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sequence_number: Option<u64>,
        response: Response,
    },

    #[serde(rename = "response.in_progress")]
    ResponseInProgress {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sequence_number: Option<u64>,
        response: Response,
    },

    #[serde(rename = "response.output_item.added")]
    OutputItemAdded {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sequence_number: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response_id: Option<String>,
        #[serde(default)]
        output_index: u32,
        item: ConversationItem,
    },

    /// An output item reached a terminal state.
    #[serde(rename = "response.output_item.done")]
    OutputItemDone {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sequence_number: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response_id: Option<String>,
        #[serde(default)]
        output_index: u32,
        item: ConversationItem,
    },

    #[serde(rename = "response.output_text.delta", alias = "response.text.delta")]
    OutputTextDelta {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sequence_number: Option<u64>,
        #[serde(default)]
        item_id: String,
        #[serde(default)]
        output_index: u32,
        #[serde(default)]
        content_index: u32,
        delta: String,
    },

    #[serde(rename = "response.output_text.done", alias = "response.text.done")]
    OutputTextDone {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sequence_number: Option<u64>,
        #[serde(default)]
        item_id: String,
        #[serde(default)]
        output_index: u32,
        #[serde(default)]
        content_index: u32,
        text: String,
    },

    #[serde(rename = "response.function_call_arguments.delta")]
    FunctionCallArgumentsDelta {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sequence_number: Option<u64>,
        #[serde(default)]
        item_id: String,
        #[serde(default)]
        output_index: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
        delta: String,
    },

    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallArgumentsDone {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sequence_number: Option<u64>,
        #[serde(default)]
        item_id: String,
        #[serde(default)]
        output_index: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        arguments: String,
    },

    /// Terminal: the response finished successfully.
    #[serde(rename = "response.completed")]
    ResponseCompleted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sequence_number: Option<u64>,
        response: Response,
    },

    /// Terminal: the response stopped early (token limit, content filter).
    #[serde(rename = "response.incomplete")]
    ResponseIncomplete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sequence_number: Option<u64>,
        response: Response,
    },

    /// Terminal: the response failed; `response.error` carries the reason.
    #[serde(rename = "response.failed")]
    ResponseFailed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sequence_number: Option<u64>,
        response: Response,
    },

    /// A persistent-session generation finished (in any status).
    #[serde(rename = "response.done")]
    ResponseDone {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event_id: Option<String>,
        response: Response,
    },

    #[serde(rename = "session.created")]
    SessionCreated {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event_id: Option<String>,
        session: SessionConfig,
    },

    #[serde(rename = "session.updated")]
    SessionUpdated {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event_id: Option<String>,
        session: SessionConfig,
    },

    #[serde(rename = "conversation.item.created")]
    ConversationItemCreated {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous_item_id: Option<String>,
        item: ConversationItem,
    },

    #[serde(rename = "error")]
    Error(ErrorEvent),

    #[serde(other)]
    Unknown,
}

impl ServerEvent {
    /// The wire `type` of this event, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ResponseCreated { .. } => "response.created",
            Self::ResponseInProgress { .. } => "response.in_progress",
            Self::OutputItemAdded { .. } => "response.output_item.added",
            Self::OutputItemDone { .. } => "response.output_item.done",
            Self::OutputTextDelta { .. } => "response.output_text.delta",
            Self::OutputTextDone { .. } => "response.output_text.done",
            Self::FunctionCallArgumentsDelta { .. } => "response.function_call_arguments.delta",
            Self::FunctionCallArgumentsDone { .. } => "response.function_call_arguments.done",
            Self::ResponseCompleted { .. } => "response.completed",
            Self::ResponseIncomplete { .. } => "response.incomplete",
            Self::ResponseFailed { .. } => "response.failed",
            Self::ResponseDone { .. } => "response.done",
            Self::SessionCreated { .. } => "session.created",
            Self::SessionUpdated { .. } => "session.updated",
            Self::ConversationItemCreated { .. } => "conversation.item.created",
            Self::Error(_) => "error",
            Self::Unknown => "unknown",
        }
    }

    /// The service-assigned sequence number, when present.
    pub fn sequence_number(&self) -> Option<u64> {
        match self {
            Self::ResponseCreated { sequence_number, .. }
            | Self::ResponseInProgress { sequence_number, .. }
            | Self::OutputItemAdded { sequence_number, .. }
            | Self::OutputItemDone { sequence_number, .. }
            | Self::OutputTextDelta { sequence_number, .. }
            | Self::OutputTextDone { sequence_number, .. }
            | Self::FunctionCallArgumentsDelta { sequence_number, .. }
            | Self::FunctionCallArgumentsDone { sequence_number, .. }
            | Self::ResponseCompleted { sequence_number, .. }
            | Self::ResponseIncomplete { sequence_number, .. }
            | Self::ResponseFailed { sequence_number, .. } => *sequence_number,
            Self::Error(e) => e.sequence_number,
            _ => None,
        }
    }

    /// The tool call carried by an item that reached its terminal state.
    ///
    /// This is the only event that triggers tool dispatch: arguments are
    /// complete here, and each item is done exactly once.
    pub fn completed_function_call(&self) -> Option<&FunctionCallItem> {
        match self {
            Self::OutputItemDone { item, .. } => item.as_function_call(),
            _ => None,
        }
    }
}

/// Payload of an `error` event.
///
/// The request/response stream puts `code`/`message`/`param` at the top level;
/// persistent sessions nest them under `error`.  Both shapes decode here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ServiceError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
}

impl ErrorEvent {
    /// Normalize either wire shape into a [`ServiceError`].
    pub fn to_service_error(&self) -> ServiceError {
        match &self.error {
            Some(nested) => nested.clone(),
            None => ServiceError {
                kind: None,
                code: self.code.clone(),
                message: self.message.clone().unwrap_or_default(),
                param: self.param.clone(),
                event_id: self.event_id.clone(),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Client events
// ---------------------------------------------------------------------------

/// Outbound requests on a persistent session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event_id: Option<String>,
        session: SessionConfig,
    },

    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous_item_id: Option<String>,
        item: ConversationItem,
    },

    #[serde(rename = "conversation.item.delete")]
    ConversationItemDelete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event_id: Option<String>,
        item_id: String,
    },

    #[serde(rename = "response.create")]
    ResponseCreate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response: Option<ResponseParameters>,
    },

    #[serde(rename = "response.cancel")]
    ResponseCancel {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response_id: Option<String>,
    },
}

impl ClientEvent {
    /// Replace the session configuration.
    pub fn session_update(session: SessionConfig) -> Self {
        Self::SessionUpdate {
            event_id: None,
            session,
        }
    }

    /// Append an item to the conversation.
    pub fn item_create(item: ConversationItem) -> Self {
        Self::ConversationItemCreate {
            event_id: None,
            previous_item_id: None,
            item,
        }
    }

    /// Ask the model to generate with the session defaults.
    pub fn response_create() -> Self {
        Self::ResponseCreate {
            event_id: None,
            response: None,
        }
    }

    /// The wire `type` of this event, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionUpdate { .. } => "session.update",
            Self::ConversationItemCreate { .. } => "conversation.item.create",
            Self::ConversationItemDelete { .. } => "conversation.item.delete",
            Self::ResponseCreate { .. } => "response.create",
            Self::ResponseCancel { .. } => "response.cancel",
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
