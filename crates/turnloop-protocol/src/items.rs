//! Conversation items.
//!
//! An item is one entry in the model's input/output log.  Items are created
//! either by the application (input) or by the model (output) and are never
//! mutated afterwards; the orchestrator carries them forward by value.

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Roles and content
// ---------------------------------------------------------------------------

/// The author of a message item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System-level instructions that shape model behavior.
    System,
    /// Developer instructions (higher priority than user input).
    Developer,
    /// Input from the human user.
    User,
    /// Output from the model.
    Assistant,
}

/// Lifecycle status reported on model-produced items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    InProgress,
    Completed,
    Incomplete,
}

/// A single content part of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Text supplied by the application.
    InputText { text: String },
    /// Text generated by the model (request/response API).
    OutputText { text: String },
    /// Text generated by the model (persistent session API).
    Text { text: String },
    /// The model declined to answer.
    Refusal { refusal: String },
    /// Generated audio; only the transcript is retained.
    Audio {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transcript: Option<String>,
    },
    /// Any part kind this crate does not model.
    #[serde(other)]
    Unsupported,
}

impl ContentPart {
    /// Text carried by this part, if it is a model text part.
    pub fn output_text(&self) -> Option<&str> {
        match self {
            Self::OutputText { text } | Self::Text { text } => Some(text),
            Self::Audio { transcript } => transcript.as_deref(),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Item payloads
// ---------------------------------------------------------------------------

/// A message with a role and content parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub role: Role,
    #[serde(default)]
    pub content: Vec<ContentPart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ItemStatus>,
}

/// A model-requested invocation of an application tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Correlates the call with its output item.
    pub call_id: String,
    /// Tool name; matched against registered handlers by equality.
    pub name: String,
    /// JSON-encoded arguments, exactly as produced by the model.
    #[serde(default)]
    pub arguments: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ItemStatus>,
}

/// The application's answer to a [`FunctionCallItem`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallOutputItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub call_id: String,
    pub output: String,
}

// ---------------------------------------------------------------------------
// ConversationItem
// ---------------------------------------------------------------------------

/// One entry in the conversation log.
///
/// Item kinds this crate does not model (reasoning, hosted tool calls, ...)
/// are preserved verbatim in [`ConversationItem::Other`] so they can be carried
/// forward into the next request unchanged.
#[derive(Debug, Clone, PartialEq)]
pub enum ConversationItem {
    Message(MessageItem),
    FunctionCall(FunctionCallItem),
    FunctionCallOutput(FunctionCallOutputItem),
    Other(Value),
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum KnownItem {
    Message(MessageItem),
    FunctionCall(FunctionCallItem),
    FunctionCallOutput(FunctionCallOutputItem),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum KnownItemRef<'a> {
    Message(&'a MessageItem),
    FunctionCall(&'a FunctionCallItem),
    FunctionCallOutput(&'a FunctionCallOutputItem),
}

impl Serialize for ConversationItem {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Message(m) => KnownItemRef::Message(m).serialize(serializer),
            Self::FunctionCall(c) => KnownItemRef::FunctionCall(c).serialize(serializer),
            Self::FunctionCallOutput(o) => KnownItemRef::FunctionCallOutput(o).serialize(serializer),
            Self::Other(v) => v.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for ConversationItem {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        match value.get("type").and_then(Value::as_str) {
            Some("message" | "function_call" | "function_call_output") => {
                let known: KnownItem = serde_json::from_value(value).map_err(de::Error::custom)?;
                Ok(match known {
                    KnownItem::Message(m) => Self::Message(m),
                    KnownItem::FunctionCall(c) => Self::FunctionCall(c),
                    KnownItem::FunctionCallOutput(o) => Self::FunctionCallOutput(o),
                })
            }
            _ => Ok(Self::Other(value)),
        }
    }
}

impl ConversationItem {
    /// Build a message item from a role and a single text part.
    fn text_message(role: Role, text: impl Into<String>) -> Self {
        let text = text.into();
        let part = match role {
            Role::Assistant => ContentPart::OutputText { text },
            _ => ContentPart::InputText { text },
        };
        Self::Message(MessageItem {
            id: None,
            role,
            content: vec![part],
            status: None,
        })
    }

    /// Create a user message.
    pub fn user_text(text: impl Into<String>) -> Self {
        Self::text_message(Role::User, text)
    }

    /// Create a system message.
    pub fn system_text(text: impl Into<String>) -> Self {
        Self::text_message(Role::System, text)
    }

    /// Create an assistant message.
    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self::text_message(Role::Assistant, text)
    }

    /// Create a tool-call output item answering `call_id`.
    pub fn function_call_output(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self::FunctionCallOutput(FunctionCallOutputItem {
            id: None,
            call_id: call_id.into(),
            output: output.into(),
        })
    }

    /// The opaque item id, when the service assigned one.
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Message(m) => m.id.as_deref(),
            Self::FunctionCall(c) => c.id.as_deref(),
            Self::FunctionCallOutput(o) => o.id.as_deref(),
            Self::Other(v) => v.get("id").and_then(Value::as_str),
        }
    }

    /// The function call carried by this item, if any.
    pub fn as_function_call(&self) -> Option<&FunctionCallItem> {
        match self {
            Self::FunctionCall(call) => Some(call),
            _ => None,
        }
    }

    /// Concatenated model text of an assistant message, if any.
    pub fn output_text(&self) -> Option<String> {
        let Self::Message(message) = self else {
            return None;
        };
        if message.role != Role::Assistant {
            return None;
        }
        let mut parts = message.content.iter().filter_map(ContentPart::output_text).peekable();
        parts.peek()?;
        Some(parts.collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
