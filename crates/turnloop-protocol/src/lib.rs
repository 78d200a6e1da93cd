//! Wire models for turnloop.
//!
//! Everything the model service sends or accepts is described here as plain
//! serde types.  The orchestration layer in `turnloop-agent` only ever sees
//! these closed sum types; string `type` discriminators are resolved once, at
//! deserialization time.
//!
//! ## Modules
//!
//! - [`items`] -- Conversation log entries (messages, tool calls, tool outputs).
//! - [`tools`] -- Tool descriptors advertised to the model.
//! - [`response`] -- Model responses, requests, usage and service errors.
//! - [`session`] -- Persistent session configuration.
//! - [`events`] -- Server and client event unions.

pub mod events;
pub mod items;
pub mod response;
pub mod session;
pub mod tools;

pub use events::{ClientEvent, ErrorEvent, ServerEvent};
pub use items::{
    ContentPart, ConversationItem, FunctionCallItem, FunctionCallOutputItem, ItemStatus,
    MessageItem, Role,
};
pub use response::{Response, ResponseRequest, ResponseStatus, ServiceError, Usage};
pub use session::{ResponseParameters, SessionConfig};
pub use tools::{ToolDescriptor, ToolKind};
