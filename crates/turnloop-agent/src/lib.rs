//! Conversation orchestration for turnloop.
//!
//! Two owners drive tool-using conversations with a hosted model:
//!
//! ```text
//! ┌──────────────────┐   request/response   ┌──────────────────┐
//! │ TurnOrchestrator │─────────────────────>│ ResponsesTransport│
//! └────────┬─────────┘                      └──────────────────┘
//!          │ tool calls
//!          v
//!   ┌─────────────┐
//!   │ ToolHandler │
//!   └─────────────┘
//!          ^ tool calls
//!          │
//! ┌────────┴──────────┐  duplex events   ┌───────────────────────┐
//! │ SessionController │<────────────────>│ EventSink + event stream│
//! └───────────────────┘                  └───────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`orchestrator`] -- The turn loop for request/response conversations.
//! - [`session`] -- Lifecycle, tool sync and dispatch for persistent sessions.
//! - [`tool`] -- The tool handler trait and ready-made handlers.
//! - [`transport`] -- HTTP/SSE and WebSocket transports.
//! - [`config`] -- Settings loading.
//! - [`error`] -- Agent error types.

pub mod config;
pub mod error;
pub mod orchestrator;
pub mod session;
pub mod tool;
pub mod transport;

pub use config::AgentSettings;
pub use error::{AgentError, Result};
pub use orchestrator::{OrchestratorConfig, ResponseMode, TurnOrchestrator, TurnOutcome};
pub use session::{SessionController, SessionError, SessionOptions, SessionState};
pub use tool::{DelegateTool, FunctionTool, ToolHandler, ToolInvocation, ToolOwner};
pub use transport::{
    EventSink, HttpTransport, ResponsesTransport, ServerEventStream, WsSink, connect_realtime,
    synthesize_events,
};
