//! Tool handlers.
//!
//! A [`ToolHandler`] pairs a [`ToolDescriptor`] advertised to the model with
//! the code that answers calls to it.  Owners (the turn orchestrator and the
//! session controller) decide *when* a handler runs; the handler only turns
//! one invocation into one output item.
//!
//! Two ready-made handlers cover most needs:
//!
//! - [`FunctionTool`] takes parsed JSON arguments and returns a JSON value,
//! - [`DelegateTool`] receives the raw invocation and builds the output item
//!   itself.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;
use uuid::Uuid;

use turnloop_protocol::{ConversationItem, FunctionCallItem, ToolDescriptor};

use crate::error::{AgentError, Result};

// ---------------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------------

/// One call the model made to a tool.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    /// Correlates the call with its output item.
    pub call_id: String,
    pub name: String,
    /// JSON-encoded arguments, exactly as the model produced them.
    pub arguments: String,
    /// Id of the call item, when the service assigned one.
    pub item_id: Option<String>,
}

impl ToolInvocation {
    pub fn from_call(call: &FunctionCallItem) -> Self {
        Self {
            call_id: call.call_id.clone(),
            name: call.name.clone(),
            arguments: call.arguments.clone(),
            item_id: call.id.clone(),
        }
    }

    /// Decode the arguments.  Empty arguments decode as `{}`.
    pub fn parse_arguments<T: DeserializeOwned>(&self) -> Result<T> {
        let raw = if self.arguments.trim().is_empty() {
            "{}"
        } else {
            self.arguments.as_str()
        };
        serde_json::from_str(raw).map_err(|e| AgentError::ToolExecutionFailed {
            tool_name: self.name.clone(),
            reason: format!("invalid arguments: {e}"),
        })
    }

    /// The output item answering this call.
    pub fn output(&self, output: impl Into<String>) -> ConversationItem {
        ConversationItem::function_call_output(self.call_id.clone(), output)
    }
}

// ---------------------------------------------------------------------------
// Handler trait
// ---------------------------------------------------------------------------

/// Who a handler is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolOwner {
    Orchestrator(Uuid),
    Session(Uuid),
}

/// Application code answering calls to one tool.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// The descriptor advertised to the model.
    fn descriptor(&self) -> &ToolDescriptor;

    /// Descriptor name; unique per owner.
    fn name(&self) -> &str {
        &self.descriptor().name
    }

    /// Whether `call` is addressed to this handler.
    fn matches(&self, call: &FunctionCallItem) -> bool {
        call.name == self.descriptor().name
    }

    /// Produce the output item for one invocation.
    async fn execute(&self, invocation: ToolInvocation) -> Result<ConversationItem>;

    /// Called after the handler was attached to `owner`.
    fn on_attach(&self, _owner: ToolOwner) {}

    /// Called after the handler was detached from `owner`.
    fn on_detach(&self, _owner: ToolOwner) {}
}

/// Run `handler`, turning a failure into an error payload so the model sees
/// it and the turn still completes.
pub(crate) async fn run_tool(
    handler: &dyn ToolHandler,
    invocation: ToolInvocation,
) -> ConversationItem {
    let call_id = invocation.call_id.clone();
    let name = invocation.name.clone();
    tracing::debug!(tool = %name, call_id = %call_id, "executing tool");

    match handler.execute(invocation).await {
        Ok(output) => output,
        Err(e) => {
            tracing::warn!(tool = %name, call_id = %call_id, error = %e, "tool execution failed");
            let payload = serde_json::json!({ "error": e.to_string() });
            ConversationItem::function_call_output(call_id, payload.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// FunctionTool
// ---------------------------------------------------------------------------

type JsonFn = dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync;

/// A tool backed by an async function from JSON arguments to a JSON result.
///
/// String results are sent as-is; any other value is sent JSON-encoded.
#[derive(Clone)]
pub struct FunctionTool {
    descriptor: ToolDescriptor,
    func: Arc<JsonFn>,
}

impl FunctionTool {
    pub fn new<F, Fut>(descriptor: ToolDescriptor, func: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            descriptor,
            func: Arc::new(move |args| Box::pin(func(args))),
        }
    }
}

impl fmt::Debug for FunctionTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionTool")
            .field("name", &self.descriptor.name)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ToolHandler for FunctionTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn execute(&self, invocation: ToolInvocation) -> Result<ConversationItem> {
        let args: Value = invocation.parse_arguments()?;
        let value = (self.func)(args).await?;
        let output = match value {
            Value::String(s) => s,
            other => other.to_string(),
        };
        Ok(invocation.output(output))
    }
}

// ---------------------------------------------------------------------------
// DelegateTool
// ---------------------------------------------------------------------------

type DelegateFn = dyn Fn(ToolInvocation) -> BoxFuture<'static, Result<ConversationItem>> + Send + Sync;

/// A tool that hands the raw invocation to a closure which builds the output
/// item itself.
#[derive(Clone)]
pub struct DelegateTool {
    descriptor: ToolDescriptor,
    func: Arc<DelegateFn>,
}

impl DelegateTool {
    pub fn new<F, Fut>(descriptor: ToolDescriptor, func: F) -> Self
    where
        F: Fn(ToolInvocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ConversationItem>> + Send + 'static,
    {
        Self {
            descriptor,
            func: Arc::new(move |invocation| Box::pin(func(invocation))),
        }
    }
}

impl fmt::Debug for DelegateTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelegateTool")
            .field("name", &self.descriptor.name)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ToolHandler for DelegateTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn execute(&self, invocation: ToolInvocation) -> Result<ConversationItem> {
        (self.func)(invocation).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use turnloop_protocol::FunctionCallOutputItem;

    fn call(name: &str, arguments: &str) -> FunctionCallItem {
        FunctionCallItem {
            id: Some("fc_1".into()),
            call_id: "call_1".into(),
            name: name.into(),
            arguments: arguments.into(),
            status: None,
        }
    }

    fn weather_tool() -> FunctionTool {
        FunctionTool::new(
            ToolDescriptor::function("get_weather", "Current weather", json!({"type": "object"})),
            |args| async move {
                let city = args["city"].as_str().unwrap_or_default().to_owned();
                if city.is_empty() {
                    return Err(AgentError::ToolExecutionFailed {
                        tool_name: "get_weather".into(),
                        reason: "city is required".into(),
                    });
                }
                Ok(json!({ "temp_c": 22 }))
            },
        )
    }

    fn output_of(item: ConversationItem) -> FunctionCallOutputItem {
        match item {
            ConversationItem::FunctionCallOutput(out) => out,
            other => panic!("expected function call output, got {other:?}"),
        }
    }

    #[test]
    fn matches_by_name() {
        let tool = weather_tool();
        assert!(tool.matches(&call("get_weather", "{}")));
        assert!(!tool.matches(&call("get_time", "{}")));
        assert_eq!(tool.name(), "get_weather");
    }

    #[tokio::test]
    async fn function_tool_encodes_json_result() {
        let tool = weather_tool();
        let invocation = ToolInvocation::from_call(&call("get_weather", r#"{"city":"Paris"}"#));

        let out = output_of(tool.execute(invocation).await.unwrap());
        assert_eq!(out.call_id, "call_1");
        assert_eq!(out.output, r#"{"temp_c":22}"#);
    }

    #[tokio::test]
    async fn string_results_are_sent_verbatim() {
        let tool = FunctionTool::new(
            ToolDescriptor::function("echo", "Echo", json!({"type": "object"})),
            |_| async { Ok(Value::String("plain".into())) },
        );
        let out = output_of(
            tool.execute(ToolInvocation::from_call(&call("echo", "")))
                .await
                .unwrap(),
        );
        assert_eq!(out.output, "plain");
    }

    #[tokio::test]
    async fn run_tool_turns_errors_into_payload() {
        let tool = weather_tool();
        let invocation = ToolInvocation::from_call(&call("get_weather", "{}"));

        let out = output_of(run_tool(&tool, invocation).await);
        assert_eq!(out.call_id, "call_1");
        let payload: Value = serde_json::from_str(&out.output).unwrap();
        assert!(payload["error"].as_str().unwrap().contains("city is required"));
    }

    #[tokio::test]
    async fn malformed_arguments_become_error_output() {
        let tool = weather_tool();
        let invocation = ToolInvocation::from_call(&call("get_weather", "{not json"));

        let out = output_of(run_tool(&tool, invocation).await);
        assert!(out.output.contains("invalid arguments"));
    }

    #[tokio::test]
    async fn delegate_tool_builds_its_own_item() {
        let tool = DelegateTool::new(
            ToolDescriptor::function("lookup", "Lookup", json!({"type": "object"})),
            |invocation: ToolInvocation| async move {
                Ok(invocation.output(format!("looked up {}", invocation.arguments)))
            },
        );
        let out = output_of(
            tool.execute(ToolInvocation::from_call(&call("lookup", "42")))
                .await
                .unwrap(),
        );
        assert_eq!(out.output, "looked up 42");
    }
}
