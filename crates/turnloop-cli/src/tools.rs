//! Built-in tools offered to the model by the CLI.

use std::sync::Arc;

use chrono::{Local, SecondsFormat, Utc};
use serde_json::{Value, json};
use turnloop_agent::{AgentError, FunctionTool, ToolHandler};
use turnloop_protocol::ToolDescriptor;

/// Name the model uses to call [`current_time`].
pub const CURRENT_TIME: &str = "current_time";

/// Every tool the CLI registers, in both modes.
pub fn builtin_tools() -> Vec<Arc<dyn ToolHandler>> {
    vec![Arc::new(current_time()) as Arc<dyn ToolHandler>]
}

/// Reports the current date and time.
///
/// Takes an optional `timezone` of `"utc"` (default) or `"local"`.
pub fn current_time() -> FunctionTool {
    let descriptor = ToolDescriptor::function(
        CURRENT_TIME,
        "Get the current date and time.",
        json!({
            "type": "object",
            "properties": {
                "timezone": {
                    "type": "string",
                    "enum": ["utc", "local"],
                    "description": "Which clock to read. Defaults to utc."
                }
            },
            "additionalProperties": false
        }),
    );
    FunctionTool::new(descriptor, |args: Value| async move { now(&args) })
}

fn now(args: &Value) -> turnloop_agent::Result<Value> {
    let timezone = args
        .get("timezone")
        .and_then(Value::as_str)
        .unwrap_or("utc");
    let timestamp = match timezone {
        "utc" => Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        "local" => Local::now().to_rfc3339_opts(SecondsFormat::Secs, false),
        other => {
            return Err(AgentError::ToolExecutionFailed {
                tool_name: CURRENT_TIME.into(),
                reason: format!("unsupported timezone: {other}"),
            });
        }
    };
    Ok(json!({ "timezone": timezone, "timestamp": timestamp }))
}
