//! Tool descriptors advertised to the model.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The kind of tool; only function tools are handled client-side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    #[default]
    Function,
}

/// A tool definition exposed to the model so it knows what it may call.
///
/// Matching between a tool-call item and a handler is by [`name`](Self::name)
/// equality and nothing else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    #[serde(rename = "type", default)]
    pub kind: ToolKind,

    /// Unique tool name.
    pub name: String,

    /// Human-readable description of what the tool does.
    #[serde(default)]
    pub description: String,

    /// JSON Schema describing the tool's parameters.
    #[serde(default)]
    pub parameters: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strict: Option<bool>,
}

impl ToolDescriptor {
    /// Describe a function tool.
    pub fn function(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
    ) -> Self {
        Self {
            kind: ToolKind::Function,
            name: name.into(),
            description: description.into(),
            parameters,
            strict: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serializes_as_function_tool() {
        let tool = ToolDescriptor::function(
            "get_weather",
            "Current weather for a city",
            json!({"type": "object", "properties": {"city": {"type": "string"}}}),
        );
        let v = serde_json::to_value(&tool).unwrap();
        assert_eq!(v["type"], "function");
        assert_eq!(v["name"], "get_weather");
        assert!(v.get("strict").is_none());
    }
}
