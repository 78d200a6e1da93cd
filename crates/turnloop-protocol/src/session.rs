//! Persistent session configuration.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::tools::ToolDescriptor;

/// Configuration of a persistent duplex session.
///
/// Only the fields the orchestration layer reads are typed; everything else
/// (audio formats, voice activity detection, ...) round-trips through
/// [`extra`](Self::extra).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modalities: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,

    /// Tools the remote side currently advertises to the model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDescriptor>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SessionConfig {
    /// A session update that only replaces the advertised tool list.
    pub fn with_tools(tools: Vec<ToolDescriptor>) -> Self {
        Self {
            tools: Some(tools),
            ..Self::default()
        }
    }
}

/// Per-response overrides sent with a generation request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modalities: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_fields_round_trip_through_extra() {
        let raw = json!({
            "id": "sess_1",
            "model": "rt-model",
            "voice": "alloy",
            "turn_detection": {"type": "server_vad"}
        });
        let config: SessionConfig = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(config.id.as_deref(), Some("sess_1"));
        assert!(config.extra.contains_key("turn_detection"));
        assert_eq!(serde_json::to_value(&config).unwrap(), raw);
    }
}
