//! Agent settings.
//!
//! Settings come from an optional TOML file, then environment variables
//! override individual fields.  A missing file is not an error.
//!
//! ```toml
//! model = "gpt-4.1-mini"
//! streaming = true
//! use_server_state = false
//! max_turns = 8
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{AgentError, Result};

/// Default endpoint for request/response conversations.
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Default endpoint for persistent sessions.
pub const DEFAULT_REALTIME_URL: &str = "wss://api.openai.com/v1/realtime";

/// Connection and model settings shared by the orchestrator, the session
/// controller and the transports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Bearer token.  Never serialized back out.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub base_url: String,
    pub realtime_url: String,
    pub model: String,
    pub realtime_model: String,
    pub instructions: Option<String>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_output_tokens: Option<u32>,
    /// Reference the previous response instead of resending history.
    pub use_server_state: bool,
    /// Ask for an event stream instead of a single response object.
    pub streaming: bool,
    /// Upper bound on auto-iterated turns per call.  Unset means unbounded.
    pub max_turns: Option<u32>,
    pub connect_timeout_secs: u64,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.into(),
            realtime_url: DEFAULT_REALTIME_URL.into(),
            model: "gpt-4.1-mini".into(),
            realtime_model: "gpt-4o-realtime-preview".into(),
            instructions: None,
            temperature: None,
            top_p: None,
            max_output_tokens: None,
            use_server_state: false,
            streaming: true,
            max_turns: None,
            connect_timeout_secs: 30,
        }
    }
}

impl AgentSettings {
    /// Parse settings from TOML text.  Absent keys keep their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| AgentError::Config {
            reason: format!("failed to parse TOML settings: {e}"),
        })
    }

    /// Load settings from `path`, falling back to defaults when the file
    /// does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            warn!(path = ?path, "settings file does not exist, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| AgentError::Config {
            reason: format!("failed to read settings file {}: {e}", path.display()),
        })?;
        let settings = Self::from_toml_str(&content)?;
        info!(path = ?path, model = %settings.model, "settings loaded");
        Ok(settings)
    }

    /// Override fields from the process environment.
    pub fn apply_env(self) -> Self {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Override fields from `lookup`.
    ///
    /// `TURNLOOP_API_KEY` wins over `OPENAI_API_KEY`.  Empty values are
    /// ignored.
    pub fn apply_env_with<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = get("TURNLOOP_API_KEY").or_else(|| get("OPENAI_API_KEY")) {
            self.api_key = Some(key);
        }
        if let Some(url) = get("TURNLOOP_BASE_URL") {
            debug!(base_url = %url, "base url overridden from environment");
            self.base_url = url;
        }
        if let Some(url) = get("TURNLOOP_REALTIME_URL") {
            self.realtime_url = url;
        }
        if let Some(model) = get("TURNLOOP_MODEL") {
            debug!(model = %model, "model overridden from environment");
            self.model = model;
        }
        self
    }

    /// The API key, or a config error naming the variables to set.
    pub fn require_api_key(&self) -> Result<&str> {
        self.api_key
            .as_deref()
            .ok_or_else(|| AgentError::Config {
                reason: "no API key configured (set TURNLOOP_API_KEY or OPENAI_API_KEY)".into(),
            })
    }
}
