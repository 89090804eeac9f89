use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ConfigError;
use crate::providers::ApiType;

/// An upstream channel: one provider endpoint plus the credentials and
/// per-channel rewrites applied to calls routed through it.
///
/// ```toml
/// [[channels]]
/// id = 1
/// name = "openai-primary"
/// api_type = "open_ai"
/// base_url = "https://api.openai.com"
/// api_key = "${OPENAI_API_KEY}"
/// models = ["gpt-4o", "gpt-4o-mini"]
/// model_mapping = { "gpt-4o" = "gpt-4o-2024-08-06" }
/// status_code_mapping = { "429" = 503 }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelConfig {
    pub id: i64,

    pub name: String,

    pub api_type: ApiType,

    /// Base URL without the `/v1/...` path.
    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default)]
    pub api_key: String,

    /// Models this channel serves, by the name clients request.
    pub models: Vec<String>,

    /// Groups allowed to use this channel.
    #[serde(default = "default_groups")]
    pub groups: Vec<String>,

    /// Higher priority channels are selected first.
    #[serde(default)]
    pub priority: i64,

    /// Rename a requested model before sending it upstream.
    #[serde(default)]
    pub model_mapping: HashMap<String, String>,

    /// Top-level fields written over the translated request body.
    #[serde(default)]
    pub param_override: serde_json::Map<String, Value>,

    /// Rewrites the status code reported to clients for upstream errors.
    /// Keys are upstream status codes as strings.
    #[serde(default)]
    pub status_code_mapping: HashMap<String, u16>,

    /// Total timeout for a single upstream call. Streaming bodies are bounded
    /// by the idle timeout instead.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl ChannelConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// The model name to send upstream for a requested model.
    pub fn upstream_model(&self, requested: &str) -> String {
        self.model_mapping
            .get(requested)
            .filter(|mapped| !mapped.is_empty())
            .cloned()
            .unwrap_or_else(|| requested.to_string())
    }

    /// Apply `status_code_mapping` to an upstream status code.
    pub fn remap_status(&self, status: u16) -> u16 {
        if status == 200 {
            return status;
        }
        self.status_code_mapping
            .get(&status.to_string())
            .copied()
            .unwrap_or(status)
    }

    /// A channel with default rewrites, for tests.
    #[cfg(test)]
    pub fn for_tests(id: i64, api_type: ApiType, base_url: Option<String>, models: &[&str]) -> Self {
        Self {
            id,
            name: format!("channel-{id}"),
            api_type,
            base_url,
            api_key: "sk-upstream".into(),
            models: models.iter().map(|m| m.to_string()).collect(),
            groups: default_groups(),
            priority: 0,
            model_mapping: HashMap::new(),
            param_override: Default::default(),
            status_code_mapping: HashMap::new(),
            timeout_secs: 30,
        }
    }

    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        if self.models.is_empty() {
            return Err(ConfigError::Validation(format!(
                "channel {} ({}) lists no models",
                self.id, self.name
            )));
        }
        for (from, to) in &self.status_code_mapping {
            let valid_from = from.parse::<u16>().is_ok_and(|s| (100..=599).contains(&s));
            if !valid_from || !(100..=599).contains(to) {
                return Err(ConfigError::Validation(format!(
                    "channel {} has an invalid status_code_mapping entry {from} -> {to}",
                    self.id
                )));
            }
        }
        if self.api_type.requires_base_url() && self.base_url.is_none() {
            return Err(ConfigError::Validation(format!(
                "channel {} ({}) requires base_url",
                self.id, self.name
            )));
        }
        Ok(())
    }
}

fn default_groups() -> Vec<String> {
    vec!["default".to_string()]
}

fn default_timeout_secs() -> u64 {
    300
}
