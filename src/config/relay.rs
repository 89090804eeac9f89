use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Relay pipeline tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    /// Largest accepted `max_tokens` / `max_completion_tokens` value.
    #[serde(default = "default_max_tokens_ceiling")]
    pub max_tokens_ceiling: u64,

    /// Minimum token count used when estimating the pre-authorization hold.
    #[serde(default = "default_pre_consumed_floor")]
    pub pre_consumed_floor_tokens: i64,

    /// Skip the pre-authorization hold when the balance exceeds this multiple
    /// of the estimated cost.
    #[serde(default = "default_trust_multiplier")]
    pub trust_multiplier: i64,

    /// Forward the client's request body verbatim instead of the translated one.
    /// Channel `param_override` maps are not applied in this mode.
    #[serde(default)]
    pub pass_through_request_body: bool,

    /// Group assigned to users that do not declare one.
    #[serde(default = "default_group")]
    pub default_group: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_tokens_ceiling: default_max_tokens_ceiling(),
            pre_consumed_floor_tokens: default_pre_consumed_floor(),
            trust_multiplier: default_trust_multiplier(),
            pass_through_request_body: false,
            default_group: default_group(),
        }
    }
}

impl RelayConfig {
    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        if self.trust_multiplier < 1 {
            return Err(ConfigError::Validation(
                "relay.trust_multiplier must be at least 1".into(),
            ));
        }
        if self.pre_consumed_floor_tokens < 0 {
            return Err(ConfigError::Validation(
                "relay.pre_consumed_floor_tokens cannot be negative".into(),
            ));
        }
        Ok(())
    }
}

fn default_max_tokens_ceiling() -> u64 {
    (i32::MAX / 2) as u64
}

fn default_pre_consumed_floor() -> i64 {
    500
}

fn default_trust_multiplier() -> i64 {
    100
}

fn default_group() -> String {
    "default".to_string()
}
