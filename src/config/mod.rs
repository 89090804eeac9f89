//! Configuration module for the gateway.
//!
//! The gateway is configured via a TOML file, with support for environment
//! variable interpolation using `${VAR_NAME}` syntax.
//!
//! # Example
//!
//! ```toml
//! [server]
//! port = 3000
//!
//! [pricing]
//! quota_per_unit = 500000
//! model_ratio = { "gpt-4o-mini" = 0.00000015 }
//!
//! [[channels]]
//! id = 1
//! name = "openai"
//! api_type = "open_ai"
//! api_key = "${OPENAI_API_KEY}"
//! models = ["gpt-4o-mini"]
//!
//! [[users]]
//! id = 1
//! username = "alice"
//! quota = 1000000
//!
//! [[tokens]]
//! id = 1
//! name = "alice-laptop"
//! key = "sk-alice"
//! user_id = 1
//! unlimited = true
//! ```

mod accounts;
mod channels;
mod database;
mod features;
mod observability;
mod relay;
mod server;

use std::{collections::HashSet, path::Path};

pub use accounts::*;
pub use channels::*;
pub use database::*;
pub use features::*;
pub use observability::*;
pub use relay::*;
use serde::{Deserialize, Serialize};
pub use server::*;

/// Root configuration for the gateway.
///
/// All sections are optional with sensible defaults, but a usable gateway
/// needs at least one channel, one user and one token.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,

    /// Storage for balances and logs. Defaults to in-memory.
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,

    #[serde(default)]
    pub relay: RelayConfig,

    /// Ratios, fixed prices and tool prices.
    #[serde(default)]
    pub pricing: crate::pricing::PricingConfig,

    #[serde(default)]
    pub channels: Vec<ChannelConfig>,

    #[serde(default)]
    pub users: Vec<UserConfig>,

    #[serde(default)]
    pub tokens: Vec<TokenConfig>,

    #[serde(default)]
    pub chat_log: ChatLogConfig,

    #[serde(default)]
    pub content_policy: ContentPolicyConfig,

    #[serde(default)]
    pub jobs: JobQueueConfig,

    #[serde(default)]
    pub usage_buffer: UsageBufferConfig,
}

impl GatewayConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e, path.as_ref().to_path_buf()))?;

        Self::from_str(&contents)
    }

    /// Parse configuration from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(contents: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(contents)?;

        let raw: toml::Value = toml::from_str(&expanded).map_err(ConfigError::Parse)?;
        check_disabled_features(&raw)?;

        let config: GatewayConfig = toml::from_str(&expanded).map_err(ConfigError::Parse)?;
        config.validate()?;

        Ok(config)
    }

    /// Validate the configuration for consistency and completeness.
    fn validate(&self) -> Result<(), ConfigError> {
        self.database.validate()?;
        self.relay.validate()?;
        self.pricing.validate()?;

        let mut channel_ids = HashSet::new();
        for channel in &self.channels {
            if !channel_ids.insert(channel.id) {
                return Err(ConfigError::Validation(format!(
                    "duplicate channel id {}",
                    channel.id
                )));
            }
            channel.validate()?;
        }

        let mut user_ids = HashSet::new();
        for user in &self.users {
            if !user_ids.insert(user.id) {
                return Err(ConfigError::Validation(format!(
                    "duplicate user id {}",
                    user.id
                )));
            }
        }

        let mut token_ids = HashSet::new();
        let mut token_keys = HashSet::new();
        for token in &self.tokens {
            if !token_ids.insert(token.id) {
                return Err(ConfigError::Validation(format!(
                    "duplicate token id {}",
                    token.id
                )));
            }
            if token.key.is_empty() || !token_keys.insert(token.key.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "token {} has an empty or duplicate key",
                    token.id
                )));
            }
            if !user_ids.contains(&token.user_id) {
                return Err(ConfigError::Validation(format!(
                    "token {} references unknown user {}",
                    token.id, token.user_id
                )));
            }
        }

        if self.jobs.workers == 0 || self.jobs.capacity == 0 {
            return Err(ConfigError::Validation(
                "jobs.workers and jobs.capacity must be at least 1".into(),
            ));
        }

        Ok(())
    }

    /// Group for a user, falling back to `relay.default_group`.
    pub fn user_group(&self, user: &UserConfig) -> String {
        user.group
            .clone()
            .unwrap_or_else(|| self.relay.default_group.clone())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {1}: {0}")]
    Io(std::io::Error, std::path::PathBuf),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),
}

/// Check for feature-gated configuration values before typed deserialization.
///
/// Without this, a `database.type` whose cargo feature is not compiled in
/// surfaces as a cryptic serde "unknown variant" error.
fn check_disabled_features(raw: &toml::Value) -> Result<(), ConfigError> {
    let db_type = raw
        .get("database")
        .and_then(|d| d.get("type"))
        .and_then(|t| t.as_str());

    if db_type == Some("sqlite") && cfg!(not(feature = "database-sqlite")) {
        return Err(ConfigError::Validation(
            "database type \"sqlite\" requires the database-sqlite feature. \
             Rebuild with: cargo build --features database-sqlite"
                .into(),
        ));
    }

    Ok(())
}

/// Expand `${VAR}` references, leaving anything after a `#` comment marker untouched.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| ConfigError::Validation(e.to_string()))?;
    let mut result = String::with_capacity(input.len());

    for line in input.lines() {
        let comment_pos = line.find('#');

        let mut line_result = String::with_capacity(line.len());
        let mut last_end = 0;

        for cap in re.captures_iter(line) {
            let (Some(whole), Some(name)) = (cap.get(0), cap.get(1)) else {
                continue;
            };

            if let Some(pos) = comment_pos
                && whole.start() >= pos
            {
                continue;
            }

            line_result.push_str(&line[last_end..whole.start()]);

            let var_name = name.as_str();
            let value = std::env::var(var_name)
                .map_err(|_| ConfigError::EnvVarNotFound(var_name.to_string()))?;
            line_result.push_str(&value);

            last_end = whole.end();
        }

        line_result.push_str(&line[last_end..]);
        result.push_str(&line_result);
        result.push('\n');
    }

    if !input.ends_with('\n') && result.ends_with('\n') {
        result.pop();
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASIC: &str = r#"
        [[channels]]
        id = 1
        name = "openai"
        api_type = "open_ai"
        api_key = "sk-test"
        models = ["gpt-4o-mini"]

        [[users]]
        id = 1
        username = "alice"
        quota = 1000000

        [[tokens]]
        id = 10
        name = "laptop"
        key = "sk-alice"
        user_id = 1
    "#;

    #[test]
    fn test_minimal_config() {
        let config = GatewayConfig::from_str(BASIC).unwrap();

        assert_eq!(config.channels.len(), 1);
        assert_eq!(config.users[0].quota, 1_000_000);
        assert!(!config.tokens[0].unlimited);
        assert!(config.database.is_none());
        assert!(config.chat_log.enabled);
        assert_eq!(config.relay.trust_multiplier, 100);
        assert_eq!(config.user_group(&config.users[0]), "default");
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = GatewayConfig::from_str("[server]\nbogus = 1").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_token_with_unknown_user_rejected() {
        let config = BASIC.replace("user_id = 1", "user_id = 99");
        let err = GatewayConfig::from_str(&config).unwrap_err();
        assert!(err.to_string().contains("unknown user 99"), "{err}");
    }

    #[test]
    fn test_duplicate_channel_id_rejected() {
        let config = format!(
            "{BASIC}\n[[channels]]\nid = 1\nname = \"again\"\napi_type = \"open_ai\"\nmodels = [\"x\"]\n"
        );
        let err = GatewayConfig::from_str(&config).unwrap_err();
        assert!(err.to_string().contains("duplicate channel id"), "{err}");
    }

    #[test]
    fn test_env_var_expansion() {
        temp_env::with_var("RELAYGATE_TEST_KEY", Some("sk-secret"), || {
            let result = expand_env_vars("key = \"${RELAYGATE_TEST_KEY}\"").unwrap();
            assert_eq!(result, "key = \"sk-secret\"");
        });
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, BASIC.as_bytes()).unwrap();

        let config = GatewayConfig::from_file(file.path()).unwrap();
        assert_eq!(config.tokens[0].key, "sk-alice");
    }

    #[test]
    fn test_from_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let err = GatewayConfig::from_file(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(..)));
    }

    #[test]
    fn test_env_var_missing() {
        let err = expand_env_vars("key = \"${RELAYGATE_SURELY_UNSET_VAR}\"").unwrap_err();
        assert!(matches!(err, ConfigError::EnvVarNotFound(name) if name == "RELAYGATE_SURELY_UNSET_VAR"));
    }

    #[test]
    fn test_env_var_in_comment_ignored() {
        let result = expand_env_vars("key = \"value\" # ${NONEXISTENT_VAR}").unwrap();
        assert_eq!(result, "key = \"value\" # ${NONEXISTENT_VAR}");
    }

    #[test]
    #[cfg(not(feature = "database-sqlite"))]
    fn test_disabled_database_sqlite_error() {
        let err = GatewayConfig::from_str("[database]\ntype = \"sqlite\"\npath = \"x.db\"")
            .unwrap_err();
        assert!(err.to_string().contains("database-sqlite"), "{err}");
    }

    #[test]
    #[cfg(feature = "database-sqlite")]
    fn test_sqlite_database_config() {
        let config = GatewayConfig::from_str(&format!(
            "[database]\ntype = \"sqlite\"\npath = \"relaygate.db\"\n{BASIC}"
        ))
        .unwrap();
        match config.database {
            DatabaseConfig::Sqlite(c) => {
                assert_eq!(c.path, "relaygate.db");
                assert!(c.run_migrations);
            }
            other => panic!("expected sqlite, got {other:?}"),
        }
    }
}
