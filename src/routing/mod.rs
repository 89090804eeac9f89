//! Channel selection.
//!
//! A request is routed by the model name it asks for and the caller's group.
//! Among the channels that serve both, the highest `priority` wins; channels
//! that share the top priority take turns.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use crate::config::ChannelConfig;

/// Maximum length for a model string.
const MAX_MODEL_STRING_LENGTH: usize = 256;

/// Validate that a model string contains only safe characters and is within length limits.
///
/// Allowed characters: alphanumeric, hyphens, dots, slashes, colons, underscores, at signs, and spaces.
pub fn validate_model_string(model: &str) -> Result<(), RoutingError> {
    if model.is_empty() {
        return Err(RoutingError::NoModel);
    }
    if model.len() > MAX_MODEL_STRING_LENGTH {
        return Err(RoutingError::InvalidModelFormat(format!(
            "Model string exceeds maximum length of {} characters",
            MAX_MODEL_STRING_LENGTH,
        )));
    }
    if !model
        .chars()
        .all(|c| c.is_alphanumeric() || "-._/:@ ".contains(c))
    {
        return Err(RoutingError::InvalidModelFormat(
            "Model string contains invalid characters".to_string(),
        ));
    }
    Ok(())
}

/// Error when routing a model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    /// No model specified.
    NoModel,
    /// No enabled channel serves this model for the caller's group.
    NoChannel { model: String, group: String },
    /// Invalid model string format (bad characters or too long).
    InvalidModelFormat(String),
}

impl std::fmt::Display for RoutingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoModel => write!(f, "No model specified"),
            Self::NoChannel { model, group } => write!(
                f,
                "No available channel for model {} under group {}",
                model, group
            ),
            Self::InvalidModelFormat(msg) => write!(f, "Invalid model format: {}", msg),
        }
    }
}

impl std::error::Error for RoutingError {}

/// Immutable channel table with a round-robin cursor per lookup.
#[derive(Debug, Default)]
pub struct ChannelTable {
    channels: Vec<Arc<ChannelConfig>>,
    cursor: AtomicUsize,
}

impl ChannelTable {
    pub fn new(channels: impl IntoIterator<Item = ChannelConfig>) -> Self {
        Self {
            channels: channels.into_iter().map(Arc::new).collect(),
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn get(&self, id: i64) -> Option<Arc<ChannelConfig>> {
        self.channels.iter().find(|c| c.id == id).cloned()
    }

    /// Pick a channel serving `model` for `group`.
    pub fn select(&self, model: &str, group: &str) -> Result<Arc<ChannelConfig>, RoutingError> {
        validate_model_string(model)?;

        let candidates: Vec<&Arc<ChannelConfig>> = self
            .channels
            .iter()
            .filter(|c| c.models.iter().any(|m| m == model))
            .filter(|c| c.groups.iter().any(|g| g == group))
            .collect();

        let Some(top) = candidates.iter().map(|c| c.priority).max() else {
            return Err(RoutingError::NoChannel {
                model: model.to_string(),
                group: group.to_string(),
            });
        };

        let tier: Vec<&Arc<ChannelConfig>> = candidates
            .into_iter()
            .filter(|c| c.priority == top)
            .collect();
        let turn = self.cursor.fetch_add(1, Ordering::Relaxed) % tier.len();

        Ok(Arc::clone(tier[turn]))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::providers::ApiType;

    fn channel(id: i64, models: &[&str], priority: i64) -> ChannelConfig {
        let mut channel = ChannelConfig::for_tests(id, ApiType::Test, None, models);
        channel.priority = priority;
        channel
    }

    #[rstest]
    #[case("gpt-4o", true)]
    #[case("openrouter/anthropic/claude-3.5-sonnet", true)]
    #[case("models/gemini-1.5-pro:latest", true)]
    #[case("", false)]
    #[case("gpt-4o\nX-Injected: 1", false)]
    #[case("model<script>", false)]
    fn test_validate_model_string(#[case] model: &str, #[case] valid: bool) {
        assert_eq!(validate_model_string(model).is_ok(), valid);
    }

    #[test]
    fn test_model_string_too_long() {
        let model = "a".repeat(MAX_MODEL_STRING_LENGTH + 1);
        assert!(matches!(
            validate_model_string(&model),
            Err(RoutingError::InvalidModelFormat(_))
        ));
    }

    #[test]
    fn test_select_by_model() {
        let table = ChannelTable::new([channel(1, &["gpt-4o"], 0), channel(2, &["o3-mini"], 0)]);
        assert_eq!(table.select("o3-mini", "default").unwrap().id, 2);
        assert_eq!(table.select("gpt-4o", "default").unwrap().id, 1);
    }

    #[test]
    fn test_select_prefers_higher_priority() {
        let table = ChannelTable::new([
            channel(1, &["gpt-4o"], 0),
            channel(2, &["gpt-4o"], 10),
            channel(3, &["gpt-4o"], 5),
        ]);
        for _ in 0..4 {
            assert_eq!(table.select("gpt-4o", "default").unwrap().id, 2);
        }
    }

    #[test]
    fn test_select_rotates_within_priority() {
        let table = ChannelTable::new([channel(1, &["gpt-4o"], 1), channel(2, &["gpt-4o"], 1)]);
        let first = table.select("gpt-4o", "default").unwrap().id;
        let second = table.select("gpt-4o", "default").unwrap().id;
        assert_ne!(first, second);
    }

    #[test]
    fn test_select_respects_group() {
        let mut vip = channel(1, &["gpt-4o"], 0);
        vip.groups = vec!["vip".into()];
        let table = ChannelTable::new([vip]);

        assert_eq!(table.select("gpt-4o", "vip").unwrap().id, 1);
        assert_eq!(
            table.select("gpt-4o", "default").unwrap_err(),
            RoutingError::NoChannel {
                model: "gpt-4o".into(),
                group: "default".into()
            }
        );
    }

    #[test]
    fn test_unknown_model() {
        let table = ChannelTable::new([channel(1, &["gpt-4o"], 0)]);
        assert!(matches!(
            table.select("claude-3", "default"),
            Err(RoutingError::NoChannel { .. })
        ));
    }
}
