//! Pricing configuration and per-call price quotes.
//!
//! Ratios are expressed in currency units per token; `quota_per_unit`
//! converts a currency amount into integer quota units. A model with a fixed
//! `model_price` is billed per call regardless of token counts.

mod cost;

use std::{collections::HashMap, sync::Arc};

pub use cost::{QuotaBreakdown, ToolCharge, compute_quota, estimate_quota};
use parking_lot::RwLock;
use rust_decimal::{Decimal, prelude::FromPrimitive};
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// Default quota units per currency unit.
pub const DEFAULT_QUOTA_PER_UNIT: f64 = 500_000.0;

/// Search context sizes accepted in `web_search_options.search_context_size`.
pub const SEARCH_CONTEXT_SIZES: [&str; 3] = ["low", "medium", "high"];

/// Pricing tables loaded from the `[pricing]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PricingConfig {
    #[serde(default = "default_quota_per_unit")]
    pub quota_per_unit: f64,

    /// Prompt token price by model.
    #[serde(default)]
    pub model_ratio: HashMap<String, f64>,

    /// Completion token price by model. Defaults to the model ratio.
    #[serde(default)]
    pub completion_ratio: HashMap<String, f64>,

    /// Cached prompt token price by model. Defaults to the model ratio.
    #[serde(default)]
    pub cache_ratio: HashMap<String, f64>,

    /// Image prompt token price by model. Defaults to the model ratio.
    #[serde(default)]
    pub image_ratio: HashMap<String, f64>,

    /// Fixed per-call price by model. Takes precedence over ratios.
    #[serde(default)]
    pub model_price: HashMap<String, f64>,

    /// Multiplier by user group. Missing groups use 1.0.
    #[serde(default)]
    pub group_ratio: HashMap<String, f64>,

    #[serde(default)]
    pub web_search_price_per_thousand: WebSearchPrices,

    #[serde(default = "default_file_search_price")]
    pub file_search_price_per_thousand: f64,

    #[serde(default = "default_claude_web_search_price")]
    pub claude_web_search_price_per_thousand: f64,

    /// Separately priced audio input, per million tokens, by model.
    #[serde(default)]
    pub audio_input_price_per_million: HashMap<String, f64>,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            quota_per_unit: default_quota_per_unit(),
            model_ratio: HashMap::new(),
            completion_ratio: HashMap::new(),
            cache_ratio: HashMap::new(),
            image_ratio: HashMap::new(),
            model_price: HashMap::new(),
            group_ratio: HashMap::new(),
            web_search_price_per_thousand: WebSearchPrices::default(),
            file_search_price_per_thousand: default_file_search_price(),
            claude_web_search_price_per_thousand: default_claude_web_search_price(),
            audio_input_price_per_million: HashMap::new(),
        }
    }
}

/// Web search price per thousand calls, by search context size.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebSearchPrices {
    #[serde(default = "default_web_search_low")]
    pub low: f64,
    #[serde(default = "default_web_search_medium")]
    pub medium: f64,
    #[serde(default = "default_web_search_high")]
    pub high: f64,
}

impl Default for WebSearchPrices {
    fn default() -> Self {
        Self {
            low: default_web_search_low(),
            medium: default_web_search_medium(),
            high: default_web_search_high(),
        }
    }
}

impl WebSearchPrices {
    fn for_context_size(&self, size: &str) -> f64 {
        match size {
            "low" => self.low,
            "high" => self.high,
            _ => self.medium,
        }
    }
}

/// Error resolving a quote for a model.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum PricingError {
    #[error("model {0} has no configured ratio or price")]
    ModelNotPriced(String),

    #[error("pricing value for {0} is not representable")]
    InvalidValue(String),
}

impl PricingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.quota_per_unit.is_finite() && self.quota_per_unit > 0.0) {
            return Err(ConfigError::Validation(
                "pricing.quota_per_unit must be positive".into(),
            ));
        }
        let tables = [
            ("model_ratio", &self.model_ratio),
            ("completion_ratio", &self.completion_ratio),
            ("cache_ratio", &self.cache_ratio),
            ("image_ratio", &self.image_ratio),
            ("model_price", &self.model_price),
            ("group_ratio", &self.group_ratio),
            ("audio_input_price_per_million", &self.audio_input_price_per_million),
        ];
        for (table, values) in tables {
            if let Some((key, value)) = values.iter().find(|(_, v)| !(v.is_finite() && **v >= 0.0))
            {
                return Err(ConfigError::Validation(format!(
                    "pricing.{table}.{key} must be a non-negative number, got {value}"
                )));
            }
        }
        Ok(())
    }

    /// Resolve the immutable price quote for one call.
    ///
    /// `search_context_size` is only set for chat calls that carried
    /// `web_search_options`; it enables per-call web search pricing for
    /// `*search-preview` models.
    pub fn quote(
        &self,
        model: &str,
        group: &str,
        search_context_size: Option<&str>,
    ) -> Result<PriceQuote, PricingError> {
        let dec = |name: &str, v: f64| {
            Decimal::from_f64(v).ok_or_else(|| PricingError::InvalidValue(name.to_string()))
        };

        let group_ratio = dec("group_ratio", self.group_ratio.get(group).copied().unwrap_or(1.0))?;
        let quota_per_unit = dec("quota_per_unit", self.quota_per_unit)?;

        let fixed_price = self.model_price.get(model).copied();
        let model_ratio = match (self.model_ratio.get(model), fixed_price) {
            (Some(r), _) => *r,
            (None, Some(_)) => 0.0,
            (None, None) => return Err(PricingError::ModelNotPriced(model.to_string())),
        };
        let ratio_or_model = |table: &HashMap<String, f64>| {
            table.get(model).copied().unwrap_or(model_ratio)
        };

        let web_search_price_per_thousand = match search_context_size {
            Some(size) if model.ends_with("search-preview") => Some(dec(
                "web_search_price_per_thousand",
                self.web_search_price_per_thousand.for_context_size(size),
            )?),
            _ => None,
        };

        Ok(PriceQuote {
            model_ratio: dec("model_ratio", model_ratio)?,
            completion_ratio: dec("completion_ratio", ratio_or_model(&self.completion_ratio))?,
            cache_ratio: dec("cache_ratio", ratio_or_model(&self.cache_ratio))?,
            image_ratio: dec("image_ratio", ratio_or_model(&self.image_ratio))?,
            group_ratio,
            use_fixed_price: fixed_price.is_some(),
            fixed_price: dec("model_price", fixed_price.unwrap_or(0.0))?,
            quota_per_unit,
            web_search_price_per_thousand,
            default_web_search_price_per_thousand: dec(
                "web_search_price_per_thousand",
                self.web_search_price_per_thousand.medium,
            )?,
            file_search_price_per_thousand: dec(
                "file_search_price_per_thousand",
                self.file_search_price_per_thousand,
            )?,
            claude_web_search_price_per_thousand: dec(
                "claude_web_search_price_per_thousand",
                self.claude_web_search_price_per_thousand,
            )?,
            audio_input_price_per_million: self
                .audio_input_price_per_million
                .get(model)
                .map(|p| dec("audio_input_price_per_million", *p))
                .transpose()?,
        })
    }
}

/// Everything needed to price one call. Computed once and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceQuote {
    pub model_ratio: Decimal,
    pub completion_ratio: Decimal,
    pub group_ratio: Decimal,
    pub cache_ratio: Decimal,
    pub image_ratio: Decimal,
    pub use_fixed_price: bool,
    pub fixed_price: Decimal,
    pub quota_per_unit: Decimal,
    /// Present when the call itself is a priced web search
    /// (`*search-preview` model with a search context size).
    pub web_search_price_per_thousand: Option<Decimal>,
    /// Price for web search tool calls reported by a Responses stream.
    pub default_web_search_price_per_thousand: Decimal,
    pub file_search_price_per_thousand: Decimal,
    pub claude_web_search_price_per_thousand: Decimal,
    pub audio_input_price_per_million: Option<Decimal>,
}

/// Hot-reloadable pricing. Readers take a cheap `Arc` snapshot so a call
/// prices against one consistent table even if it is replaced mid-flight.
#[derive(Debug)]
pub struct PricingStore {
    current: RwLock<Arc<PricingConfig>>,
}

impl PricingStore {
    pub fn new(config: PricingConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
        }
    }

    pub fn snapshot(&self) -> Arc<PricingConfig> {
        Arc::clone(&self.current.read())
    }

    /// Swap in a new pricing table after validating it.
    pub fn replace(&self, config: PricingConfig) -> Result<(), ConfigError> {
        config.validate()?;
        *self.current.write() = Arc::new(config);
        tracing::info!("Pricing configuration reloaded");
        Ok(())
    }
}

fn default_quota_per_unit() -> f64 {
    DEFAULT_QUOTA_PER_UNIT
}

fn default_file_search_price() -> f64 {
    2.5
}

fn default_claude_web_search_price() -> f64 {
    10.0
}

fn default_web_search_low() -> f64 {
    30.0
}

fn default_web_search_medium() -> f64 {
    35.0
}

fn default_web_search_high() -> f64 {
    50.0
}

#[cfg(test)]
mod tests {
    use rust_decimal::dec;

    use super::*;

    fn config() -> PricingConfig {
        PricingConfig {
            quota_per_unit: 1000.0,
            model_ratio: HashMap::from([
                ("gpt-4o".into(), 0.5),
                ("gpt-4o-search-preview".into(), 0.5),
            ]),
            completion_ratio: HashMap::from([("gpt-4o".into(), 2.0)]),
            model_price: HashMap::from([("dall-e-3".into(), 0.25)]),
            group_ratio: HashMap::from([("vip".into(), 0.75)]),
            ..Default::default()
        }
    }

    #[test]
    fn test_quote_defaults_secondary_ratios_to_model_ratio() {
        let quote = config().quote("gpt-4o", "default", None).unwrap();
        assert_eq!(quote.model_ratio, dec!(0.5));
        assert_eq!(quote.completion_ratio, dec!(2));
        assert_eq!(quote.cache_ratio, dec!(0.5));
        assert_eq!(quote.image_ratio, dec!(0.5));
        assert_eq!(quote.group_ratio, dec!(1));
        assert!(!quote.use_fixed_price);
        assert!(quote.web_search_price_per_thousand.is_none());
    }

    #[test]
    fn test_quote_group_ratio() {
        let quote = config().quote("gpt-4o", "vip", None).unwrap();
        assert_eq!(quote.group_ratio, dec!(0.75));
    }

    #[test]
    fn test_quote_fixed_price() {
        let quote = config().quote("dall-e-3", "default", None).unwrap();
        assert!(quote.use_fixed_price);
        assert_eq!(quote.fixed_price, dec!(0.25));
    }

    #[test]
    fn test_quote_unpriced_model() {
        let err = config().quote("mystery", "default", None).unwrap_err();
        assert_eq!(err, PricingError::ModelNotPriced("mystery".into()));
    }

    #[test]
    fn test_quote_web_search_only_for_search_preview_models() {
        let cfg = config();
        let quote = cfg.quote("gpt-4o-search-preview", "default", Some("high")).unwrap();
        assert_eq!(quote.web_search_price_per_thousand, Some(dec!(50)));

        let quote = cfg.quote("gpt-4o", "default", Some("high")).unwrap();
        assert!(quote.web_search_price_per_thousand.is_none());
    }

    #[test]
    fn test_validate_rejects_negative_ratio() {
        let mut cfg = config();
        cfg.model_ratio.insert("bad".into(), -1.0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_store_replace_is_visible_to_new_snapshots() {
        let store = PricingStore::new(config());
        let before = store.snapshot();

        let mut updated = config();
        updated.model_ratio.insert("gpt-4o".into(), 1.0);
        store.replace(updated).unwrap();

        assert_eq!(before.model_ratio["gpt-4o"], 0.5);
        assert_eq!(store.snapshot().model_ratio["gpt-4o"], 1.0);
    }
}
