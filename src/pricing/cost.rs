//! Quota arithmetic. All intermediate values are `Decimal`; only the final
//! amount is rounded up to whole quota units.

use std::fmt;

use rust_decimal::{Decimal, prelude::ToPrimitive};

use super::PriceQuote;
use crate::api_types::{FILE_SEARCH, ToolUsage, Usage, WEB_SEARCH_PREVIEW};

const THOUSAND: Decimal = Decimal::from_parts(1000, 0, 0, false, 0);
const MILLION: Decimal = Decimal::from_parts(1_000_000, 0, 0, false, 0);

/// One priced tool line on a settled call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCharge {
    pub tool: &'static str,
    pub calls: u32,
    pub price_per_thousand: Decimal,
    /// Already scaled by group ratio and quota per unit.
    pub cost: Decimal,
}

/// The settled amount for a call and how it was reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaBreakdown {
    pub quota: i64,
    pub token_cost: Decimal,
    pub audio_input_cost: Decimal,
    pub tool_charges: Vec<ToolCharge>,
    pub fixed_price: bool,
}

impl fmt::Display for QuotaBreakdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.fixed_price {
            write!(f, "fixed price")?;
        } else {
            write!(f, "tokens {}", self.token_cost.round_dp(4))?;
        }
        if !self.audio_input_cost.is_zero() {
            write!(f, ", audio input {}", self.audio_input_cost.round_dp(4))?;
        }
        for charge in &self.tool_charges {
            write!(
                f,
                ", {} x{} @ {}/1k = {}",
                charge.tool,
                charge.calls,
                charge.price_per_thousand,
                charge.cost.round_dp(4)
            )?;
        }
        write!(f, " => {}", self.quota)
    }
}

/// Quota to hold before dispatch.
///
/// Prompts shorter than `floor_tokens` are held as if they were
/// `floor_tokens` long so that tiny prompts with large outputs still reserve
/// something meaningful.
pub fn estimate_quota(
    quote: &PriceQuote,
    prompt_tokens: i64,
    max_tokens: i64,
    floor_tokens: i64,
) -> i64 {
    if quote.use_fixed_price {
        return ceil_quota(quote.group_ratio * quote.fixed_price * quote.quota_per_unit);
    }

    let prompt = Decimal::from(prompt_tokens.max(floor_tokens));
    let completion = Decimal::from(max_tokens.max(0));
    let cost = (prompt * quote.model_ratio + completion * quote.completion_ratio)
        * quote.group_ratio
        * quote.quota_per_unit;
    ceil_quota(cost)
}

/// Authoritative cost of a finished call.
///
/// Cached, image and (for Gemini models) audio prompt tokens are carved out
/// of the prompt and priced at their own ratios. Tool charges are added after
/// the token cost has been scaled, since each is already in quota units.
pub fn compute_quota(
    quote: &PriceQuote,
    usage: &Usage,
    tools: &ToolUsage,
    origin_model: &str,
    claude_web_search_calls: u32,
) -> QuotaBreakdown {
    if quote.use_fixed_price {
        return QuotaBreakdown {
            quota: ceil_quota(quote.group_ratio * quote.fixed_price * quote.quota_per_unit),
            token_cost: Decimal::ZERO,
            audio_input_cost: Decimal::ZERO,
            tool_charges: Vec::new(),
            fixed_price: true,
        };
    }

    let scale = quote.group_ratio * quote.quota_per_unit;
    let details = &usage.prompt_tokens_details;

    let mut base = usage.prompt_tokens;
    let mut weighted = Decimal::ZERO;

    if details.cached_tokens > 0 {
        base -= details.cached_tokens;
        weighted += Decimal::from(details.cached_tokens) * quote.cache_ratio;
    }
    if details.image_tokens > 0 {
        base -= details.image_tokens;
        weighted += Decimal::from(details.image_tokens) * quote.image_ratio;
    }

    let mut audio_input_cost = Decimal::ZERO;
    if details.audio_tokens > 0 {
        if origin_model.starts_with("gemini") {
            base -= details.audio_tokens;
            weighted += Decimal::from(details.audio_tokens) * quote.model_ratio;
        } else if let Some(price) = quote.audio_input_price_per_million {
            audio_input_cost = price / MILLION * Decimal::from(details.audio_tokens) * scale;
        }
    }

    let token_cost = (Decimal::from(base.max(0)) * quote.model_ratio
        + Decimal::from(usage.completion_tokens.max(0)) * quote.completion_ratio
        + weighted)
        * scale;

    let mut tool_charges = Vec::new();
    let mut charge = |tool: &'static str, calls: u32, price_per_thousand: Decimal| {
        if calls > 0 {
            tool_charges.push(ToolCharge {
                tool,
                calls,
                price_per_thousand,
                cost: Decimal::from(calls) * price_per_thousand / THOUSAND * scale,
            });
        }
    };

    match quote.web_search_price_per_thousand {
        Some(price) => charge(WEB_SEARCH_PREVIEW, 1, price),
        None => charge(
            WEB_SEARCH_PREVIEW,
            tools.count(WEB_SEARCH_PREVIEW),
            quote.default_web_search_price_per_thousand,
        ),
    }
    charge(
        "claude_web_search",
        claude_web_search_calls,
        quote.claude_web_search_price_per_thousand,
    );
    charge(
        FILE_SEARCH,
        tools.count(FILE_SEARCH),
        quote.file_search_price_per_thousand,
    );

    let tool_cost: Decimal = tool_charges.iter().map(|c| c.cost).sum();

    QuotaBreakdown {
        quota: ceil_quota(token_cost + tool_cost + audio_input_cost),
        token_cost,
        audio_input_cost,
        tool_charges,
        fixed_price: false,
    }
}

fn ceil_quota(amount: Decimal) -> i64 {
    amount.ceil().to_i64().unwrap_or(i64::MAX).max(0)
}
