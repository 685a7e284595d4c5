//! Pricing rates and cost computation.
//!
//! Rates are stored per million tokens and converted to per-token values
//! once, at load time. Lookup keys are `tier:category:model`, lower-cased;
//! resolution retries with the model's `-latest` and trailing ISO-date
//! suffixes stripped before giving up.

use serde::{Deserialize, Serialize};

use crate::store_types::PricingRateRow;
use crate::usage::TokenUsage;

pub const DEFAULT_TIER: &str = "standard";
pub const DEFAULT_CATEGORY: &str = "text";

const TOKENS_PER_MILLION: f64 = 1_000_000.0;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PricingRate {
    pub model: String,
    pub tier: String,
    pub category: String,
    pub input_rate_per_token: f64,
    pub output_rate_per_token: f64,
    /// Loaded for completeness; the cost formula does not price cached
    /// input tokens separately.
    pub cached_input_rate_per_token: f64,
}

impl From<PricingRateRow> for PricingRate {
    fn from(row: PricingRateRow) -> Self {
        Self {
            model: row.model,
            tier: row.tier,
            category: row.category,
            input_rate_per_token: (row.input_per_million / TOKENS_PER_MILLION).max(0.0),
            output_rate_per_token: (row.output_per_million / TOKENS_PER_MILLION).max(0.0),
            cached_input_rate_per_token: (row.cached_input_per_million / TOKENS_PER_MILLION)
                .max(0.0),
        }
    }
}

impl PricingRate {
    pub fn key(&self) -> String {
        rate_key(&self.model, &self.tier, &self.category)
    }
}

pub fn rate_key(model: &str, tier: &str, category: &str) -> String {
    format!(
        "{}:{}:{}",
        tier.to_ascii_lowercase(),
        category.to_ascii_lowercase(),
        model.to_ascii_lowercase()
    )
}

/// Lookup keys in resolution order: the exact model, then the model with a
/// trailing `-latest` stripped, then with a trailing `-YYYY-MM-DD` date
/// suffix stripped. Tier and category stay fixed across variants.
pub fn candidate_keys(model: &str, tier: &str, category: &str) -> Vec<String> {
    let mut keys = vec![rate_key(model, tier, category)];
    if let Some(base) = strip_latest_suffix(model) {
        keys.push(rate_key(base, tier, category));
    }
    if let Some(base) = strip_date_suffix(model) {
        keys.push(rate_key(base, tier, category));
    }
    keys
}

fn strip_latest_suffix(model: &str) -> Option<&str> {
    model
        .strip_suffix("-latest")
        .filter(|base| !base.is_empty())
}

fn strip_date_suffix(model: &str) -> Option<&str> {
    // "-YYYY-MM-DD" is 11 bytes.
    if model.len() < 12 {
        return None;
    }
    let (base, tail) = model.split_at(model.len() - 11);
    let tail = tail.as_bytes();
    let dashes_ok = tail[0] == b'-' && tail[5] == b'-' && tail[8] == b'-';
    let digits_ok = [1usize, 2, 3, 4, 6, 7, 9, 10]
        .iter()
        .all(|idx| tail[*idx].is_ascii_digit());
    (dashes_ok && digits_ok).then_some(base)
}

/// `cost = input × input_rate + output × output_rate`, rates per single
/// token. No resolved rate means zero cost; the resolver reports the miss.
pub fn estimate_cost(tokens: TokenUsage, rate: Option<&PricingRate>) -> f64 {
    let Some(rate) = rate else {
        return 0.0;
    };
    tokens.input_tokens as f64 * rate.input_rate_per_token
        + tokens.output_tokens as f64 * rate.output_rate_per_token
}
