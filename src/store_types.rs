use serde::{Deserialize, Serialize};

/// One append-only record per completed proxied exchange. Never mutated
/// or deleted after write.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub user_id: String,
    pub service_name: String,
    pub endpoint: String,
    pub status_code: u16,
    pub latency_ms: u64,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub estimated_cost: f64,
    pub created_at_ms: u64,
}

/// Row shape of the read-mostly pricing collection. Rates are per million
/// tokens; conversion to per-token happens when rates are loaded into the
/// cache.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PricingRateRow {
    pub model: String,
    #[serde(default = "default_tier")]
    pub tier: String,
    #[serde(default = "default_category")]
    pub category: String,
    pub input_per_million: f64,
    pub output_per_million: f64,
    #[serde(default)]
    pub cached_input_per_million: f64,
}

fn default_tier() -> String {
    crate::costing::DEFAULT_TIER.to_string()
}

fn default_category() -> String {
    crate::costing::DEFAULT_CATEGORY.to_string()
}
