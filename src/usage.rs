//! Token-usage extraction from decoded response bodies.

use serde_json::Value;

use crate::routing::RoutingMetadata;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Clone, Debug)]
pub struct ExtractedUsage {
    pub tokens: TokenUsage,
    pub model: String,
    /// True when the counts came from a provider-reported usage object
    /// rather than caller-supplied fallbacks.
    pub reported: bool,
}

/// Resolves token counts and the model identifier for one exchange.
///
/// A provider-reported usage object is authoritative; only when the body
/// carries none do the caller-supplied fallback counts apply. Missing
/// values default to zero on both paths.
pub fn extract(body: &Value, meta: &RoutingMetadata) -> ExtractedUsage {
    let model = body
        .get("model")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| meta.model_hint.clone())
        .unwrap_or_else(|| "unknown".to_string());

    match reported_usage(body) {
        Some(tokens) => ExtractedUsage {
            tokens,
            model,
            reported: true,
        },
        None => ExtractedUsage {
            tokens: TokenUsage {
                input_tokens: meta.fallback_input_tokens.unwrap_or(0),
                output_tokens: meta.fallback_output_tokens.unwrap_or(0),
            },
            model,
            reported: false,
        },
    }
}

/// Reads the provider usage object, accepting both OpenAI-style
/// (`prompt_tokens`/`completion_tokens`) and Anthropic-style
/// (`input_tokens`/`output_tokens`) field names.
fn reported_usage(body: &Value) -> Option<TokenUsage> {
    let usage = body.get("usage")?.as_object()?;
    let input_tokens = usage
        .get("input_tokens")
        .or_else(|| usage.get("prompt_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let output_tokens = usage
        .get("output_tokens")
        .or_else(|| usage.get("completion_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    Some(TokenUsage {
        input_tokens,
        output_tokens,
    })
}
