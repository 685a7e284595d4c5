//! Per-request routing metadata, built from caller-supplied headers at
//! ingress and dropped once the exchange is accounted. Callers are trusted
//! as-is; validation here is about shape, not identity.

use axum::http::HeaderMap;
use thiserror::Error;

pub const TARGET_HEADER: &str = "x-target-url";
pub const SERVICE_HEADER: &str = "x-service-name";
pub const USER_HEADER: &str = "x-user-id";
pub const MODEL_HINT_HEADER: &str = "x-model-hint";
pub const PRICING_TIER_HEADER: &str = "x-pricing-tier";
pub const FALLBACK_INPUT_HEADER: &str = "x-fallback-input-tokens";
pub const FALLBACK_OUTPUT_HEADER: &str = "x-fallback-output-tokens";

/// Every routing header, in one place so the forwarder can strip them all
/// before the request leaves the proxy.
pub const ROUTING_HEADERS: [&str; 7] = [
    TARGET_HEADER,
    SERVICE_HEADER,
    USER_HEADER,
    MODEL_HINT_HEADER,
    PRICING_TIER_HEADER,
    FALLBACK_INPUT_HEADER,
    FALLBACK_OUTPUT_HEADER,
];

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("no target: {TARGET_HEADER} header missing and no default target configured")]
    MissingTarget,
    #[error("missing required header: {header}")]
    MissingHeader { header: &'static str },
    #[error("invalid value for header {header}")]
    InvalidHeader { header: &'static str },
}

#[derive(Clone, Debug)]
pub struct RoutingMetadata {
    pub target_url: String,
    pub service_name: String,
    pub user_id: String,
    pub model_hint: Option<String>,
    pub pricing_tier: Option<String>,
    pub fallback_input_tokens: Option<u64>,
    pub fallback_output_tokens: Option<u64>,
}

impl RoutingMetadata {
    /// Fails fast when required routing information is absent instead of
    /// letting empty identities propagate into usage records.
    pub fn from_headers(
        headers: &HeaderMap,
        default_target: Option<&str>,
    ) -> Result<Self, RoutingError> {
        let target_url = match header_str(headers, TARGET_HEADER)? {
            Some(value) => value.to_string(),
            None => default_target
                .map(str::to_string)
                .ok_or(RoutingError::MissingTarget)?,
        };
        let service_name = required(headers, SERVICE_HEADER)?;
        let user_id = required(headers, USER_HEADER)?;

        Ok(Self {
            target_url,
            service_name,
            user_id,
            model_hint: header_str(headers, MODEL_HINT_HEADER)?.map(str::to_string),
            pricing_tier: header_str(headers, PRICING_TIER_HEADER)?.map(str::to_string),
            fallback_input_tokens: header_u64(headers, FALLBACK_INPUT_HEADER)?,
            fallback_output_tokens: header_u64(headers, FALLBACK_OUTPUT_HEADER)?,
        })
    }
}

fn required(headers: &HeaderMap, name: &'static str) -> Result<String, RoutingError> {
    header_str(headers, name)?
        .map(str::to_string)
        .ok_or(RoutingError::MissingHeader { header: name })
}

fn header_str<'a>(
    headers: &'a HeaderMap,
    name: &'static str,
) -> Result<Option<&'a str>, RoutingError> {
    let Some(value) = headers.get(name) else {
        return Ok(None);
    };
    let value = value
        .to_str()
        .map_err(|_| RoutingError::InvalidHeader { header: name })?
        .trim();
    if value.is_empty() {
        return Err(RoutingError::InvalidHeader { header: name });
    }
    Ok(Some(value))
}

fn header_u64(headers: &HeaderMap, name: &'static str) -> Result<Option<u64>, RoutingError> {
    header_str(headers, name)?
        .map(|raw| {
            raw.parse::<u64>()
                .map_err(|_| RoutingError::InvalidHeader { header: name })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut out = HeaderMap::new();
        for (name, value) in pairs {
            out.insert(*name, HeaderValue::from_str(value).expect("header value"));
        }
        out
    }

    #[test]
    fn builds_from_full_header_set() {
        let headers = headers(&[
            (TARGET_HEADER, "http://upstream.local:9000"),
            (SERVICE_HEADER, "chat-app"),
            (USER_HEADER, "user-7"),
            (MODEL_HINT_HEADER, "gpt-4o-mini"),
            (PRICING_TIER_HEADER, "batch"),
            (FALLBACK_INPUT_HEADER, "200"),
            (FALLBACK_OUTPUT_HEADER, "80"),
        ]);

        let meta = RoutingMetadata::from_headers(&headers, None).expect("metadata");
        assert_eq!(meta.target_url, "http://upstream.local:9000");
        assert_eq!(meta.service_name, "chat-app");
        assert_eq!(meta.user_id, "user-7");
        assert_eq!(meta.model_hint.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(meta.pricing_tier.as_deref(), Some("batch"));
        assert_eq!(meta.fallback_input_tokens, Some(200));
        assert_eq!(meta.fallback_output_tokens, Some(80));
    }

    #[test]
    fn default_target_fills_missing_header() {
        let headers = headers(&[(SERVICE_HEADER, "svc"), (USER_HEADER, "u1")]);
        let meta = RoutingMetadata::from_headers(&headers, Some("http://fallback.local"))
            .expect("metadata");
        assert_eq!(meta.target_url, "http://fallback.local");
    }

    #[test]
    fn missing_target_without_default_is_an_error() {
        let headers = headers(&[(SERVICE_HEADER, "svc"), (USER_HEADER, "u1")]);
        let err = RoutingMetadata::from_headers(&headers, None).unwrap_err();
        assert!(matches!(err, RoutingError::MissingTarget));
    }

    #[test]
    fn missing_identity_headers_are_errors() {
        let headers = headers(&[(TARGET_HEADER, "http://t")]);
        let err = RoutingMetadata::from_headers(&headers, None).unwrap_err();
        assert!(matches!(
            err,
            RoutingError::MissingHeader {
                header: SERVICE_HEADER
            }
        ));
    }

    #[test]
    fn malformed_token_count_is_rejected() {
        let headers = headers(&[
            (TARGET_HEADER, "http://t"),
            (SERVICE_HEADER, "svc"),
            (USER_HEADER, "u1"),
            (FALLBACK_INPUT_HEADER, "not-a-number"),
        ]);
        let err = RoutingMetadata::from_headers(&headers, None).unwrap_err();
        assert!(matches!(
            err,
            RoutingError::InvalidHeader {
                header: FALLBACK_INPUT_HEADER
            }
        ));
    }
}
