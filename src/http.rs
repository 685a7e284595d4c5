//! HTTP surface: the read endpoints, the health probe, and the proxy
//! fallback route that catches everything else.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::aggregate::{self, DailyUsage, ServiceBreakdown};
use crate::pricing::PricingCache;
use crate::proxy::{UpstreamClient, handle_proxy};
use crate::store::UsageStore;

#[derive(Clone)]
pub struct AppState {
    store: Arc<dyn UsageStore>,
    pricing: Arc<PricingCache>,
    upstream: UpstreamClient,
    default_target: Option<String>,
    max_body_bytes: usize,
    usage_max_body_bytes: usize,
}

impl AppState {
    pub fn new(
        store: Arc<dyn UsageStore>,
        pricing: Arc<PricingCache>,
        upstream: UpstreamClient,
    ) -> Self {
        Self {
            store,
            pricing,
            upstream,
            default_target: None,
            max_body_bytes: 64 * 1024 * 1024,
            usage_max_body_bytes: 1024 * 1024,
        }
    }

    pub fn with_default_target(mut self, target: impl Into<String>) -> Self {
        self.default_target = Some(target.into());
        self
    }

    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes.max(1);
        self
    }

    pub fn with_usage_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.usage_max_body_bytes = max_body_bytes;
        self
    }

    pub(crate) fn store(&self) -> &Arc<dyn UsageStore> {
        &self.store
    }

    pub(crate) fn pricing(&self) -> &Arc<PricingCache> {
        &self.pricing
    }

    pub(crate) fn upstream(&self) -> &UpstreamClient {
        &self.upstream
    }

    pub(crate) fn default_target(&self) -> Option<&str> {
        self.default_target.as_deref()
    }

    pub(crate) fn max_body_bytes(&self) -> usize {
        self.max_body_bytes
    }

    pub(crate) fn usage_max_body_bytes(&self) -> usize {
        self.usage_max_body_bytes
    }
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

pub(crate) fn error_response(status: StatusCode, code: &'static str, message: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: ErrorDetail {
                code,
                message: message.to_string(),
            },
        }),
    )
        .into_response()
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Deserialize)]
struct BreakdownQuery {
    limit: Option<usize>,
    offset: Option<usize>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/usage", get(daily_usage_report))
        .route("/services", get(service_breakdown_report))
        .fallback(handle_proxy)
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn daily_usage_report(
    State(state): State<AppState>,
) -> Result<Json<Vec<DailyUsage>>, Response> {
    let records = state.store.list_usage().await.map_err(|err| {
        tracing::error!("usage report query failed: {err}");
        error_response(StatusCode::INTERNAL_SERVER_ERROR, "store_error", &err.to_string())
    })?;
    Ok(Json(aggregate::daily_usage(&records)))
}

async fn service_breakdown_report(
    State(state): State<AppState>,
    Query(query): Query<BreakdownQuery>,
) -> Result<Json<Vec<ServiceBreakdown>>, Response> {
    let records = state.store.list_usage().await.map_err(|err| {
        tracing::error!("service report query failed: {err}");
        error_response(StatusCode::INTERNAL_SERVER_ERROR, "store_error", &err.to_string())
    })?;
    let limit = query.limit.unwrap_or(aggregate::DEFAULT_BREAKDOWN_LIMIT);
    let offset = query.offset.unwrap_or(0);
    Ok(Json(aggregate::service_breakdown(&records, limit, offset)))
}
