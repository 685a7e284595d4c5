//! Proxy forwarding path and the accounting pipeline hanging off it.
//!
//! The contract ordering matters: delivering the upstream response always
//! outranks recording usage. Accounting runs on a spawned task once the
//! response is on its way back to the caller, and every failure inside it
//! is logged, never surfaced.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use axum::body::{Body, to_bytes};
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri, header};
use axum::response::Response;
use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt, stream};
use thiserror::Error;

use crate::costing;
use crate::decode;
use crate::http::{AppState, error_response};
use crate::routing::{ROUTING_HEADERS, RoutingError, RoutingMetadata};
use crate::store_types::UsageRecord;
use crate::usage;

static REQUEST_ID_SEQ: AtomicU64 = AtomicU64::new(0);

const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Routing(#[from] RoutingError),
    #[error("request body too large")]
    RequestTooLarge,
    #[error("upstream request failed: {0}")]
    Upstream(reqwest::Error),
    #[error("upstream body read failed: {0}")]
    UpstreamBody(reqwest::Error),
}

impl ProxyError {
    fn status(&self) -> StatusCode {
        match self {
            ProxyError::Routing(_) => StatusCode::BAD_GATEWAY,
            ProxyError::RequestTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::Upstream(_) | ProxyError::UpstreamBody(_) => StatusCode::BAD_GATEWAY,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ProxyError::Routing(_) => "routing_error",
            ProxyError::RequestTooLarge => "request_too_large",
            ProxyError::Upstream(_) | ProxyError::UpstreamBody(_) => "upstream_error",
        }
    }
}

/// Thin reqwest wrapper for the outbound leg. The target origin comes
/// from each request's routing metadata rather than a fixed base url.
#[derive(Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
}

impl UpstreamClient {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    pub async fn forward(
        &self,
        method: Method,
        url: String,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let mut request = self.client.request(method, url).headers(headers);
        if !body.is_empty() {
            request = request.body(body);
        }
        request.send().await
    }
}

pub(crate) async fn handle_proxy(State(state): State<AppState>, req: axum::http::Request<Body>) -> Response {
    match proxy_exchange(&state, req).await {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!("proxy exchange failed: {err}");
            error_response(err.status(), err.code(), &err.to_string())
        }
    }
}

async fn proxy_exchange(
    state: &AppState,
    req: axum::http::Request<Body>,
) -> Result<Response, ProxyError> {
    let (parts, incoming_body) = req.into_parts();
    let meta = RoutingMetadata::from_headers(&parts.headers, state.default_target())?;

    let request_id = header_value(&parts.headers, "x-request-id")
        .map(str::to_string)
        .unwrap_or_else(generate_request_id);
    let endpoint = parts.uri.path().to_string();
    let url = join_target_url(&meta.target_url, &parts.uri);

    let body = to_bytes(incoming_body, state.max_body_bytes())
        .await
        .map_err(|_| ProxyError::RequestTooLarge)?;

    let mut outgoing_headers = parts.headers.clone();
    sanitize_forward_headers(&mut outgoing_headers);
    insert_request_id(&mut outgoing_headers, &request_id);

    tracing::debug!(
        request_id = %request_id,
        method = %parts.method,
        url = %url,
        service = %meta.service_name,
        "forwarding request"
    );

    let started = Instant::now();
    let upstream = state
        .upstream()
        .forward(parts.method.clone(), url, outgoing_headers, body)
        .await
        .map_err(ProxyError::Upstream)?;

    let status = upstream.status();
    let upstream_headers = upstream.headers().clone();

    match capture_body(upstream, state.max_body_bytes()).await? {
        CapturedBody::Complete(bytes) => {
            let latency_ms = started.elapsed().as_millis() as u64;
            spawn_accounting(
                state.clone(),
                meta,
                endpoint,
                status.as_u16(),
                latency_ms,
                &upstream_headers,
                bytes.clone(),
            );
            Ok(build_response(status, &upstream_headers, Body::from(bytes)))
        }
        CapturedBody::Overflow { prefix, rest } => {
            // Past the buffer cap there is no complete body to account;
            // release what was buffered and stream the remainder through.
            tracing::debug!(
                request_id = %request_id,
                "response exceeded buffer cap; skipping accounting"
            );
            let body = Body::from_stream(
                stream::once(async move { Ok::<Bytes, std::io::Error>(prefix) }).chain(rest),
            );
            Ok(build_response(status, &upstream_headers, body))
        }
    }
}

enum CapturedBody {
    Complete(Bytes),
    Overflow {
        prefix: Bytes,
        rest: stream::BoxStream<'static, Result<Bytes, std::io::Error>>,
    },
}

/// Buffers the upstream body up to `cap` bytes. Accounting needs the
/// complete decoded body, so the buffered-vs-overflow distinction decides
/// whether this exchange is accounted at all.
async fn capture_body(
    response: reqwest::Response,
    cap: usize,
) -> Result<CapturedBody, ProxyError> {
    let mut body_stream = response.bytes_stream();
    let mut buffered: Vec<u8> = Vec::new();

    while let Some(chunk) = body_stream.next().await {
        let chunk = chunk.map_err(ProxyError::UpstreamBody)?;
        buffered.extend_from_slice(&chunk);
        if buffered.len() > cap {
            return Ok(CapturedBody::Overflow {
                prefix: Bytes::from(buffered),
                rest: body_stream.map_err(std::io::Error::other).boxed(),
            });
        }
    }

    Ok(CapturedBody::Complete(Bytes::from(buffered)))
}

fn build_response(status: StatusCode, upstream_headers: &HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    let headers = response.headers_mut();
    for (name, value) in upstream_headers {
        headers.insert(name.clone(), value.clone());
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
    // Recomputed for the buffered path; meaningless for the streamed one.
    headers.remove(header::CONTENT_LENGTH);
    response
}

/// Strips routing headers (they are ours, not the upstream's) and
/// hop-by-hop headers before the request leaves the proxy.
fn sanitize_forward_headers(headers: &mut HeaderMap) {
    for name in ROUTING_HEADERS {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);
}

fn join_target_url(target: &str, uri: &Uri) -> String {
    let base = target.trim_end_matches('/');
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    format!("{base}{path_and_query}")
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn generate_request_id() -> String {
    let seq = REQUEST_ID_SEQ.fetch_add(1, Ordering::Relaxed);
    let ts_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0);
    format!("tollgate-{ts_ms}-{seq}")
}

fn insert_request_id(headers: &mut HeaderMap, request_id: &str) {
    let value = match axum::http::HeaderValue::from_str(request_id) {
        Ok(value) => value,
        Err(_) => return,
    };
    headers.insert("x-request-id", value);
}

fn spawn_accounting(
    state: AppState,
    meta: RoutingMetadata,
    endpoint: String,
    status_code: u16,
    latency_ms: u64,
    upstream_headers: &HeaderMap,
    body: Bytes,
) {
    let content_type = header_value(upstream_headers, header::CONTENT_TYPE.as_str())
        .map(str::to_string);
    let content_encoding = header_value(upstream_headers, header::CONTENT_ENCODING.as_str())
        .map(str::to_string);

    tokio::spawn(async move {
        account_exchange(
            &state,
            meta,
            endpoint,
            status_code,
            latency_ms,
            content_type.as_deref(),
            content_encoding.as_deref(),
            body,
        )
        .await;
    });
}

/// The accounting pipeline for one completed exchange: decode, extract,
/// price, persist. Any bail-out here leaves the already-delivered
/// response untouched.
#[allow(clippy::too_many_arguments)]
async fn account_exchange(
    state: &AppState,
    meta: RoutingMetadata,
    endpoint: String,
    status_code: u16,
    latency_ms: u64,
    content_type: Option<&str>,
    content_encoding: Option<&str>,
    body: Bytes,
) {
    let is_json = content_type.is_some_and(|ct| ct.to_ascii_lowercase().contains("application/json"));
    if !is_json {
        tracing::debug!(endpoint = %endpoint, "non-json response; accounting skipped");
        return;
    }
    if body.len() > state.usage_max_body_bytes() {
        tracing::debug!(
            endpoint = %endpoint,
            bytes = body.len(),
            "response too large for usage parsing; accounting skipped"
        );
        return;
    }

    let decoded = match decode::decode_body(&body, content_encoding) {
        Ok(decoded) => decoded,
        Err(err) => {
            tracing::debug!(endpoint = %endpoint, "{err}; accounting skipped");
            return;
        }
    };
    let parsed: serde_json::Value = match serde_json::from_slice(&decoded.bytes) {
        Ok(value) => value,
        Err(err) => {
            tracing::debug!(endpoint = %endpoint, "response body is not valid json: {err}; accounting skipped");
            return;
        }
    };

    let extracted = usage::extract(&parsed, &meta);
    let rate = state
        .pricing()
        .resolve(&extracted.model, meta.pricing_tier.as_deref(), None)
        .await;
    let estimated_cost = costing::estimate_cost(extracted.tokens, rate.as_ref());

    let record = UsageRecord {
        user_id: meta.user_id,
        service_name: meta.service_name,
        endpoint,
        status_code,
        latency_ms,
        model: extracted.model,
        input_tokens: extracted.tokens.input_tokens,
        output_tokens: extracted.tokens.output_tokens,
        estimated_cost,
        created_at_ms: crate::now_epoch_millis(),
    };

    if let Err(err) = state.store().append_usage(record).await {
        tracing::error!("failed to persist usage record: {err}");
    }
}
