//! The transparent `/relay` surface.
//!
//! Callers point their HTTP client at the proxy and select the real target
//! with `X-Pag0-Target-Url`; method, headers, and body pass through. The
//! response is the upstream response plus `x-pag0-*` metadata headers, with
//! one exception: an upstream 402 is relayed byte-for-byte so x402-aware
//! clients can run their own payment flow against it.

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, Method, Response, StatusCode};
use pag0_core::Pag0Error;
use serde_json::json;
use std::sync::Arc;

use crate::policy::RequestContext;
use crate::proxy::{project_id_from, run_pipeline, ApiError, AppState, PipelineOutcome};
use crate::x402;

/// Connection-scoped headers that never cross the proxy, either direction.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub(crate) fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Whether an inbound header is addressed to the proxy rather than the
/// upstream.
fn is_proxy_header(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.starts_with("x-pag0-") || lower == x402::X_PAYMENT
}

/// Headers to forward upstream: everything except hop-by-hop, proxy
/// plumbing, and the connection-derived `host`/`content-length`.
pub(crate) fn outbound_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut outbound = HeaderMap::new();
    for (name, value) in inbound {
        let name_str = name.as_str();
        if is_hop_by_hop(name_str)
            || is_proxy_header(name_str)
            || name_str.eq_ignore_ascii_case("host")
            || name_str.eq_ignore_ascii_case("content-length")
        {
            continue;
        }
        outbound.append(name.clone(), value.clone());
    }
    outbound
}

/// Upstream response headers to relay back: everything except hop-by-hop
/// and the recomputed `content-length`.
fn response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut filtered = HeaderMap::new();
    for (name, value) in upstream {
        let name_str = name.as_str();
        if is_hop_by_hop(name_str) || name_str.eq_ignore_ascii_case("content-length") {
            continue;
        }
        filtered.append(name.clone(), value.clone());
    }
    filtered
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

pub(crate) async fn handle_relay(
    State(state): State<Arc<AppState>>,
    method: Method,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> std::result::Result<Response<Body>, ApiError> {
    let target = headers
        .get(x402::X_PAG0_TARGET_URL)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            Pag0Error::BadRequest(format!(
                "relay requests must carry the {} header",
                x402::X_PAG0_TARGET_URL
            ))
        })?;
    let project_id = project_id_from(&headers);
    let ctx = RequestContext::new(project_id, method.as_str(), target)?;

    let payment = match headers.get(x402::X_PAYMENT).and_then(|v| v.to_str().ok()) {
        Some(raw) => Some(x402::decode_payment_header(raw)?),
        None => None,
    };

    let forwarded = outbound_headers(&headers);
    let body = if body.is_empty() { None } else { Some(body) };

    let outcome = run_pipeline(&state, ctx, forwarded, body, payment).await?;
    Ok(render_relay_outcome(outcome))
}

fn render_relay_outcome(outcome: PipelineOutcome) -> Response<Body> {
    match outcome {
        // Verbatim 402 passthrough: same status, headers, and body bytes
        PipelineOutcome::PaymentRequired {
            status,
            headers,
            body,
            ..
        } => {
            let mut response = Response::new(Body::from(body));
            *response.status_mut() =
                StatusCode::from_u16(status).unwrap_or(StatusCode::PAYMENT_REQUIRED);
            *response.headers_mut() = response_headers(&headers);
            response
        }
        PipelineOutcome::Success {
            status,
            headers,
            body,
            content_type,
            cost,
            cached,
            cache_age: _,
            latency_ms,
            endpoint,
            budget,
            reputation: _,
        } => {
            let mut out = response_headers(&headers);
            if out.get("content-type").is_none() {
                if let Some(ct) = content_type.as_deref().and_then(|ct| ct.parse().ok()) {
                    out.insert("content-type", ct);
                }
            }
            insert_metadata(&mut out, "x-pag0-cost", &cost.to_string());
            insert_metadata(&mut out, "x-pag0-cached", if cached { "hit" } else { "miss" });
            insert_metadata(&mut out, "x-pag0-latency", &latency_ms.to_string());
            insert_metadata(&mut out, "x-pag0-endpoint", &endpoint);
            let remaining = json!({
                "daily": budget.daily_remaining(),
                "monthly": budget.monthly_remaining(),
            });
            insert_metadata(&mut out, "x-pag0-budget-remaining", &remaining.to_string());

            let mut response = Response::new(Body::from(body));
            *response.status_mut() =
                StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            *response.headers_mut() = out;
            response
        }
    }
}

fn insert_metadata(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hop_by_hop_detection() {
        assert!(is_hop_by_hop("connection"));
        assert!(is_hop_by_hop("Transfer-Encoding"));
        assert!(is_hop_by_hop("TE"));
        assert!(!is_hop_by_hop("content-type"));
        assert!(!is_hop_by_hop("www-authenticate"));
    }

    #[test]
    fn test_outbound_headers_strip_proxy_plumbing() {
        let mut inbound = HeaderMap::new();
        inbound.insert("accept", "application/json".parse().unwrap());
        inbound.insert("authorization", "Bearer tok".parse().unwrap());
        inbound.insert("host", "proxy.local".parse().unwrap());
        inbound.insert("content-length", "12".parse().unwrap());
        inbound.insert("connection", "keep-alive".parse().unwrap());
        inbound.insert("x-pag0-target-url", "https://e.com/x".parse().unwrap());
        inbound.insert("x-pag0-project-id", "proj".parse().unwrap());
        inbound.insert("x-payment", "cHJvb2Y=".parse().unwrap());

        let outbound = outbound_headers(&inbound);
        assert_eq!(outbound.len(), 2);
        assert!(outbound.contains_key("accept"));
        assert!(outbound.contains_key("authorization"));
    }

    #[test]
    fn test_response_headers_keep_challenge_headers() {
        let mut upstream = HeaderMap::new();
        upstream.insert("www-authenticate", "x402 abc".parse().unwrap());
        upstream.insert("x-payment-required", "abc".parse().unwrap());
        upstream.insert("content-length", "3".parse().unwrap());
        upstream.insert("transfer-encoding", "chunked".parse().unwrap());

        let filtered = response_headers(&upstream);
        assert!(filtered.contains_key("www-authenticate"));
        assert!(filtered.contains_key("x-payment-required"));
        assert!(!filtered.contains_key("content-length"));
        assert!(!filtered.contains_key("transfer-encoding"));
    }
}
