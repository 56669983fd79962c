//! The proxy HTTP surface: application state, the shared request pipeline,
//! and the JSON `/proxy` endpoint.
//!
//! Both surfaces run the same pipeline: policy evaluation, cache lookup,
//! replay protection, upstream forwarding, 402 challenge handling, spend
//! settlement, and fire-and-forget analytics and audit feedback. The
//! surfaces differ only in how the outcome is rendered.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use base64::Engine as _;
use bytes::Bytes;
use chrono::Utc;
use pag0_core::{
    Amount, AuditFeedback, BudgetSnapshot, Pag0Config, Pag0Error, PaymentInfo, RequestRecord,
    Result, SignedPayment, Storage,
};
use reqwest::header::HeaderMap;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

use crate::analytics::AnalyticsRecorder;
use crate::audit::AuditTrail;
use crate::budget::BudgetTracker;
use crate::cache::ResponseCache;
use crate::curation::CurationEngine;
use crate::onchain::{HttpReputationLedger, IpfsClient};
use crate::policy::{violation_error, PolicyEngine, RequestContext};
use crate::relay;
use crate::shutdown::ShutdownCoordinator;
use crate::x402::{self, UpstreamClient};
use pag0_core::ReputationLedger;

/// How long a payment's replay marker stays set.
const REPLAY_TTL: Duration = Duration::from_secs(3600);

// ---------------------------------------------------------------------------
// Application state
// ---------------------------------------------------------------------------

/// Shared state behind every handler.
pub struct AppState {
    pub config: Pag0Config,
    pub storage: Storage,
    pub budget: Arc<BudgetTracker>,
    pub policy: PolicyEngine,
    pub cache: ResponseCache,
    pub curation: CurationEngine,
    pub audit: Option<Arc<AuditTrail>>,
    pub ledger: Option<Arc<dyn ReputationLedger>>,
    pub upstream: UpstreamClient,
    pub shutdown: ShutdownCoordinator,
    analytics: AnalyticsRecorder,
}

impl AppState {
    /// Wire up all subsystems from configuration and built storage.
    pub fn new(
        config: Pag0Config,
        storage: Storage,
        shutdown: ShutdownCoordinator,
    ) -> Result<Self> {
        let budget = Arc::new(BudgetTracker::new(storage.clone()));
        let policy = PolicyEngine::new(storage.policies.clone(), Arc::clone(&budget));
        let cache = ResponseCache::new(storage.fast.clone(), config.cache.clone());
        let upstream = UpstreamClient::new(config.timeout_ms, config.connection_timeout_ms)?;

        let ledger: Option<Arc<dyn ReputationLedger>> = match &config.audit.ledger_url {
            Some(url) => Some(Arc::new(HttpReputationLedger::new(
                url.clone(),
                config.subgraph.clone(),
                storage.fast.clone(),
            )?)),
            None => None,
        };
        let audit = match &ledger {
            Some(ledger) => {
                let ipfs = match &config.audit.ipfs_api_url {
                    Some(url) => Some(IpfsClient::new(url.clone())?),
                    None => None,
                };
                Some(Arc::new(AuditTrail::new(
                    config.audit.clone(),
                    Arc::clone(ledger),
                    ipfs,
                )))
            }
            None => None,
        };
        let curation = CurationEngine::new(storage.clone(), ledger.clone(), config.curation.clone());
        let analytics = AnalyticsRecorder::new(storage.analytics.clone(), shutdown.clone());

        Ok(Self {
            config,
            storage,
            budget,
            policy,
            cache,
            curation,
            audit,
            ledger,
            upstream,
            shutdown,
            analytics,
        })
    }

    /// Spawn the background workers (currently the audit retry worker).
    pub fn spawn_workers(&self) {
        if let Some(audit) = &self.audit {
            let token = self.shutdown.token();
            tokio::spawn(Arc::clone(audit).run_retry_worker(token));
            info!("Audit retry worker spawned");
        }
    }
}

/// Build the full proxy router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/proxy", post(handle_proxy))
        .route("/relay", any(relay::handle_relay))
        .route("/health", get(handle_health))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// What the shared pipeline produced for a request.
pub(crate) enum PipelineOutcome {
    /// The upstream answered (or the cache did).
    Success {
        status: u16,
        headers: HeaderMap,
        body: Bytes,
        content_type: Option<String>,
        cost: Amount,
        cached: bool,
        cache_age: Option<u64>,
        latency_ms: u64,
        endpoint: String,
        budget: BudgetSnapshot,
        reputation: Option<u8>,
    },
    /// The upstream demands payment the caller has not (acceptably)
    /// provided. Carries the raw 402 for byte-transparent relaying.
    PaymentRequired {
        payment_info: PaymentInfo,
        status: u16,
        headers: HeaderMap,
        body: Bytes,
        latency_ms: u64,
        endpoint: String,
    },
}

/// Run a request through the full payment-aware pipeline.
pub(crate) async fn run_pipeline(
    state: &AppState,
    ctx: RequestContext,
    outbound_headers: HeaderMap,
    body: Option<Bytes>,
    payment: Option<SignedPayment>,
) -> Result<PipelineOutcome> {
    let started = Instant::now();
    let estimated_cost = payment
        .as_ref()
        .and_then(SignedPayment::amount)
        .unwrap_or(Amount::ZERO);

    // 1. Policy gate
    let decision = state.policy.evaluate(&ctx, estimated_cost).await?;
    if !decision.allowed {
        return Err(violation_error(&decision));
    }

    // 2. Cache lookup. A hit costs nothing and never consumes a nonce.
    let cache_key = ResponseCache::generate_key(&ctx.method, &ctx.url, body.as_deref());
    if let Some(entry) = state.cache.get(&cache_key).await {
        let latency_ms = elapsed_ms(started);
        let budget = state.budget.check_budget(&ctx.project_id).await?;
        let reputation = fetch_reputation(state, &ctx.endpoint).await;
        record_analytics(state, &ctx, entry.status, Amount::ZERO, latency_ms, true);
        return Ok(PipelineOutcome::Success {
            status: entry.status,
            headers: HeaderMap::new(),
            content_type: entry.content_type.clone(),
            cache_age: Some(entry.age_secs(Utc::now())),
            body: Bytes::from(entry.body()?),
            cost: Amount::ZERO,
            cached: true,
            latency_ms,
            endpoint: ctx.endpoint,
            budget,
            reputation,
        });
    }

    // 3. Replay protection, before any spend can occur
    if let Some(payment) = &payment {
        let key = format!("replay:{}", x402::replay_key(payment));
        let created = state.storage.fast.set_nx(&key, b"1", REPLAY_TTL).await?;
        if !created {
            return Err(Pag0Error::ReplayAttack);
        }

        // Pre-flight validation is advisory and log-only
        if let Some(audit) = &state.audit {
            audit
                .request_validation(&ctx.project_id, &ctx.endpoint, estimated_cost)
                .await;
        }
    }

    // 4. Forward upstream, payment proof attached when supplied
    let response = state
        .upstream
        .forward(
            &ctx.method,
            &ctx.url,
            outbound_headers,
            body.clone(),
            payment.as_ref(),
        )
        .await?;
    let latency_ms = elapsed_ms(started);

    // 5. 402: surface the challenge instead of a body
    if response.status == 402 {
        let payment_info = x402::parse_payment_challenge(response.status, &response.headers)?
            .ok_or_else(|| {
                Pag0Error::MalformedPaymentChallenge(
                    "402 response carried no payment challenge header".to_string(),
                )
            })?;
        record_analytics(state, &ctx, 402, Amount::ZERO, latency_ms, false);
        return Ok(PipelineOutcome::PaymentRequired {
            payment_info,
            status: response.status,
            headers: response.headers,
            body: response.body,
            latency_ms,
            endpoint: ctx.endpoint,
        });
    }

    // 6. Settle: receipt amount wins over the committed estimate
    let cost = match (x402::settled_cost(&response.headers), &payment) {
        (Some(settled), _) => settled,
        (None, Some(_)) => estimated_cost,
        (None, None) => Amount::ZERO,
    };
    state.budget.record_spend(&ctx.project_id, cost).await?;

    // 7. Cache eligible responses (degrades silently)
    if state.cache.is_cacheable(
        &ctx.method,
        response.status,
        &ctx.url,
        response.body.len(),
        response.cache_control(),
    ) {
        state
            .cache
            .put(
                &cache_key,
                &ctx.url,
                response.status,
                response.content_type(),
                &response.body,
            )
            .await;
    }

    // 8. Fire-and-forget bookkeeping
    record_analytics(state, &ctx, response.status, cost, latency_ms, false);
    if payment.is_some() {
        submit_audit_feedback(state, &ctx, &response.headers, response.status, cost, latency_ms);
    }

    let budget = state.budget.check_budget(&ctx.project_id).await?;
    let reputation = fetch_reputation(state, &ctx.endpoint).await;

    Ok(PipelineOutcome::Success {
        status: response.status,
        content_type: response.content_type().map(str::to_string),
        headers: response.headers,
        body: response.body,
        cost,
        cached: false,
        cache_age: None,
        latency_ms,
        endpoint: ctx.endpoint,
        budget,
        reputation,
    })
}

fn record_analytics(
    state: &AppState,
    ctx: &RequestContext,
    status: u16,
    cost: Amount,
    latency_ms: u64,
    cached: bool,
) {
    state.analytics.record_async(RequestRecord {
        id: Uuid::new_v4(),
        project_id: ctx.project_id.clone(),
        endpoint: ctx.endpoint.clone(),
        method: ctx.method.clone(),
        url: ctx.url.clone(),
        status_code: status,
        cost,
        latency_ms,
        cached,
        created_at: Utc::now(),
    });
}

fn submit_audit_feedback(
    state: &AppState,
    ctx: &RequestContext,
    headers: &HeaderMap,
    status: u16,
    cost: Amount,
    latency_ms: u64,
) {
    let Some(audit) = &state.audit else {
        return;
    };
    let feedback = AuditFeedback {
        agent_id: ctx.project_id.clone(),
        endpoint: ctx.endpoint.clone(),
        cost,
        latency_ms,
        status_code: status,
        tx_hash: x402::settled_tx_hash(headers),
        sender: state.config.audit.agent_address.clone(),
        receiver: None,
    };
    let audit = Arc::clone(audit);
    let guard = state.shutdown.track_task();
    tokio::spawn(async move {
        let _guard = guard;
        audit.record_payment_feedback(feedback).await;
    });
}

async fn fetch_reputation(state: &AppState, endpoint: &str) -> Option<u8> {
    let ledger = state.ledger.as_ref()?;
    match ledger.get_reputation(endpoint).await {
        Ok(score) => score,
        Err(e) => {
            warn!(endpoint, error = %e, "Reputation lookup failed");
            None
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

// ---------------------------------------------------------------------------
// /proxy endpoint
// ---------------------------------------------------------------------------

fn default_method() -> String {
    "GET".to_string()
}

/// JSON body of a `/proxy` call.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyRequest {
    /// Full upstream URL.
    pub target_url: String,
    /// HTTP method, `GET` by default.
    #[serde(default = "default_method")]
    pub method: String,
    /// Extra headers to forward upstream.
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    /// Request body: a JSON string is sent verbatim, any other JSON value
    /// is serialized.
    #[serde(default)]
    pub body: Option<serde_json::Value>,
    /// Signed x402 payment proof.
    #[serde(default)]
    pub signed_payment: Option<SignedPayment>,
}

async fn handle_proxy(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<ProxyRequest>,
) -> std::result::Result<Response, ApiError> {
    let project_id = project_id_from(&headers);
    let ctx = RequestContext::new(project_id, request.method.clone(), &request.target_url)?;

    let body_bytes = match &request.body {
        None => None,
        Some(serde_json::Value::String(s)) => Some(Bytes::from(s.clone().into_bytes())),
        Some(value) => Some(Bytes::from(serde_json::to_vec(value).map_err(Pag0Error::from)?)),
    };

    let mut outbound = x402::header_map_from_pairs(
        request
            .headers
            .iter()
            .flatten()
            .map(|(k, v)| (k.as_str(), v.as_str())),
    );
    if !outbound.contains_key("content-type") {
        if let Some(serde_json::Value::Object(_) | serde_json::Value::Array(_)) = &request.body {
            outbound.insert("content-type", "application/json".parse().map_err(
                |e| Pag0Error::BadRequest(format!("invalid content type: {e}")),
            )?);
        }
    }

    let outcome = run_pipeline(&state, ctx, outbound, body_bytes, request.signed_payment).await?;
    Ok(render_proxy_outcome(outcome))
}

fn render_proxy_outcome(outcome: PipelineOutcome) -> Response {
    match outcome {
        PipelineOutcome::Success {
            status,
            headers,
            body,
            content_type,
            cost,
            cached,
            cache_age,
            latency_ms,
            endpoint,
            budget,
            reputation,
        } => {
            let mut metadata = json!({
                "cost": cost,
                "cached": cached,
                "cacheSource": if cached { "cache" } else { "upstream" },
                "latency": latency_ms,
                "endpoint": endpoint,
                "budgetRemaining": {
                    "daily": budget.daily_remaining(),
                    "monthly": budget.monthly_remaining(),
                },
            });
            if let Some(age) = cache_age {
                metadata["cacheAge"] = json!(age);
            }
            if let Some(score) = reputation {
                metadata["onChainReputation"] = json!(score);
            }
            let envelope = json!({
                "status": status,
                "body": render_body(&body, content_type.as_deref()),
                "headers": passthrough_headers(&headers),
                "metadata": metadata,
            });
            (StatusCode::OK, Json(envelope)).into_response()
        }
        PipelineOutcome::PaymentRequired {
            payment_info,
            latency_ms,
            endpoint,
            ..
        } => {
            let envelope = json!({
                "status": 402,
                "paymentInfo": payment_info,
                "metadata": {
                    "endpoint": endpoint,
                    "latency": latency_ms,
                },
            });
            (StatusCode::PAYMENT_REQUIRED, Json(envelope)).into_response()
        }
    }
}

/// Render an upstream body for the JSON envelope: JSON when it parses,
/// UTF-8 text otherwise, base64 as the last resort.
fn render_body(body: &[u8], content_type: Option<&str>) -> serde_json::Value {
    let looks_json = content_type.map_or(true, |ct| ct.contains("json"));
    if looks_json {
        if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) {
            return value;
        }
    }
    match std::str::from_utf8(body) {
        Ok(text) => json!(text),
        Err(_) => json!(base64::engine::general_purpose::STANDARD.encode(body)),
    }
}

/// Upstream headers worth echoing in the envelope. Hop-by-hop and payment
/// plumbing headers stay out.
fn passthrough_headers(headers: &HeaderMap) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for (name, value) in headers {
        let name = name.as_str();
        if relay::is_hop_by_hop(name) || name.starts_with("x-payment") {
            continue;
        }
        if let Ok(value) = value.to_str() {
            map.insert(name.to_string(), json!(value));
        }
    }
    serde_json::Value::Object(map)
}

/// Project selector, defaulting when the header is absent.
pub(crate) fn project_id_from(headers: &HeaderMap) -> String {
    headers
        .get(x402::X_PAG0_PROJECT_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map_or_else(|| "default".to_string(), str::to_string)
}

// ---------------------------------------------------------------------------
// /health endpoint
// ---------------------------------------------------------------------------

async fn handle_health(State(state): State<Arc<AppState>>) -> Response {
    let fast_ok = state.storage.fast.health_check().await.is_ok();
    let durable_ok = state.storage.policies.health_check().await.is_ok();
    let healthy = fast_ok && durable_ok;

    let body = json!({
        "status": if healthy { "ok" } else { "degraded" },
        "checks": {
            "fastStore": if fast_ok { "ok" } else { "failed" },
            "durableStore": if durable_ok { "ok" } else { "failed" },
        },
        "cache": {
            "hits": state.cache.hits(),
            "misses": state.cache.misses(),
        },
        "audit": {
            "enabled": state.audit.is_some(),
            "retryQueue": state.audit.as_ref().map_or(0, |a| a.queue_len()),
        },
    });
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

// ---------------------------------------------------------------------------
// Error boundary
// ---------------------------------------------------------------------------

/// Wraps [`Pag0Error`] for the HTTP boundary.
pub struct ApiError(pub Pag0Error);

impl From<Pag0Error> for ApiError {
    fn from(err: Pag0Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Pag0Error::PolicyViolation { .. } | Pag0Error::ReplayAttack => StatusCode::FORBIDDEN,
            Pag0Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Pag0Error::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            Pag0Error::UpstreamUnreachable(_) | Pag0Error::MalformedPaymentChallenge(_) => {
                StatusCode::BAD_GATEWAY
            }
            Pag0Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let mut body = json!({
            "code": self.0.code(),
            "message": self.0.to_string(),
        });
        if let Pag0Error::PolicyViolation {
            reason,
            details: Some(details),
            ..
        } = &self.0
        {
            body["reason"] = json!(reason);
            body["details"] = details.clone();
        }
        (status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_id_default() {
        assert_eq!(project_id_from(&HeaderMap::new()), "default");

        let mut headers = HeaderMap::new();
        headers.insert(x402::X_PAG0_PROJECT_ID, "team-a".parse().unwrap());
        assert_eq!(project_id_from(&headers), "team-a");

        let mut empty = HeaderMap::new();
        empty.insert(x402::X_PAG0_PROJECT_ID, "".parse().unwrap());
        assert_eq!(project_id_from(&empty), "default");
    }

    #[test]
    fn test_render_body_json() {
        let rendered = render_body(br#"{"ok":true}"#, Some("application/json"));
        assert_eq!(rendered, json!({"ok": true}));
    }

    #[test]
    fn test_render_body_text() {
        let rendered = render_body(b"hello world", Some("text/plain"));
        assert_eq!(rendered, json!("hello world"));
    }

    #[test]
    fn test_render_body_binary_is_base64() {
        let rendered = render_body(&[0xff, 0xfe, 0x00], Some("application/octet-stream"));
        assert_eq!(rendered, json!("//4A"));
    }

    #[test]
    fn test_render_body_untyped_json_still_parses() {
        let rendered = render_body(br#"[1,2,3]"#, None);
        assert_eq!(rendered, json!([1, 2, 3]));
    }

    #[test]
    fn test_proxy_request_deserializes_camel_case() {
        let request: ProxyRequest = serde_json::from_value(json!({
            "targetUrl": "https://api.example.com/x",
            "method": "POST",
            "headers": {"accept": "application/json"},
            "body": {"q": 1},
            "signedPayment": {"nonce": "n1", "value": "100"},
        }))
        .unwrap();
        assert_eq!(request.target_url, "https://api.example.com/x");
        assert_eq!(request.method, "POST");
        assert!(request.signed_payment.is_some());
    }

    #[test]
    fn test_proxy_request_defaults_method() {
        let request: ProxyRequest =
            serde_json::from_value(json!({"targetUrl": "https://e.com/x"})).unwrap();
        assert_eq!(request.method, "GET");
        assert!(request.body.is_none());
    }

    #[test]
    fn test_passthrough_headers_filters_plumbing() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "application/json".parse().unwrap());
        headers.insert("transfer-encoding", "chunked".parse().unwrap());
        headers.insert("x-payment-response", "abc".parse().unwrap());
        headers.insert("x-request-id", "r1".parse().unwrap());

        let rendered = passthrough_headers(&headers);
        let map = rendered.as_object().unwrap();
        assert!(map.contains_key("content-type"));
        assert!(map.contains_key("x-request-id"));
        assert!(!map.contains_key("transfer-encoding"));
        assert!(!map.contains_key("x-payment-response"));
    }

    #[test]
    fn test_api_error_status_mapping() {
        let cases: Vec<(Pag0Error, StatusCode)> = vec![
            (Pag0Error::ReplayAttack, StatusCode::FORBIDDEN),
            (
                Pag0Error::Unauthorized("x".to_string()),
                StatusCode::UNAUTHORIZED,
            ),
            (
                Pag0Error::RateLimited("x".to_string()),
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (
                Pag0Error::UpstreamUnreachable("x".to_string()),
                StatusCode::BAD_GATEWAY,
            ),
            (
                Pag0Error::MalformedPaymentChallenge("x".to_string()),
                StatusCode::BAD_GATEWAY,
            ),
            (
                Pag0Error::BadRequest("x".to_string()),
                StatusCode::BAD_REQUEST,
            ),
            (
                Pag0Error::Storage("x".to_string()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                Pag0Error::BudgetStore("x".to_string()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError(err).into_response().status(), expected);
        }
    }
}
