//! End-to-end tests: a real mock upstream behind the full router.
//!
//! The mock upstream speaks just enough x402 to exercise the pipeline: a
//! free route, a payment-gated route that answers 402 until an `X-PAYMENT`
//! header arrives, and a counter route for cache verification.

use axum::body::Body;
use axum::http::{HeaderMap, Request, Response, StatusCode};
use axum::routing::get;
use axum::Router;
use base64::Engine as _;
use pag0_core::{Amount, Pag0Config, Policy, Storage};
use pag0_proxy::{build_router, AppState, ShutdownCoordinator};
use pag0_storage::StorageProfile;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tower::ServiceExt;

const PAID_PRICE: &str = "1000000";

static COUNTER: AtomicU32 = AtomicU32::new(0);

fn challenge_header() -> String {
    let challenge = json!({
        "maxAmountRequired": PAID_PRICE,
        "resource": "/paid",
        "scheme": "exact",
        "network": "base-sepolia",
        "payTo": "0xupstream",
    });
    format!(
        "x402 {}",
        base64::engine::general_purpose::STANDARD.encode(challenge.to_string())
    )
}

async fn plain_handler() -> Response<Body> {
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(Body::from(r#"{"ok":true}"#))
        .unwrap()
}

async fn paid_handler(headers: HeaderMap) -> Response<Body> {
    if headers.contains_key("x-payment") {
        Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/json")
            .header("cache-control", "no-store")
            .header("x-payment-amount", PAID_PRICE)
            .body(Body::from(r#"{"data":"premium"}"#))
            .unwrap()
    } else {
        Response::builder()
            .status(StatusCode::PAYMENT_REQUIRED)
            .header("content-type", "application/json")
            .header("www-authenticate", challenge_header())
            .body(Body::from(r#"{"error":"payment required"}"#))
            .unwrap()
    }
}

async fn counter_handler() -> Response<Body> {
    let n = COUNTER.fetch_add(1, Ordering::SeqCst);
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(Body::from(format!(r#"{{"serial":{n}}}"#)))
        .unwrap()
}

/// Start the mock upstream on an ephemeral port, returning its base URL.
async fn spawn_upstream() -> String {
    let app = Router::new()
        .route("/plain", get(plain_handler))
        .route("/paid", get(paid_handler))
        .route("/counter", get(counter_handler));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

async fn test_app() -> (Router, Storage) {
    let storage = StorageProfile::Memory.build().await.unwrap();
    let shutdown = ShutdownCoordinator::new(5);
    let state = Arc::new(AppState::new(Pag0Config::default(), storage.clone(), shutdown).unwrap());
    (build_router(state), storage)
}

async fn read_json(response: Response<Body>) -> (StatusCode, Value) {
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap();
    (status, value)
}

async fn post_proxy(app: &Router, body: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri("/proxy")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    read_json(response).await
}

fn payment(nonce: &str, value: &str) -> Value {
    json!({
        "nonce": nonce,
        "payload": { "authorization": { "nonce": nonce, "value": value } },
        "signature": "0xsigned",
    })
}

async fn install_policy(storage: &Storage, mut policy: Policy) {
    policy.is_active = true;
    storage.policies.create_policy(&policy).await.unwrap();
}

// ---------------------------------------------------------------------------
// /proxy
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_proxy_success_envelope() {
    let upstream = spawn_upstream().await;
    let (app, _storage) = test_app().await;

    let (status, envelope) =
        post_proxy(&app, json!({"targetUrl": format!("{upstream}/plain")})).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(envelope["status"], 200);
    assert_eq!(envelope["body"]["ok"], true);
    assert_eq!(envelope["metadata"]["cached"], false);
    assert_eq!(envelope["metadata"]["cacheSource"], "upstream");
    assert_eq!(envelope["metadata"]["cost"], "0");
    assert_eq!(envelope["metadata"]["endpoint"], "127.0.0.1");
    // No policy installed: budgets are unlimited
    assert_eq!(envelope["metadata"]["budgetRemaining"]["daily"], Value::Null);
    assert!(envelope["metadata"]["latency"].is_u64());
}

#[tokio::test]
async fn test_proxy_402_envelope() {
    let upstream = spawn_upstream().await;
    let (app, _storage) = test_app().await;

    let (status, envelope) =
        post_proxy(&app, json!({"targetUrl": format!("{upstream}/paid")})).await;

    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(envelope["status"], 402);
    assert_eq!(envelope["paymentInfo"]["maxAmountRequired"], PAID_PRICE);
    assert_eq!(envelope["paymentInfo"]["scheme"], "exact");
    assert_eq!(envelope["paymentInfo"]["payTo"], "0xupstream");
    assert_eq!(envelope["metadata"]["endpoint"], "127.0.0.1");
    // A bare 402 carries no cost metadata
    assert!(envelope["metadata"].get("cost").is_none());
}

#[tokio::test]
async fn test_proxy_paid_call_settles_spend() {
    let upstream = spawn_upstream().await;
    let (app, storage) = test_app().await;

    let (status, envelope) = post_proxy(
        &app,
        json!({
            "targetUrl": format!("{upstream}/paid"),
            "signedPayment": payment("nonce-settle", PAID_PRICE),
        }),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(envelope["status"], 200);
    assert_eq!(envelope["body"]["data"], "premium");
    assert_eq!(envelope["metadata"]["cost"], PAID_PRICE);

    // The spend reached the durable budget mirror
    let totals = storage
        .budgets
        .get_totals("default")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(totals.daily_spent, Amount::from_units(1_000_000));
}

#[tokio::test]
async fn test_proxy_replayed_payment_rejected() {
    let upstream = spawn_upstream().await;
    let (app, _storage) = test_app().await;

    let body = json!({
        "targetUrl": format!("{upstream}/paid"),
        "signedPayment": payment("nonce-replay", PAID_PRICE),
    });

    let (first, _) = post_proxy(&app, body.clone()).await;
    assert_eq!(first, StatusCode::OK);

    let (second, error) = post_proxy(&app, body).await;
    assert_eq!(second, StatusCode::FORBIDDEN);
    assert_eq!(error["code"], "REPLAY_ATTACK");
}

#[tokio::test]
async fn test_proxy_concurrent_replay_single_winner() {
    let upstream = spawn_upstream().await;
    let (app, _storage) = test_app().await;

    let body = json!({
        "targetUrl": format!("{upstream}/paid"),
        "signedPayment": payment("nonce-race", PAID_PRICE),
    });

    let mut handles = Vec::new();
    for _ in 0..8 {
        let app = app.clone();
        let body = body.clone();
        handles.push(tokio::spawn(async move { post_proxy(&app, body).await.0 }));
    }
    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() == StatusCode::OK {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn test_proxy_blocked_endpoint() {
    let upstream = spawn_upstream().await;
    let (app, storage) = test_app().await;

    let mut policy = Policy::new(
        "default",
        "lockdown",
        Amount::from_units(5_000_000),
        Amount::from_units(10_000_000),
        Amount::from_units(100_000_000),
    );
    policy.blocked_endpoints = vec!["127.0.0.1".to_string()];
    install_policy(&storage, policy).await;

    let (status, error) =
        post_proxy(&app, json!({"targetUrl": format!("{upstream}/plain")})).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(error["code"], "POLICY_VIOLATION");
    assert_eq!(error["reason"], "ENDPOINT_BLOCKED");
}

#[tokio::test]
async fn test_proxy_per_request_limit() {
    let upstream = spawn_upstream().await;
    let (app, storage) = test_app().await;

    let policy = Policy::new(
        "default",
        "tight",
        Amount::from_units(500_000),
        Amount::from_units(10_000_000),
        Amount::from_units(100_000_000),
    );
    install_policy(&storage, policy).await;

    let (status, error) = post_proxy(
        &app,
        json!({
            "targetUrl": format!("{upstream}/paid"),
            "signedPayment": payment("nonce-limit", PAID_PRICE),
        }),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(error["reason"], "PER_REQUEST_LIMIT_EXCEEDED");
}

#[tokio::test]
async fn test_proxy_cache_hit_on_second_call() {
    let upstream = spawn_upstream().await;
    let (app, _storage) = test_app().await;
    let body = json!({"targetUrl": format!("{upstream}/counter")});

    let (_, first) = post_proxy(&app, body.clone()).await;
    assert_eq!(first["metadata"]["cached"], false);

    let (_, second) = post_proxy(&app, body).await;
    assert_eq!(second["metadata"]["cached"], true);
    assert_eq!(second["metadata"]["cacheSource"], "cache");
    assert!(second["metadata"]["cacheAge"].is_u64());
    // The upstream was not hit again: the serial did not advance
    assert_eq!(second["body"]["serial"], first["body"]["serial"]);
}

#[tokio::test]
async fn test_proxy_unreachable_upstream_is_502() {
    let (app, _storage) = test_app().await;
    let (status, error) =
        post_proxy(&app, json!({"targetUrl": "http://127.0.0.1:1/nothing"})).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(error["code"], "UPSTREAM_UNREACHABLE");
}

#[tokio::test]
async fn test_proxy_rejects_invalid_target() {
    let (app, _storage) = test_app().await;
    let (status, error) = post_proxy(&app, json!({"targetUrl": "not a url"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["code"], "BAD_REQUEST");
}

// ---------------------------------------------------------------------------
// /relay
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_relay_402_is_byte_transparent() {
    let upstream = spawn_upstream().await;
    let (app, _storage) = test_app().await;

    let request = Request::builder()
        .method("GET")
        .uri("/relay")
        .header("x-pag0-target-url", format!("{upstream}/paid"))
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    let challenge = response
        .headers()
        .get("www-authenticate")
        .and_then(|v| v.to_str().ok())
        .unwrap()
        .to_string();
    assert_eq!(challenge, challenge_header());
    // No pag0 metadata headers on a passthrough 402
    assert!(response.headers().get("x-pag0-cost").is_none());

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&bytes[..], br#"{"error":"payment required"}"#);
}

#[tokio::test]
async fn test_relay_success_carries_metadata_headers() {
    let upstream = spawn_upstream().await;
    let (app, _storage) = test_app().await;

    let proof = base64::engine::general_purpose::STANDARD
        .encode(payment("nonce-relay", PAID_PRICE).to_string());
    let request = Request::builder()
        .method("GET")
        .uri("/relay")
        .header("x-pag0-target-url", format!("{upstream}/paid"))
        .header("x-pag0-project-id", "relay-proj")
        .header("x-payment", proof)
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers().clone();
    assert_eq!(headers.get("x-pag0-cost").unwrap(), PAID_PRICE);
    assert_eq!(headers.get("x-pag0-cached").unwrap(), "miss");
    assert_eq!(headers.get("x-pag0-endpoint").unwrap(), "127.0.0.1");
    assert!(headers.get("x-pag0-latency").is_some());
    let remaining: Value = serde_json::from_str(
        headers
            .get("x-pag0-budget-remaining")
            .unwrap()
            .to_str()
            .unwrap(),
    )
    .unwrap();
    assert_eq!(remaining["daily"], Value::Null);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&bytes[..], br#"{"data":"premium"}"#);
}

#[tokio::test]
async fn test_relay_requires_target_header() {
    let (app, _storage) = test_app().await;
    let request = Request::builder()
        .method("GET")
        .uri("/relay")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_relay_cache_hit_header() {
    let upstream = spawn_upstream().await;
    let (app, _storage) = test_app().await;

    let make_request = || {
        Request::builder()
            .method("GET")
            .uri("/relay")
            .header("x-pag0-target-url", format!("{upstream}/plain"))
            .body(Body::empty())
            .unwrap()
    };
    let first = app.clone().oneshot(make_request()).await.unwrap();
    assert_eq!(first.headers().get("x-pag0-cached").unwrap(), "miss");

    let second = app.oneshot(make_request()).await.unwrap();
    assert_eq!(second.headers().get("x-pag0-cached").unwrap(), "hit");
    let bytes = axum::body::to_bytes(second.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&bytes[..], br#"{"ok":true}"#);
}

// ---------------------------------------------------------------------------
// /health
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_health_reports_ok() {
    let (app, _storage) = test_app().await;
    let request = Request::builder()
        .method("GET")
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let (status, body) = read_json(app.oneshot(request).await.unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["checks"]["fastStore"], "ok");
    assert_eq!(body["audit"]["enabled"], false);
}
