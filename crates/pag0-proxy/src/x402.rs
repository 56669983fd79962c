//! x402 payment-protocol plumbing.
//!
//! Forwards requests upstream, parses 402 payment challenges from response
//! headers, attaches signed payment proofs, and extracts settled costs and
//! replay keys. The proxy treats payment proofs as opaque: it never
//! verifies signatures, it only relays them and guards against reuse.

use base64::Engine as _;
use bytes::Bytes;
use pag0_core::{Amount, Pag0Error, PaymentInfo, Result, SignedPayment};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::debug;

/// Header carrying the base64 signed payment proof upstream.
pub const X_PAYMENT: &str = "x-payment";
/// Challenge header some upstreams use instead of `WWW-Authenticate`.
pub const X_PAYMENT_REQUIRED: &str = "x-payment-required";
/// Settlement receipt header (base64 JSON).
pub const X_PAYMENT_RESPONSE: &str = "x-payment-response";
/// Plain decimal settled-amount header.
pub const X_PAYMENT_AMOUNT: &str = "x-payment-amount";
/// Relay surface: target URL selector.
pub const X_PAG0_TARGET_URL: &str = "x-pag0-target-url";
/// Relay surface: project selector.
pub const X_PAG0_PROJECT_ID: &str = "x-pag0-project-id";

const X402_SCHEME_PREFIX: &str = "x402 ";

// ---------------------------------------------------------------------------
// Upstream client
// ---------------------------------------------------------------------------

/// A captured upstream response.
#[derive(Debug)]
pub struct UpstreamResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers as received.
    pub headers: HeaderMap,
    /// Raw body bytes.
    pub body: Bytes,
}

impl UpstreamResponse {
    /// The `Content-Type` header, when present and valid UTF-8.
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        header_str(&self.headers, "content-type")
    }

    /// The `Cache-Control` header, when present and valid UTF-8.
    #[must_use]
    pub fn cache_control(&self) -> Option<&str> {
        header_str(&self.headers, "cache-control")
    }
}

/// HTTP client for upstream forwarding.
///
/// Redirects are disabled so payment challenges and proofs are never
/// silently re-routed to a different host.
pub struct UpstreamClient {
    client: reqwest::Client,
}

impl UpstreamClient {
    /// Build a client with the configured timeouts.
    pub fn new(timeout_ms: u64, connection_timeout_ms: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_millis(timeout_ms))
            .connect_timeout(Duration::from_millis(connection_timeout_ms))
            .build()
            .map_err(|e| Pag0Error::Config(format!("failed to build upstream client: {e}")))?;
        Ok(Self { client })
    }

    /// Forward a request upstream, optionally attaching a payment proof in
    /// the `X-PAYMENT` header.
    pub async fn forward(
        &self,
        method: &str,
        url: &str,
        headers: HeaderMap,
        body: Option<Bytes>,
        payment: Option<&SignedPayment>,
    ) -> Result<UpstreamResponse> {
        let method = reqwest::Method::from_bytes(method.to_uppercase().as_bytes())
            .map_err(|_| Pag0Error::BadRequest(format!("invalid HTTP method '{method}'")))?;

        let mut request = self.client.request(method, url).headers(headers);
        if let Some(payment) = payment {
            request = request.header(X_PAYMENT, encode_payment(payment)?);
        }
        if let Some(body) = body {
            request = request.body(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Pag0Error::UpstreamUnreachable(format!("{url}: {e}")))?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| Pag0Error::UpstreamUnreachable(format!("{url}: body read failed: {e}")))?;

        debug!(url, status, body_len = body.len(), "Upstream response");
        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}

/// Base64 the payment proof's JSON for the `X-PAYMENT` header.
pub fn encode_payment(payment: &SignedPayment) -> Result<HeaderValue> {
    let json = serde_json::to_vec(&payment.0)?;
    let encoded = base64::engine::general_purpose::STANDARD.encode(json);
    HeaderValue::from_str(&encoded)
        .map_err(|e| Pag0Error::BadRequest(format!("payment proof not header-safe: {e}")))
}

// ---------------------------------------------------------------------------
// Challenge parsing
// ---------------------------------------------------------------------------

/// Parse a 402 payment challenge from upstream response headers.
///
/// Primary form is `WWW-Authenticate: x402 <base64 JSON>`; some upstreams
/// send a raw base64 `X-Payment-Required` header instead. Returns
/// `Ok(None)` for non-402 responses and 402s without a challenge header;
/// a challenge header that fails to decode is an error.
pub fn parse_payment_challenge(status: u16, headers: &HeaderMap) -> Result<Option<PaymentInfo>> {
    if status != 402 {
        return Ok(None);
    }

    let encoded = match header_str(headers, "www-authenticate") {
        Some(value) => {
            let value = value.trim();
            match value.get(..X402_SCHEME_PREFIX.len()) {
                Some(prefix) if prefix.eq_ignore_ascii_case(X402_SCHEME_PREFIX) => {
                    Some(value[X402_SCHEME_PREFIX.len()..].trim().to_string())
                }
                _ => None,
            }
        }
        None => None,
    };
    let encoded = match encoded.or_else(|| header_str(headers, X_PAYMENT_REQUIRED).map(str::to_string)) {
        Some(e) => e,
        None => return Ok(None),
    };

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| {
            Pag0Error::MalformedPaymentChallenge(format!("challenge is not valid base64: {e}"))
        })?;
    let info: PaymentInfo = serde_json::from_slice(&decoded).map_err(|e| {
        Pag0Error::MalformedPaymentChallenge(format!("challenge JSON is invalid: {e}"))
    })?;
    Ok(Some(info))
}

/// Extract the settled cost from upstream response headers.
///
/// Prefers the plain decimal `X-Payment-Amount` header; falls back to the
/// `amount`/`value` field of a base64 JSON `X-Payment-Response` receipt.
#[must_use]
pub fn settled_cost(headers: &HeaderMap) -> Option<Amount> {
    if let Some(raw) = header_str(headers, X_PAYMENT_AMOUNT) {
        if let Ok(amount) = raw.trim().parse::<Amount>() {
            return Some(amount);
        }
    }

    let raw = header_str(headers, X_PAYMENT_RESPONSE)?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(raw.trim())
        .ok()?;
    let receipt: serde_json::Value = serde_json::from_slice(&decoded).ok()?;
    let candidate = receipt.get("amount").or_else(|| receipt.get("value"))?;
    match candidate {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.as_u64().map(|v| Amount::from_units(u128::from(v))),
        _ => None,
    }
}

/// Extract the settlement transaction hash from a receipt header.
#[must_use]
pub fn settled_tx_hash(headers: &HeaderMap) -> Option<String> {
    let raw = header_str(headers, X_PAYMENT_RESPONSE)?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(raw.trim())
        .ok()?;
    let receipt: serde_json::Value = serde_json::from_slice(&decoded).ok()?;
    receipt
        .get("txHash")
        .or_else(|| receipt.get("transaction"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

// ---------------------------------------------------------------------------
// Replay keys
// ---------------------------------------------------------------------------

/// Stable replay-detection key for a payment proof.
///
/// Uses the proof's nonce when one is present; otherwise the hex sha256 of
/// the proof's canonical JSON, so structurally identical proofs collide.
#[must_use]
pub fn replay_key(payment: &SignedPayment) -> String {
    if let Some(nonce) = payment.nonce() {
        return nonce.to_string();
    }
    let canonical = payment.0.to_string();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let digest = hasher.finalize();
    use std::fmt::Write as _;
    digest
        .iter()
        .fold(String::with_capacity(64), |mut s, b| {
            let _ = write!(s, "{b:02x}");
            s
        })
}

/// Parse a raw `X-PAYMENT` header value (base64 JSON) into a proof.
pub fn decode_payment_header(raw: &str) -> Result<SignedPayment> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(raw.trim())
        .map_err(|e| Pag0Error::BadRequest(format!("X-PAYMENT header is not valid base64: {e}")))?;
    let value: serde_json::Value = serde_json::from_slice(&decoded)
        .map_err(|e| Pag0Error::BadRequest(format!("X-PAYMENT header is not valid JSON: {e}")))?;
    Ok(SignedPayment(value))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Build a `HeaderMap` from string pairs, skipping invalid names/values.
pub fn header_map_from_pairs<'a, I>(pairs: I) -> HeaderMap
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }
    headers
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
