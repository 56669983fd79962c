//! On-chain integrations: the reputation ledger HTTP client and the IPFS
//! proof uploader.
//!
//! Ledger submissions return the settlement transaction hash. Reputation
//! lookups go through the subgraph and are cached in the fast store so the
//! hot path rarely pays a network round trip.

use async_trait::async_trait;
use pag0_core::{
    FastStore, FeedbackEvent, Pag0Error, ReputationLedger, Result, SubgraphConfig,
    ValidationRequest,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const REPUTATION_QUERY: &str = r"query Reputation($endpoint: String!) {
  endpointReputation(id: $endpoint) {
    score
  }
}";

// ---------------------------------------------------------------------------
// Ledger client
// ---------------------------------------------------------------------------

/// HTTP client for the reputation ledger and its subgraph.
pub struct HttpReputationLedger {
    client: reqwest::Client,
    ledger_url: String,
    subgraph: SubgraphConfig,
    fast: Arc<dyn FastStore>,
}

impl HttpReputationLedger {
    /// Create a ledger client.
    pub fn new(
        ledger_url: String,
        subgraph: SubgraphConfig,
        fast: Arc<dyn FastStore>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Pag0Error::Config(format!("failed to build ledger client: {e}")))?;
        Ok(Self {
            client,
            ledger_url: ledger_url.trim_end_matches('/').to_string(),
            subgraph,
            fast,
        })
    }

    async fn query_subgraph(&self, url: &str, endpoint: &str) -> Result<Option<u8>> {
        let body = serde_json::json!({
            "query": REPUTATION_QUERY,
            "variables": { "endpoint": endpoint },
        });
        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Pag0Error::Ledger(format!("subgraph query failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Pag0Error::Ledger(format!(
                "subgraph returned HTTP {}",
                response.status()
            )));
        }
        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Pag0Error::Ledger(format!("subgraph response is not JSON: {e}")))?;
        Ok(parse_reputation_response(&payload))
    }
}

#[async_trait]
impl ReputationLedger for HttpReputationLedger {
    async fn submit_feedback(&self, event: &FeedbackEvent) -> Result<String> {
        let url = format!("{}/feedback", self.ledger_url);
        let response = self
            .client
            .post(&url)
            .json(event)
            .send()
            .await
            .map_err(|e| Pag0Error::Ledger(format!("feedback submission failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Pag0Error::Ledger(format!(
                "ledger rejected feedback with HTTP {}",
                response.status()
            )));
        }
        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Pag0Error::Ledger(format!("ledger response is not JSON: {e}")))?;
        parse_tx_hash(&payload).ok_or_else(|| {
            Pag0Error::Ledger("ledger response carried no transaction hash".to_string())
        })
    }

    async fn request_validation(&self, request: &ValidationRequest) -> Result<()> {
        let url = format!("{}/validate", self.ledger_url);
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| Pag0Error::Ledger(format!("validation request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Pag0Error::Ledger(format!(
                "ledger rejected validation with HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn get_reputation(&self, endpoint: &str) -> Result<Option<u8>> {
        let Some(url) = self.subgraph.url.clone() else {
            return Ok(None);
        };

        let cache_key = reputation_key(endpoint);
        match self.fast.get(&cache_key).await {
            Ok(Some(bytes)) => {
                if let Some(score) = std::str::from_utf8(&bytes)
                    .ok()
                    .and_then(|s| s.parse::<u8>().ok())
                {
                    return Ok(Some(score));
                }
            }
            Ok(None) => {}
            Err(e) => warn!(endpoint, error = %e, "Reputation cache read failed"),
        }

        let score = self.query_subgraph(&url, endpoint).await?;
        if let Some(score) = score {
            if let Err(e) = self
                .fast
                .set(
                    &cache_key,
                    score.to_string().as_bytes(),
                    Duration::from_secs(self.subgraph.cache_ttl_secs),
                )
                .await
            {
                warn!(endpoint, error = %e, "Reputation cache write failed");
            }
        }
        debug!(endpoint, ?score, "Reputation fetched from subgraph");
        Ok(score)
    }
}

fn reputation_key(endpoint: &str) -> String {
    format!("reputation:{endpoint}")
}

/// Pull the score out of a subgraph response, clamped to 0..=100.
fn parse_reputation_response(payload: &serde_json::Value) -> Option<u8> {
    let score = payload
        .get("data")?
        .get("endpointReputation")?
        .get("score")?;
    match score {
        serde_json::Value::Number(n) => n.as_u64().map(|v| v.min(100) as u8),
        serde_json::Value::String(s) => s.parse::<u64>().ok().map(|v| v.min(100) as u8),
        _ => None,
    }
}

/// Pull the transaction hash out of a ledger submission response.
fn parse_tx_hash(payload: &serde_json::Value) -> Option<String> {
    payload
        .get("txHash")
        .or_else(|| payload.get("transactionHash"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

// ---------------------------------------------------------------------------
// IPFS uploads
// ---------------------------------------------------------------------------

/// Minimal client for the IPFS HTTP API `add` endpoint.
pub struct IpfsClient {
    client: reqwest::Client,
    api_url: String,
}

impl IpfsClient {
    /// Create a client against an IPFS HTTP API base URL.
    pub fn new(api_url: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| Pag0Error::Config(format!("failed to build IPFS client: {e}")))?;
        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
        })
    }

    /// Upload a document and return its CID.
    pub async fn add(&self, name: &str, bytes: Vec<u8>) -> Result<String> {
        let part = reqwest::multipart::Part::bytes(bytes).file_name(name.to_string());
        let form = reqwest::multipart::Form::new().part("file", part);

        let url = format!("{}/api/v0/add", self.api_url);
        let response = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| Pag0Error::Ledger(format!("IPFS add failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Pag0Error::Ledger(format!(
                "IPFS add returned HTTP {}",
                response.status()
            )));
        }
        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Pag0Error::Ledger(format!("IPFS response is not JSON: {e}")))?;
        payload
            .get("Hash")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| Pag0Error::Ledger("IPFS response carried no Hash".to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
