//! Audit trail: payment feedback, proof uploads, and the retry queue.
//!
//! After every settled paid call the proxy derives a quality score, uploads
//! a metadata document to IPFS as the proof reference, and submits the
//! resulting feedback event to the reputation ledger. Submission failures
//! land in a bounded in-memory retry queue processed by a background
//! worker; entries that keep failing are dropped after a fixed number of
//! retries, and whatever is still queued gets one last attempt when the
//! worker is cancelled at shutdown.
//!
//! Nothing in this module gates the request pipeline. The ledger is the
//! only required dependency; without an IPFS API the proof CID is empty.

use chrono::Utc;
use pag0_core::{
    Amount, AuditConfig, AuditFeedback, FeedbackEvent, ReputationLedger, ValidationRequest,
};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::onchain::IpfsClient;

/// Maximum queued feedback events; the oldest is dropped beyond this.
const QUEUE_CAP: usize = 100;
/// Failed retries before an event is dropped for good.
const MAX_RETRIES: u32 = 3;

struct QueuedFeedback {
    event: FeedbackEvent,
    retries: u32,
    next_attempt: Instant,
}

// ---------------------------------------------------------------------------
// AuditTrail
// ---------------------------------------------------------------------------

/// Submits payment feedback to the reputation ledger.
pub struct AuditTrail {
    ledger: Arc<dyn ReputationLedger>,
    ipfs: Option<IpfsClient>,
    agent_address: Option<String>,
    config: AuditConfig,
    queue: Mutex<VecDeque<QueuedFeedback>>,
}

impl AuditTrail {
    /// Create an audit trail over a ledger client.
    pub fn new(
        config: AuditConfig,
        ledger: Arc<dyn ReputationLedger>,
        ipfs: Option<IpfsClient>,
    ) -> Self {
        Self {
            ledger,
            ipfs,
            agent_address: config.agent_address.clone(),
            config,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Record feedback for a settled paid call.
    ///
    /// Builds the metadata document, uploads it as proof (best effort),
    /// and submits the event. A failed submission is queued for retry.
    pub async fn record_payment_feedback(&self, feedback: AuditFeedback) {
        let document = self.metadata_document(&feedback);
        let integrity_hash = sha256_hex(document.to_string().as_bytes());
        let proof_cid = self.upload_proof(&feedback, &document).await;

        let event = FeedbackEvent {
            quality_score: quality_score(feedback.status_code, feedback.latency_ms),
            feedback,
            proof_cid,
            integrity_hash,
        };

        match self.ledger.submit_feedback(&event).await {
            Ok(tx_hash) => {
                debug!(
                    endpoint = %event.feedback.endpoint,
                    tx_hash,
                    quality = event.quality_score,
                    "Payment feedback submitted"
                );
            }
            Err(e) => {
                warn!(
                    endpoint = %event.feedback.endpoint,
                    error = %e,
                    "Feedback submission failed, queuing for retry"
                );
                self.enqueue(event, 0);
            }
        }
    }

    /// Pre-flight validation for a high-cost call. Failures are logged and
    /// never block the request.
    pub async fn request_validation(&self, agent_id: &str, endpoint: &str, amount: Amount) {
        let request = ValidationRequest {
            agent_id: agent_id.to_string(),
            endpoint: endpoint.to_string(),
            amount,
        };
        if let Err(e) = self.ledger.request_validation(&request).await {
            warn!(endpoint, %amount, error = %e, "Pre-flight validation failed");
        }
    }

    /// Process the retry queue until cancelled.
    pub async fn run_retry_worker(self: Arc<Self>, token: CancellationToken) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.retry_interval_secs.max(1)));
        info!(
            interval_secs = self.config.retry_interval_secs,
            "Audit retry worker started"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.process_due().await;
                }
                _ = token.cancelled() => {
                    let pending = self.queue_len();
                    if pending > 0 {
                        info!(pending, "Flushing audit retry queue before shutdown");
                        self.flush_pending().await;
                    }
                    info!("Audit retry worker stopped");
                    return;
                }
            }
        }
    }

    /// Retry every queued event whose backoff has elapsed.
    pub(crate) async fn process_due(&self) {
        let now = Instant::now();
        let due: Vec<QueuedFeedback> = {
            let mut queue = match self.queue.lock() {
                Ok(q) => q,
                Err(poisoned) => poisoned.into_inner(),
            };
            let mut due = Vec::new();
            let mut remaining = VecDeque::with_capacity(queue.len());
            for entry in queue.drain(..) {
                if entry.next_attempt <= now {
                    due.push(entry);
                } else {
                    remaining.push_back(entry);
                }
            }
            *queue = remaining;
            due
        };

        for entry in due {
            match self.ledger.submit_feedback(&entry.event).await {
                Ok(tx_hash) => {
                    debug!(
                        endpoint = %entry.event.feedback.endpoint,
                        tx_hash,
                        retries = entry.retries,
                        "Queued feedback submitted"
                    );
                }
                Err(e) => {
                    let retries = entry.retries + 1;
                    if retries >= MAX_RETRIES {
                        error!(
                            endpoint = %entry.event.feedback.endpoint,
                            retries,
                            error = %e,
                            "Feedback dropped after repeated submission failures"
                        );
                    } else {
                        self.enqueue(entry.event, retries);
                    }
                }
            }
        }
    }

    /// Give every queued event one final submission attempt, ignoring
    /// backoff. Runs when the retry worker is cancelled; an event that
    /// still fails here is lost, since no worker remains to retry it.
    async fn flush_pending(&self) {
        let pending: Vec<QueuedFeedback> = {
            let mut queue = match self.queue.lock() {
                Ok(q) => q,
                Err(poisoned) => poisoned.into_inner(),
            };
            queue.drain(..).collect()
        };
        for entry in pending {
            if let Err(e) = self.ledger.submit_feedback(&entry.event).await {
                warn!(
                    endpoint = %entry.event.feedback.endpoint,
                    error = %e,
                    "Feedback lost at shutdown"
                );
            }
        }
    }

    /// Number of events waiting for retry.
    pub fn queue_len(&self) -> usize {
        match self.queue.lock() {
            Ok(q) => q.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    fn enqueue(&self, event: FeedbackEvent, retries: u32) {
        let delay = Duration::from_millis(
            self.config
                .retry_base_delay_ms
                .saturating_mul(u64::from(retries) + 1),
        );
        let mut queue = match self.queue.lock() {
            Ok(q) => q,
            Err(poisoned) => poisoned.into_inner(),
        };
        if queue.len() >= QUEUE_CAP {
            if let Some(dropped) = queue.pop_front() {
                warn!(
                    endpoint = %dropped.event.feedback.endpoint,
                    "Retry queue full, dropping oldest feedback event"
                );
            }
        }
        queue.push_back(QueuedFeedback {
            event,
            retries,
            next_attempt: Instant::now() + delay,
        });
    }

    fn metadata_document(&self, feedback: &AuditFeedback) -> serde_json::Value {
        serde_json::json!({
            "feedback": feedback,
            "agent": self.agent_address,
            "recordedAt": Utc::now().to_rfc3339(),
        })
    }

    async fn upload_proof(&self, feedback: &AuditFeedback, document: &serde_json::Value) -> String {
        let Some(ipfs) = &self.ipfs else {
            return String::new();
        };
        let name = format!("pag0-feedback-{}.json", feedback.endpoint);
        match ipfs.add(&name, document.to_string().into_bytes()).await {
            Ok(cid) => cid,
            Err(e) => {
                warn!(endpoint = %feedback.endpoint, error = %e, "Proof upload failed");
                String::new()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Quality scoring
// ---------------------------------------------------------------------------

/// Quality score for a completed call, from its status and latency.
///
/// Successful calls grade on latency bands; any non-2xx scores 10.
#[must_use]
pub fn quality_score(status: u16, latency_ms: u64) -> u8 {
    if !(200..300).contains(&status) {
        return 10;
    }
    match latency_ms {
        0..=199 => 100,
        200..=499 => 85,
        500..=999 => 70,
        1000..=2999 => 50,
        _ => 30,
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    use std::fmt::Write as _;
    digest.iter().fold(String::with_capacity(64), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
