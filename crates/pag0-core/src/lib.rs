//! Core types, traits, and errors for pag0
//!
//! This crate contains the foundational types shared across all pag0
//! components: the exact-integer monetary [`Amount`], spend policies and
//! their evaluation results, endpoint quality scores, x402 payment-protocol
//! types, configuration, and the storage/ledger abstraction traits.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Monetary amounts
// ---------------------------------------------------------------------------

/// An exact monetary amount in fixed-decimal units (6 decimals, e.g. USDC
/// base units).
///
/// Serialized to/from decimal strings for wire compatibility with BigInt
/// callers. All arithmetic is checked integer arithmetic; floating point is
/// never used on a spend path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Amount(u128);

impl Amount {
    /// The zero amount.
    pub const ZERO: Amount = Amount(0);

    /// Number of decimal places in the base unit.
    pub const DECIMALS: u32 = 6;

    /// Construct from raw base units (e.g. micro-dollars).
    #[must_use]
    pub const fn from_units(units: u128) -> Self {
        Self(units)
    }

    /// Raw base units.
    #[must_use]
    pub const fn units(&self) -> u128 {
        self.0
    }

    /// Checked addition; `None` on overflow.
    #[must_use]
    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    /// Subtraction clamped at zero.
    #[must_use]
    pub fn saturating_sub(self, other: Amount) -> Amount {
        Amount(self.0.saturating_sub(other.0))
    }

    /// True if this is the zero amount.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Convert to a signed 64-bit value for store counters (Redis INCRBY,
    /// SQLite INTEGER are signed 64-bit). `None` if the amount does not fit.
    #[must_use]
    pub fn to_i64(&self) -> Option<i64> {
        i64::try_from(self.0).ok()
    }

    /// Construct from a non-negative signed 64-bit store counter value.
    #[must_use]
    pub fn from_i64(value: i64) -> Amount {
        Amount(u128::try_from(value.max(0)).unwrap_or(0))
    }

    /// Lossy conversion to f64, for scoring ratios only — never for spend
    /// accounting.
    #[must_use]
    pub fn as_f64_lossy(&self) -> f64 {
        self.0 as f64
    }
}

impl std::fmt::Display for Amount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for Amount {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err("empty amount".to_string());
        }
        trimmed
            .parse::<u128>()
            .map(Amount)
            .map_err(|e| format!("invalid amount '{s}': {e}"))
    }
}

impl Serialize for Amount {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct AmountVisitor;

        impl serde::de::Visitor<'_> for AmountVisitor {
            type Value = Amount;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a decimal-string or non-negative integer amount")
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> std::result::Result<Amount, E> {
                v.parse().map_err(E::custom)
            }

            fn visit_u64<E: serde::de::Error>(self, v: u64) -> std::result::Result<Amount, E> {
                Ok(Amount(u128::from(v)))
            }

            fn visit_i64<E: serde::de::Error>(self, v: i64) -> std::result::Result<Amount, E> {
                if v < 0 {
                    return Err(E::custom("amount cannot be negative"));
                }
                Ok(Amount(v as u128))
            }
        }

        deserializer.deserialize_any(AmountVisitor)
    }
}

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

/// A spend policy for a project.
///
/// At most one policy per project is active at any time; activating a policy
/// deactivates all others for that project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    /// Unique policy identifier.
    pub id: Uuid,
    /// Project this policy applies to.
    pub project_id: String,
    /// Human-readable policy name.
    pub name: String,
    /// Maximum spend on a single request.
    pub max_per_request: Amount,
    /// Maximum spend per UTC day.
    pub daily_budget: Amount,
    /// Maximum spend per UTC month.
    pub monthly_budget: Amount,
    /// Hostname whitelist patterns (empty = allow all, subject to the
    /// block list). Supports `*` wildcards.
    pub allowed_endpoints: Vec<String>,
    /// Hostname blacklist patterns. Supports `*` wildcards.
    pub blocked_endpoints: Vec<String>,
    /// Whether this policy is the active one for its project.
    pub is_active: bool,
    /// When the policy was created.
    pub created_at: DateTime<Utc>,
    /// When the policy was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Policy {
    /// Create a new inactive policy with the given limits.
    pub fn new(
        project_id: impl Into<String>,
        name: impl Into<String>,
        max_per_request: Amount,
        daily_budget: Amount,
        monthly_budget: Amount,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            project_id: project_id.into(),
            name: name.into(),
            max_per_request,
            daily_budget,
            monthly_budget,
            allowed_endpoints: Vec::new(),
            blocked_endpoints: Vec::new(),
            is_active: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Validate the limit ordering invariant
    /// `max_per_request ≤ daily_budget ≤ monthly_budget`.
    ///
    /// Enforced at creation/update time, not at evaluation time.
    pub fn validate(&self) -> Result<()> {
        if self.max_per_request > self.daily_budget {
            return Err(Pag0Error::Config(format!(
                "policy '{}': max_per_request ({}) exceeds daily_budget ({})",
                self.name, self.max_per_request, self.daily_budget
            )));
        }
        if self.daily_budget > self.monthly_budget {
            return Err(Pag0Error::Config(format!(
                "policy '{}': daily_budget ({}) exceeds monthly_budget ({})",
                self.name, self.daily_budget, self.monthly_budget
            )));
        }
        Ok(())
    }

    /// Synthetic unlimited policy used when a project has no active policy.
    #[must_use]
    pub fn unrestricted(project_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::nil(),
            project_id: project_id.to_string(),
            name: "unrestricted".to_string(),
            max_per_request: Amount::from_units(u128::MAX),
            daily_budget: Amount::from_units(u128::MAX),
            monthly_budget: Amount::from_units(u128::MAX),
            allowed_endpoints: Vec::new(),
            blocked_endpoints: Vec::new(),
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// True if this is the synthetic unrestricted policy.
    #[must_use]
    pub fn is_unrestricted(&self) -> bool {
        self.id.is_nil()
    }
}

/// Machine-readable reason code for a policy denial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PolicyReason {
    /// Target hostname matched a blocked-endpoint pattern.
    EndpointBlocked,
    /// A whitelist exists and the target hostname matched none of it.
    EndpointNotWhitelisted,
    /// Estimated cost exceeds the per-request limit.
    PerRequestLimitExceeded,
    /// Estimated cost would push daily spend over the daily budget.
    DailyBudgetExceeded,
    /// Estimated cost would push monthly spend over the monthly budget.
    MonthlyBudgetExceeded,
}

impl std::fmt::Display for PolicyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::EndpointBlocked => "ENDPOINT_BLOCKED",
            Self::EndpointNotWhitelisted => "ENDPOINT_NOT_WHITELISTED",
            Self::PerRequestLimitExceeded => "PER_REQUEST_LIMIT_EXCEEDED",
            Self::DailyBudgetExceeded => "DAILY_BUDGET_EXCEEDED",
            Self::MonthlyBudgetExceeded => "MONTHLY_BUDGET_EXCEEDED",
        };
        f.write_str(s)
    }
}

/// Result of evaluating a request against the active policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDecision {
    /// Whether the request is allowed to proceed.
    pub allowed: bool,
    /// The policy that was evaluated (synthetic "unrestricted" when the
    /// project has no active policy).
    pub policy: Policy,
    /// Denial reason code (`None` when allowed).
    pub reason: Option<PolicyReason>,
    /// Additional denial context (limits, current spend).
    pub details: Option<serde_json::Value>,
}

impl PolicyDecision {
    /// An allow decision for the given policy.
    #[must_use]
    pub fn allow(policy: Policy) -> Self {
        Self {
            allowed: true,
            policy,
            reason: None,
            details: None,
        }
    }

    /// A deny decision with a reason code and context.
    #[must_use]
    pub fn deny(policy: Policy, reason: PolicyReason, details: serde_json::Value) -> Self {
        Self {
            allowed: false,
            policy,
            reason: Some(reason),
            details: Some(details),
        }
    }
}

// ---------------------------------------------------------------------------
// Budgets
// ---------------------------------------------------------------------------

/// Cumulative durable spend totals for a project.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BudgetTotals {
    /// Accumulated daily spend.
    pub daily_spent: Amount,
    /// Accumulated monthly spend.
    pub monthly_spent: Amount,
}

/// Current budget state for a project, with the active policy's limits
/// overlaid (`None` limit = unlimited).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    /// Spend so far in the current UTC day.
    pub daily_spent: Amount,
    /// Daily limit from the active policy, if any.
    pub daily_limit: Option<Amount>,
    /// Spend so far in the current UTC month.
    pub monthly_spent: Amount,
    /// Monthly limit from the active policy, if any.
    pub monthly_limit: Option<Amount>,
}

impl BudgetSnapshot {
    /// Remaining daily budget (`None` = unlimited).
    #[must_use]
    pub fn daily_remaining(&self) -> Option<Amount> {
        self.daily_limit.map(|l| l.saturating_sub(self.daily_spent))
    }

    /// Remaining monthly budget (`None` = unlimited).
    #[must_use]
    pub fn monthly_remaining(&self) -> Option<Amount> {
        self.monthly_limit
            .map(|l| l.saturating_sub(self.monthly_spent))
    }
}

// ---------------------------------------------------------------------------
// Endpoint scores (curation)
// ---------------------------------------------------------------------------

/// Weights applied to the four score dimensions when computing the overall
/// score. Should sum to 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreWeights {
    /// Weight of the cost dimension.
    pub cost: f64,
    /// Weight of the latency dimension.
    pub latency: f64,
    /// Weight of the reliability dimension.
    pub reliability: f64,
    /// Weight of the on-chain reputation dimension.
    pub reputation: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            cost: 0.3,
            latency: 0.25,
            reliability: 0.25,
            reputation: 0.2,
        }
    }
}

/// Observed evidence backing a score.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScoreEvidence {
    /// Number of live requests in the evidence window.
    pub sample_size: u64,
    /// Human-readable evidence window (e.g. "30d").
    pub period: String,
    /// Mean cost per request over the window.
    pub avg_cost_per_request: Amount,
    /// p95 latency over the window, in milliseconds.
    pub avg_latency_ms: u64,
    /// Fraction of requests with 2xx/3xx status (0.0–1.0).
    pub success_rate: f64,
}

/// Quality score for a single upstream endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointScore {
    /// Endpoint hostname (e.g. `api.example.com`).
    pub endpoint: String,
    /// Category the endpoint belongs to (e.g. "weather", "search").
    pub category: String,
    /// Weighted overall score, 0–100.
    pub overall_score: u8,
    /// Cost-relative-to-benchmark score, 0–100.
    pub cost_score: u8,
    /// Latency-relative-to-benchmark score, 0–100.
    pub latency_score: u8,
    /// Success-rate score, 0–100.
    pub reliability_score: u8,
    /// On-chain reputation score, 0–100 (50 when unavailable).
    pub reputation_score: u8,
    /// Total samples: persisted seed baseline plus live request counts.
    pub sample_size: u64,
    /// Dimension weights used for the overall score.
    pub weights: ScoreWeights,
    /// The observed evidence this score was computed from.
    pub evidence: ScoreEvidence,
    /// Known resources (paths) served by this endpoint.
    pub resources: Vec<String>,
    /// When the score was last refreshed.
    pub updated_at: DateTime<Utc>,
}

/// Sort key for score rankings and recommendations.
///
/// Mapped to a column name through an explicit lookup — caller input is
/// never interpolated into SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortBy {
    /// Order by the weighted overall score.
    #[default]
    Overall,
    /// Order by the cost score.
    Cost,
    /// Order by the latency score.
    Latency,
    /// Order by the reliability score.
    Reliability,
    /// Order by the reputation score.
    Reputation,
}

impl SortBy {
    /// The score column this sort key maps to.
    #[must_use]
    pub fn column(self) -> &'static str {
        match self {
            Self::Overall => "overall_score",
            Self::Cost => "cost_score",
            Self::Latency => "latency_score",
            Self::Reliability => "reliability_score",
            Self::Reputation => "reputation_score",
        }
    }
}

/// Category-wide benchmark averages used as score denominators.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CategoryBenchmarks {
    /// Average cost per request across scored endpoints in the category.
    pub avg_cost: f64,
    /// Average p95 latency across scored endpoints in the category, ms.
    pub avg_latency_ms: f64,
}

/// Winner per dimension when comparing endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonWinners {
    /// Endpoint with the highest overall score.
    pub overall: String,
    /// Endpoint with the highest cost score.
    pub cost: String,
    /// Endpoint with the highest latency score.
    pub latency: String,
    /// Endpoint with the highest reliability score.
    pub reliability: String,
}

/// Min/max spread of a score dimension across compared endpoints.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScoreRange {
    /// Lowest value across the compared endpoints.
    pub min: u8,
    /// Highest value across the compared endpoints.
    pub max: u8,
}

/// Result of comparing 2–5 endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointComparison {
    /// The scores of the compared endpoints, in request order.
    pub endpoints: Vec<EndpointScore>,
    /// Winner per dimension (ties go to the earlier endpoint).
    pub winner: ComparisonWinners,
    /// Per-dimension spreads.
    pub differences: ComparisonDifferences,
}

/// Per-dimension min/max spreads for a comparison.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonDifferences {
    /// Overall score spread.
    pub overall: ScoreRange,
    /// Cost score spread.
    pub cost: ScoreRange,
    /// Latency score spread.
    pub latency: ScoreRange,
    /// Reliability score spread.
    pub reliability: ScoreRange,
}

// ---------------------------------------------------------------------------
// x402 payment-protocol types
// ---------------------------------------------------------------------------

/// Payment terms parsed from an upstream 402 challenge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentInfo {
    /// Maximum amount the upstream will charge, in base units.
    pub max_amount_required: Amount,
    /// The resource being paid for (usually the request URL).
    pub resource: String,
    /// Payment scheme identifier (e.g. "exact").
    pub scheme: String,
    /// Settlement network identifier (e.g. "base-sepolia").
    pub network: String,
    /// Human-readable description of the charge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Recipient address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pay_to: Option<String>,
    /// Seconds the challenge remains valid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_timeout_seconds: Option<u64>,
    /// Asset contract address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset: Option<String>,
    /// Scheme-specific extension data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

/// A caller-supplied signed payment proof.
///
/// The proxy never inspects or verifies the signature — it only extracts a
/// replay key and an estimated amount, then relays the proof upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedPayment(pub serde_json::Value);

impl SignedPayment {
    /// The payment's unique nonce, used for replay protection.
    ///
    /// Looks for a top-level `nonce`, then `payload.authorization.nonce`,
    /// then a top-level `signature`. Absent all three, the caller should
    /// hash the canonical JSON instead.
    #[must_use]
    pub fn nonce(&self) -> Option<&str> {
        self.0
            .get("nonce")
            .or_else(|| {
                self.0
                    .get("payload")
                    .and_then(|p| p.get("authorization"))
                    .and_then(|a| a.get("nonce"))
            })
            .or_else(|| self.0.get("signature"))
            .and_then(|v| v.as_str())
    }

    /// The committed payment amount, used as the pre-forward cost estimate.
    ///
    /// Looks for `payload.authorization.value`, then top-level `value`,
    /// then `maxAmountRequired`.
    #[must_use]
    pub fn amount(&self) -> Option<Amount> {
        let candidate = self
            .0
            .get("payload")
            .and_then(|p| p.get("authorization"))
            .and_then(|a| a.get("value"))
            .or_else(|| self.0.get("value"))
            .or_else(|| self.0.get("maxAmountRequired"))?;
        match candidate {
            serde_json::Value::String(s) => s.parse().ok(),
            serde_json::Value::Number(n) => n.as_u64().map(|v| Amount::from_units(u128::from(v))),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Audit feedback
// ---------------------------------------------------------------------------

/// A payment-feedback event submitted to the reputation ledger after a
/// completed paid call. Ephemeral — never persisted beyond process memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditFeedback {
    /// The agent/project that made the call.
    pub agent_id: String,
    /// Upstream endpoint hostname.
    pub endpoint: String,
    /// Settled cost of the call.
    pub cost: Amount,
    /// Observed end-to-end latency in milliseconds.
    pub latency_ms: u64,
    /// Upstream HTTP status code.
    pub status_code: u16,
    /// Settlement transaction hash, when known.
    pub tx_hash: Option<String>,
    /// Payment sender address.
    pub sender: Option<String>,
    /// Payment receiver address.
    pub receiver: Option<String>,
}

/// An [`AuditFeedback`] enriched with the derived fields the ledger
/// records: the quality score, the content-addressed proof reference, and
/// the integrity hash of the metadata document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackEvent {
    /// The underlying feedback.
    pub feedback: AuditFeedback,
    /// Quality score (0–100) derived from latency and status.
    pub quality_score: u8,
    /// CID of the uploaded metadata document (empty when the upload
    /// failed or was disabled).
    pub proof_cid: String,
    /// Hex sha256 of the metadata document.
    pub integrity_hash: String,
}

/// A pre-flight validation request for a high-cost call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationRequest {
    /// The agent/project requesting validation.
    pub agent_id: String,
    /// Upstream endpoint hostname.
    pub endpoint: String,
    /// The amount about to be committed.
    pub amount: Amount,
}

// ---------------------------------------------------------------------------
// Analytics records
// ---------------------------------------------------------------------------

/// One row in the durable request log. Feeds curation's trailing-30-day
/// aggregates and operator analytics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    /// Unique record identifier.
    pub id: Uuid,
    /// Project that made the request.
    pub project_id: String,
    /// Upstream endpoint hostname.
    pub endpoint: String,
    /// HTTP method.
    pub method: String,
    /// Full target URL.
    pub url: String,
    /// Upstream (or cached) status code.
    pub status_code: u16,
    /// Settled cost of the request.
    pub cost: Amount,
    /// End-to-end latency in milliseconds.
    pub latency_ms: u64,
    /// Whether the response was served from cache.
    pub cached: bool,
    /// When the request completed.
    pub created_at: DateTime<Utc>,
}

/// Trailing-window aggregates for a single endpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct EndpointAggregates {
    /// Number of requests in the window.
    pub request_count: u64,
    /// Mean cost per request.
    pub avg_cost: Amount,
    /// p95 latency in milliseconds.
    pub p95_latency_ms: u64,
    /// Fraction of requests with status < 400 (0.0–1.0).
    pub success_rate: f64,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Top-level pag0 configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pag0Config {
    /// Address and port to bind the proxy server to.
    pub listen_addr: String,
    /// Upstream request timeout in milliseconds. Callers should configure
    /// their own client timeout above this value.
    pub timeout_ms: u64,
    /// Upstream connection timeout in milliseconds.
    pub connection_timeout_ms: u64,
    /// Maximum inbound request body size in bytes.
    pub max_request_size_bytes: u64,
    /// Storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Response cache configuration.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Curation engine configuration.
    #[serde(default)]
    pub curation: CurationConfig,
    /// Audit trail configuration.
    #[serde(default)]
    pub audit: AuditConfig,
    /// Subgraph reputation-lookup configuration.
    #[serde(default)]
    pub subgraph: SubgraphConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Graceful shutdown configuration.
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

impl Default for Pag0Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8402".to_string(),
            timeout_ms: 30_000,
            connection_timeout_ms: 5_000,
            max_request_size_bytes: 10 * 1024 * 1024,
            storage: StorageConfig::default(),
            cache: CacheConfig::default(),
            curation: CurationConfig::default(),
            audit: AuditConfig::default(),
            subgraph: SubgraphConfig::default(),
            logging: LoggingConfig::default(),
            shutdown: ShutdownConfig::default(),
        }
    }
}

/// Storage configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Storage profile: `"memory"` (in-process), `"lite"` (SQLite +
    /// in-memory fast store), or `"production"` (SQLite + Redis).
    #[serde(default = "default_storage_profile")]
    pub profile: String,
    /// SQLite database path (lite/production profiles).
    #[serde(default = "default_database_path")]
    pub database_path: String,
    /// Redis connection URL (production profile).
    #[serde(default)]
    pub redis_url: Option<String>,
}

fn default_storage_profile() -> String {
    "lite".to_string()
}

fn default_database_path() -> String {
    "pag0.db".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            profile: default_storage_profile(),
            database_path: default_database_path(),
            redis_url: None,
        }
    }
}

/// A pattern-to-TTL cache rule. Rules are checked in declaration order and
/// the first match wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheTtlRule {
    /// URL pattern (`*` wildcards).
    pub pattern: String,
    /// TTL in seconds for matching URLs.
    pub ttl_secs: u64,
}

/// Response cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Default TTL in seconds when no rule matches.
    #[serde(default = "default_cache_ttl")]
    pub default_ttl_secs: u64,
    /// Maximum serialized body size to cache, in bytes.
    #[serde(default = "default_cache_max_body")]
    pub max_body_bytes: usize,
    /// Pattern-based TTL overrides, first match wins.
    #[serde(default)]
    pub ttl_rules: Vec<CacheTtlRule>,
    /// URL patterns that are never cached, regardless of TTL rules.
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
}

fn default_cache_ttl() -> u64 {
    300
}

fn default_cache_max_body() -> usize {
    1024 * 1024
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_cache_ttl(),
            max_body_bytes: default_cache_max_body(),
            ttl_rules: Vec::new(),
            exclude_patterns: Vec::new(),
        }
    }
}

/// Curation engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurationConfig {
    /// Dimension weights for the overall score.
    #[serde(default)]
    pub weights: ScoreWeights,
    /// Fallback benchmark cost per request (base units) when a category has
    /// no computed benchmark yet.
    #[serde(default = "default_benchmark_cost")]
    pub benchmark_cost: Amount,
    /// Fallback benchmark p95 latency (ms) when a category has no computed
    /// benchmark yet.
    #[serde(default = "default_benchmark_latency_ms")]
    pub benchmark_latency_ms: u64,
    /// TTL in seconds for fast-store-cached scores.
    #[serde(default = "default_score_cache_ttl")]
    pub score_cache_ttl_secs: u64,
    /// Evidence window in days.
    #[serde(default = "default_evidence_window_days")]
    pub evidence_window_days: i64,
}

fn default_benchmark_cost() -> Amount {
    Amount::from_units(500_000)
}

fn default_benchmark_latency_ms() -> u64 {
    1_000
}

fn default_score_cache_ttl() -> u64 {
    60
}

fn default_evidence_window_days() -> i64 {
    30
}

impl Default for CurationConfig {
    fn default() -> Self {
        Self {
            weights: ScoreWeights::default(),
            benchmark_cost: default_benchmark_cost(),
            benchmark_latency_ms: default_benchmark_latency_ms(),
            score_cache_ttl_secs: default_score_cache_ttl(),
            evidence_window_days: default_evidence_window_days(),
        }
    }
}

/// Audit trail configuration. Absent a ledger URL the subsystem is
/// disabled and the request pipeline is unaffected.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Reputation-ledger submission endpoint (`None` disables auditing).
    #[serde(default)]
    pub ledger_url: Option<String>,
    /// Address the proxy submits feedback as.
    #[serde(default)]
    pub agent_address: Option<String>,
    /// IPFS HTTP API base URL for proof uploads (`None` skips uploads).
    #[serde(default)]
    pub ipfs_api_url: Option<String>,
    /// Retry-queue processing interval in seconds.
    #[serde(default = "default_audit_interval")]
    pub retry_interval_secs: u64,
    /// Base retry delay in milliseconds (scaled by `retries + 1`).
    #[serde(default = "default_audit_base_delay")]
    pub retry_base_delay_ms: u64,
}

fn default_audit_interval() -> u64 {
    30
}

fn default_audit_base_delay() -> u64 {
    5_000
}

/// Subgraph reputation-lookup configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubgraphConfig {
    /// GraphQL endpoint URL (`None` disables reputation lookups).
    #[serde(default)]
    pub url: Option<String>,
    /// TTL in seconds for cached reputation values.
    #[serde(default = "default_reputation_cache_ttl")]
    pub cache_ttl_secs: u64,
}

fn default_reputation_cache_ttl() -> u64 {
    300
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format: `text` (human-readable) or `json` (structured).
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Graceful shutdown configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// Maximum seconds to wait for in-flight background tasks after a
    /// shutdown signal.
    #[serde(default = "default_shutdown_timeout")]
    pub timeout_seconds: u64,
}

fn default_shutdown_timeout() -> u64 {
    30
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_shutdown_timeout(),
        }
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Core error taxonomy.
///
/// `Storage` is the degradable class: cache and analytics call sites swallow
/// it. `BudgetStore` gates financial correctness and always propagates.
#[derive(thiserror::Error, Debug)]
pub enum Pag0Error {
    /// Denied by a business rule. Mapped to HTTP 403.
    #[error("Policy violation: {message}")]
    PolicyViolation {
        /// Machine-readable reason code.
        reason: PolicyReason,
        /// Human-readable explanation.
        message: String,
        /// Additional context (limits, current spend).
        details: Option<serde_json::Value>,
    },

    /// The same signed payment was presented twice. Aborts before any
    /// upstream charge.
    #[error("Replay attack: payment nonce has already been used")]
    ReplayAttack,

    /// Missing or invalid credentials. Mapped to HTTP 401.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Caller exceeded a request-rate limit. Mapped to HTTP 429.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Network/DNS failure reaching the upstream. Mapped to HTTP 502.
    #[error("Upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    /// A 402 response carried no parseable payment challenge. Fatal —
    /// no payment can proceed without it.
    #[error("Malformed payment challenge: {0}")]
    MalformedPaymentChallenge(String),

    /// Generic store failure (cache/analytics sites degrade instead of
    /// propagating this).
    #[error("Storage error: {0}")]
    Storage(String),

    /// Budget-store failure. Never swallowed.
    #[error("Budget store error: {0}")]
    BudgetStore(String),

    /// Curation failure (missing endpoints, bad comparison arity).
    #[error("Curation error: {0}")]
    Curation(String),

    /// Reputation ledger / IPFS failure.
    #[error("Ledger error: {0}")]
    Ledger(String),

    /// Serialization / deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed inbound request. Mapped to HTTP 400.
    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl Pag0Error {
    /// Stable machine-readable error code for the HTTP boundary.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::PolicyViolation { .. } => "POLICY_VIOLATION",
            Self::ReplayAttack => "REPLAY_ATTACK",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::RateLimited(_) => "RATE_LIMITED",
            Self::UpstreamUnreachable(_) => "UPSTREAM_UNREACHABLE",
            Self::MalformedPaymentChallenge(_) => "MALFORMED_PAYMENT_CHALLENGE",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::BudgetStore(_) => "BUDGET_STORE_ERROR",
            Self::Curation(_) => "CURATION_ERROR",
            Self::Ledger(_) => "LEDGER_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::BadRequest(_) => "BAD_REQUEST",
        }
    }
}

/// Convenience alias for `std::result::Result<T, Pag0Error>`.
pub type Result<T> = std::result::Result<T, Pag0Error>;

// ---------------------------------------------------------------------------
// Fast store trait (Redis / in-memory)
// ---------------------------------------------------------------------------

/// Low-latency shared key-value store: response cache entries, budget
/// counters, replay markers, cached scores.
///
/// Dev/Lite: in-memory `DashMap`. Production: Redis.
#[async_trait::async_trait]
pub trait FastStore: Send + Sync {
    /// Get a value by key.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Set a value with a TTL.
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;

    /// Atomically set a value only if the key is absent. Returns `true`
    /// when the key was created. This is the replay-prevention primitive —
    /// it must be a single atomic store operation.
    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool>;

    /// Atomically increment an integer counter, creating it at `delta` when
    /// absent. Returns the new value.
    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64>;

    /// Assign a TTL to a key only if it has none yet (lazy expiry on first
    /// counter creation).
    async fn expire_if_unset(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Remove a key.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Delete all keys matching a `*` glob pattern; returns the count
    /// removed. Implementations may use a non-incremental scan.
    async fn scan_delete(&self, pattern: &str) -> Result<u64>;

    /// Health check.
    async fn health_check(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Durable store traits (SQLite)
// ---------------------------------------------------------------------------

/// Policy persistence. Policies are written by external tooling and read
/// by the policy engine.
#[async_trait::async_trait]
pub trait PolicyStore: Send + Sync {
    /// Persist a new policy. Validates the limit-ordering invariant; when
    /// `is_active` is set, deactivates all other policies for the project.
    async fn create_policy(&self, policy: &Policy) -> Result<()>;

    /// Update an existing policy. Validates the limit-ordering invariant.
    async fn update_policy(&self, policy: &Policy) -> Result<()>;

    /// Activate one policy and deactivate all others for the project.
    async fn activate_policy(&self, project_id: &str, policy_id: Uuid) -> Result<()>;

    /// The currently active policy for a project, if any.
    async fn get_active_policy(&self, project_id: &str) -> Result<Option<Policy>>;

    /// All policies for a project.
    async fn list_policies(&self, project_id: &str) -> Result<Vec<Policy>>;

    /// Health check.
    async fn health_check(&self) -> Result<()>;
}

/// Durable budget mirror — the source of truth on restart, accumulated via
/// atomic add-on-conflict upserts.
#[async_trait::async_trait]
pub trait BudgetStore: Send + Sync {
    /// Atomically add spend to the project's cumulative totals.
    async fn add_spend(&self, project_id: &str, amount: Amount) -> Result<()>;

    /// The project's cumulative totals, if any spend was ever recorded.
    async fn get_totals(&self, project_id: &str) -> Result<Option<BudgetTotals>>;
}

/// Endpoint score persistence.
#[async_trait::async_trait]
pub trait ScoreStore: Send + Sync {
    /// Insert or overwrite an endpoint's score along with its seed sample
    /// baseline.
    async fn upsert_score(&self, score: &EndpointScore, seed_sample_size: u64) -> Result<()>;

    /// A single endpoint's persisted score.
    async fn get_score(&self, endpoint: &str) -> Result<Option<EndpointScore>>;

    /// The persisted seed baseline for an endpoint (0 when unscored).
    async fn get_seed_sample_size(&self, endpoint: &str) -> Result<u64>;

    /// Scores ordered descending by the chosen dimension.
    async fn list_scores(
        &self,
        category: Option<&str>,
        sort_by: SortBy,
        limit: u32,
    ) -> Result<Vec<EndpointScore>>;

    /// Category-wide benchmark averages, `None` when the category has no
    /// scored endpoints yet.
    async fn category_benchmarks(&self, category: &str) -> Result<Option<CategoryBenchmarks>>;
}

/// Durable request log powering curation evidence and analytics.
#[async_trait::async_trait]
pub trait AnalyticsStore: Send + Sync {
    /// Append a completed-request record.
    async fn record_request(&self, record: &RequestRecord) -> Result<()>;

    /// Aggregates for an endpoint since the given instant.
    async fn endpoint_aggregates(
        &self,
        endpoint: &str,
        since: DateTime<Utc>,
    ) -> Result<EndpointAggregates>;
}

// ---------------------------------------------------------------------------
// Reputation ledger trait (external collaborator)
// ---------------------------------------------------------------------------

/// Read/write access to the external reputation ledger and subgraph.
///
/// The proxy never signs transactions or runs a node; submission goes
/// through an external signer service and reads go through the subgraph.
#[async_trait::async_trait]
pub trait ReputationLedger: Send + Sync {
    /// Submit a payment-feedback event; returns the transaction hash.
    async fn submit_feedback(&self, event: &FeedbackEvent) -> Result<String>;

    /// Pre-flight validation for a high-cost call. Failures are logged by
    /// callers, never queued.
    async fn request_validation(&self, request: &ValidationRequest) -> Result<()>;

    /// Read-only reputation lookup (0–100), `None` when the endpoint has no
    /// on-chain history.
    async fn get_reputation(&self, endpoint: &str) -> Result<Option<u8>>;
}

// ---------------------------------------------------------------------------
// Composite storage
// ---------------------------------------------------------------------------

/// Composite storage wiring the fast store and the four durable concerns.
///
/// Consumers receive a single `Storage` value instead of managing five
/// separate `Arc<dyn …>` handles.
#[derive(Clone)]
pub struct Storage {
    /// Fast shared key-value store (cache, counters, replay markers).
    pub fast: Arc<dyn FastStore>,
    /// Policy persistence.
    pub policies: Arc<dyn PolicyStore>,
    /// Durable budget mirror.
    pub budgets: Arc<dyn BudgetStore>,
    /// Endpoint score persistence.
    pub scores: Arc<dyn ScoreStore>,
    /// Durable request log.
    pub analytics: Arc<dyn AnalyticsStore>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // -- Amount --------------------------------------------------------------

    #[test]
    fn test_amount_parse_and_display() {
        let a: Amount = "5000000".parse().unwrap();
        assert_eq!(a.units(), 5_000_000);
        assert_eq!(a.to_string(), "5000000");
    }

    #[test]
    fn test_amount_parse_rejects_garbage() {
        assert!("".parse::<Amount>().is_err());
        assert!("-5".parse::<Amount>().is_err());
        assert!("1.5".parse::<Amount>().is_err());
        assert!("abc".parse::<Amount>().is_err());
    }

    #[test]
    fn test_amount_serde_decimal_string() {
        let a = Amount::from_units(1_000_000);
        let json = serde_json::to_string(&a).unwrap();
        assert_eq!(json, "\"1000000\"");

        let back: Amount = serde_json::from_str("\"1000000\"").unwrap();
        assert_eq!(back, a);
    }

    #[test]
    fn test_amount_deserialize_from_integer() {
        let a: Amount = serde_json::from_str("42").unwrap();
        assert_eq!(a.units(), 42);
    }

    #[test]
    fn test_amount_deserialize_rejects_negative() {
        assert!(serde_json::from_str::<Amount>("-1").is_err());
    }

    #[test]
    fn test_amount_exceeds_64_bits() {
        let big = "340282366920938463463374607431768211455"; // u128::MAX
        let a: Amount = big.parse().unwrap();
        assert_eq!(a.units(), u128::MAX);
        assert!(a.to_i64().is_none());
    }

    #[test]
    fn test_amount_checked_add_overflow() {
        let max = Amount::from_units(u128::MAX);
        assert!(max.checked_add(Amount::from_units(1)).is_none());
        assert_eq!(
            Amount::from_units(1).checked_add(Amount::from_units(2)),
            Some(Amount::from_units(3))
        );
    }

    #[test]
    fn test_amount_saturating_sub() {
        let a = Amount::from_units(5);
        assert_eq!(a.saturating_sub(Amount::from_units(10)), Amount::ZERO);
        assert_eq!(a.saturating_sub(Amount::from_units(3)), Amount::from_units(2));
    }

    #[test]
    fn test_amount_i64_roundtrip() {
        let a = Amount::from_units(9_000_000);
        assert_eq!(Amount::from_i64(a.to_i64().unwrap()), a);
    }

    // -- Policy --------------------------------------------------------------

    #[test]
    fn test_policy_validate_ordering_ok() {
        let p = Policy::new(
            "proj",
            "default",
            Amount::from_units(1_000_000),
            Amount::from_units(10_000_000),
            Amount::from_units(100_000_000),
        );
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_policy_validate_per_request_above_daily() {
        let p = Policy::new(
            "proj",
            "bad",
            Amount::from_units(20_000_000),
            Amount::from_units(10_000_000),
            Amount::from_units(100_000_000),
        );
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_policy_validate_daily_above_monthly() {
        let p = Policy::new(
            "proj",
            "bad",
            Amount::from_units(1_000_000),
            Amount::from_units(200_000_000),
            Amount::from_units(100_000_000),
        );
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_unrestricted_policy() {
        let p = Policy::unrestricted("proj");
        assert!(p.is_unrestricted());
        assert!(p.is_active);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_policy_reason_codes() {
        assert_eq!(PolicyReason::EndpointBlocked.to_string(), "ENDPOINT_BLOCKED");
        assert_eq!(
            PolicyReason::DailyBudgetExceeded.to_string(),
            "DAILY_BUDGET_EXCEEDED"
        );
        let json = serde_json::to_string(&PolicyReason::EndpointNotWhitelisted).unwrap();
        assert_eq!(json, "\"ENDPOINT_NOT_WHITELISTED\"");
    }

    // -- Budget snapshot -----------------------------------------------------

    #[test]
    fn test_budget_snapshot_remaining() {
        let snap = BudgetSnapshot {
            daily_spent: Amount::from_units(9_000_000),
            daily_limit: Some(Amount::from_units(10_000_000)),
            monthly_spent: Amount::from_units(9_000_000),
            monthly_limit: None,
        };
        assert_eq!(snap.daily_remaining(), Some(Amount::from_units(1_000_000)));
        assert_eq!(snap.monthly_remaining(), None);
    }

    // -- SortBy --------------------------------------------------------------

    #[test]
    fn test_sort_by_column_lookup() {
        assert_eq!(SortBy::Overall.column(), "overall_score");
        assert_eq!(SortBy::Cost.column(), "cost_score");
        assert_eq!(SortBy::Latency.column(), "latency_score");
        assert_eq!(SortBy::Reliability.column(), "reliability_score");
        assert_eq!(SortBy::Reputation.column(), "reputation_score");
    }

    // -- PaymentInfo ---------------------------------------------------------

    #[test]
    fn test_payment_info_camel_case_wire_format() {
        let json = r#"{
            "maxAmountRequired": "1000000",
            "resource": "https://api.example.com/data",
            "scheme": "exact",
            "network": "base-sepolia",
            "payTo": "0xabc"
        }"#;
        let info: PaymentInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.max_amount_required, Amount::from_units(1_000_000));
        assert_eq!(info.scheme, "exact");
        assert_eq!(info.pay_to.as_deref(), Some("0xabc"));
        assert!(info.asset.is_none());
    }

    // -- SignedPayment -------------------------------------------------------

    #[test]
    fn test_signed_payment_nonce_top_level() {
        let p = SignedPayment(serde_json::json!({"nonce": "0x123"}));
        assert_eq!(p.nonce(), Some("0x123"));
    }

    #[test]
    fn test_signed_payment_nonce_nested() {
        let p = SignedPayment(serde_json::json!({
            "payload": {"authorization": {"nonce": "0xdeadbeef", "value": "2000000"}}
        }));
        assert_eq!(p.nonce(), Some("0xdeadbeef"));
        assert_eq!(p.amount(), Some(Amount::from_units(2_000_000)));
    }

    #[test]
    fn test_signed_payment_nonce_falls_back_to_signature() {
        let p = SignedPayment(serde_json::json!({"signature": "0xsig"}));
        assert_eq!(p.nonce(), Some("0xsig"));
    }

    #[test]
    fn test_signed_payment_missing_fields() {
        let p = SignedPayment(serde_json::json!({}));
        assert!(p.nonce().is_none());
        assert!(p.amount().is_none());
    }

    #[test]
    fn test_signed_payment_numeric_amount() {
        let p = SignedPayment(serde_json::json!({"value": 1500000}));
        assert_eq!(p.amount(), Some(Amount::from_units(1_500_000)));
    }

    // -- Errors --------------------------------------------------------------

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(Pag0Error::ReplayAttack.code(), "REPLAY_ATTACK");
        assert_eq!(
            Pag0Error::UpstreamUnreachable("dns".into()).code(),
            "UPSTREAM_UNREACHABLE"
        );
        assert_eq!(
            Pag0Error::PolicyViolation {
                reason: PolicyReason::EndpointBlocked,
                message: "blocked".into(),
                details: None,
            }
            .code(),
            "POLICY_VIOLATION"
        );
    }

    // -- Config defaults -----------------------------------------------------

    #[test]
    fn test_config_defaults() {
        let cfg = Pag0Config::default();
        assert_eq!(cfg.listen_addr, "0.0.0.0:8402");
        assert_eq!(cfg.storage.profile, "lite");
        assert_eq!(cfg.cache.default_ttl_secs, 300);
        assert_eq!(cfg.curation.benchmark_cost, Amount::from_units(500_000));
        assert!(cfg.audit.ledger_url.is_none());
        assert_eq!(cfg.shutdown.timeout_seconds, 30);
    }

    #[test]
    fn test_score_weights_default_sum_to_one() {
        let w = ScoreWeights::default();
        let sum = w.cost + w.latency + w.reliability + w.reputation;
        assert!((sum - 1.0).abs() < 1e-9);
    }
}
