//! Endpoint curation: scoring, rankings, and comparisons.
//!
//! Scores are computed from trailing-window request aggregates against
//! category benchmarks, blended with on-chain reputation. An endpoint with
//! no observed traffic scores 50 on every observed dimension and its
//! overall score falls back to reputation alone.

use chrono::{Duration as ChronoDuration, Utc};
use pag0_core::{
    CategoryBenchmarks, ComparisonDifferences, ComparisonWinners, CurationConfig,
    EndpointComparison, EndpointScore, Pag0Error, ReputationLedger, Result, ScoreEvidence,
    ScoreRange, SortBy, Storage,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Score an endpoint earns on every dimension absent any evidence.
const NEUTRAL_SCORE: u8 = 50;

/// Minimum and maximum number of endpoints in a comparison.
const COMPARE_MIN: usize = 2;
const COMPARE_MAX: usize = 5;

// ---------------------------------------------------------------------------
// CurationEngine
// ---------------------------------------------------------------------------

/// Computes, caches, and serves endpoint quality scores.
pub struct CurationEngine {
    storage: Storage,
    ledger: Option<Arc<dyn ReputationLedger>>,
    config: CurationConfig,
}

impl CurationEngine {
    /// Create an engine. Without a ledger every endpoint's reputation
    /// dimension is neutral.
    pub fn new(
        storage: Storage,
        ledger: Option<Arc<dyn ReputationLedger>>,
        config: CurationConfig,
    ) -> Self {
        Self {
            storage,
            ledger,
            config,
        }
    }

    /// Compute a fresh score for an endpoint from trailing-window evidence.
    pub async fn calculate_score(&self, endpoint: &str, category: &str) -> Result<EndpointScore> {
        let since = Utc::now() - ChronoDuration::days(self.config.evidence_window_days);
        let aggregates = self
            .storage
            .analytics
            .endpoint_aggregates(endpoint, since)
            .await?;
        let reputation = self.fetch_reputation(endpoint).await;

        let evidence = ScoreEvidence {
            sample_size: aggregates.request_count,
            period: format!("{}d", self.config.evidence_window_days),
            avg_cost_per_request: aggregates.avg_cost,
            avg_latency_ms: aggregates.p95_latency_ms,
            success_rate: aggregates.success_rate,
        };

        let (cost_score, latency_score, reliability_score, overall_score) =
            if aggregates.request_count < 1 {
                // Cold start: no observed evidence, only reputation counts
                (NEUTRAL_SCORE, NEUTRAL_SCORE, NEUTRAL_SCORE, reputation)
            } else {
                let benchmarks = self.benchmarks_for(category).await?;
                let cost_score =
                    ratio_score(aggregates.avg_cost.as_f64_lossy() / benchmarks.avg_cost);
                let latency_score =
                    ratio_score(aggregates.p95_latency_ms as f64 / benchmarks.avg_latency_ms);
                let reliability_score =
                    (aggregates.success_rate.clamp(0.0, 1.0) * 100.0).round() as u8;

                let w = &self.config.weights;
                let overall = f64::from(cost_score) * w.cost
                    + f64::from(latency_score) * w.latency
                    + f64::from(reliability_score) * w.reliability
                    + f64::from(reputation) * w.reputation;
                (
                    cost_score,
                    latency_score,
                    reliability_score,
                    overall.round().clamp(0.0, 100.0) as u8,
                )
            };

        Ok(EndpointScore {
            endpoint: endpoint.to_string(),
            category: category.to_string(),
            overall_score,
            cost_score,
            latency_score,
            reliability_score,
            reputation_score: reputation,
            sample_size: aggregates.request_count,
            weights: self.config.weights,
            evidence,
            resources: Vec::new(),
            updated_at: Utc::now(),
        })
    }

    /// Recompute and persist an endpoint's score, then drop the fast-store
    /// copy so the next read sees the fresh value.
    pub async fn refresh_score(&self, endpoint: &str, category: &str) -> Result<EndpointScore> {
        let mut score = self.calculate_score(endpoint, category).await?;

        let seed = self.storage.scores.get_seed_sample_size(endpoint).await?;
        score.sample_size = seed + score.evidence.sample_size;

        self.storage.scores.upsert_score(&score, seed).await?;
        if let Err(e) = self.storage.fast.delete(&score_key(endpoint)).await {
            warn!(endpoint, error = %e, "Failed to invalidate cached score");
        }
        debug!(
            endpoint,
            overall = score.overall_score,
            samples = score.sample_size,
            "Score refreshed"
        );
        Ok(score)
    }

    /// Fetch an endpoint's score, fast-store cache first.
    pub async fn get_score(&self, endpoint: &str) -> Result<Option<EndpointScore>> {
        match self.storage.fast.get(&score_key(endpoint)).await {
            Ok(Some(bytes)) => {
                if let Ok(score) = serde_json::from_slice::<EndpointScore>(&bytes) {
                    return Ok(Some(score));
                }
            }
            Ok(None) => {}
            Err(e) => warn!(endpoint, error = %e, "Score cache read failed"),
        }

        let Some(score) = self.storage.scores.get_score(endpoint).await? else {
            return Ok(None);
        };

        // Best-effort cache fill
        if let Ok(bytes) = serde_json::to_vec(&score) {
            if let Err(e) = self
                .storage
                .fast
                .set(
                    &score_key(endpoint),
                    &bytes,
                    Duration::from_secs(self.config.score_cache_ttl_secs),
                )
                .await
            {
                warn!(endpoint, error = %e, "Score cache write failed");
            }
        }
        Ok(Some(score))
    }

    /// Top endpoints within a category.
    pub async fn get_recommendations(
        &self,
        category: &str,
        sort_by: SortBy,
        limit: u32,
    ) -> Result<Vec<EndpointScore>> {
        self.storage
            .scores
            .list_scores(Some(category), sort_by, limit)
            .await
    }

    /// Top endpoints across all categories.
    pub async fn get_rankings(&self, sort_by: SortBy, limit: u32) -> Result<Vec<EndpointScore>> {
        self.storage.scores.list_scores(None, sort_by, limit).await
    }

    /// Compare 2 to 5 endpoints dimension by dimension.
    ///
    /// Winners are decided by strict greater-than, so ties go to the
    /// endpoint listed earlier. Every requested endpoint must have a score.
    pub async fn compare_endpoints(&self, endpoints: &[String]) -> Result<EndpointComparison> {
        if !(COMPARE_MIN..=COMPARE_MAX).contains(&endpoints.len()) {
            return Err(Pag0Error::Curation(format!(
                "comparison requires {COMPARE_MIN} to {COMPARE_MAX} endpoints, got {}",
                endpoints.len()
            )));
        }

        let mut scores = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            let score = self.get_score(endpoint).await?.ok_or_else(|| {
                Pag0Error::Curation(format!("no score recorded for endpoint '{endpoint}'"))
            })?;
            scores.push(score);
        }

        let winner = ComparisonWinners {
            overall: pick_winner(&scores, |s| s.overall_score),
            cost: pick_winner(&scores, |s| s.cost_score),
            latency: pick_winner(&scores, |s| s.latency_score),
            reliability: pick_winner(&scores, |s| s.reliability_score),
        };
        let differences = ComparisonDifferences {
            overall: score_range(&scores, |s| s.overall_score),
            cost: score_range(&scores, |s| s.cost_score),
            latency: score_range(&scores, |s| s.latency_score),
            reliability: score_range(&scores, |s| s.reliability_score),
        };

        Ok(EndpointComparison {
            endpoints: scores,
            winner,
            differences,
        })
    }

    /// Category benchmark averages, falling back to configured defaults
    /// when the category has no scored endpoints yet.
    async fn benchmarks_for(&self, category: &str) -> Result<CategoryBenchmarks> {
        let computed = self.storage.scores.category_benchmarks(category).await?;
        Ok(match computed {
            Some(b) if b.avg_cost > 0.0 && b.avg_latency_ms > 0.0 => b,
            _ => CategoryBenchmarks {
                avg_cost: self.config.benchmark_cost.as_f64_lossy(),
                avg_latency_ms: self.config.benchmark_latency_ms as f64,
            },
        })
    }

    /// On-chain reputation for an endpoint; neutral when unavailable.
    async fn fetch_reputation(&self, endpoint: &str) -> u8 {
        let Some(ledger) = &self.ledger else {
            return NEUTRAL_SCORE;
        };
        match ledger.get_reputation(endpoint).await {
            Ok(Some(score)) => score.min(100),
            Ok(None) => NEUTRAL_SCORE,
            Err(e) => {
                warn!(endpoint, error = %e, "Reputation lookup failed, using neutral");
                NEUTRAL_SCORE
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Pure scoring helpers
// ---------------------------------------------------------------------------

/// Map an observed-to-benchmark ratio onto a 0..=100 score.
///
/// Half the benchmark or better scores 100; double the benchmark or worse
/// scores 0; the band between falls off linearly.
#[must_use]
pub fn ratio_score(ratio: f64) -> u8 {
    if !ratio.is_finite() || ratio <= 0.5 {
        return 100;
    }
    if ratio >= 2.0 {
        return 0;
    }
    (100.0 * (1.0 - (ratio - 0.5) / 1.5)).round() as u8
}

fn pick_winner(scores: &[EndpointScore], dim: impl Fn(&EndpointScore) -> u8) -> String {
    let mut best = &scores[0];
    for score in &scores[1..] {
        if dim(score) > dim(best) {
            best = score;
        }
    }
    best.endpoint.clone()
}

fn score_range(scores: &[EndpointScore], dim: impl Fn(&EndpointScore) -> u8) -> ScoreRange {
    let mut min = u8::MAX;
    let mut max = u8::MIN;
    for score in scores {
        min = min.min(dim(score));
        max = max.max(dim(score));
    }
    ScoreRange { min, max }
}

fn score_key(endpoint: &str) -> String {
    format!("score:{endpoint}")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
