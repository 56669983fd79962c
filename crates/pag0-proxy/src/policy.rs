//! Policy evaluation.
//!
//! Evaluates a request against the project's active policy: endpoint
//! block/allow lists first, then the per-request limit, then the daily and
//! monthly budgets. The first failing check wins and short-circuits; a
//! project without an active policy is allowed under a synthetic
//! "unrestricted" policy.

use crate::budget::BudgetTracker;
use crate::wildcard;
use pag0_core::{
    Amount, Pag0Error, Policy, PolicyDecision, PolicyReason, PolicyStore, Result,
};
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

/// The request attributes policy evaluation needs.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Project making the request.
    pub project_id: String,
    /// Full target URL.
    pub url: String,
    /// Target hostname, extracted from the URL.
    pub endpoint: String,
    /// HTTP method.
    pub method: String,
}

impl RequestContext {
    /// Build a context from a target URL, extracting the hostname.
    pub fn new(project_id: impl Into<String>, method: impl Into<String>, url: &str) -> Result<Self> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| Pag0Error::BadRequest(format!("invalid target URL '{url}': {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Pag0Error::BadRequest(format!(
                "unsupported URL scheme '{}'",
                parsed.scheme()
            )));
        }
        let endpoint = parsed
            .host_str()
            .ok_or_else(|| Pag0Error::BadRequest(format!("target URL '{url}' has no host")))?
            .to_string();
        Ok(Self {
            project_id: project_id.into(),
            url: url.to_string(),
            endpoint,
            method: method.into(),
        })
    }
}

// ---------------------------------------------------------------------------
// PolicyEngine
// ---------------------------------------------------------------------------

/// Evaluates requests against active policies and current budget state.
pub struct PolicyEngine {
    policies: Arc<dyn PolicyStore>,
    budget: Arc<BudgetTracker>,
}

impl PolicyEngine {
    /// Create an engine over the policy store and budget tracker.
    pub fn new(policies: Arc<dyn PolicyStore>, budget: Arc<BudgetTracker>) -> Self {
        Self { policies, budget }
    }

    /// Evaluate a request with its estimated cost.
    ///
    /// Check order is fixed: blocked endpoints, whitelist, per-request
    /// limit, daily budget, monthly budget. Budget checks compare with
    /// exact integer arithmetic.
    pub async fn evaluate(
        &self,
        ctx: &RequestContext,
        estimated_cost: Amount,
    ) -> Result<PolicyDecision> {
        let Some(policy) = self.policies.get_active_policy(&ctx.project_id).await? else {
            debug!(project_id = %ctx.project_id, "No active policy, allowing");
            return Ok(PolicyDecision::allow(Policy::unrestricted(&ctx.project_id)));
        };

        if wildcard::matches_any(&policy.blocked_endpoints, &ctx.endpoint) {
            return Ok(PolicyDecision::deny(
                policy,
                PolicyReason::EndpointBlocked,
                json!({ "endpoint": ctx.endpoint }),
            ));
        }

        // Empty whitelist = allow all (subject to the block list above)
        if !policy.allowed_endpoints.is_empty()
            && !wildcard::matches_any(&policy.allowed_endpoints, &ctx.endpoint)
        {
            return Ok(PolicyDecision::deny(
                policy,
                PolicyReason::EndpointNotWhitelisted,
                json!({ "endpoint": ctx.endpoint }),
            ));
        }

        if estimated_cost > policy.max_per_request {
            let details = json!({
                "estimatedCost": estimated_cost,
                "maxPerRequest": policy.max_per_request,
            });
            return Ok(PolicyDecision::deny(
                policy,
                PolicyReason::PerRequestLimitExceeded,
                details,
            ));
        }

        let snapshot = self.budget.check_budget(&ctx.project_id).await?;

        let projected_daily = snapshot
            .daily_spent
            .checked_add(estimated_cost)
            .ok_or_else(|| Pag0Error::BudgetStore("daily spend overflow".to_string()))?;
        if projected_daily > policy.daily_budget {
            let details = json!({
                "estimatedCost": estimated_cost,
                "dailySpent": snapshot.daily_spent,
                "dailyBudget": policy.daily_budget,
            });
            return Ok(PolicyDecision::deny(
                policy,
                PolicyReason::DailyBudgetExceeded,
                details,
            ));
        }

        let projected_monthly = snapshot
            .monthly_spent
            .checked_add(estimated_cost)
            .ok_or_else(|| Pag0Error::BudgetStore("monthly spend overflow".to_string()))?;
        if projected_monthly > policy.monthly_budget {
            let details = json!({
                "estimatedCost": estimated_cost,
                "monthlySpent": snapshot.monthly_spent,
                "monthlyBudget": policy.monthly_budget,
            });
            return Ok(PolicyDecision::deny(
                policy,
                PolicyReason::MonthlyBudgetExceeded,
                details,
            ));
        }

        Ok(PolicyDecision::allow(policy))
    }
}

/// Turn a deny decision into the typed error the HTTP boundary maps to 403.
pub fn violation_error(decision: &PolicyDecision) -> Pag0Error {
    let reason = decision
        .reason
        .unwrap_or(PolicyReason::EndpointBlocked);
    Pag0Error::PolicyViolation {
        reason,
        message: format!("request denied by policy '{}': {reason}", decision.policy.name),
        details: decision.details.clone(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use pag0_core::Storage;
    use pag0_storage::StorageProfile;

    async fn test_engine() -> (PolicyEngine, Storage, Arc<BudgetTracker>) {
        let storage = StorageProfile::Memory.build().await.unwrap();
        let budget = Arc::new(BudgetTracker::new(storage.clone()));
        let engine = PolicyEngine::new(storage.policies.clone(), Arc::clone(&budget));
        (engine, storage, budget)
    }

    fn ctx(url: &str) -> RequestContext {
        RequestContext::new("proj", "GET", url).unwrap()
    }

    async fn install_policy(storage: &Storage, policy: &mut Policy) {
        policy.is_active = true;
        storage.policies.create_policy(policy).await.unwrap();
    }

    fn limits_policy() -> Policy {
        Policy::new(
            "proj",
            "limits",
            Amount::from_units(5_000_000),
            Amount::from_units(10_000_000),
            Amount::from_units(100_000_000),
        )
    }

    #[test]
    fn test_request_context_extracts_host() {
        let c = ctx("https://api.example.com/v1/data?x=1");
        assert_eq!(c.endpoint, "api.example.com");
    }

    #[test]
    fn test_request_context_rejects_bad_urls() {
        assert!(RequestContext::new("p", "GET", "not a url").is_err());
        assert!(RequestContext::new("p", "GET", "ftp://example.com/x").is_err());
    }

    #[tokio::test]
    async fn test_no_policy_allows_unrestricted() {
        let (engine, _s, _b) = test_engine().await;
        let decision = engine
            .evaluate(&ctx("https://api.example.com/x"), Amount::from_units(1))
            .await
            .unwrap();
        assert!(decision.allowed);
        assert!(decision.policy.is_unrestricted());
    }

    #[tokio::test]
    async fn test_blocked_endpoint_denied() {
        let (engine, storage, _b) = test_engine().await;
        let mut policy = limits_policy();
        policy.blocked_endpoints = vec!["*.evil.com".to_string()];
        install_policy(&storage, &mut policy).await;

        let decision = engine
            .evaluate(&ctx("https://api.evil.com/x"), Amount::ZERO)
            .await
            .unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.reason, Some(PolicyReason::EndpointBlocked));
    }

    #[tokio::test]
    async fn test_whitelist_enforced_when_nonempty() {
        let (engine, storage, _b) = test_engine().await;
        let mut policy = limits_policy();
        policy.allowed_endpoints = vec!["api.example.com".to_string()];
        install_policy(&storage, &mut policy).await;

        let allowed = engine
            .evaluate(&ctx("https://api.example.com/x"), Amount::ZERO)
            .await
            .unwrap();
        assert!(allowed.allowed);

        let denied = engine
            .evaluate(&ctx("https://other.example.com/x"), Amount::ZERO)
            .await
            .unwrap();
        assert_eq!(denied.reason, Some(PolicyReason::EndpointNotWhitelisted));
    }

    #[tokio::test]
    async fn test_block_list_wins_over_whitelist() {
        // A blocked, whitelisted, over-budget request must always report
        // the block, never a budget reason.
        let (engine, storage, _b) = test_engine().await;
        let mut policy = limits_policy();
        policy.allowed_endpoints = vec!["api.example.com".to_string()];
        policy.blocked_endpoints = vec!["api.example.com".to_string()];
        install_policy(&storage, &mut policy).await;

        let decision = engine
            .evaluate(
                &ctx("https://api.example.com/x"),
                Amount::from_units(999_000_000_000),
            )
            .await
            .unwrap();
        assert_eq!(decision.reason, Some(PolicyReason::EndpointBlocked));
    }

    #[tokio::test]
    async fn test_per_request_limit() {
        let (engine, storage, _b) = test_engine().await;
        install_policy(&storage, &mut limits_policy()).await;

        let decision = engine
            .evaluate(&ctx("https://api.example.com/x"), Amount::from_units(5_000_001))
            .await
            .unwrap();
        assert_eq!(decision.reason, Some(PolicyReason::PerRequestLimitExceeded));

        let at_limit = engine
            .evaluate(&ctx("https://api.example.com/x"), Amount::from_units(5_000_000))
            .await
            .unwrap();
        assert!(at_limit.allowed);
    }

    #[tokio::test]
    async fn test_daily_budget_scenario() {
        // maxPerRequest 5_000_000, dailyBudget 10_000_000, spent 9_000_000:
        // cost 2_000_000 denied, cost 1_000_000 allowed.
        let (engine, storage, budget) = test_engine().await;
        install_policy(&storage, &mut limits_policy()).await;
        budget
            .record_spend("proj", Amount::from_units(9_000_000))
            .await
            .unwrap();

        let denied = engine
            .evaluate(&ctx("https://api.example.com/x"), Amount::from_units(2_000_000))
            .await
            .unwrap();
        assert_eq!(denied.reason, Some(PolicyReason::DailyBudgetExceeded));

        let allowed = engine
            .evaluate(&ctx("https://api.example.com/x"), Amount::from_units(1_000_000))
            .await
            .unwrap();
        assert!(allowed.allowed);
    }

    #[tokio::test]
    async fn test_monthly_budget_exceeded() {
        // Spend from earlier days this month has nearly exhausted the
        // monthly budget while today's spend leaves daily headroom, so
        // only the monthly check can deny.
        let (engine, storage, _b) = test_engine().await;
        let mut policy = Policy::new(
            "proj",
            "tight-month",
            Amount::from_units(2_000_000),
            Amount::from_units(5_000_000),
            Amount::from_units(9_500_000),
        );
        install_policy(&storage, &mut policy).await;

        let now = chrono::Utc::now();
        storage
            .fast
            .incr_by(&crate::budget::daily_spend_key("proj", now), 1_000_000)
            .await
            .unwrap();
        storage
            .fast
            .incr_by(&crate::budget::monthly_spend_key("proj", now), 9_000_000)
            .await
            .unwrap();

        // Daily projects to 2_000_000 of 5_000_000; monthly projects to
        // 10_000_000 over the 9_500_000 line.
        let decision = engine
            .evaluate(
                &ctx("https://api.example.com/x"),
                Amount::from_units(1_000_000),
            )
            .await
            .unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.reason, Some(PolicyReason::MonthlyBudgetExceeded));
    }

    #[tokio::test]
    async fn test_daily_check_precedes_monthly() {
        // With equal daily and monthly budgets both checks would trip;
        // the daily one runs first and names the reason.
        let (engine, storage, budget) = test_engine().await;
        let mut policy = Policy::new(
            "proj",
            "tight-both",
            Amount::from_units(5_000_000),
            Amount::from_units(9_500_000),
            Amount::from_units(9_500_000),
        );
        install_policy(&storage, &mut policy).await;
        budget
            .record_spend("proj", Amount::from_units(9_000_000))
            .await
            .unwrap();

        let decision = engine
            .evaluate(&ctx("https://api.example.com/x"), Amount::from_units(600_000))
            .await
            .unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.reason, Some(PolicyReason::DailyBudgetExceeded));
    }

    #[tokio::test]
    async fn test_violation_error_maps_to_policy_violation() {
        let (engine, storage, _b) = test_engine().await;
        let mut policy = limits_policy();
        policy.blocked_endpoints = vec!["*".to_string()];
        install_policy(&storage, &mut policy).await;

        let decision = engine
            .evaluate(&ctx("https://api.example.com/x"), Amount::ZERO)
            .await
            .unwrap();
        let err = violation_error(&decision);
        assert_eq!(err.code(), "POLICY_VIOLATION");
    }
}
