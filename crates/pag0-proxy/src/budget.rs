//! Budget tracking and spend recording.
//!
//! Spend counters live in the fast store under UTC-period keys that expire
//! at the next period boundary, with a durable mirror accumulated through
//! atomic add-on-conflict upserts. The fast store is the low-latency source
//! of truth; the durable mirror is the source of truth after a cold start
//! or key expiry.
//!
//! All amounts are exact integers. Budget-store failures propagate — they
//! gate financial correctness and are never swallowed.

use chrono::{DateTime, Datelike, TimeZone, Utc};
use pag0_core::{Amount, BudgetSnapshot, Pag0Error, Result, Storage};
use std::time::Duration;
use tracing::debug;

// ---------------------------------------------------------------------------
// BudgetTracker
// ---------------------------------------------------------------------------

/// Tracks per-project daily and monthly spend.
pub struct BudgetTracker {
    storage: Storage,
}

impl BudgetTracker {
    /// Create a tracker over the composite storage.
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Current budget state for a project with the active policy's limits
    /// overlaid. No active policy means unlimited (`None` limits).
    pub async fn check_budget(&self, project_id: &str) -> Result<BudgetSnapshot> {
        let now = Utc::now();
        let daily = self
            .read_counter(&daily_spend_key(project_id, now))
            .await?;
        let monthly = self
            .read_counter(&monthly_spend_key(project_id, now))
            .await?;

        // Fast-store keys absent (cold start or expiry): fall back to the
        // durable mirror's last-known totals.
        let (daily_spent, monthly_spent) = match (daily, monthly) {
            (Some(d), Some(m)) => (Amount::from_i64(d), Amount::from_i64(m)),
            _ => {
                let totals = self
                    .storage
                    .budgets
                    .get_totals(project_id)
                    .await?
                    .unwrap_or_default();
                (
                    daily.map(Amount::from_i64).unwrap_or(totals.daily_spent),
                    monthly
                        .map(Amount::from_i64)
                        .unwrap_or(totals.monthly_spent),
                )
            }
        };

        let policy = self.storage.policies.get_active_policy(project_id).await?;
        let (daily_limit, monthly_limit) = match policy {
            Some(p) => (Some(p.daily_budget), Some(p.monthly_budget)),
            None => (None, None),
        };

        Ok(BudgetSnapshot {
            daily_spent,
            daily_limit,
            monthly_spent,
            monthly_limit,
        })
    }

    /// Record settled spend for a project.
    ///
    /// Atomically increments both period counters in the fast store,
    /// lazily assigning each key's expiry on first creation, then upserts
    /// the durable mirror. Any failure propagates.
    pub async fn record_spend(&self, project_id: &str, amount: Amount) -> Result<()> {
        if amount.is_zero() {
            return Ok(());
        }
        let delta = amount.to_i64().ok_or_else(|| {
            Pag0Error::BudgetStore(format!("spend amount {amount} exceeds counter range"))
        })?;

        let now = Utc::now();

        let daily_key = daily_spend_key(project_id, now);
        let daily_total = self.storage.fast.incr_by(&daily_key, delta).await?;
        self.storage
            .fast
            .expire_if_unset(&daily_key, Duration::from_secs(seconds_until_utc_midnight(now)))
            .await?;

        let monthly_key = monthly_spend_key(project_id, now);
        let monthly_total = self.storage.fast.incr_by(&monthly_key, delta).await?;
        self.storage
            .fast
            .expire_if_unset(&monthly_key, Duration::from_secs(seconds_until_next_month(now)))
            .await?;

        self.storage.budgets.add_spend(project_id, amount).await?;

        debug!(
            project_id,
            amount = %amount,
            daily_total,
            monthly_total,
            "Spend recorded"
        );
        Ok(())
    }

    /// Read a counter key, parsing its ASCII integer value.
    async fn read_counter(&self, key: &str) -> Result<Option<i64>> {
        let Some(bytes) = self.storage.fast.get(key).await? else {
            return Ok(None);
        };
        let value = std::str::from_utf8(&bytes)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or_else(|| {
                Pag0Error::BudgetStore(format!("counter key '{key}' holds a non-integer value"))
            })?;
        Ok(Some(value))
    }
}

// ---------------------------------------------------------------------------
// Period key helpers
// ---------------------------------------------------------------------------

/// Fast-store key for the current UTC day's spend.
pub(crate) fn daily_spend_key(project_id: &str, now: DateTime<Utc>) -> String {
    format!("budget:{project_id}:daily:{}", now.format("%Y-%m-%d"))
}

/// Fast-store key for the current UTC month's spend.
pub(crate) fn monthly_spend_key(project_id: &str, now: DateTime<Utc>) -> String {
    format!(
        "budget:{project_id}:monthly:{:04}-{:02}",
        now.year(),
        now.month()
    )
}

/// Seconds from `now` until the next UTC midnight.
pub fn seconds_until_utc_midnight(now: DateTime<Utc>) -> u64 {
    let tomorrow = now.date_naive() + chrono::Duration::days(1);
    let midnight = Utc
        .from_utc_datetime(&tomorrow.and_hms_opt(0, 0, 0).unwrap_or_default());
    (midnight - now).num_seconds().max(1) as u64
}

/// Seconds from `now` until the start of the next UTC month.
pub fn seconds_until_next_month(now: DateTime<Utc>) -> u64 {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    let next = Utc
        .with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .unwrap_or(now);
    (next - now).num_seconds().max(1) as u64
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
