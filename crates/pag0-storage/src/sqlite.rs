//! SQLite storage backend.
//!
//! Provides [`SqliteStore`], a single pool-backed store implementing the
//! four durable concerns: policies, budget mirrors, endpoint scores, and
//! the request log.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use pag0_core::{
    Amount, AnalyticsStore, BudgetStore, BudgetTotals, CategoryBenchmarks, EndpointAggregates,
    EndpointScore, Pag0Error, Policy, PolicyStore, RequestRecord, Result, ScoreEvidence,
    ScoreStore, ScoreWeights, SortBy,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::str::FromStr;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Schema migrations
// ---------------------------------------------------------------------------

const MIGRATIONS: &[&str] = &[
    // Spend policies; one active row per project at most
    "CREATE TABLE IF NOT EXISTS policies (
        id TEXT NOT NULL PRIMARY KEY,
        project_id TEXT NOT NULL,
        name TEXT NOT NULL,
        max_per_request TEXT NOT NULL,
        daily_budget TEXT NOT NULL,
        monthly_budget TEXT NOT NULL,
        allowed_endpoints TEXT NOT NULL DEFAULT '[]',
        blocked_endpoints TEXT NOT NULL DEFAULT '[]',
        is_active INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_policies_project ON policies(project_id, is_active)",
    // Durable spend mirror, one row per (project, period)
    "CREATE TABLE IF NOT EXISTS budget_spend (
        project_id TEXT NOT NULL,
        period_key TEXT NOT NULL,
        spent INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (project_id, period_key)
    )",
    // Endpoint quality scores with denormalized evidence columns for
    // SQL-side benchmark averages
    "CREATE TABLE IF NOT EXISTS endpoint_scores (
        endpoint TEXT NOT NULL PRIMARY KEY,
        category TEXT NOT NULL,
        overall_score INTEGER NOT NULL,
        cost_score INTEGER NOT NULL,
        latency_score INTEGER NOT NULL,
        reliability_score INTEGER NOT NULL,
        reputation_score INTEGER NOT NULL,
        sample_size INTEGER NOT NULL DEFAULT 0,
        seed_sample_size INTEGER NOT NULL DEFAULT 0,
        avg_cost INTEGER NOT NULL DEFAULT 0,
        avg_latency_ms INTEGER NOT NULL DEFAULT 0,
        weights TEXT NOT NULL DEFAULT '{}',
        evidence TEXT NOT NULL DEFAULT '{}',
        resources TEXT NOT NULL DEFAULT '[]',
        updated_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_scores_category ON endpoint_scores(category, overall_score)",
    // Completed-request log feeding curation evidence and analytics
    "CREATE TABLE IF NOT EXISTS request_log (
        id TEXT NOT NULL PRIMARY KEY,
        project_id TEXT NOT NULL,
        endpoint TEXT NOT NULL,
        method TEXT NOT NULL,
        url TEXT NOT NULL,
        status_code INTEGER NOT NULL,
        cost INTEGER NOT NULL DEFAULT 0,
        latency_ms INTEGER NOT NULL DEFAULT 0,
        cached INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_requests_endpoint ON request_log(endpoint, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_requests_project ON request_log(project_id, created_at)",
];

// ---------------------------------------------------------------------------
// Pool builder
// ---------------------------------------------------------------------------

/// Open (or create) a SQLite connection pool configured for pag0.
pub(crate) async fn open_pool(database_url: &str) -> Result<SqlitePool> {
    let connect_opts = SqliteConnectOptions::from_str(database_url)
        .map_err(|e| Pag0Error::Storage(format!("Invalid database URL: {e}")))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);

    // For in-memory databases every connection gets its own database, so
    // restrict the pool to a single connection to keep a consistent view.
    let max_conns: u32 = if database_url.contains(":memory:") {
        1
    } else {
        10
    };

    sqlx::pool::PoolOptions::<Sqlite>::new()
        .max_connections(max_conns)
        .connect_with(connect_opts)
        .await
        .map_err(|e| Pag0Error::Storage(format!("Failed to connect to SQLite: {e}")))
}

/// Run a list of migration statements against the given pool.
///
/// `ALTER TABLE … ADD COLUMN` statements are allowed to fail silently
/// (the column may already exist from a previous run).
pub(crate) async fn run_migrations(pool: &SqlitePool, statements: &[&str]) -> Result<()> {
    for statement in statements {
        let result = sqlx::query(statement).execute(pool).await;
        match result {
            Ok(_) => {}
            Err(e) => {
                let is_alter_add = statement.to_uppercase().contains("ALTER TABLE")
                    && statement.to_uppercase().contains("ADD COLUMN");
                let is_duplicate = e.to_string().contains("duplicate column");
                if is_alter_add && is_duplicate {
                    // Column already exists — safe to ignore
                    continue;
                }
                return Err(Pag0Error::Storage(format!("Migration failed: {e}")));
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

/// Parse a [`Uuid`] from a TEXT column value.
fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| Pag0Error::Storage(format!("Invalid UUID '{s}': {e}")))
}

/// Parse a [`DateTime<Utc>`] from an RFC 3339 TEXT column value.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Pag0Error::Storage(format!("Invalid datetime '{s}': {e}")))
}

/// Parse an [`Amount`] from a decimal-string TEXT column value.
fn parse_amount(s: &str) -> Result<Amount> {
    s.parse()
        .map_err(|e| Pag0Error::Storage(format!("Invalid amount '{s}': {e}")))
}

/// Convert an [`Amount`] to a signed 64-bit counter value, erroring instead
/// of truncating when it does not fit.
fn amount_to_i64(amount: Amount) -> Result<i64> {
    amount
        .to_i64()
        .ok_or_else(|| Pag0Error::BudgetStore(format!("amount {amount} exceeds counter range")))
}

/// Period key for the current UTC day, e.g. `day:2026-08-31`.
fn daily_key(now: DateTime<Utc>) -> String {
    format!("day:{}", now.format("%Y-%m-%d"))
}

/// Period key for the current UTC month, e.g. `month:2026-08`.
fn monthly_key(now: DateTime<Utc>) -> String {
    format!("month:{:04}-{:02}", now.year(), now.month())
}

// ---------------------------------------------------------------------------
// Row conversions
// ---------------------------------------------------------------------------

/// Reconstruct a [`Policy`] from a SQLite row.
fn policy_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Policy> {
    let allowed: Vec<String> = {
        let raw: String = row.get("allowed_endpoints");
        serde_json::from_str(&raw)
            .map_err(|e| Pag0Error::Storage(format!("Invalid allowed_endpoints JSON: {e}")))?
    };
    let blocked: Vec<String> = {
        let raw: String = row.get("blocked_endpoints");
        serde_json::from_str(&raw)
            .map_err(|e| Pag0Error::Storage(format!("Invalid blocked_endpoints JSON: {e}")))?
    };

    Ok(Policy {
        id: parse_uuid(&row.get::<String, _>("id"))?,
        project_id: row.get("project_id"),
        name: row.get("name"),
        max_per_request: parse_amount(&row.get::<String, _>("max_per_request"))?,
        daily_budget: parse_amount(&row.get::<String, _>("daily_budget"))?,
        monthly_budget: parse_amount(&row.get::<String, _>("monthly_budget"))?,
        allowed_endpoints: allowed,
        blocked_endpoints: blocked,
        is_active: row.get::<i64, _>("is_active") != 0,
        created_at: parse_datetime(&row.get::<String, _>("created_at"))?,
        updated_at: parse_datetime(&row.get::<String, _>("updated_at"))?,
    })
}

/// Reconstruct an [`EndpointScore`] from a SQLite row.
fn score_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<EndpointScore> {
    let weights: ScoreWeights = {
        let raw: String = row.get("weights");
        serde_json::from_str(&raw)
            .map_err(|e| Pag0Error::Storage(format!("Invalid weights JSON: {e}")))?
    };
    let evidence: ScoreEvidence = {
        let raw: String = row.get("evidence");
        serde_json::from_str(&raw)
            .map_err(|e| Pag0Error::Storage(format!("Invalid evidence JSON: {e}")))?
    };
    let resources: Vec<String> = {
        let raw: String = row.get("resources");
        serde_json::from_str(&raw)
            .map_err(|e| Pag0Error::Storage(format!("Invalid resources JSON: {e}")))?
    };

    Ok(EndpointScore {
        endpoint: row.get("endpoint"),
        category: row.get("category"),
        overall_score: row.get::<i64, _>("overall_score") as u8,
        cost_score: row.get::<i64, _>("cost_score") as u8,
        latency_score: row.get::<i64, _>("latency_score") as u8,
        reliability_score: row.get::<i64, _>("reliability_score") as u8,
        reputation_score: row.get::<i64, _>("reputation_score") as u8,
        sample_size: row.get::<i64, _>("sample_size") as u64,
        weights,
        evidence,
        resources,
        updated_at: parse_datetime(&row.get::<String, _>("updated_at"))?,
    })
}

// ===========================================================================
// SqliteStore
// ===========================================================================

/// SQLite-backed durable store for policies, budget mirrors, endpoint
/// scores, and the request log, sharing a single connection pool.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) a SQLite database and run schema migrations.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # async fn example() -> pag0_core::Result<()> {
    /// let store = pag0_storage::SqliteStore::new("sqlite::memory:").await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = open_pool(database_url).await?;
        run_migrations(&pool, MIGRATIONS).await?;
        Ok(Self { pool })
    }

    /// Insert or replace a policy row using the provided executor.
    async fn upsert_policy_row<'e, E>(&self, executor: E, policy: &Policy) -> Result<()>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        let allowed_json = serde_json::to_string(&policy.allowed_endpoints)
            .map_err(|e| Pag0Error::Storage(format!("serialize allowed_endpoints: {e}")))?;
        let blocked_json = serde_json::to_string(&policy.blocked_endpoints)
            .map_err(|e| Pag0Error::Storage(format!("serialize blocked_endpoints: {e}")))?;

        sqlx::query(
            "INSERT OR REPLACE INTO policies (
                id, project_id, name, max_per_request, daily_budget,
                monthly_budget, allowed_endpoints, blocked_endpoints,
                is_active, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )
        .bind(policy.id.to_string())
        .bind(&policy.project_id)
        .bind(&policy.name)
        .bind(policy.max_per_request.to_string())
        .bind(policy.daily_budget.to_string())
        .bind(policy.monthly_budget.to_string())
        .bind(&allowed_json)
        .bind(&blocked_json)
        .bind(i64::from(policy.is_active))
        .bind(policy.created_at.to_rfc3339())
        .bind(policy.updated_at.to_rfc3339())
        .execute(executor)
        .await
        .map_err(|e| Pag0Error::Storage(format!("Failed to upsert policy: {e}")))?;

        Ok(())
    }

    /// Accumulate spend into one (project, period) row.
    async fn add_period_spend<'e, E>(
        &self,
        executor: E,
        project_id: &str,
        period_key: &str,
        delta: i64,
    ) -> Result<()>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        sqlx::query(
            "INSERT INTO budget_spend (project_id, period_key, spent)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(project_id, period_key) DO UPDATE SET
                spent = spent + excluded.spent",
        )
        .bind(project_id)
        .bind(period_key)
        .bind(delta)
        .execute(executor)
        .await
        .map_err(|e| Pag0Error::BudgetStore(format!("Failed to record spend: {e}")))?;

        Ok(())
    }

    /// Read one (project, period) spend row.
    async fn get_period_spend(&self, project_id: &str, period_key: &str) -> Result<Option<i64>> {
        let row = sqlx::query(
            "SELECT spent FROM budget_spend WHERE project_id = ?1 AND period_key = ?2",
        )
        .bind(project_id)
        .bind(period_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Pag0Error::BudgetStore(format!("Failed to read spend: {e}")))?;

        Ok(row.map(|r| r.get("spent")))
    }
}

// ---------------------------------------------------------------------------
// PolicyStore
// ---------------------------------------------------------------------------

#[async_trait]
impl PolicyStore for SqliteStore {
    async fn create_policy(&self, policy: &Policy) -> Result<()> {
        policy.validate()?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Pag0Error::Storage(format!("Failed to begin transaction: {e}")))?;

        if policy.is_active {
            sqlx::query("UPDATE policies SET is_active = 0 WHERE project_id = ?1")
                .bind(&policy.project_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| Pag0Error::Storage(format!("Failed to deactivate policies: {e}")))?;
        }

        self.upsert_policy_row(&mut *tx, policy).await?;

        tx.commit()
            .await
            .map_err(|e| Pag0Error::Storage(format!("Failed to commit transaction: {e}")))?;

        Ok(())
    }

    async fn update_policy(&self, policy: &Policy) -> Result<()> {
        policy.validate()?;

        let existing = sqlx::query("SELECT id FROM policies WHERE id = ?1")
            .bind(policy.id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Pag0Error::Storage(format!("Failed to look up policy: {e}")))?;
        if existing.is_none() {
            return Err(Pag0Error::Storage(format!(
                "policy {} does not exist",
                policy.id
            )));
        }

        self.upsert_policy_row(&self.pool, policy).await
    }

    async fn activate_policy(&self, project_id: &str, policy_id: Uuid) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Pag0Error::Storage(format!("Failed to begin transaction: {e}")))?;

        sqlx::query("UPDATE policies SET is_active = 0 WHERE project_id = ?1")
            .bind(project_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| Pag0Error::Storage(format!("Failed to deactivate policies: {e}")))?;

        let result = sqlx::query(
            "UPDATE policies SET is_active = 1, updated_at = ?1
             WHERE id = ?2 AND project_id = ?3",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(policy_id.to_string())
        .bind(project_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| Pag0Error::Storage(format!("Failed to activate policy: {e}")))?;

        if result.rows_affected() == 0 {
            return Err(Pag0Error::Storage(format!(
                "policy {policy_id} not found for project '{project_id}'"
            )));
        }

        tx.commit()
            .await
            .map_err(|e| Pag0Error::Storage(format!("Failed to commit transaction: {e}")))?;

        Ok(())
    }

    async fn get_active_policy(&self, project_id: &str) -> Result<Option<Policy>> {
        let row = sqlx::query(
            "SELECT * FROM policies WHERE project_id = ?1 AND is_active = 1 LIMIT 1",
        )
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Pag0Error::Storage(format!("Failed to get active policy: {e}")))?;

        match row {
            Some(ref r) => Ok(Some(policy_from_row(r)?)),
            None => Ok(None),
        }
    }

    async fn list_policies(&self, project_id: &str) -> Result<Vec<Policy>> {
        let rows = sqlx::query(
            "SELECT * FROM policies WHERE project_id = ?1 ORDER BY created_at DESC",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Pag0Error::Storage(format!("Failed to list policies: {e}")))?;

        rows.iter().map(policy_from_row).collect()
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Pag0Error::Storage(format!("Health check failed: {e}")))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// BudgetStore
// ---------------------------------------------------------------------------

#[async_trait]
impl BudgetStore for SqliteStore {
    async fn add_spend(&self, project_id: &str, amount: Amount) -> Result<()> {
        let delta = amount_to_i64(amount)?;
        let now = Utc::now();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Pag0Error::BudgetStore(format!("Failed to begin transaction: {e}")))?;

        self.add_period_spend(&mut *tx, project_id, &daily_key(now), delta)
            .await?;
        self.add_period_spend(&mut *tx, project_id, &monthly_key(now), delta)
            .await?;

        tx.commit()
            .await
            .map_err(|e| Pag0Error::BudgetStore(format!("Failed to commit spend: {e}")))?;

        Ok(())
    }

    async fn get_totals(&self, project_id: &str) -> Result<Option<BudgetTotals>> {
        let now = Utc::now();
        let daily = self.get_period_spend(project_id, &daily_key(now)).await?;
        let monthly = self.get_period_spend(project_id, &monthly_key(now)).await?;

        if daily.is_none() && monthly.is_none() {
            return Ok(None);
        }

        Ok(Some(BudgetTotals {
            daily_spent: Amount::from_i64(daily.unwrap_or(0)),
            monthly_spent: Amount::from_i64(monthly.unwrap_or(0)),
        }))
    }
}

// ---------------------------------------------------------------------------
// ScoreStore
// ---------------------------------------------------------------------------

#[async_trait]
impl ScoreStore for SqliteStore {
    async fn upsert_score(&self, score: &EndpointScore, seed_sample_size: u64) -> Result<()> {
        let weights_json = serde_json::to_string(&score.weights)
            .map_err(|e| Pag0Error::Storage(format!("serialize weights: {e}")))?;
        let evidence_json = serde_json::to_string(&score.evidence)
            .map_err(|e| Pag0Error::Storage(format!("serialize evidence: {e}")))?;
        let resources_json = serde_json::to_string(&score.resources)
            .map_err(|e| Pag0Error::Storage(format!("serialize resources: {e}")))?;
        let avg_cost = score
            .evidence
            .avg_cost_per_request
            .to_i64()
            .unwrap_or(i64::MAX);

        sqlx::query(
            "INSERT OR REPLACE INTO endpoint_scores (
                endpoint, category, overall_score, cost_score, latency_score,
                reliability_score, reputation_score, sample_size,
                seed_sample_size, avg_cost, avg_latency_ms, weights, evidence,
                resources, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        )
        .bind(&score.endpoint)
        .bind(&score.category)
        .bind(i64::from(score.overall_score))
        .bind(i64::from(score.cost_score))
        .bind(i64::from(score.latency_score))
        .bind(i64::from(score.reliability_score))
        .bind(i64::from(score.reputation_score))
        .bind(score.sample_size as i64)
        .bind(seed_sample_size as i64)
        .bind(avg_cost)
        .bind(score.evidence.avg_latency_ms as i64)
        .bind(&weights_json)
        .bind(&evidence_json)
        .bind(&resources_json)
        .bind(score.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| Pag0Error::Storage(format!("Failed to upsert score: {e}")))?;

        Ok(())
    }

    async fn get_score(&self, endpoint: &str) -> Result<Option<EndpointScore>> {
        let row = sqlx::query("SELECT * FROM endpoint_scores WHERE endpoint = ?1")
            .bind(endpoint)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Pag0Error::Storage(format!("Failed to get score: {e}")))?;

        match row {
            Some(ref r) => Ok(Some(score_from_row(r)?)),
            None => Ok(None),
        }
    }

    async fn get_seed_sample_size(&self, endpoint: &str) -> Result<u64> {
        let row = sqlx::query("SELECT seed_sample_size FROM endpoint_scores WHERE endpoint = ?1")
            .bind(endpoint)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Pag0Error::Storage(format!("Failed to get seed sample size: {e}")))?;

        Ok(row.map(|r| r.get::<i64, _>("seed_sample_size") as u64).unwrap_or(0))
    }

    async fn list_scores(
        &self,
        category: Option<&str>,
        sort_by: SortBy,
        limit: u32,
    ) -> Result<Vec<EndpointScore>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM endpoint_scores WHERE 1 = 1");

        if let Some(cat) = category {
            qb.push(" AND category = ");
            qb.push_bind(cat.to_string());
        }

        // sort_by maps through a fixed enum lookup, never caller text
        qb.push(" ORDER BY ");
        qb.push(sort_by.column());
        qb.push(" DESC LIMIT ");
        qb.push_bind(i64::from(limit));

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Pag0Error::Storage(format!("Failed to list scores: {e}")))?;

        rows.iter().map(score_from_row).collect()
    }

    async fn category_benchmarks(&self, category: &str) -> Result<Option<CategoryBenchmarks>> {
        let row = sqlx::query(
            "SELECT AVG(avg_cost) as bench_cost, AVG(avg_latency_ms) as bench_latency,
                    COUNT(*) as n
             FROM endpoint_scores WHERE category = ?1",
        )
        .bind(category)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Pag0Error::Storage(format!("Failed to compute benchmarks: {e}")))?;

        let count: i64 = row.get("n");
        if count == 0 {
            return Ok(None);
        }

        Ok(Some(CategoryBenchmarks {
            avg_cost: row.get::<Option<f64>, _>("bench_cost").unwrap_or(0.0),
            avg_latency_ms: row.get::<Option<f64>, _>("bench_latency").unwrap_or(0.0),
        }))
    }
}

// ---------------------------------------------------------------------------
// AnalyticsStore
// ---------------------------------------------------------------------------

#[async_trait]
impl AnalyticsStore for SqliteStore {
    async fn record_request(&self, record: &RequestRecord) -> Result<()> {
        let cost = record
            .cost
            .to_i64()
            .ok_or_else(|| Pag0Error::Storage(format!("cost {} exceeds log range", record.cost)))?;

        sqlx::query(
            "INSERT INTO request_log (
                id, project_id, endpoint, method, url, status_code, cost,
                latency_ms, cached, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )
        .bind(record.id.to_string())
        .bind(&record.project_id)
        .bind(&record.endpoint)
        .bind(&record.method)
        .bind(&record.url)
        .bind(i64::from(record.status_code))
        .bind(cost)
        .bind(record.latency_ms as i64)
        .bind(i64::from(record.cached))
        .bind(record.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| Pag0Error::Storage(format!("Failed to record request: {e}")))?;

        Ok(())
    }

    async fn endpoint_aggregates(
        &self,
        endpoint: &str,
        since: DateTime<Utc>,
    ) -> Result<EndpointAggregates> {
        let since_str = since.to_rfc3339();

        let row = sqlx::query(
            "SELECT COUNT(*) as n,
                    COALESCE(SUM(cost), 0) as total_cost,
                    COALESCE(AVG(CASE WHEN status_code < 400 THEN 1.0 ELSE 0.0 END), 0.0)
                        as success_rate
             FROM request_log WHERE endpoint = ?1 AND created_at >= ?2",
        )
        .bind(endpoint)
        .bind(&since_str)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Pag0Error::Storage(format!("Failed to aggregate requests: {e}")))?;

        let count: i64 = row.get("n");
        if count == 0 {
            return Ok(EndpointAggregates::default());
        }

        let total_cost: i64 = row.get("total_cost");
        let success_rate: f64 = row.get("success_rate");

        // p95 by offset into the sorted latency column
        let offset = (count * 95) / 100;
        let p95_row = sqlx::query(
            "SELECT latency_ms FROM request_log
             WHERE endpoint = ?1 AND created_at >= ?2
             ORDER BY latency_ms ASC LIMIT 1 OFFSET ?3",
        )
        .bind(endpoint)
        .bind(&since_str)
        .bind(offset.min(count - 1))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Pag0Error::Storage(format!("Failed to compute p95 latency: {e}")))?;

        Ok(EndpointAggregates {
            request_count: count as u64,
            avg_cost: Amount::from_i64(total_cost / count),
            p95_latency_ms: p95_row.get::<i64, _>("latency_ms") as u64,
            success_rate,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
