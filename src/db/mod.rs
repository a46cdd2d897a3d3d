//! SQLite persistence for decision sets, cycle runs and the equity curve.
//!
//! Stores:
//! - Decision sets keyed by their input fingerprint (re-persisting is a no-op)
//! - One audit row per decision
//! - Cycle run records (status, attempts, error)
//! - Equity curve used to derive running drawdown
//!
//! Money values are stored as TEXT to keep `Decimal` exact.

use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use tracing::{debug, info};

use crate::metrics;
use crate::models::{DecisionFlag, DecisionSet, PortfolioState};
use crate::trading::DecisionSink;

/// Database connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

/// Stored decision set header.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredDecisionSet {
    pub cycle_id: String,
    pub as_of: DateTime<Utc>,
    pub buy_count: i64,
    pub sell_count: i64,
    pub hold_count: i64,
    pub rejected_count: i64,
    pub total_buy_value: String,
    pub total_sell_value: String,
    pub projected_cash: String,
    pub projected_exposure: String,
    pub created_at: DateTime<Utc>,
}

/// Stored per-ticker decision.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredDecision {
    pub ticker: String,
    pub action: String,
    pub size_fraction: String,
    pub amount: String,
    pub confidence: Option<f64>,
    pub rationale: String,
    pub flags: String,
}

/// Outcome of one cycle run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        }
    }
}

/// Stored cycle run record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredCycleRun {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: String,
    pub cycle_id: Option<String>,
    pub attempts: i64,
    pub dry_run: bool,
    pub error: Option<String>,
}

/// Equity curve point.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EquityPoint {
    pub timestamp: DateTime<Utc>,
    pub portfolio_value: String,
    pub cash: String,
    pub exposure: String,
}

impl EquityPoint {
    pub fn value(&self) -> Result<Decimal> {
        parse_decimal(&self.portfolio_value)
    }
}

fn parse_decimal(raw: &str) -> Result<Decimal> {
    Decimal::from_str(raw).with_context(|| format!("Invalid decimal in database: {}", raw))
}

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        // A private in-memory database must live on a single connection
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS decision_sets (
                cycle_id TEXT PRIMARY KEY,
                as_of TEXT NOT NULL,
                buy_count INTEGER NOT NULL,
                sell_count INTEGER NOT NULL,
                hold_count INTEGER NOT NULL,
                rejected_count INTEGER NOT NULL,
                total_buy_value TEXT NOT NULL,
                total_sell_value TEXT NOT NULL,
                projected_cash TEXT NOT NULL,
                projected_exposure TEXT NOT NULL,
                report TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS decisions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cycle_id TEXT NOT NULL,
                ticker TEXT NOT NULL,
                action TEXT NOT NULL,
                size_fraction TEXT NOT NULL,
                amount TEXT NOT NULL,
                confidence REAL,
                rationale TEXT NOT NULL,
                flags TEXT NOT NULL DEFAULT '',
                UNIQUE(cycle_id, ticker),
                FOREIGN KEY (cycle_id) REFERENCES decision_sets(cycle_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cycle_runs (
                run_id TEXT PRIMARY KEY,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                status TEXT NOT NULL,
                cycle_id TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                dry_run INTEGER NOT NULL DEFAULT 0,
                error TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS equity_curve (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                portfolio_value TEXT NOT NULL,
                cash TEXT NOT NULL,
                exposure TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Indexes
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_decisions_cycle ON decisions(cycle_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_cycle_runs_started ON cycle_runs(started_at)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_equity_curve_time ON equity_curve(timestamp)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ==================== Decision Sets ====================

    /// Persist a decision set. Returns `false` if it was already stored.
    pub async fn save_decision_set(&self, set: &DecisionSet) -> Result<bool> {
        let report = serde_json::to_string(set).context("Failed to serialize decision set")?;
        let s = &set.summary;

        let mut tx = self.pool.begin().await.context("Failed to open transaction")?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO decision_sets (
                cycle_id, as_of, buy_count, sell_count, hold_count, rejected_count,
                total_buy_value, total_sell_value, projected_cash, projected_exposure,
                report, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(cycle_id) DO NOTHING
            "#,
        )
        .bind(&set.cycle_id)
        .bind(set.as_of)
        .bind(s.buy_count as i64)
        .bind(s.sell_count as i64)
        .bind(s.hold_count as i64)
        .bind(s.rejected_count as i64)
        .bind(s.total_buy_value.to_string())
        .bind(s.total_sell_value.to_string())
        .bind(s.projected_cash.to_string())
        .bind(s.projected_exposure.to_string())
        .bind(&report)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;

        if !inserted {
            tx.rollback().await?;
            debug!(cycle_id = %set.cycle_id, "Decision set already stored");
            return Ok(false);
        }

        for d in set.decisions.values() {
            let flags = d.flags.iter().map(DecisionFlag::as_str).collect::<Vec<_>>().join(",");

            sqlx::query(
                r#"
                INSERT INTO decisions (cycle_id, ticker, action, size_fraction, amount, confidence, rationale, flags)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&set.cycle_id)
            .bind(&d.ticker)
            .bind(d.action.as_str())
            .bind(d.size_fraction.to_string())
            .bind(d.amount.to_string())
            .bind(d.confidence)
            .bind(&d.rationale)
            .bind(flags)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await.context("Failed to commit decision set")?;
        Ok(true)
    }

    /// Load a full decision set by fingerprint.
    pub async fn get_decision_set(&self, cycle_id: &str) -> Result<Option<DecisionSet>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT report FROM decision_sets WHERE cycle_id = ?")
            .bind(cycle_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|(report,)| serde_json::from_str(&report).context("Failed to parse stored decision set"))
            .transpose()
    }

    /// Most recent decision sets, newest first.
    pub async fn recent_decision_sets(&self, limit: i64) -> Result<Vec<StoredDecisionSet>> {
        sqlx::query_as::<_, StoredDecisionSet>(
            r#"
            SELECT cycle_id, as_of, buy_count, sell_count, hold_count, rejected_count,
                   total_buy_value, total_sell_value, projected_cash, projected_exposure, created_at
            FROM decision_sets
            ORDER BY as_of DESC, created_at DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch decision sets")
    }

    /// Decisions of one set, in ticker order.
    pub async fn get_decisions(&self, cycle_id: &str) -> Result<Vec<StoredDecision>> {
        sqlx::query_as::<_, StoredDecision>(
            r#"
            SELECT ticker, action, size_fraction, amount, confidence, rationale, flags
            FROM decisions
            WHERE cycle_id = ?
            ORDER BY ticker
            "#,
        )
        .bind(cycle_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch decisions")
    }

    // ==================== Cycle Runs ====================

    /// Record the start of a cycle run.
    pub async fn start_cycle_run(&self, run_id: &str, started_at: DateTime<Utc>, dry_run: bool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cycle_runs (run_id, started_at, status, dry_run)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(run_id)
        .bind(started_at)
        .bind(RunStatus::Running.as_str())
        .bind(dry_run)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Record how a cycle run ended.
    pub async fn finish_cycle_run(
        &self,
        run_id: &str,
        status: RunStatus,
        cycle_id: Option<&str>,
        attempts: u32,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE cycle_runs SET
                finished_at = ?,
                status = ?,
                cycle_id = ?,
                attempts = ?,
                error = ?
            WHERE run_id = ?
            "#,
        )
        .bind(Utc::now())
        .bind(status.as_str())
        .bind(cycle_id)
        .bind(attempts as i64)
        .bind(error)
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Whether a non-dry run succeeded at or after `since`.
    pub async fn has_successful_run_since(&self, since: DateTime<Utc>) -> Result<bool> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM cycle_runs WHERE status = ? AND dry_run = 0 AND started_at >= ?",
        )
        .bind(RunStatus::Succeeded.as_str())
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(count > 0)
    }

    /// Most recent cycle runs, newest first.
    pub async fn recent_cycle_runs(&self, limit: i64) -> Result<Vec<StoredCycleRun>> {
        sqlx::query_as::<_, StoredCycleRun>(
            r#"
            SELECT run_id, started_at, finished_at, status, cycle_id, attempts, dry_run, error
            FROM cycle_runs
            ORDER BY started_at DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch cycle runs")
    }

    // ==================== Equity Curve ====================

    /// Record the marked portfolio value of a snapshot.
    pub async fn record_equity_point(&self, portfolio: &PortfolioState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO equity_curve (timestamp, portfolio_value, cash, exposure)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(portfolio.as_of)
        .bind(portfolio.marked_value().to_string())
        .bind(portfolio.cash_available.to_string())
        .bind(portfolio.exposure().round_dp(6).to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Recent equity curve points, newest first.
    pub async fn get_equity_curve(&self, limit: i64) -> Result<Vec<EquityPoint>> {
        sqlx::query_as::<_, EquityPoint>(
            "SELECT timestamp, portfolio_value, cash, exposure FROM equity_curve ORDER BY timestamp DESC, id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch equity curve")
    }

    /// Highest recorded portfolio value, if any.
    pub async fn equity_peak(&self) -> Result<Option<Decimal>> {
        // TEXT columns do not order numerically
        let values: Vec<(String,)> = sqlx::query_as("SELECT portfolio_value FROM equity_curve")
            .fetch_all(&self.pool)
            .await?;

        let mut peak: Option<Decimal> = None;
        for (raw,) in values {
            let value = parse_decimal(&raw)?;
            peak = Some(peak.map_or(value, |p| p.max(value)));
        }
        Ok(peak)
    }

    /// Maximum drawdown over the recorded equity curve.
    pub async fn calculate_max_drawdown(&self, limit: i64) -> Result<Decimal> {
        let points = self.get_equity_curve(limit).await?;

        // Points are in DESC order, reverse for calculation
        let values = points
            .iter()
            .rev()
            .map(EquityPoint::value)
            .collect::<Result<Vec<_>>>()?;

        Ok(metrics::max_drawdown(&values))
    }
}

#[async_trait]
impl DecisionSink for Database {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn persist(&self, set: &DecisionSet) -> Result<()> {
        if self.save_decision_set(set).await? {
            info!(cycle_id = %set.cycle_id, decisions = set.decisions.len(), "Stored decision set");
        }
        Ok(())
    }
}
