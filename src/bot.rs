//! Cycle runner: main orchestration of one decision cycle plus the daily schedule.
//!
//! Handles:
//! - Gathering balances, positions, forecasts and statistics concurrently
//! - Retrying transient collaborator failures with bounded backoff
//! - Enforcing a wall-clock budget per cycle
//! - Handing the decision set to its sinks and recording the run

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use backoff::future::retry;
use backoff::ExponentialBackoffBuilder;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::api::{ForecastSource, PortfolioSource, RawPosition, StatisticsSource};
use crate::db::{Database, RunStatus};
use crate::error::EngineError;
use crate::models::{DecisionFlag, DecisionSet, TradeAction};
use crate::trading::{
    normalize_ticker, CycleSnapshot, DecisionEngine, DecisionSink, ForecastAdapter, JsonExporter,
    SnapshotBuilder,
};

/// Retry policy for collaborator reads.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total fetch attempts per cycle, first one included
    pub max_attempts: u32,

    pub initial_interval: Duration,

    pub multiplier: f64,

    pub max_interval: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_secs(1),
            multiplier: 2.0,
            max_interval: Duration::from_secs(30),
        }
    }
}

/// Daily schedule (UTC hours).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleConfig {
    pub primary_hour: u32,

    /// Runs only when no cycle succeeded during the preceding day
    pub backup_hour: u32,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            primary_hour: 8,
            backup_hour: 2,
        }
    }
}

impl ScheduleConfig {
    pub fn validate(&self) -> Result<()> {
        if self.primary_hour > 23 || self.backup_hour > 23 {
            anyhow::bail!(
                "Schedule hours must be in 0..=23 (primary {}, backup {})",
                self.primary_hour,
                self.backup_hour
            );
        }
        if self.primary_hour == self.backup_hour {
            anyhow::bail!("Primary and backup runs cannot share hour {}", self.primary_hour);
        }
        Ok(())
    }
}

/// Which scheduled run fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Primary,
    Backup,
}

/// Bot configuration.
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Evaluate and report without persisting the decision set
    pub dry_run: bool,

    /// Directory receiving `signals.json` and `decision_report.json`
    pub export_dir: PathBuf,

    /// Wall-clock budget for one cycle
    pub cycle_timeout: Duration,

    pub retry: RetryConfig,

    pub schedule: ScheduleConfig,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            export_dir: PathBuf::from("./signals"),
            cycle_timeout: Duration::from_secs(30 * 60),
            retry: RetryConfig::default(),
            schedule: ScheduleConfig::default(),
        }
    }
}

/// Collaborators the runner reads from.
#[derive(Clone)]
pub struct Sources {
    pub forecasts: Arc<dyn ForecastSource>,
    pub portfolio: Arc<dyn PortfolioSource>,
    pub statistics: Arc<dyn StatisticsSource>,
}

impl Sources {
    /// One backend serving every collaborator role.
    pub fn shared<S>(source: Arc<S>) -> Self
    where
        S: ForecastSource + PortfolioSource + StatisticsSource + 'static,
    {
        Self {
            forecasts: source.clone(),
            portfolio: source.clone(),
            statistics: source,
        }
    }
}

/// Result of one successful cycle.
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub run_id: String,
    pub decision_set: DecisionSet,
    pub attempts: u32,
    pub persisted: bool,
}

/// The cycle runner.
pub struct Bot {
    config: BotConfig,
    engine: DecisionEngine,
    sources: Sources,
    db: Database,
    sinks: Vec<Box<dyn DecisionSink>>,
}

impl Bot {
    pub fn new(config: BotConfig, engine: DecisionEngine, sources: Sources, db: Database) -> Self {
        let sinks: Vec<Box<dyn DecisionSink>> = vec![
            Box::new(JsonExporter::new(config.export_dir.clone())),
            Box::new(db.clone()),
        ];

        info!(
            dry_run = config.dry_run,
            export_dir = %config.export_dir.display(),
            timeout_secs = config.cycle_timeout.as_secs(),
            "Bot initialized"
        );

        Self {
            config,
            engine,
            sources,
            db,
            sinks,
        }
    }

    /// Run one full cycle and record it.
    pub async fn run_cycle(&self) -> Result<CycleOutcome> {
        let run_id = Uuid::new_v4().to_string();
        self.db
            .start_cycle_run(&run_id, Utc::now(), self.config.dry_run)
            .await
            .context("Failed to record cycle start")?;

        info!(run_id = %run_id, dry_run = self.config.dry_run, "Starting decision cycle");

        let attempts = AtomicU32::new(0);
        let result = match tokio::time::timeout(self.config.cycle_timeout, self.execute_cycle(&attempts)).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!(
                "Cycle exceeded its {}s budget",
                self.config.cycle_timeout.as_secs()
            )),
        };
        let attempts = attempts.load(Ordering::SeqCst);

        match result {
            Ok((decision_set, persisted)) => {
                self.db
                    .finish_cycle_run(&run_id, RunStatus::Succeeded, Some(decision_set.cycle_id.as_str()), attempts, None)
                    .await
                    .context("Failed to record cycle completion")?;

                info!(
                    run_id = %run_id,
                    cycle_id = %decision_set.cycle_id,
                    buys = decision_set.summary.buy_count,
                    sells = decision_set.summary.sell_count,
                    attempts = attempts,
                    persisted = persisted,
                    "Decision cycle complete"
                );

                Ok(CycleOutcome {
                    run_id,
                    decision_set,
                    attempts,
                    persisted,
                })
            }
            Err(e) => {
                error!(run_id = %run_id, attempts = attempts, error = %e, "Decision cycle failed");

                let message = format!("{:#}", e);
                if let Err(db_err) = self
                    .db
                    .finish_cycle_run(&run_id, RunStatus::Failed, None, attempts, Some(message.as_str()))
                    .await
                {
                    warn!(error = %db_err, "Failed to record cycle failure");
                }
                Err(e)
            }
        }
    }

    async fn execute_cycle(&self, attempts: &AtomicU32) -> Result<(DecisionSet, bool)> {
        let snapshot = self.gather_snapshot(attempts).await?;
        let set = self.engine.evaluate(&snapshot)?;

        let trades = set.with_action(TradeAction::Sell).chain(set.with_action(TradeAction::Buy));
        for decision in trades {
            info!(
                ticker = %decision.ticker,
                action = %decision.action,
                amount = %decision.amount,
                fraction = %decision.size_fraction,
                "Decision"
            );
        }

        let unforecast = set
            .decisions
            .values()
            .filter(|d| d.has_flag(DecisionFlag::MissingSignal))
            .count();
        if unforecast > 0 {
            warn!(positions = unforecast, "Open positions kept without a forecast");
        }

        if self.config.dry_run {
            info!(cycle_id = %set.cycle_id, "Dry run, decision set not persisted");
            return Ok((set, false));
        }

        self.db
            .record_equity_point(&snapshot.portfolio)
            .await
            .context("Failed to record equity point")?;

        for sink in &self.sinks {
            sink.persist(&set)
                .await
                .with_context(|| format!("Failed to persist decision set to {}", sink.name()))?;
        }

        Ok((set, true))
    }

    /// Gather the immutable cycle snapshot, retrying transient failures.
    ///
    /// Snapshot validation errors are permanent and fail on the first attempt.
    pub async fn gather_snapshot(&self, attempts: &AtomicU32) -> Result<CycleSnapshot> {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.config.retry.initial_interval)
            .with_multiplier(self.config.retry.multiplier)
            .with_max_interval(self.config.retry.max_interval)
            .with_max_elapsed_time(None)
            .build();
        let max_attempts = self.config.retry.max_attempts.max(1);

        retry(policy, move || async move {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            self.fetch_snapshot().await.map_err(|e| {
                if e.downcast_ref::<EngineError>().is_some() || attempt >= max_attempts {
                    backoff::Error::permanent(e)
                } else {
                    warn!(attempt = attempt, max_attempts = max_attempts, error = %e, "Collaborator read failed, retrying");
                    backoff::Error::transient(e)
                }
            })
        })
        .await
    }

    async fn fetch_snapshot(&self) -> Result<CycleSnapshot> {
        let as_of = Utc::now();
        let currency = self.engine.config().quote_currency.as_str();

        let (cash, positions, equity_peak) = futures::try_join!(
            self.sources.portfolio.get_cash(currency),
            self.sources.portfolio.get_open_positions(),
            self.db.equity_peak(),
        )?;

        let tickers = self.request_tickers(&positions);
        let (predictions, statistics) = futures::try_join!(
            self.sources.forecasts.predict(&tickers),
            self.sources.statistics.get_statistics(&tickers),
        )?;

        debug!(
            cash = %cash,
            positions = positions.len(),
            predictions = predictions.len(),
            statistics = statistics.len(),
            "Collaborator data gathered"
        );

        let portfolio = SnapshotBuilder::build_portfolio(cash, &positions, equity_peak, as_of)?;

        Ok(CycleSnapshot {
            portfolio,
            forecasts: ForecastAdapter::normalize(&predictions),
            statistics: SnapshotBuilder::index_statistics(statistics),
        })
    }

    /// Configured universe plus every held ticker, sorted.
    fn request_tickers(&self, positions: &[RawPosition]) -> Vec<String> {
        let mut tickers: BTreeSet<String> = self
            .engine
            .config()
            .universe
            .iter()
            .map(|t| normalize_ticker(t))
            .collect();
        tickers.extend(positions.iter().map(|p| normalize_ticker(&p.ticker)));
        tickers.retain(|t| !t.is_empty());
        tickers.into_iter().collect()
    }

    /// Run cycles on the daily schedule until Ctrl-C.
    pub async fn run_daily(&self) -> Result<()> {
        let schedule = self.config.schedule;
        schedule.validate()?;

        info!(
            primary_hour = schedule.primary_hour,
            backup_hour = schedule.backup_hour,
            dry_run = self.config.dry_run,
            "Starting daily scheduler"
        );

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            let now = Utc::now();
            let (at, slot) = next_run_at(now, &schedule).context("No schedulable run time")?;
            let wait = (at - now).to_std().unwrap_or_default();
            info!(next_run = %at, slot = ?slot, "Waiting for next scheduled cycle");

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }
            }

            if !self.should_run(slot, at).await {
                continue;
            }

            if let Err(e) = self.run_cycle().await {
                error!(slot = ?slot, error = %e, "Scheduled cycle failed");
            }
        }

        info!("Scheduler stopped");
        Ok(())
    }

    /// Backup runs are skipped when a cycle succeeded during the preceding day.
    async fn should_run(&self, slot: Slot, at: DateTime<Utc>) -> bool {
        if slot == Slot::Primary {
            return true;
        }

        match self.db.has_successful_run_since(at - ChronoDuration::hours(24)).await {
            Ok(true) => {
                info!("Cycle already succeeded within the last day, skipping backup run");
                false
            }
            Ok(false) => {
                warn!("No successful cycle within the last day, running backup");
                true
            }
            Err(e) => {
                warn!(error = %e, "Could not check previous runs, running backup");
                true
            }
        }
    }
}

/// Earliest scheduled run strictly after `now`.
pub fn next_run_at(now: DateTime<Utc>, schedule: &ScheduleConfig) -> Option<(DateTime<Utc>, Slot)> {
    let today = now.date_naive();
    let slots = [
        (schedule.primary_hour, Slot::Primary),
        (schedule.backup_hour, Slot::Backup),
    ];

    (0..=1)
        .filter_map(|offset| today.checked_add_signed(ChronoDuration::days(offset)))
        .flat_map(|day| {
            slots.into_iter().filter_map(move |(hour, slot)| {
                day.and_hms_opt(hour, 0, 0)
                    .map(|naive| (Utc.from_utc_datetime(&naive), slot))
            })
        })
        .filter(|(at, _)| *at > now)
        .min_by_key(|(at, _)| *at)
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use tempfile::TempDir;
    use tokio_test::{assert_err, assert_ok};

    use crate::api::{PredictionsResponse, RawPrediction};
    use crate::models::AssetStatistics;
    use crate::trading::EngineConfig;

    struct FakeSource {
        cash: Decimal,
        positions: Vec<RawPosition>,
        predictions: PredictionsResponse,
        statistics: Vec<AssetStatistics>,
        failures_left: AtomicU32,
        delay: Option<Duration>,
    }

    impl FakeSource {
        fn new(cash: Decimal) -> Self {
            let mut predictions = PredictionsResponse::new();
            predictions.insert(
                "ETH-USD".to_string(),
                RawPrediction {
                    predicted_side: Some("BUY".to_string()),
                    confidence: 0.9,
                    buy_probability: Some(0.8),
                    sell_probability: Some(0.2),
                },
            );
            predictions.insert(
                "ADA-USD".to_string(),
                RawPrediction {
                    predicted_side: Some("SELL".to_string()),
                    confidence: 0.6,
                    buy_probability: Some(0.3),
                    sell_probability: Some(0.7),
                },
            );

            Self {
                cash,
                positions: Vec::new(),
                predictions,
                statistics: vec![AssetStatistics {
                    ticker: "ETH-USD".to_string(),
                    historical_win_rate: 0.6,
                    avg_win: 0.06,
                    avg_loss: 0.04,
                    annualized_volatility: 0.6,
                }],
                failures_left: AtomicU32::new(0),
                delay: None,
            }
        }

        fn failing(self, failures: u32) -> Self {
            self.failures_left.store(failures, Ordering::SeqCst);
            self
        }
    }

    #[async_trait]
    impl ForecastSource for FakeSource {
        async fn predict(&self, _tickers: &[String]) -> Result<PredictionsResponse> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            Ok(self.predictions.clone())
        }
    }

    #[async_trait]
    impl PortfolioSource for FakeSource {
        async fn get_cash(&self, _currency: &str) -> Result<Decimal> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                anyhow::bail!("exchange unavailable");
            }
            Ok(self.cash)
        }

        async fn get_open_positions(&self) -> Result<Vec<RawPosition>> {
            Ok(self.positions.clone())
        }
    }

    #[async_trait]
    impl StatisticsSource for FakeSource {
        async fn get_statistics(&self, _tickers: &[String]) -> Result<Vec<AssetStatistics>> {
            Ok(self.statistics.clone())
        }
    }

    fn test_config(dry_run: bool, export: &TempDir) -> BotConfig {
        BotConfig {
            dry_run,
            export_dir: export.path().join("signals"),
            cycle_timeout: Duration::from_secs(10),
            retry: RetryConfig {
                max_attempts: 3,
                initial_interval: Duration::from_millis(1),
                multiplier: 2.0,
                max_interval: Duration::from_millis(5),
            },
            schedule: ScheduleConfig::default(),
        }
    }

    async fn bot(config: BotConfig, source: FakeSource) -> (Bot, Database) {
        let db = Database::new("sqlite::memory:").await.unwrap();
        let engine = DecisionEngine::new(EngineConfig::default()).unwrap();
        let bot = Bot::new(config, engine, Sources::shared(Arc::new(source)), db.clone());
        (bot, db)
    }

    #[tokio::test]
    async fn test_cycle_is_persisted() {
        let export = TempDir::new().unwrap();
        let config = test_config(false, &export);
        let export_dir = config.export_dir.clone();
        let (bot, db) = bot(config, FakeSource::new(dec!(10000))).await;

        let outcome = bot.run_cycle().await.unwrap();
        assert!(outcome.persisted);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.decision_set.summary.buy_count, 1);
        assert_eq!(outcome.decision_set.get("ETH-USD").unwrap().action, TradeAction::Buy);
        assert_eq!(outcome.decision_set.get("ADA-USD").unwrap().action, TradeAction::Hold);

        let stored = db.get_decision_set(&outcome.decision_set.cycle_id).await.unwrap();
        assert_eq!(stored, Some(outcome.decision_set.clone()));
        assert!(export_dir.join("signals.json").exists());
        assert_eq!(db.get_equity_curve(10).await.unwrap().len(), 1);

        let runs = db.recent_cycle_runs(10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Succeeded.as_str());
        assert_eq!(runs[0].cycle_id.as_deref(), Some(outcome.decision_set.cycle_id.as_str()));

        // Exports live only as long as the test directory
        drop(bot);
        export.close().unwrap();
        assert!(!export_dir.exists());
    }

    #[tokio::test]
    async fn test_dry_run_skips_persistence() {
        let export = TempDir::new().unwrap();
        let (bot, db) = bot(test_config(true, &export), FakeSource::new(dec!(10000))).await;

        let outcome = bot.run_cycle().await.unwrap();
        assert!(!outcome.persisted);
        assert!(db.recent_decision_sets(10).await.unwrap().is_empty());
        assert!(db.get_equity_curve(10).await.unwrap().is_empty());

        let runs = db.recent_cycle_runs(10).await.unwrap();
        assert!(runs[0].dry_run);
        // Dry runs never satisfy the backup check
        assert!(bot.should_run(Slot::Backup, Utc::now()).await);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let export = TempDir::new().unwrap();
        let (bot, _db) = bot(test_config(false, &export), FakeSource::new(dec!(10000)).failing(2)).await;

        let outcome = assert_ok!(bot.run_cycle().await);
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let export = TempDir::new().unwrap();
        let (bot, db) = bot(test_config(false, &export), FakeSource::new(dec!(10000)).failing(5)).await;

        let err = bot.run_cycle().await.unwrap_err();
        assert!(err.to_string().contains("exchange unavailable"));

        let runs = db.recent_cycle_runs(10).await.unwrap();
        assert_eq!(runs[0].status, RunStatus::Failed.as_str());
        assert_eq!(runs[0].attempts, 3);
        assert!(runs[0].error.as_deref().unwrap().contains("exchange unavailable"));
    }

    #[tokio::test]
    async fn test_invalid_snapshot_is_not_retried() {
        let export = TempDir::new().unwrap();
        let (bot, db) = bot(test_config(false, &export), FakeSource::new(dec!(-5))).await;

        assert_err!(bot.run_cycle().await);
        let runs = db.recent_cycle_runs(10).await.unwrap();
        assert_eq!(runs[0].attempts, 1);
    }

    #[tokio::test]
    async fn test_cycle_timeout() {
        let export = TempDir::new().unwrap();
        let mut config = test_config(false, &export);
        config.cycle_timeout = Duration::from_millis(20);
        let mut source = FakeSource::new(dec!(10000));
        source.delay = Some(Duration::from_secs(5));
        let (bot, db) = bot(config, source).await;

        let err = bot.run_cycle().await.unwrap_err();
        assert!(err.to_string().contains("budget"));
        let runs = db.recent_cycle_runs(10).await.unwrap();
        assert_eq!(runs[0].status, RunStatus::Failed.as_str());
    }

    #[tokio::test]
    async fn test_backup_skipped_after_success() {
        let export = TempDir::new().unwrap();
        let (bot, _db) = bot(test_config(false, &export), FakeSource::new(dec!(10000))).await;

        assert!(bot.should_run(Slot::Backup, Utc::now()).await);
        bot.run_cycle().await.unwrap();
        assert!(!bot.should_run(Slot::Backup, Utc::now()).await);
        assert!(bot.should_run(Slot::Primary, Utc::now()).await);
    }

    #[test]
    fn test_next_run_at() {
        let schedule = ScheduleConfig::default();

        let now = Utc.with_ymd_and_hms(2025, 8, 1, 5, 0, 0).unwrap();
        assert_eq!(
            next_run_at(now, &schedule),
            Some((Utc.with_ymd_and_hms(2025, 8, 1, 8, 0, 0).unwrap(), Slot::Primary))
        );

        // Strictly after now
        let now = Utc.with_ymd_and_hms(2025, 8, 1, 8, 0, 0).unwrap();
        assert_eq!(
            next_run_at(now, &schedule),
            Some((Utc.with_ymd_and_hms(2025, 8, 2, 2, 0, 0).unwrap(), Slot::Backup))
        );

        let now = Utc.with_ymd_and_hms(2025, 8, 1, 1, 30, 0).unwrap();
        assert_eq!(
            next_run_at(now, &schedule),
            Some((Utc.with_ymd_and_hms(2025, 8, 1, 2, 0, 0).unwrap(), Slot::Backup))
        );
    }

    #[test]
    fn test_schedule_validation() {
        assert!(ScheduleConfig::default().validate().is_ok());
        assert!(ScheduleConfig { primary_hour: 24, backup_hour: 2 }.validate().is_err());
        assert!(ScheduleConfig { primary_hour: 8, backup_hour: 8 }.validate().is_err());
    }
}
