//! Cryptonita decision engine
//!
//! Turns per-asset forecasts into sized BUY / SELL / HOLD decisions for a
//! long-only crypto basket, under portfolio-level risk budgets.

mod api;
mod bot;
mod db;
mod error;
mod metrics;
mod models;
mod trading;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{TimeZone, Timelike, Utc};
use clap::{Args, Parser, Subcommand};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::api::{HttpSource, RawPosition, SnapshotDirSource};
use crate::bot::{Bot, BotConfig, RetryConfig, ScheduleConfig, Sources};
use crate::db::Database;
use crate::metrics::StatisticsCalculator;
use crate::models::{AssetStatistics, DecisionSet, DecisionSummary, PredictedSide, Signal};
use crate::trading::{DecisionEngine, EngineConfig, PositionSizer, SnapshotBuilder};

/// Equity points considered for the drawdown shown by `history`.
const EQUITY_LOOKBACK: i64 = 365;

/// Crypto position sizing and trade decision engine.
#[derive(Parser)]
#[command(name = "cryptonita")]
#[command(about = "Size and decide trades for a crypto basket", long_about = None)]
struct Cli {
    /// Database URL
    #[arg(short, long, env = "DATABASE_URL", default_value = "sqlite:./cryptonita.db?mode=rwc")]
    database: String,

    /// Engine configuration file (TOML, optional)
    #[arg(short, long, env = "CRYPTONITA_CONFIG", default_value = "cryptonita.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

/// Where collaborator data comes from.
#[derive(Args, Clone)]
struct SourceArgs {
    /// Directory holding predictions.json, balances.json, positions.json, asset_stats.json
    #[arg(long, env = "CRYPTONITA_SNAPSHOT_DIR", conflicts_with = "api_url")]
    snapshot_dir: Option<PathBuf>,

    /// Base URL of the data service
    #[arg(long, env = "CRYPTONITA_API_URL")]
    api_url: Option<String>,
}

impl SourceArgs {
    fn sources(&self) -> Result<Sources> {
        match (&self.snapshot_dir, &self.api_url) {
            (Some(dir), _) => Ok(Sources::shared(Arc::new(SnapshotDirSource::new(dir)))),
            (None, Some(url)) => Ok(Sources::shared(Arc::new(HttpSource::new(url.as_str())?))),
            (None, None) => anyhow::bail!("Either --snapshot-dir or --api-url is required"),
        }
    }
}

/// Cycle runner settings shared by `run` and `daemon`.
#[derive(Args, Clone)]
struct CycleArgs {
    #[command(flatten)]
    source: SourceArgs,

    /// Directory for signals.json and decision_report.json
    #[arg(long, env = "CRYPTONITA_EXPORT_DIR", default_value = "./signals")]
    export_dir: PathBuf,

    /// Wall-clock budget per cycle in seconds
    #[arg(long, default_value = "1800")]
    timeout: u64,

    /// Collaborator fetch attempts per cycle
    #[arg(long, default_value = "3")]
    max_attempts: u32,

    /// Evaluate without persisting the decision set
    #[arg(long)]
    dry_run: bool,
}

impl CycleArgs {
    fn bot_config(&self, schedule: ScheduleConfig) -> BotConfig {
        BotConfig {
            dry_run: self.dry_run,
            export_dir: self.export_dir.clone(),
            cycle_timeout: Duration::from_secs(self.timeout),
            retry: RetryConfig {
                max_attempts: self.max_attempts,
                ..RetryConfig::default()
            },
            schedule,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run one decision cycle
    Run {
        #[command(flatten)]
        cycle: CycleArgs,
    },

    /// Run decision cycles on a daily schedule (UTC)
    Daemon {
        #[command(flatten)]
        cycle: CycleArgs,

        /// Hour of the daily run
        #[arg(long, default_value = "8")]
        primary_hour: u32,

        /// Hour of the backup run, skipped after a successful cycle
        #[arg(long, default_value = "2")]
        backup_hour: u32,
    },

    /// Size a hypothetical BUY candidate and show every component
    Size {
        /// Ticker of the candidate
        #[arg(short, long)]
        ticker: String,

        /// Model confidence (0-1)
        #[arg(long)]
        confidence: f64,

        /// Historical win rate (0-1)
        #[arg(long)]
        win_rate: f64,

        /// Average winning return (0.08 = 8%)
        #[arg(long)]
        avg_win: f64,

        /// Average losing return, as a positive number
        #[arg(long)]
        avg_loss: f64,

        /// Annualized volatility
        #[arg(long)]
        volatility: f64,

        /// Available cash
        #[arg(long, default_value = "10000")]
        cash: Decimal,

        /// Open position as TICKER=AMOUNT (repeatable)
        #[arg(long = "position", value_parser = parse_position)]
        positions: Vec<(String, Decimal)>,

        /// Historical equity peak, for the drawdown adjustment
        #[arg(long)]
        peak: Option<Decimal>,

        /// UTC hour for the time-of-day adjustment (defaults to now)
        #[arg(long)]
        hour: Option<u32>,
    },

    /// Derive asset statistics from per-ticker return series
    Stats {
        /// JSON file: {"TICKER": [r1, r2, ...]}
        input: PathBuf,

        /// Series are prices rather than returns
        #[arg(long)]
        prices: bool,

        /// Write asset_stats.json here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show recent decision sets and cycle runs
    History {
        /// Number of entries to show
        #[arg(short = 'n', long, default_value = "10")]
        limit: i64,

        /// Show the decisions of one cycle
        #[arg(long)]
        cycle: Option<String>,
    },

    /// Show the effective engine configuration
    Config {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = EngineConfig::load(Some(cli.config.as_path()))?;

    match cli.command {
        Commands::Run { cycle } => {
            let db = Database::new(&cli.database).await?;
            let engine = DecisionEngine::new(config)?;
            let bot = Bot::new(
                cycle.bot_config(ScheduleConfig::default()),
                engine,
                cycle.source.sources()?,
                db,
            );

            let outcome = bot.run_cycle().await?;
            print_decision_set(&outcome.decision_set);
            println!(
                "\nRun {} ({} attempt{}) {}",
                outcome.run_id,
                outcome.attempts,
                if outcome.attempts == 1 { "" } else { "s" },
                if outcome.persisted { "persisted" } else { "DRY RUN, not persisted" }
            );
        }

        Commands::Daemon {
            cycle,
            primary_hour,
            backup_hour,
        } => {
            let schedule = ScheduleConfig {
                primary_hour,
                backup_hour,
            };
            schedule.validate()?;

            let db = Database::new(&cli.database).await?;
            let engine = DecisionEngine::new(config)?;
            let bot = Bot::new(cycle.bot_config(schedule), engine, cycle.source.sources()?, db);

            println!("\n=== Cryptonita Scheduler ===");
            println!("Primary run: {:02}:00 UTC", primary_hour);
            println!("Backup run:  {:02}:00 UTC", backup_hour);
            println!("Mode: {}", if cycle.dry_run { "DRY RUN" } else { "LIVE" });
            println!("\nPress Ctrl+C to stop.\n");

            bot.run_daily().await?;
        }

        Commands::Size {
            ticker,
            confidence,
            win_rate,
            avg_win,
            avg_loss,
            volatility,
            cash,
            positions,
            peak,
            hour,
        } => {
            let now = Utc::now();
            let hour = hour.unwrap_or_else(|| now.hour());
            let as_of = now
                .date_naive()
                .and_hms_opt(hour, 0, 0)
                .map(|naive| Utc.from_utc_datetime(&naive))
                .with_context(|| format!("Invalid hour {}", hour))?;

            let raw_positions: Vec<RawPosition> = positions
                .into_iter()
                .map(|(ticker, amount)| RawPosition {
                    ticker,
                    amount_invested: amount,
                    entry_price: Decimal::ONE,
                    entry_timestamp: as_of,
                    current_price: None,
                })
                .collect();
            let portfolio = SnapshotBuilder::build_portfolio(cash, &raw_positions, peak, as_of)?;

            let ticker = trading::normalize_ticker(&ticker);
            let signal = Signal {
                ticker: ticker.clone(),
                predicted_side: PredictedSide::Buy,
                confidence,
                buy_probability: confidence,
                sell_probability: 1.0 - confidence,
            };
            let stats = AssetStatistics {
                ticker: ticker.clone(),
                historical_win_rate: win_rate,
                avg_win,
                avg_loss,
                annualized_volatility: volatility,
            };

            let sizer = PositionSizer::new(&config);
            let breakdown = sizer.calculate(&signal, &stats, &portfolio);
            let amount = sizer.amount_for(breakdown.fraction, &portfolio);

            println!("\n=== Position Size: {} ===\n", ticker);
            println!("Portfolio:");
            println!("  Total Value:          ${:.2}", portfolio.total_value);
            println!("  Drawdown:             {:.2}%", portfolio.drawdown * dec!(100));
            println!("  Open Positions:       {}", portfolio.position_count());

            println!("\nKelly:");
            match breakdown.full_kelly {
                Some(k) => println!("  Full Kelly:           {:.4}", k),
                None => println!("  Full Kelly:           n/a (degenerate statistics)"),
            }
            println!("  Kelly Component:      {:.4}", breakdown.kelly_component);

            println!("\nVolatility:");
            println!("  Adjustment:           {:.3}", breakdown.volatility_adjustment);
            println!("  Component:            {:.4}", breakdown.volatility_component);

            println!("\nAdjustments:");
            println!("  Base Fraction:        {:.4}", breakdown.base_fraction);
            println!(
                "  Correlation:          {:.2} ({} co-held in {})",
                breakdown.correlation_adjustment, breakdown.co_held, breakdown.correlation_bucket
            );
            println!("  Drawdown:             {:.2}", breakdown.drawdown_adjustment);
            println!("  Time of Day:          {:.2} ({:02}:00 UTC)", breakdown.time_adjustment, hour);
            println!("  Raw Fraction:         {:.4}", breakdown.raw_fraction);

            println!("\nResult:");
            println!("  Size:                 {}%", breakdown.fraction * dec!(100));
            println!("  Amount:               ${}", amount);
            println!("  Rationale:            {}", breakdown.rationale());
        }

        Commands::Stats {
            input,
            prices,
            output,
        } => {
            let raw = tokio::fs::read_to_string(&input)
                .await
                .with_context(|| format!("Failed to read {}", input.display()))?;
            let mut series: BTreeMap<String, Vec<f64>> =
                serde_json::from_str(&raw).context("Failed to parse return series")?;

            if prices {
                for values in series.values_mut() {
                    *values = StatisticsCalculator::returns_from_prices(values);
                }
            }

            let stats = StatisticsCalculator::from_series(&series);
            let body = serde_json::to_string_pretty(&stats)?;

            match output {
                Some(path) => {
                    tokio::fs::write(&path, body)
                        .await
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    info!(path = %path.display(), assets = stats.len(), "Asset statistics written");
                }
                None => println!("{}", body),
            }
        }

        Commands::History { limit, cycle } => {
            let db = Database::new(&cli.database).await?;

            if let Some(cycle_id) = cycle {
                let set = db
                    .get_decision_set(&cycle_id)
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("Decision set {} not found", cycle_id))?;
                let rows = db.get_decisions(&cycle_id).await?;

                println!("\n=== Decision Set {} ===", cycle_id);
                println!("As of: {}\n", set.as_of.format("%Y-%m-%d %H:%M:%S UTC"));
                println!(
                    "{:<12} {:<6} {:>10} {:>12} {:>6}  {:<24} {}",
                    "TICKER", "ACTION", "FRACTION", "AMOUNT", "CONF", "FLAGS", "RATIONALE"
                );
                println!("{}", "-".repeat(110));
                for d in rows {
                    println!(
                        "{:<12} {:<6} {:>10} {:>12} {:>6}  {:<24} {}",
                        d.ticker,
                        d.action,
                        d.size_fraction,
                        d.amount,
                        d.confidence.map(|c| format!("{:.2}", c)).unwrap_or_else(|| "-".to_string()),
                        if d.flags.is_empty() { "-" } else { d.flags.as_str() },
                        truncate(&d.rationale, 50)
                    );
                }
                print_summary(&set.summary);
                return Ok(());
            }

            let sets = db.recent_decision_sets(limit).await?;
            if sets.is_empty() {
                println!("No decision sets yet. Use 'cryptonita run' to produce one.");
            } else {
                println!(
                    "\n{:<18} {:<17} {:>4} {:>4} {:>4} {:>4} {:>12} {:>12} {:>12} {:>9}  {}",
                    "CYCLE", "AS OF", "BUY", "SELL", "HOLD", "REJ", "BUY VALUE", "SELL VALUE", "PROJ CASH", "EXPOSURE", "STORED"
                );
                println!("{}", "-".repeat(130));
                for s in sets {
                    println!(
                        "{:<18} {:<17} {:>4} {:>4} {:>4} {:>4} {:>12} {:>12} {:>12} {:>9}  {}",
                        truncate(&s.cycle_id, 16),
                        s.as_of.format("%Y-%m-%d %H:%M"),
                        s.buy_count,
                        s.sell_count,
                        s.hold_count,
                        s.rejected_count,
                        s.total_buy_value,
                        s.total_sell_value,
                        s.projected_cash,
                        s.projected_exposure,
                        s.created_at.format("%Y-%m-%d %H:%M")
                    );
                }
            }

            let runs = db.recent_cycle_runs(limit).await?;
            if !runs.is_empty() {
                println!(
                    "\n{:<38} {:<17} {:<10} {:>8} {:>8} {:>4}  {:<18} {}",
                    "RUN", "STARTED", "STATUS", "DURATION", "ATTEMPTS", "DRY", "CYCLE", "ERROR"
                );
                println!("{}", "-".repeat(130));
                for r in runs {
                    let duration = r
                        .finished_at
                        .map(|end| format!("{}s", (end - r.started_at).num_seconds()))
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "{:<38} {:<17} {:<10} {:>8} {:>8} {:>4}  {:<18} {}",
                        r.run_id,
                        r.started_at.format("%Y-%m-%d %H:%M"),
                        r.status,
                        duration,
                        r.attempts,
                        if r.dry_run { "yes" } else { "no" },
                        truncate(r.cycle_id.as_deref().unwrap_or("-"), 16),
                        truncate(r.error.as_deref().unwrap_or(""), 40)
                    );
                }
            }

            if let Some(latest) = db.get_equity_curve(1).await?.into_iter().next() {
                println!(
                    "\nLatest equity: ${} (cash ${}, exposure {}) at {}",
                    latest.value()?,
                    latest.cash,
                    latest.exposure,
                    latest.timestamp.format("%Y-%m-%d %H:%M UTC")
                );
            }
            let max_dd = db.calculate_max_drawdown(EQUITY_LOOKBACK).await?;
            println!("Max drawdown (recorded equity): {:.2}%", max_dd * dec!(100));
        }

        Commands::Config { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(&config)?);
                return Ok(());
            }

            println!("\n=== Engine Configuration ===\n");
            println!("Signals:");
            println!("  BUY Confidence:       {:.2}", config.buy_confidence_threshold);
            println!("  SELL Confidence:      {:.2}", config.sell_confidence_threshold);
            println!("  Universe:             {} tickers", config.universe.len());
            println!("  Quote Currency:       {}", config.quote_currency);

            println!("\nPosition Sizing:");
            println!("  Min Position:         {}%", config.min_position_size * dec!(100));
            println!("  Max Position:         {}%", config.max_position_size * dec!(100));
            println!("  Kelly Fraction:       {}", config.base_kelly_fraction);
            println!("  Base Vol Fraction:    {}", config.base_volatility_fraction);
            println!("  Target Vol:           {:.0}%", config.target_portfolio_vol * 100.0);
            println!(
                "  Time of Day:          {}",
                if config.time_of_day.enabled { "enabled" } else { "disabled" }
            );
            println!("  Correlation Buckets:  {}", config.correlation.buckets.len());

            println!("\nPortfolio Limits:");
            println!("  Max Invested:         {}%", config.max_total_invested * dec!(100));
            println!("  Min Cash Reserve:     {}%", config.min_cash_reserve * dec!(100));
            println!("  Max Positions:        {}", config.max_simultaneous_positions);
            println!("  Min Trade:            ${}", config.min_trade_amount);

            println!("\nRisk Management:");
            println!("  Drawdown Threshold:   {}%", config.max_drawdown_threshold * dec!(100));
            println!("  Drawdown Reduction:   {}", config.drawdown_reduction_factor);
            println!("  Stop Loss:            {}", percent_or_off(config.stop_loss_pct));
            println!("  Take Profit:          {}", percent_or_off(config.take_profit_pct));
        }
    }

    Ok(())
}

fn print_decision_set(set: &DecisionSet) {
    println!("\n=== Decision Set {} ===", truncate(&set.cycle_id, 16));
    println!("As of: {}\n", set.as_of.format("%Y-%m-%d %H:%M:%S UTC"));
    println!(
        "{:<12} {:<6} {:>8} {:>12} {:>6}  {}",
        "TICKER", "ACTION", "SIZE", "AMOUNT", "CONF", "RATIONALE"
    );
    println!("{}", "-".repeat(100));

    for d in set.decisions.values() {
        println!(
            "{:<12} {:<6} {:>7.2}% {:>12} {:>6}  {}",
            d.ticker,
            d.action,
            d.size_fraction * dec!(100),
            d.amount,
            d.confidence.map(|c| format!("{:.2}", c)).unwrap_or_else(|| "-".to_string()),
            truncate(&d.rationale, 60)
        );
    }

    print_summary(&set.summary);
}

fn print_summary(s: &DecisionSummary) {
    println!("\nBUY {} | SELL {} | HOLD {} ({} rejected)", s.buy_count, s.sell_count, s.hold_count, s.rejected_count);
    println!("Buys:  ${}  Sells: ${}  Net: ${}", s.total_buy_value, s.total_sell_value, s.net_cash_flow);
    println!(
        "Projected cash: ${}  After settlement: ${}  Exposure: {:.2}%",
        s.projected_cash,
        s.cash_after_settlement,
        s.projected_exposure * dec!(100)
    );
}

fn percent_or_off(value: Option<Decimal>) -> String {
    value
        .map(|v| format!("{}%", v * dec!(100)))
        .unwrap_or_else(|| "off".to_string())
}

/// Parse `TICKER=AMOUNT`.
fn parse_position(s: &str) -> Result<(String, Decimal), String> {
    let (ticker, amount) = s
        .split_once('=')
        .ok_or_else(|| format!("expected TICKER=AMOUNT, got '{}'", s))?;
    let amount: Decimal = amount
        .trim()
        .parse()
        .map_err(|e| format!("invalid amount '{}': {}", amount, e))?;
    Ok((ticker.trim().to_string(), amount))
}

/// Truncate a string with ellipsis if too long.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_position() {
        assert_eq!(parse_position("btc-usd=1500").unwrap(), ("btc-usd".to_string(), dec!(1500)));
        assert!(parse_position("BTC-USD").is_err());
        assert!(parse_position("BTC-USD=abc").is_err());
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a much longer rationale", 10), "a much ...");
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from([
            "cryptonita",
            "run",
            "--snapshot-dir",
            "./data",
            "--dry-run",
        ])
        .unwrap();
        match cli.command {
            Commands::Run { cycle } => {
                assert!(cycle.dry_run);
                assert_eq!(cycle.timeout, 1800);
                assert!(cycle.source.sources().is_ok());
            }
            _ => panic!("expected run"),
        }
    }
}
