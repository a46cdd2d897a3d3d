//! Decision set export for the execution collaborator.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

use crate::models::DecisionSet;

/// Action map consumed by the execution collaborator.
pub const SIGNALS_FILE: &str = "signals.json";

/// Full audit record of the last cycle.
pub const REPORT_FILE: &str = "decision_report.json";

/// Destination for a reconciled decision set.
///
/// Implementations must tolerate receiving the same set twice.
#[async_trait]
pub trait DecisionSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn persist(&self, set: &DecisionSet) -> Result<()>;
}

/// Writes `signals.json` and `decision_report.json` into a directory.
pub struct JsonExporter {
    dir: PathBuf,
}

impl JsonExporter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn signals_path(&self) -> PathBuf {
        self.dir.join(SIGNALS_FILE)
    }

    pub fn report_path(&self) -> PathBuf {
        self.dir.join(REPORT_FILE)
    }
}

#[async_trait]
impl DecisionSink for JsonExporter {
    fn name(&self) -> &'static str {
        "json"
    }

    async fn persist(&self, set: &DecisionSet) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create export directory {}", self.dir.display()))?;

        write_json(&self.signals_path(), &set.actions()).await?;
        write_json(&self.report_path(), set).await?;

        info!(
            cycle_id = %set.cycle_id,
            dir = %self.dir.display(),
            "Exported decision set"
        );
        Ok(())
    }
}

/// Write through a temporary file so readers never see a partial document.
async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut body = serde_json::to_vec_pretty(value).context("Failed to serialize export")?;
    body.push(b'\n');

    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &body)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to move {} into place", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use tempfile::TempDir;

    use crate::models::{DecisionSummary, TradeAction, TradeDecision};

    fn decision_set() -> DecisionSet {
        let mut decisions = BTreeMap::new();
        decisions.insert(
            "SOL-USD".to_string(),
            TradeDecision::buy("SOL-USD", dec!(0.08), dec!(800), 0.9, "standard position").unwrap(),
        );
        decisions.insert(
            "BTC-USD".to_string(),
            TradeDecision::hold("BTC-USD", Some(0.6), "BUY confidence below threshold"),
        );

        DecisionSet {
            cycle_id: "abc123".to_string(),
            as_of: Utc.with_ymd_and_hms(2025, 8, 1, 10, 0, 0).unwrap(),
            decisions,
            summary: DecisionSummary {
                buy_count: 1,
                sell_count: 0,
                hold_count: 1,
                rejected_count: 0,
                total_buy_value: dec!(800),
                total_sell_value: Decimal::ZERO,
                net_cash_flow: dec!(-800),
                projected_cash: dec!(9200),
                cash_after_settlement: dec!(9200),
                projected_exposure: dec!(0.08),
            },
        }
    }

    #[tokio::test]
    async fn test_exports_signals_and_report() {
        let tmp = TempDir::new().unwrap();
        let exporter = JsonExporter::new(tmp.path().join("signals"));
        let set = decision_set();

        exporter.persist(&set).await.unwrap();
        let first = std::fs::read_to_string(exporter.signals_path()).unwrap();

        let signals: BTreeMap<String, TradeAction> = serde_json::from_str(&first).unwrap();
        assert_eq!(signals["SOL-USD"], TradeAction::Buy);
        assert_eq!(signals["BTC-USD"], TradeAction::Hold);
        assert!(first.contains("\"SOL-USD\": \"BUY\""));

        let report: DecisionSet =
            serde_json::from_str(&std::fs::read_to_string(exporter.report_path()).unwrap()).unwrap();
        assert_eq!(report, set);

        // Re-exporting the same set leaves the files unchanged
        exporter.persist(&set).await.unwrap();
        assert_eq!(std::fs::read_to_string(exporter.signals_path()).unwrap(), first);
    }
}
