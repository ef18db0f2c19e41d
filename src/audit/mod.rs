//! Audit trail
//!
//! One record per guard per cycle with the inputs that produced the decision,
//! written to a daily CSV file under `<data_dir>/audit/`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use csv::WriterBuilder;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, RwLock as AsyncRwLock};
use uuid::Uuid;

use crate::guards::{Decision, GuardOutcome};
use crate::types::{AccountSnapshot, Feed, GuardKind, NewsEvent};

/// Inputs the cycle saw, kept so a decision can be reproduced
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InputsSnapshot {
    pub balance: Option<Decimal>,
    pub floating_pnl: Option<Decimal>,
    pub floating_pct: Option<Decimal>,
    pub open_positions: usize,
    /// `None` when the calendar was unavailable
    pub news_events: Option<usize>,
}

impl InputsSnapshot {
    pub fn capture(account: &Feed<AccountSnapshot>, news: &Feed<Vec<NewsEvent>>) -> Self {
        let snap = account.available();
        Self {
            balance: snap.map(|s| s.balance),
            floating_pnl: snap.map(|s| s.floating_pnl),
            floating_pct: snap.and_then(|s| s.floating_pct()).map(|p| p.round_dp(4)),
            open_positions: snap.map(|s| s.positions.len()).unwrap_or(0),
            news_events: news.available().map(|e| e.len()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub cycle_id: Uuid,
    pub guard: GuardKind,
    pub decision: Decision,
    pub reason: String,
    pub actions: usize,
    pub inputs: InputsSnapshot,
}

impl AuditRecord {
    pub fn from_outcome(
        cycle_id: Uuid,
        timestamp: DateTime<Utc>,
        outcome: &GuardOutcome,
        inputs: &InputsSnapshot,
    ) -> Self {
        Self {
            timestamp,
            cycle_id,
            guard: outcome.guard,
            decision: outcome.decision,
            reason: outcome.reason.clone(),
            actions: outcome.actions.len(),
            inputs: inputs.clone(),
        }
    }
}

/// Flat CSV row; csv cannot serialize nested structs
#[derive(Debug, Serialize, Deserialize)]
struct AuditRow {
    timestamp: String,
    cycle_id: String,
    guard: String,
    decision: String,
    reason: String,
    actions: usize,
    balance: Option<Decimal>,
    floating_pnl: Option<Decimal>,
    floating_pct: Option<Decimal>,
    open_positions: usize,
    news_events: Option<usize>,
}

impl From<&AuditRecord> for AuditRow {
    fn from(r: &AuditRecord) -> Self {
        Self {
            timestamp: r.timestamp.to_rfc3339(),
            cycle_id: r.cycle_id.to_string(),
            guard: r.guard.to_string(),
            decision: r.decision.to_string(),
            reason: r.reason.clone(),
            actions: r.actions,
            balance: r.inputs.balance,
            floating_pnl: r.inputs.floating_pnl,
            floating_pct: r.inputs.floating_pct,
            open_positions: r.inputs.open_positions,
            news_events: r.inputs.news_events,
        }
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, records: &[AuditRecord]) -> Result<()>;
}

/// Daily `audit_<date>.csv` files
pub struct CsvAuditLog {
    dir: PathBuf,
    current: Mutex<Option<(NaiveDate, csv::Writer<std::fs::File>)>>,
}

impl CsvAuditLog {
    pub fn new(data_dir: impl AsRef<Path>) -> Result<Self> {
        let dir = data_dir.as_ref().join("audit");
        fs::create_dir_all(&dir).context("Failed to create audit directory")?;
        Ok(Self {
            dir,
            current: Mutex::new(None),
        })
    }

    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("audit_{}.csv", date.format("%Y-%m-%d")))
    }

    fn create_writer(path: &Path) -> Result<csv::Writer<std::fs::File>> {
        let file_has_data =
            path.exists() && fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .context("Failed to open audit file")?;

        Ok(WriterBuilder::new()
            .has_headers(!file_has_data)
            .from_writer(file))
    }
}

#[async_trait]
impl AuditSink for CsvAuditLog {
    async fn record(&self, records: &[AuditRecord]) -> Result<()> {
        let mut current = self.current.lock().await;

        for record in records {
            let date = record.timestamp.date_naive();
            let rotate = !matches!(current.as_ref(), Some((d, _)) if *d == date);
            if rotate {
                *current = Some((date, Self::create_writer(&self.path_for(date))?));
            }
            if let Some((_, writer)) = current.as_mut() {
                writer
                    .serialize(AuditRow::from(record))
                    .context("Failed to write audit record")?;
            }
        }

        if let Some((_, writer)) = current.as_mut() {
            writer.flush().context("Failed to flush audit writer")?;
        }
        Ok(())
    }
}

/// Keeps records in memory; used for dry runs and tests
#[derive(Default)]
pub struct MemoryAuditLog {
    records: AsyncRwLock<Vec<AuditRecord>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<AuditRecord> {
        self.records.read().await.clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditLog {
    async fn record(&self, records: &[AuditRecord]) -> Result<()> {
        self.records.write().await.extend_from_slice(records);
        Ok(())
    }
}
