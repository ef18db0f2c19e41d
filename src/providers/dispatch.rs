//! Action sinks
//!
//! `LoggingDispatcher` is the dry-run sink. `JsonlOutboxDispatcher` appends
//! each action as one JSON line for the broker bridge to execute.

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tracing::info;

use super::ActionDispatcher;
use crate::error::{GuardError, Result};
use crate::types::Action;

#[derive(Default)]
pub struct LoggingDispatcher;

#[async_trait]
impl ActionDispatcher for LoggingDispatcher {
    async fn dispatch(&self, action: &Action) -> Result<()> {
        info!(origin = %action.origin(), action = %action, "🧪 [DRY RUN] Action not sent");
        Ok(())
    }
}

#[derive(Serialize)]
struct OutboxLine<'a> {
    queued_at: chrono::DateTime<Utc>,
    action: &'a Action,
}

pub struct JsonlOutboxDispatcher {
    path: PathBuf,
}

impl JsonlOutboxDispatcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ActionDispatcher for JsonlOutboxDispatcher {
    async fn dispatch(&self, action: &Action) -> Result<()> {
        let mut line = serde_json::to_string(&OutboxLine {
            queued_at: Utc::now(),
            action,
        })?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| {
                GuardError::ActionDispatchFailure(format!("{}: {}", self.path.display(), e))
            })?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| GuardError::ActionDispatchFailure(e.to_string()))?;
        file.flush()
            .await
            .map_err(|e| GuardError::ActionDispatchFailure(e.to_string()))?;

        info!(origin = %action.origin(), action = %action, "📤 Action queued");
        Ok(())
    }
}
