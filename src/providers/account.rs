//! Account snapshot read from a JSON file kept current by the broker bridge

use async_trait::async_trait;
use std::path::PathBuf;
use tracing::debug;

use super::AccountProvider;
use crate::error::{GuardError, Result};
use crate::types::AccountSnapshot;

const SOURCE: &str = "account snapshot file";

pub struct FileAccountProvider {
    path: PathBuf,
}

impl FileAccountProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl AccountProvider for FileAccountProvider {
    async fn snapshot(&self) -> Result<AccountSnapshot> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| GuardError::unavailable(SOURCE, format!("{}: {}", self.path.display(), e)))?;

        let snapshot: AccountSnapshot = serde_json::from_str(&raw)
            .map_err(|e| GuardError::unavailable(SOURCE, format!("{}: {}", self.path.display(), e)))?;

        debug!(
            balance = %snapshot.balance,
            floating_pnl = %snapshot.floating_pnl,
            positions = snapshot.positions.len(),
            "Account snapshot read"
        );
        Ok(snapshot)
    }
}
