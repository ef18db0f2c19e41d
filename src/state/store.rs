//! Guard state persistence
//!
//! Read-modify-write interface with a JSON file implementation (atomic
//! rename) and an in-memory one for tests and dry runs.

use chrono::Utc;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{info, warn};

use super::GuardState;
use crate::error::{GuardError, Result};

pub trait StateStore: Send + Sync {
    /// Load the record for `scope`. Missing or unreadable records come back
    /// as `GuardState::default()`; only IO failures on an existing file that
    /// cannot be set aside are errors.
    fn load(&self, scope: &str) -> Result<GuardState>;

    /// Durably write the record for `scope`. Failure is fatal for the engine.
    fn save(&self, scope: &str, state: &GuardState) -> Result<()>;
}

/// One `guard_state_<scope>.json` file per scope under `dir`
pub struct JsonFileStateStore {
    dir: PathBuf,
}

impl JsonFileStateStore {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn path_for(&self, scope: &str) -> PathBuf {
        let safe: String = scope
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("guard_state_{}.json", safe))
    }

    /// Move an unreadable record aside so the next save does not destroy it
    fn quarantine(&self, path: &Path) -> Result<()> {
        let aside = path.with_extension(format!("corrupt-{}", Utc::now().format("%Y%m%d_%H%M%S")));
        fs::rename(path, &aside).map_err(|e| {
            GuardError::PersistenceCorrupt(format!(
                "cannot move corrupt state {} aside: {}",
                path.display(),
                e
            ))
        })?;
        warn!(from = %path.display(), to = %aside.display(), "Corrupt guard state moved aside");
        Ok(())
    }
}

impl StateStore for JsonFileStateStore {
    fn load(&self, scope: &str) -> Result<GuardState> {
        let path = self.path_for(scope);
        if !path.exists() {
            info!(path = %path.display(), "💾 No guard state found, starting fresh");
            return Ok(GuardState::default());
        }

        let parsed = fs::read_to_string(&path)
            .map_err(|e| GuardError::StaleState(e.to_string()))
            .and_then(|json| {
                serde_json::from_str::<GuardState>(&json)
                    .map_err(|e| GuardError::StaleState(e.to_string()))
            });

        match parsed {
            Ok(state) => {
                info!(
                    path = %path.display(),
                    partial_close_done = state.partial_close_done,
                    drawdown_block_active = state.drawdown_block_active,
                    trailing_positions = state.trailing_state.len(),
                    "💾 Guard state loaded"
                );
                Ok(state)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Guard state unreadable, using defaults");
                self.quarantine(&path)?;
                Ok(GuardState::default())
            }
        }
    }

    fn save(&self, scope: &str, state: &GuardState) -> Result<()> {
        let path = self.path_for(scope);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(state)?;

        fs::write(&tmp, json)
            .and_then(|_| fs::rename(&tmp, &path))
            .map_err(|e| {
                GuardError::PersistenceCorrupt(format!("write {}: {}", path.display(), e))
            })?;
        Ok(())
    }
}

/// Process-local store
#[derive(Default)]
pub struct MemoryStateStore {
    records: RwLock<HashMap<String, GuardState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, scope: &str) -> Option<GuardState> {
        self.records.read().ok()?.get(scope).cloned()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self, scope: &str) -> Result<GuardState> {
        Ok(self.get(scope).unwrap_or_default())
    }

    fn save(&self, scope: &str, state: &GuardState) -> Result<()> {
        let mut records = self
            .records
            .write()
            .map_err(|e| GuardError::PersistenceCorrupt(e.to_string()))?;
        records.insert(scope.to_string(), state.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStateStore::new(dir.path()).unwrap();

        let mut state = GuardState::default();
        state.partial_close_done = true;
        state.four_pm_closure_done = NaiveDate::from_ymd_opt(2024, 3, 1);
        store.save("acct-1", &state).unwrap();

        assert_eq!(store.load("acct-1").unwrap(), state);
        assert!(!store.path_for("acct-1").with_extension("json.tmp").exists());
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStateStore::new(dir.path()).unwrap();
        assert_eq!(store.load("nobody").unwrap(), GuardState::default());
    }

    #[test]
    fn test_corrupt_file_falls_back_and_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStateStore::new(dir.path()).unwrap();
        let path = store.path_for("acct");
        fs::write(&path, "{ not json").unwrap();

        let state = store.load("acct").unwrap();
        assert_eq!(state, GuardState::default());
        assert!(!path.exists());

        let quarantined = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().contains("corrupt"));
        assert!(quarantined);
    }

    #[test]
    fn test_scope_is_sanitized() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStateStore::new(dir.path()).unwrap();
        let path = store.path_for("../evil/acct");
        assert_eq!(path.parent().unwrap(), dir.path());
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStateStore::new();
        assert_eq!(store.load("x").unwrap(), GuardState::default());

        let mut state = GuardState::default();
        state.drawdown_block_active = true;
        store.save("x", &state).unwrap();
        assert!(store.get("x").unwrap().drawdown_block_active);
    }
}
