//! Persisted guard state
//!
//! One record per account scope. Each field has a single owning guard and an
//! explicit reset rule; see the field docs.

mod store;

pub use store::{JsonFileStateStore, MemoryStateStore, StateStore};

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::{Action, GuardKind};

pub const STATE_VERSION: u32 = 1;

/// Per-position trailing-stop progress, owned by the trailing manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrailingState {
    pub breakeven_applied: bool,
    pub trail_active: bool,
    pub activation_time: Option<DateTime<Utc>>,
    /// Stop level most recently requested for this position
    #[serde(default)]
    pub last_stop: Option<Decimal>,
}

impl Default for TrailingState {
    fn default() -> Self {
        Self {
            breakeven_applied: false,
            trail_active: false,
            activation_time: None,
            last_stop: None,
        }
    }
}

/// Lifecycle stage derived from the flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrailingStage {
    Fresh,
    BreakevenApplied,
    Trailing,
}

impl TrailingState {
    pub fn stage(&self) -> TrailingStage {
        match (self.breakeven_applied, self.trail_active) {
            (true, true) => TrailingStage::Trailing,
            (true, false) => TrailingStage::BreakevenApplied,
            _ => TrailingStage::Fresh,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardState {
    #[serde(default = "default_version")]
    pub version: u32,
    /// ProfitGuard. Set by the partial close; cleared when the account goes
    /// flat or a full close executes.
    #[serde(default)]
    pub partial_close_done: bool,
    /// ProfitGuard. Cooldown after a full close.
    #[serde(default)]
    pub full_close_lock_until: Option<DateTime<Utc>>,
    /// DrawdownGuard. Cleared only when floating P&L strictly exceeds the
    /// recovery threshold.
    #[serde(default)]
    pub drawdown_block_active: bool,
    #[serde(default)]
    pub drawdown_block_since: Option<DateTime<Utc>>,
    /// DrawdownGuard. When the last block cleared (start of the recovery cooldown).
    #[serde(default)]
    pub drawdown_recovered_at: Option<DateTime<Utc>>,
    /// TimeGuard. UTC date on which the daily forced closure last ran.
    #[serde(default)]
    pub four_pm_closure_done: Option<NaiveDate>,
    /// TimeGuard. Session name -> UTC date its auto-close last ran.
    #[serde(default)]
    pub session_closures_done: HashMap<String, NaiveDate>,
    /// TrailingStopManager. Keyed by position id, removed when the position closes.
    #[serde(default)]
    pub trailing_state: HashMap<String, TrailingState>,
    #[serde(default)]
    pub last_cycle_at: Option<DateTime<Utc>>,
}

fn default_version() -> u32 {
    STATE_VERSION
}

impl Default for GuardState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            partial_close_done: false,
            full_close_lock_until: None,
            drawdown_block_active: false,
            drawdown_block_since: None,
            drawdown_recovered_at: None,
            four_pm_closure_done: None,
            session_closures_done: HashMap::new(),
            trailing_state: HashMap::new(),
            last_cycle_at: None,
        }
    }
}

impl GuardState {
    /// Undo the state transition carried by `action`, restoring the
    /// affected fields from `prior`.
    ///
    /// Called when the action fails to dispatch so the transition is retried
    /// next cycle. Only the fields that action stands for are restored: a
    /// rejected stop move rolls back that position's trailing entry and
    /// nothing else, a rejected close rolls back the issuing guard's close
    /// bookkeeping.
    pub fn revert_action(&mut self, action: &Action, prior: &GuardState) {
        match action {
            Action::ClosePositions {
                origin: GuardKind::Profit,
                ..
            } => {
                self.partial_close_done = prior.partial_close_done;
                self.full_close_lock_until = prior.full_close_lock_until;
            }
            Action::ClosePositions {
                origin: GuardKind::Time,
                ..
            } => {
                self.four_pm_closure_done = prior.four_pm_closure_done;
                self.session_closures_done = prior.session_closures_done.clone();
            }
            Action::ModifyStopLoss { position_id, .. } => {
                self.revert_trailing_entry(prior, position_id);
            }
            _ => {}
        }
    }

    fn revert_trailing_entry(&mut self, prior: &GuardState, id: &str) {
        match prior.trailing_state.get(id) {
            Some(entry) => {
                self.trailing_state.insert(id.to_string(), entry.clone());
            }
            None => {
                self.trailing_state.remove(id);
            }
        }
    }

    /// Drop trailing entries for positions that are no longer open
    pub fn retain_open_positions(&mut self, open_ids: &[String]) -> usize {
        let before = self.trailing_state.len();
        self.trailing_state
            .retain(|id, _| open_ids.iter().any(|open| open == id));
        before - self.trailing_state.len()
    }
}
