//! Guards
//!
//! Each guard reads the cycle's account snapshot and the current guard state,
//! applies its own state transitions, and reports a `GuardOutcome`. Guards
//! never perform IO; the scheduler dispatches whatever they emit.

pub mod drawdown;
pub mod news;
pub mod profit;
pub mod time;
pub mod trailing;

pub use drawdown::DrawdownGuard;
pub use news::{NewsAssessment, NewsGuard, NewsMatch, ALL_SYMBOLS};
pub use profit::ProfitGuard;
pub use time::{ActiveSession, TimeGuard};
pub use trailing::TrailingStopManager;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{Action, GuardKind};

/// What a guard decided this cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    Allow,
    Block,
    CloseAll,
    PartialClose,
    AdjustStops,
    Reset,
    Cooldown,
    Skipped,
    NoAction,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Decision::Allow => "ALLOW",
            Decision::Block => "BLOCK",
            Decision::CloseAll => "CLOSE_ALL",
            Decision::PartialClose => "PARTIAL_CLOSE",
            Decision::AdjustStops => "ADJUST_STOPS",
            Decision::Reset => "RESET",
            Decision::Cooldown => "COOLDOWN",
            Decision::Skipped => "SKIPPED",
            Decision::NoAction => "NO_ACTION",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GuardOutcome {
    pub guard: GuardKind,
    pub decision: Decision,
    pub reason: String,
    pub actions: Vec<Action>,
    /// Set when the guard blocks new entries account-wide
    pub blocks_entries: bool,
}

impl GuardOutcome {
    pub fn new(guard: GuardKind, decision: Decision, reason: impl Into<String>) -> Self {
        Self {
            guard,
            decision,
            reason: reason.into(),
            actions: Vec::new(),
            blocks_entries: false,
        }
    }

    pub fn with_actions(mut self, actions: Vec<Action>) -> Self {
        self.actions = actions;
        self
    }

    pub fn blocking(mut self) -> Self {
        self.blocks_entries = true;
        self
    }

    /// True when this outcome closes every open position
    pub fn closes_all(&self) -> bool {
        self.actions.iter().any(Action::is_full_close)
    }
}

/// Round a price to the precision used for stop levels: one digit beyond the pip.
pub(crate) fn round_to_pip_precision(price: Decimal, pip_size: Decimal) -> Decimal {
    price.round_dp(pip_size.normalize().scale() + 1)
}
