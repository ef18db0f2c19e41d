//! Time Guard - end-of-day closure, hard session exit, session windows
//!
//! The daily closure is level-triggered but stamped with the UTC date, so it
//! fires once per day and re-arms on its own. Session auto-closes work the
//! same way, stamped per session name, and only fire inside a short grace
//! window after their clock time. The hard exit has no flag and closes
//! whatever is still open on every cycle past its cutoff.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{Decision, GuardOutcome};
use crate::config::TimeGuardConfig;
use crate::state::GuardState;
use crate::types::{AccountSnapshot, Action, BlockScope, CloseOrder, GuardKind};

/// How long after a session's auto-close time a missed tick may still fire it
const AUTO_CLOSE_GRACE_MINUTES: i64 = 15;

/// Trading session containing the cycle time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveSession {
    pub name: String,
    pub lot_multiplier: Decimal,
}

pub struct TimeGuard<'a> {
    config: &'a TimeGuardConfig,
}

impl<'a> TimeGuard<'a> {
    pub fn new(config: &'a TimeGuardConfig) -> Self {
        Self { config }
    }

    /// First configured session whose window contains `now`
    pub fn active_session(&self, now: DateTime<Utc>) -> Option<ActiveSession> {
        let t = now.time();
        self.config
            .sessions
            .iter()
            .find(|s| s.contains(t))
            .map(|s| ActiveSession {
                name: s.name.clone(),
                lot_multiplier: s.lot_multiplier,
            })
    }

    pub fn is_past_hard_exit(&self, now: DateTime<Utc>) -> bool {
        now.time() >= self.config.hard_exit_time
    }

    pub fn evaluate(
        &self,
        snapshot: &AccountSnapshot,
        now: DateTime<Utc>,
        state: &mut GuardState,
    ) -> GuardOutcome {
        let t = now.time();
        let today = now.date_naive();
        let mut close_reason = None;

        for session in &self.config.sessions {
            let Some(close_at) = session.auto_close else {
                continue;
            };
            let Some(occurrence) = auto_close_occurrence(close_at, now) else {
                continue;
            };
            if state.session_closures_done.get(&session.name) == Some(&occurrence) {
                continue;
            }
            state
                .session_closures_done
                .insert(session.name.clone(), occurrence);
            if snapshot.is_flat() {
                info!(session = %session.name, "🕓 [TIME] Session auto-close with no open positions");
            } else {
                info!(
                    session = %session.name,
                    positions = snapshot.positions.len(),
                    "🕓 [TIME] Session auto-close"
                );
                close_reason = Some(format!(
                    "{} session auto-close at {}",
                    session.name,
                    clock(close_at)
                ));
            }
        }

        if t >= self.config.daily_closure_time && state.four_pm_closure_done != Some(today) {
            state.four_pm_closure_done = Some(today);
            if snapshot.is_flat() {
                info!(date = %today, "🕓 [TIME] Daily cutoff passed with no open positions");
            } else {
                info!(
                    date = %today,
                    positions = snapshot.positions.len(),
                    "🕓 [TIME] Daily forced closure"
                );
                close_reason = Some(format!(
                    "daily closure at {}",
                    clock(self.config.daily_closure_time)
                ));
            }
        }

        if self.is_past_hard_exit(now) && !snapshot.is_flat() {
            warn!(
                positions = snapshot.positions.len(),
                cutoff = %clock(self.config.hard_exit_time),
                "⏰ [TIME] Hard session exit, closing everything"
            );
            close_reason = Some(format!(
                "hard session exit at {}",
                clock(self.config.hard_exit_time)
            ));
        }

        let entry_block = self.entry_block_reason(now);
        let mut actions = Vec::new();

        if let Some(reason) = &close_reason {
            actions.push(Action::ClosePositions {
                origin: GuardKind::Time,
                orders: snapshot
                    .positions
                    .iter()
                    .map(|p| CloseOrder {
                        position_id: p.id.clone(),
                        symbol: p.symbol.clone(),
                        volume: p.volume,
                    })
                    .collect(),
                fraction: Decimal::ONE,
                reason: reason.clone(),
            });
        }
        if let Some(reason) = &entry_block {
            actions.push(Action::BlockNewEntries {
                origin: GuardKind::Time,
                scope: BlockScope::All,
                reason: reason.clone(),
            });
        }

        let outcome = match (close_reason, &entry_block) {
            (Some(reason), _) => GuardOutcome::new(GuardKind::Time, Decision::CloseAll, reason),
            (None, Some(reason)) => GuardOutcome::new(GuardKind::Time, Decision::Block, reason.clone()),
            (None, None) => GuardOutcome::new(
                GuardKind::Time,
                Decision::Allow,
                format!("inside trading session at {}", t.format("%H:%M")),
            ),
        }
        .with_actions(actions);

        if entry_block.is_some() {
            outcome.blocking()
        } else {
            outcome
        }
    }

    /// Stateless entry window predicate
    fn entry_block_reason(&self, now: DateTime<Utc>) -> Option<String> {
        if self.is_past_hard_exit(now) {
            return Some(format!(
                "past hard exit {}",
                clock(self.config.hard_exit_time)
            ));
        }
        if self.active_session(now).is_none() {
            return Some(format!(
                "no trading session active at {}",
                now.format("%H:%M")
            ));
        }
        None
    }
}

/// Date of the auto-close `now` falls in the grace window of, if any
fn auto_close_occurrence(close_at: NaiveTime, now: DateTime<Utc>) -> Option<NaiveDate> {
    let today = now.date_naive();
    let mut elapsed = now.time().signed_duration_since(close_at);
    let mut date = today;
    if elapsed < Duration::zero() {
        elapsed = elapsed + Duration::days(1);
        date = today.pred_opt()?;
    }
    (elapsed < Duration::minutes(AUTO_CLOSE_GRACE_MINUTES)).then_some(date)
}

fn clock(t: NaiveTime) -> String {
    t.format("%H:%M").to_string()
}
