//! Trailing Stop Manager - per-position breakeven and trailing stops
//!
//! Fresh -> BreakevenApplied once the position is old enough and in profit,
//! then Trailing on every later cycle. Stops only ever move in the
//! position's favour.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

use super::{round_to_pip_precision, Decision, GuardOutcome};
use crate::config::TrailingConfigSnapshot;
use crate::state::{GuardState, TrailingState};
use crate::types::{AccountSnapshot, Action, Direction, GuardKind, Position};

pub struct TrailingStopManager<'a> {
    config: &'a TrailingConfigSnapshot,
}

impl<'a> TrailingStopManager<'a> {
    pub fn new(config: &'a TrailingConfigSnapshot) -> Self {
        Self { config }
    }

    /// Advance stops for every open position.
    ///
    /// `skip` holds ids that are being closed or are frozen this cycle.
    /// `moved` holds stops another guard already requested this cycle.
    pub fn evaluate(
        &self,
        snapshot: &AccountSnapshot,
        now: DateTime<Utc>,
        state: &mut GuardState,
        skip: &HashSet<String>,
        moved: &HashMap<String, Decimal>,
    ) -> GuardOutcome {
        let mut actions = Vec::new();

        for pos in &snapshot.positions {
            if skip.contains(&pos.id) {
                debug!(position = %pos.id, "[TRAIL] Skipped (closing or frozen)");
                continue;
            }
            let entry = state.trailing_state.entry(pos.id.clone()).or_default();
            let already_moved = moved.get(&pos.id).copied();

            let action = if entry.breakeven_applied {
                self.trail(pos, entry, already_moved)
            } else {
                self.breakeven(pos, entry, now, already_moved)
            };
            actions.extend(action);
        }

        if actions.is_empty() {
            return GuardOutcome::new(GuardKind::Trailing, Decision::NoAction, "no stop changes");
        }
        GuardOutcome::new(
            GuardKind::Trailing,
            Decision::AdjustStops,
            format!("{} stop adjustment(s)", actions.len()),
        )
        .with_actions(actions)
    }

    fn breakeven(
        &self,
        pos: &Position,
        entry: &mut TrailingState,
        now: DateTime<Utc>,
        already_moved: Option<Decimal>,
    ) -> Option<Action> {
        if now - pos.opened_at < self.config.breakeven_after || !pos.in_profit() {
            return None;
        }

        entry.breakeven_applied = true;
        entry.trail_active = true;
        entry.activation_time = Some(now);

        if let Some(level) = already_moved {
            entry.last_stop = Some(level);
            debug!(position = %pos.id, stop = %level, "[TRAIL] Breakeven already set this cycle");
            return None;
        }

        let target = pos.entry_price;
        match pos.stop_loss {
            Some(current) if !pos.direction.is_improvement(target, current) => {
                entry.last_stop = Some(current);
                None
            }
            _ => {
                entry.last_stop = Some(target);
                info!(
                    position = %pos.id,
                    symbol = %pos.symbol,
                    stop = %target,
                    "🛡️ [TRAIL] Stop moved to breakeven"
                );
                Some(modify(pos, target))
            }
        }
    }

    fn trail(
        &self,
        pos: &Position,
        entry: &mut TrailingState,
        already_moved: Option<Decimal>,
    ) -> Option<Action> {
        if !entry.trail_active {
            return None;
        }

        let reference = [entry.last_stop, pos.stop_loss, already_moved]
            .into_iter()
            .flatten()
            .reduce(|a, b| better(pos.direction, a, b))
            .unwrap_or(pos.entry_price);

        let pip = self.config.pip_size(&pos.symbol);
        let distance = self.config.trail_distance_pips * pip;
        if pos.favourable_distance_from(reference) <= distance {
            return None;
        }

        let candidate = round_to_pip_precision(
            pos.current_price - distance * pos.direction.sign(),
            pip,
        );
        if !pos.direction.is_improvement(candidate, reference) {
            return None;
        }

        entry.last_stop = Some(candidate);
        info!(
            position = %pos.id,
            symbol = %pos.symbol,
            from = %reference,
            to = %candidate,
            "📈 [TRAIL] Stop advanced"
        );
        Some(modify(pos, candidate))
    }
}

fn better(direction: Direction, a: Decimal, b: Decimal) -> Decimal {
    if direction.is_improvement(b, a) {
        b
    } else {
        a
    }
}

fn modify(pos: &Position, new_price: Decimal) -> Action {
    Action::ModifyStopLoss {
        origin: GuardKind::Trailing,
        position_id: pos.id.clone(),
        symbol: pos.symbol.clone(),
        new_price,
    }
}
