//! Profit Guard - two-stage profit securing
//!
//! Stage 1 (partial): floating P&L reaches `partial_trigger_pct` of balance →
//! close a fraction of every position, move stops to breakeven, reset the lot
//! size. Fires at most once per equity cycle.
//!
//! Stage 2 (full): floating P&L reaches `full_trigger_pct` → close everything,
//! re-arm the partial stage and start the cooldown. Always wins over stage 1.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info};

use super::{round_to_pip_precision, Decision, GuardOutcome};
use crate::config::{ProfitGuardConfig, TrailingConfigSnapshot};
use crate::state::GuardState;
use crate::types::{AccountSnapshot, Action, CloseOrder, GuardKind, Position};

pub struct ProfitGuard<'a> {
    config: &'a ProfitGuardConfig,
    pips: &'a TrailingConfigSnapshot,
}

impl<'a> ProfitGuard<'a> {
    pub fn new(config: &'a ProfitGuardConfig, pips: &'a TrailingConfigSnapshot) -> Self {
        Self { config, pips }
    }

    pub fn evaluate(
        &self,
        snapshot: &AccountSnapshot,
        floating_pct: Decimal,
        now: DateTime<Utc>,
        state: &mut GuardState,
    ) -> GuardOutcome {
        if snapshot.is_flat() {
            return GuardOutcome::new(GuardKind::Profit, Decision::NoAction, "no open positions");
        }

        if let Some(until) = state.full_close_lock_until {
            if now <= until {
                return GuardOutcome::new(
                    GuardKind::Profit,
                    Decision::Cooldown,
                    format!("full-close cooldown until {}", until.format("%H:%M:%S")),
                );
            }
        }

        if floating_pct >= self.config.full_trigger_pct {
            return self.full_close(snapshot, floating_pct, now, state);
        }

        if floating_pct >= self.config.partial_trigger_pct {
            if state.partial_close_done {
                return GuardOutcome::new(
                    GuardKind::Profit,
                    Decision::NoAction,
                    format!(
                        "floating {:.2}% >= partial {}% but partial already done this cycle",
                        floating_pct, self.config.partial_trigger_pct
                    ),
                );
            }
            return self.partial_close(snapshot, floating_pct, state);
        }

        GuardOutcome::new(
            GuardKind::Profit,
            Decision::NoAction,
            format!(
                "floating {:.2}% below partial {}%",
                floating_pct, self.config.partial_trigger_pct
            ),
        )
    }

    fn full_close(
        &self,
        snapshot: &AccountSnapshot,
        floating_pct: Decimal,
        now: DateTime<Utc>,
        state: &mut GuardState,
    ) -> GuardOutcome {
        let reason = format!(
            "floating {:.2}% >= full trigger {}%",
            floating_pct, self.config.full_trigger_pct
        );
        let orders = snapshot
            .positions
            .iter()
            .map(|p| CloseOrder {
                position_id: p.id.clone(),
                symbol: p.symbol.clone(),
                volume: p.volume,
            })
            .collect();

        state.partial_close_done = false;
        state.full_close_lock_until = Some(now + self.config.full_close_cooldown);

        info!(
            floating_pct = %floating_pct.round_dp(2),
            positions = snapshot.positions.len(),
            "🎯 [PROFIT] Full close triggered"
        );

        GuardOutcome::new(GuardKind::Profit, Decision::CloseAll, reason.clone()).with_actions(vec![
            Action::ClosePositions {
                origin: GuardKind::Profit,
                orders,
                fraction: Decimal::ONE,
                reason,
            },
        ])
    }

    fn partial_close(
        &self,
        snapshot: &AccountSnapshot,
        floating_pct: Decimal,
        state: &mut GuardState,
    ) -> GuardOutcome {
        let reason = format!(
            "floating {:.2}% >= partial trigger {}%",
            floating_pct, self.config.partial_trigger_pct
        );
        let fraction = self.config.partial_close_fraction;

        let mut orders = Vec::new();
        for pos in &snapshot.positions {
            let volume = self.partial_volume(pos.volume);
            if volume < self.config.min_lot || volume <= Decimal::ZERO {
                debug!(
                    position = %pos.id,
                    volume = %pos.volume,
                    "[PROFIT] Position too small for partial close, breakeven only"
                );
                continue;
            }
            orders.push(CloseOrder {
                position_id: pos.id.clone(),
                symbol: pos.symbol.clone(),
                volume,
            });
        }

        let mut actions = Vec::new();
        if !orders.is_empty() {
            actions.push(Action::ClosePositions {
                origin: GuardKind::Profit,
                orders,
                fraction,
                reason: reason.clone(),
            });
        }
        actions.extend(
            snapshot
                .positions
                .iter()
                .filter_map(|pos| self.breakeven_action(pos)),
        );
        actions.push(Action::ResetLotSize {
            origin: GuardKind::Profit,
            reason: "partial close executed".to_string(),
        });

        state.partial_close_done = true;

        info!(
            floating_pct = %floating_pct.round_dp(2),
            fraction = %fraction,
            "🎯 [PROFIT] Partial close + breakeven triggered"
        );

        GuardOutcome::new(GuardKind::Profit, Decision::PartialClose, reason).with_actions(actions)
    }

    /// Volume to close, rounded down to the lot step and never above what is open
    pub fn partial_volume(&self, volume: Decimal) -> Decimal {
        let raw = volume * self.config.partial_close_fraction;
        let stepped = (raw / self.config.lot_step).floor() * self.config.lot_step;
        stepped.min(volume).normalize()
    }

    /// Breakeven price for a position including the configured buffer
    pub fn breakeven_price(&self, pos: &Position) -> Decimal {
        let pip = self.pips.pip_size(&pos.symbol);
        let buffer = self.config.breakeven_buffer_pips * pip * pos.direction.sign();
        round_to_pip_precision(pos.entry_price + buffer, pip)
    }

    fn breakeven_action(&self, pos: &Position) -> Option<Action> {
        let target = self.breakeven_price(pos);
        if let Some(current) = pos.stop_loss {
            if !pos.direction.is_improvement(target, current) {
                return None;
            }
        }
        Some(Action::ModifyStopLoss {
            origin: GuardKind::Profit,
            position_id: pos.id.clone(),
            symbol: pos.symbol.clone(),
            new_price: target,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GuardConfig;
    use crate::types::Direction;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 13, 0, 0).unwrap()
    }

    fn position(id: &str, volume: Decimal) -> Position {
        Position {
            id: id.to_string(),
            symbol: "EURUSD".to_string(),
            direction: Direction::Long,
            volume,
            entry_price: dec!(1.08500),
            current_price: dec!(1.09000),
            opened_at: now() - Duration::hours(1),
            stop_loss: Some(dec!(1.08000)),
            take_profit: None,
            profit: dec!(50),
        }
    }

    fn snapshot(pnl: Decimal, positions: Vec<Position>) -> AccountSnapshot {
        AccountSnapshot {
            balance: dec!(10000),
            floating_pnl: pnl,
            closed_pnl_today: Decimal::ZERO,
            positions,
            timestamp: now(),
        }
    }

    fn run(cfg: &GuardConfig, snap: &AccountSnapshot, state: &mut GuardState) -> GuardOutcome {
        let guard = ProfitGuard::new(&cfg.profit, &cfg.trailing);
        guard.evaluate(snap, snap.floating_pct().unwrap(), now(), state)
    }

    #[test]
    fn test_partial_then_full_scenario() {
        let cfg = GuardConfig::default();
        let mut state = GuardState::default();
        let positions = vec![position("1", dec!(1.00)), position("2", dec!(0.50))];

        let out = run(&cfg, &snapshot(dec!(100), positions.clone()), &mut state);
        assert_eq!(out.decision, Decision::PartialClose);
        assert!(state.partial_close_done);
        match &out.actions[0] {
            Action::ClosePositions { orders, fraction, .. } => {
                assert_eq!(*fraction, dec!(0.5));
                assert_eq!(orders[0].volume, dec!(0.5));
                assert_eq!(orders[1].volume, dec!(0.25));
            }
            other => panic!("unexpected first action {:?}", other),
        }
        let sl_moves = out
            .actions
            .iter()
            .filter(|a| matches!(a, Action::ModifyStopLoss { new_price, .. } if *new_price == dec!(1.08500)))
            .count();
        assert_eq!(sl_moves, 2);
        assert!(out
            .actions
            .iter()
            .any(|a| matches!(a, Action::ResetLotSize { .. })));

        let out = run(&cfg, &snapshot(dec!(250), positions), &mut state);
        assert_eq!(out.decision, Decision::CloseAll);
        assert!(out.closes_all());
        assert!(!state.partial_close_done);
        assert_eq!(
            state.full_close_lock_until,
            Some(now() + cfg.profit.full_close_cooldown)
        );
    }

    #[test]
    fn test_partial_fires_once() {
        let cfg = GuardConfig::default();
        let mut state = GuardState::default();
        let snap = snapshot(dec!(120), vec![position("1", dec!(1.00))]);

        assert_eq!(run(&cfg, &snap, &mut state).decision, Decision::PartialClose);
        for _ in 0..5 {
            let out = run(&cfg, &snap, &mut state);
            assert_eq!(out.decision, Decision::NoAction);
            assert!(out.actions.is_empty());
        }
    }

    #[test]
    fn test_full_close_wins_over_partial() {
        let cfg = GuardConfig::default();
        let mut state = GuardState::default();
        let out = run(&cfg, &snapshot(dec!(300), vec![position("1", dec!(1.00))]), &mut state);
        assert_eq!(out.decision, Decision::CloseAll);
        assert!(!state.partial_close_done);
    }

    #[test]
    fn test_cooldown_blocks_both_stages() {
        let cfg = GuardConfig::default();
        let mut state = GuardState {
            full_close_lock_until: Some(now() + Duration::minutes(5)),
            ..GuardState::default()
        };
        let out = run(&cfg, &snapshot(dec!(300), vec![position("1", dec!(1.00))]), &mut state);
        assert_eq!(out.decision, Decision::Cooldown);
        assert!(out.actions.is_empty());
        assert!(!state.partial_close_done);
    }

    #[test]
    fn test_flat_account_does_nothing() {
        let cfg = GuardConfig::default();
        let mut state = GuardState::default();
        let out = run(&cfg, &snapshot(dec!(300), Vec::new()), &mut state);
        assert_eq!(out.decision, Decision::NoAction);
        assert!(state.full_close_lock_until.is_none());
    }

    #[test]
    fn test_partial_volume_rounds_down_to_step() {
        let cfg = GuardConfig::default();
        let guard = ProfitGuard::new(&cfg.profit, &cfg.trailing);
        assert_eq!(guard.partial_volume(dec!(0.03)), dec!(0.01));
        assert_eq!(guard.partial_volume(dec!(1.25)), dec!(0.62));
        assert_eq!(guard.partial_volume(dec!(0.01)), dec!(0));
    }

    #[test]
    fn test_tiny_position_gets_breakeven_only() {
        let cfg = GuardConfig::default();
        let mut state = GuardState::default();
        let out = run(&cfg, &snapshot(dec!(100), vec![position("1", dec!(0.01))]), &mut state);
        assert_eq!(out.decision, Decision::PartialClose);
        assert!(!out
            .actions
            .iter()
            .any(|a| matches!(a, Action::ClosePositions { .. })));
        assert!(out
            .actions
            .iter()
            .any(|a| matches!(a, Action::ModifyStopLoss { .. })));
    }

    #[test]
    fn test_breakeven_never_loosens_stop() {
        let cfg = GuardConfig::default();
        let mut pos = position("1", dec!(1.00));
        pos.stop_loss = Some(dec!(1.08700));
        let mut state = GuardState::default();
        let out = run(&cfg, &snapshot(dec!(100), vec![pos]), &mut state);
        assert!(!out
            .actions
            .iter()
            .any(|a| matches!(a, Action::ModifyStopLoss { .. })));
    }

    #[test]
    fn test_breakeven_buffer_for_short() {
        let mut cfg = GuardConfig::default();
        cfg.profit.breakeven_buffer_pips = dec!(5);
        let guard = ProfitGuard::new(&cfg.profit, &cfg.trailing);
        let mut pos = position("1", dec!(1.00));
        pos.direction = Direction::Short;
        pos.symbol = "USDJPY".to_string();
        pos.entry_price = dec!(150.000);
        assert_eq!(guard.breakeven_price(&pos), dec!(149.950));
    }
}
