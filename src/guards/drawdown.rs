//! Drawdown Guard - blocks new entries while floating P&L is adverse
//!
//! Enters the block at `pct <= block_trigger_pct` and leaves it only when
//! `pct > recovery_trigger_pct`. The gap between the two thresholds is the
//! hysteresis band; values inside it never change the current state.
//!
//! On top of the band, two hard loss limits block entries for as long as they
//! are breached: the daily loss (closed today plus floating) and the total
//! loss (reference balance minus equity). Open positions are never touched.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{info, warn};

use super::{Decision, GuardOutcome};
use crate::config::DrawdownGuardConfig;
use crate::state::GuardState;
use crate::types::{AccountSnapshot, Action, BlockScope, GuardKind};

pub struct DrawdownGuard<'a> {
    config: &'a DrawdownGuardConfig,
}

impl<'a> DrawdownGuard<'a> {
    pub fn new(config: &'a DrawdownGuardConfig) -> Self {
        Self { config }
    }

    pub fn evaluate(
        &self,
        snapshot: &AccountSnapshot,
        floating_pct: Decimal,
        now: DateTime<Utc>,
        state: &mut GuardState,
    ) -> GuardOutcome {
        let outcome = self.hysteresis(floating_pct, now, state);
        match self.loss_limit_breach(snapshot) {
            Some(breach) if outcome.blocks_entries => {
                self.block(format!("{}; {}", breach, outcome.reason))
            }
            Some(breach) => self.block(breach),
            None => outcome,
        }
    }

    /// Daily and total loss limits, measured against the reference balance
    fn loss_limit_breach(&self, snapshot: &AccountSnapshot) -> Option<String> {
        let reference = self.config.initial_balance.unwrap_or(snapshot.balance);
        if reference <= Decimal::ZERO {
            return None;
        }

        if let Some(limit_pct) = self.config.max_daily_loss_pct {
            let daily_loss = snapshot.closed_pnl_today + snapshot.floating_pnl;
            let limit = limit_pct / Decimal::ONE_HUNDRED * reference;
            if daily_loss <= -limit {
                warn!(
                    closed_today = %snapshot.closed_pnl_today,
                    floating = %snapshot.floating_pnl,
                    limit = %limit,
                    "🚫 [DRAWDOWN] Daily loss limit breached"
                );
                return Some(format!(
                    "daily loss {:.2} breaches limit {:.2} ({}% of {})",
                    daily_loss, limit, limit_pct, reference
                ));
            }
        }

        if let Some(limit_pct) = self.config.max_total_loss_pct {
            let equity = snapshot.balance + snapshot.floating_pnl;
            let total_loss = reference - equity;
            let limit = limit_pct / Decimal::ONE_HUNDRED * reference;
            if total_loss >= limit {
                warn!(
                    equity = %equity,
                    reference = %reference,
                    limit = %limit,
                    "🚫 [DRAWDOWN] Total loss limit breached"
                );
                return Some(format!(
                    "total loss {:.2} breaches limit {:.2} ({}% of {})",
                    total_loss, limit, limit_pct, reference
                ));
            }
        }
        None
    }

    fn hysteresis(
        &self,
        floating_pct: Decimal,
        now: DateTime<Utc>,
        state: &mut GuardState,
    ) -> GuardOutcome {
        let pct = format!("{:.2}", floating_pct);

        if state.drawdown_block_active {
            if floating_pct > self.config.recovery_trigger_pct {
                state.drawdown_block_active = false;
                state.drawdown_block_since = None;
                state.drawdown_recovered_at = Some(now);
                info!(
                    floating_pct = %pct,
                    recovery = %self.config.recovery_trigger_pct,
                    "✅ [DRAWDOWN] Block removed"
                );
                return self.after_recovery(pct, now, state);
            }

            let since = state
                .drawdown_block_since
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "unknown".to_string());
            return self.block(format!(
                "drawdown block active since {}: floating {}% <= recovery {}%",
                since, pct, self.config.recovery_trigger_pct
            ));
        }

        if floating_pct <= self.config.block_trigger_pct {
            state.drawdown_block_active = true;
            state.drawdown_block_since = Some(now);
            warn!(
                floating_pct = %pct,
                threshold = %self.config.block_trigger_pct,
                "🚫 [DRAWDOWN] Block activated"
            );
            return self.block(format!(
                "floating {}% <= block threshold {}%",
                pct, self.config.block_trigger_pct
            ));
        }

        self.after_recovery(pct, now, state)
    }

    /// Allow, unless a post-recovery cooldown is still running
    fn after_recovery(&self, pct: String, now: DateTime<Utc>, state: &GuardState) -> GuardOutcome {
        if let Some(recovered) = state.drawdown_recovered_at {
            let until = recovered + self.config.recovery_cooldown;
            if now < until {
                return self.block(format!(
                    "recovery cooldown until {} (floating {}%)",
                    until.format("%H:%M"),
                    pct
                ));
            }
        }
        GuardOutcome::new(
            GuardKind::Drawdown,
            Decision::Allow,
            format!(
                "floating {}% above block threshold {}%",
                pct, self.config.block_trigger_pct
            ),
        )
    }

    fn block(&self, reason: String) -> GuardOutcome {
        GuardOutcome::new(GuardKind::Drawdown, Decision::Block, reason.clone())
            .with_actions(vec![Action::BlockNewEntries {
                origin: GuardKind::Drawdown,
                scope: BlockScope::All,
                reason,
            }])
            .blocking()
    }
}
