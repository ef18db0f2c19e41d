//! Guard Orchestrator
//!
//! Pure per-cycle evaluation. Takes the cycle's inputs and the persisted
//! state, runs the guards in a fixed order (Time, News, Drawdown, Profit,
//! Trailing) and returns the verdict, the ordered actions, audit records and
//! the proposed next state. All IO lives in the scheduler.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{AuditRecord, InputsSnapshot};
use crate::config::GuardConfig;
use crate::guards::{
    ActiveSession, Decision, DrawdownGuard, GuardOutcome, NewsGuard, ProfitGuard, TimeGuard,
    TrailingStopManager,
};
use crate::state::GuardState;
use crate::types::{AccountSnapshot, Action, BlockScope, Feed, GuardKind, NewsEvent};

/// Which guards a cycle runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CycleKind {
    /// Every guard
    Full,
    /// Time, Drawdown and Profit only; the sub-tick between full cycles
    Fast,
}

impl fmt::Display for CycleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleKind::Full => write!(f, "full"),
            CycleKind::Fast => write!(f, "fast"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CycleInput {
    pub cycle_id: Uuid,
    pub kind: CycleKind,
    pub now: DateTime<Utc>,
    pub account: Feed<AccountSnapshot>,
    pub news: Feed<Vec<NewsEvent>>,
    /// Symbols the entry logic may trade; `*` asks for the account-wide news check
    pub watch_symbols: BTreeSet<String>,
}

impl CycleInput {
    pub fn new(
        kind: CycleKind,
        now: DateTime<Utc>,
        account: Feed<AccountSnapshot>,
        news: Feed<Vec<NewsEvent>>,
    ) -> Self {
        Self {
            cycle_id: Uuid::new_v4(),
            kind,
            now,
            account,
            news,
            watch_symbols: BTreeSet::new(),
        }
    }

    pub fn with_watch_symbols<I, S>(mut self, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.watch_symbols = symbols.into_iter().map(Into::into).collect();
        self
    }
}

/// Composite allow/block for new-trade evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Verdict {
    Allow,
    Block { reasons: Vec<String> },
}

impl Verdict {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Verdict::Block { .. })
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Allow => write!(f, "ALLOW"),
            Verdict::Block { reasons } => write!(f, "BLOCK ({})", reasons.join("; ")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CycleResult {
    pub cycle_id: Uuid,
    pub kind: CycleKind,
    pub verdict: Verdict,
    /// Per-symbol news blocks (symbol -> reason)
    pub symbol_blocks: BTreeMap<String, String>,
    /// Account-wide news block (window match on `*` or fail-closed calendar)
    pub news_block: Option<String>,
    pub actions: Vec<Action>,
    pub audit: Vec<AuditRecord>,
    pub next_state: GuardState,
    pub session: Option<ActiveSession>,
}

impl CycleResult {
    /// Verdict for one symbol: account-wide block first, then news blocks
    pub fn verdict_for(&self, symbol: &str) -> Verdict {
        if self.verdict.is_blocked() {
            return self.verdict.clone();
        }
        match self.symbol_blocks.get(symbol) {
            Some(reason) => Verdict::Block {
                reasons: vec![reason.clone()],
            },
            None => Verdict::Allow,
        }
    }
}

pub struct GuardOrchestrator {
    config: GuardConfig,
}

impl GuardOrchestrator {
    pub fn new(config: GuardConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    pub fn evaluate(&self, input: &CycleInput, prior: &GuardState) -> CycleResult {
        let mut next = prior.clone();
        next.last_cycle_at = Some(input.now);

        let inputs = InputsSnapshot::capture(&input.account, &input.news);
        let session = TimeGuard::new(&self.config.time).active_session(input.now);

        let (snapshot, floating_pct) = match &input.account {
            Feed::Available(snap) => match snap.floating_pct() {
                Some(pct) => (snap, pct),
                None => {
                    return self.data_unavailable(
                        input,
                        next,
                        &inputs,
                        session,
                        format!("unusable balance {}", snap.balance),
                    )
                }
            },
            Feed::Unavailable(why) => {
                return self.data_unavailable(input, next, &inputs, session, why.clone())
            }
        };

        let mut outcomes = Vec::new();
        if let Some(reset) = self.flat_reset(snapshot, &mut next) {
            outcomes.push(reset);
        }

        // Time
        let time = TimeGuard::new(&self.config.time).evaluate(snapshot, input.now, &mut next);
        let mut closing_all = time.closes_all();
        outcomes.push(time);

        // News
        let mut symbol_blocks = BTreeMap::new();
        let mut freeze_all = false;
        let mut news_block = None;
        if input.kind == CycleKind::Full {
            let mut symbols = input.watch_symbols.clone();
            symbols.extend(snapshot.positions.iter().map(|p| p.symbol.clone()));
            let news = NewsGuard::new(&self.config.news).evaluate(&input.news, &symbols, input.now);
            symbol_blocks = news.symbol_blocks;
            freeze_all = news.freeze_all;
            if news.outcome.blocks_entries {
                news_block = Some(news.outcome.reason.clone());
            }
            outcomes.push(news.outcome);
        }

        // Drawdown
        outcomes.push(DrawdownGuard::new(&self.config.drawdown).evaluate(
            snapshot,
            floating_pct,
            input.now,
            &mut next,
        ));

        // Profit
        let profit = if closing_all {
            GuardOutcome::new(
                GuardKind::Profit,
                Decision::Skipped,
                "positions already closing this cycle",
            )
        } else {
            ProfitGuard::new(&self.config.profit, &self.config.trailing).evaluate(
                snapshot,
                floating_pct,
                input.now,
                &mut next,
            )
        };
        closing_all |= profit.closes_all();
        let moved: HashMap<String, Decimal> = profit
            .actions
            .iter()
            .filter_map(|a| match a {
                Action::ModifyStopLoss {
                    position_id,
                    new_price,
                    ..
                } => Some((position_id.clone(), *new_price)),
                _ => None,
            })
            .collect();
        outcomes.push(profit);

        // Trailing
        if input.kind == CycleKind::Full {
            let trailing = if closing_all {
                GuardOutcome::new(
                    GuardKind::Trailing,
                    Decision::Skipped,
                    "positions already closing this cycle",
                )
            } else {
                let frozen: HashSet<String> = snapshot
                    .positions
                    .iter()
                    .filter(|p| freeze_all || symbol_blocks.contains_key(&p.symbol))
                    .map(|p| p.id.clone())
                    .collect();
                TrailingStopManager::new(&self.config.trailing).evaluate(
                    snapshot,
                    input.now,
                    &mut next,
                    &frozen,
                    &moved,
                )
            };
            outcomes.push(trailing);
        }

        let reasons: Vec<String> = outcomes
            .iter()
            .filter(|o| o.blocks_entries)
            .map(|o| format!("{}: {}", o.guard, o.reason))
            .collect();
        let verdict = if reasons.is_empty() {
            Verdict::Allow
        } else {
            Verdict::Block { reasons }
        };

        let actions = resolve_actions(&outcomes);
        let audit = outcomes
            .iter()
            .map(|o| AuditRecord::from_outcome(input.cycle_id, input.now, o, &inputs))
            .collect();

        info!(
            cycle = %input.cycle_id,
            kind = %input.kind,
            verdict = %verdict,
            actions = actions.len(),
            symbol_blocks = symbol_blocks.len(),
            "🔄 Guard cycle evaluated"
        );

        CycleResult {
            cycle_id: input.cycle_id,
            kind: input.kind,
            verdict,
            symbol_blocks,
            news_block,
            actions,
            audit,
            next_state: next,
            session,
        }
    }

    /// Block entries, leave positions and guard state alone
    fn data_unavailable(
        &self,
        input: &CycleInput,
        next: GuardState,
        inputs: &InputsSnapshot,
        session: Option<ActiveSession>,
        why: String,
    ) -> CycleResult {
        warn!(cycle = %input.cycle_id, error = %why, "⚠️ Account data unavailable, blocking entries");
        let reason = format!("account data unavailable: {}", why);
        let outcome = GuardOutcome::new(GuardKind::Orchestrator, Decision::Block, reason.clone())
            .with_actions(vec![Action::BlockNewEntries {
                origin: GuardKind::Orchestrator,
                scope: BlockScope::All,
                reason: reason.clone(),
            }])
            .blocking();

        CycleResult {
            cycle_id: input.cycle_id,
            kind: input.kind,
            verdict: Verdict::Block {
                reasons: vec![format!("{}: {}", GuardKind::Orchestrator, reason)],
            },
            symbol_blocks: BTreeMap::new(),
            news_block: None,
            actions: outcome.actions.clone(),
            audit: vec![AuditRecord::from_outcome(
                input.cycle_id,
                input.now,
                &outcome,
                inputs,
            )],
            next_state: next,
            session,
        }
    }

    /// Equity-cycle bookkeeping that runs before any guard
    fn flat_reset(&self, snapshot: &AccountSnapshot, next: &mut GuardState) -> Option<GuardOutcome> {
        if snapshot.is_flat() {
            let had_trailing = !next.trailing_state.is_empty();
            let was_done = next.partial_close_done;
            next.partial_close_done = false;
            next.trailing_state.clear();
            if was_done || had_trailing {
                info!("♻️ Account flat, equity cycle reset");
                return Some(GuardOutcome::new(
                    GuardKind::Orchestrator,
                    Decision::Reset,
                    "account flat: partial-close flag and trailing state cleared",
                ));
            }
            return None;
        }

        let dropped = next.retain_open_positions(&snapshot.position_ids());
        if dropped > 0 {
            debug!(dropped, "Dropped trailing state for closed positions");
        }
        None
    }
}

/// Ordered action list across guards.
///
/// After the first close-all, later guards contribute no position-mutating
/// actions. Stop moves are kept once per position (first wins).
fn resolve_actions(outcomes: &[GuardOutcome]) -> Vec<Action> {
    let mut actions = Vec::new();
    let mut closed = false;
    let mut stops_moved = HashSet::new();

    for outcome in outcomes {
        for action in &outcome.actions {
            if closed && action.mutates_positions() {
                debug!(action = %action, "Dropped: positions already closing");
                continue;
            }
            if let Action::ModifyStopLoss { position_id, .. } = action {
                if !stops_moved.insert(position_id.clone()) {
                    debug!(action = %action, "Dropped: stop already moved this cycle");
                    continue;
                }
            }
            actions.push(action.clone());
        }
        closed |= outcome.closes_all();
    }
    actions
}
