//! Polling loop around the orchestrator
//!
//! Owns every side effect: collaborator calls under a timeout, state
//! persistence, action dispatch, the audit trail and the entry gate read by
//! the entry logic. State is written before any action is dispatched; a
//! failed position-mutating action rolls back the transition it carried and
//! the state is written again.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::audit::AuditSink;
use crate::config::AppConfig;
use crate::error::{GuardError, Result};
use crate::guards::ActiveSession;
use crate::orchestrator::{CycleInput, CycleKind, GuardOrchestrator, Verdict};
use crate::providers::{AccountProvider, ActionDispatcher, NewsProvider};
use crate::state::{GuardState, StateStore};
use crate::types::Feed;

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Guard-state scope (account id)
    pub scope: String,
    pub tick: Duration,
    /// `None` disables fast sub-ticks
    pub fast_tick: Option<Duration>,
    pub provider_timeout: Duration,
    pub watch_symbols: Vec<String>,
}

impl SchedulerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            scope: config.engine.account_id.clone(),
            tick: Duration::from_secs(config.scheduler.tick_secs),
            fast_tick: match config.scheduler.fast_tick_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            provider_timeout: Duration::from_secs(config.scheduler.provider_timeout_secs),
            watch_symbols: config.engine.watch_symbols.clone(),
        }
    }
}

/// Latest allow/block answer for new-trade evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct EntryGate {
    pub verdict: Verdict,
    /// News blocks from the last full cycle
    pub symbol_blocks: BTreeMap<String, String>,
    pub news_block: Option<String>,
    pub session: Option<ActiveSession>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for EntryGate {
    fn default() -> Self {
        // Nothing evaluated yet
        Self {
            verdict: Verdict::Block {
                reasons: vec!["no guard cycle has run yet".to_string()],
            },
            symbol_blocks: BTreeMap::new(),
            news_block: None,
            session: None,
            updated_at: None,
        }
    }
}

impl EntryGate {
    pub fn allows(&self, symbol: &str) -> bool {
        !self.verdict.is_blocked()
            && self.news_block.is_none()
            && !self.symbol_blocks.contains_key(symbol)
    }
}

/// What one cycle did
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub kind: CycleKind,
    pub verdict: Verdict,
    pub dispatched: usize,
    pub failed: usize,
    pub rolled_back: bool,
}

pub struct Scheduler {
    orchestrator: GuardOrchestrator,
    account: Arc<dyn AccountProvider>,
    news: Arc<dyn NewsProvider>,
    dispatcher: Arc<dyn ActionDispatcher>,
    store: Arc<dyn StateStore>,
    audit: Arc<dyn AuditSink>,
    settings: SchedulerSettings,
    state: GuardState,
    gate: Arc<RwLock<EntryGate>>,
}

impl Scheduler {
    /// Build the scheduler and load the persisted state for `settings.scope`
    pub fn new(
        orchestrator: GuardOrchestrator,
        account: Arc<dyn AccountProvider>,
        news: Arc<dyn NewsProvider>,
        dispatcher: Arc<dyn ActionDispatcher>,
        store: Arc<dyn StateStore>,
        audit: Arc<dyn AuditSink>,
        settings: SchedulerSettings,
    ) -> Result<Self> {
        let state = store.load(&settings.scope)?;
        Ok(Self {
            orchestrator,
            account,
            news,
            dispatcher,
            store,
            audit,
            settings,
            state,
            gate: Arc::new(RwLock::new(EntryGate::default())),
        })
    }

    pub fn state(&self) -> &GuardState {
        &self.state
    }

    pub fn gate(&self) -> Arc<RwLock<EntryGate>> {
        self.gate.clone()
    }

    /// Run until `shutdown` flips to true. The in-flight cycle always
    /// finishes and the state is written once more before returning.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut full = interval(self.settings.tick);
        full.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut fast = interval(self.settings.fast_tick.unwrap_or(self.settings.tick));
        fast.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let fast_enabled = self.settings.fast_tick.is_some();

        info!(
            scope = %self.settings.scope,
            tick_secs = self.settings.tick.as_secs(),
            fast_tick_secs = self.settings.fast_tick.map(|d| d.as_secs()).unwrap_or(0),
            "🚀 Guard scheduler started"
        );

        loop {
            let kind = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                _ = full.tick() => CycleKind::Full,
                _ = fast.tick(), if fast_enabled => CycleKind::Fast,
            };

            if let Err(e) = self.run_cycle(kind).await {
                if e.is_fatal() {
                    error!(error = %e, "💥 Guard state cannot be persisted, stopping");
                    return Err(e);
                }
                warn!(error = %e, kind = %kind, "Guard cycle failed");
            }
        }

        self.store.save(&self.settings.scope, &self.state)?;
        info!(scope = %self.settings.scope, "💾 Guard state persisted, scheduler stopped");
        Ok(())
    }

    pub async fn run_cycle(&mut self, kind: CycleKind) -> Result<CycleReport> {
        self.run_cycle_at(kind, Utc::now()).await
    }

    pub async fn run_cycle_at(&mut self, kind: CycleKind, now: DateTime<Utc>) -> Result<CycleReport> {
        let account = self.fetch("account snapshot", self.account.snapshot()).await;
        let news = match kind {
            CycleKind::Full => self.fetch("news calendar", self.news.events()).await,
            CycleKind::Fast => Feed::Unavailable("not fetched on fast cycles".to_string()),
        };

        let input = CycleInput::new(kind, now, account, news)
            .with_watch_symbols(self.settings.watch_symbols.iter().cloned());
        let result = self.orchestrator.evaluate(&input, &self.state);

        let prior = std::mem::replace(&mut self.state, result.next_state.clone());
        self.store.save(&self.settings.scope, &self.state)?;

        let mut dispatched = 0;
        let mut failed = 0;
        let mut rolled_back = false;
        for action in &result.actions {
            let outcome = match timeout(self.settings.provider_timeout, self.dispatcher.dispatch(action)).await {
                Ok(res) => res,
                Err(_) => Err(GuardError::ActionDispatchFailure(format!(
                    "timed out after {}s",
                    self.settings.provider_timeout.as_secs()
                ))),
            };

            match outcome {
                Ok(()) => dispatched += 1,
                Err(e) => {
                    failed += 1;
                    warn!(action = %action, origin = %action.origin(), error = %e, "❌ Action dispatch failed");
                    if action.mutates_positions() {
                        self.state.revert_action(action, &prior);
                        rolled_back = true;
                    }
                }
            }
        }

        if rolled_back {
            self.store.save(&self.settings.scope, &self.state)?;
            info!(cycle = %result.cycle_id, "↩️ Guard transitions rolled back for retry next cycle");
        }

        if let Err(e) = self.audit.record(&result.audit).await {
            warn!(error = %e, "Failed to write audit records");
        }

        {
            let mut gate = self.gate.write().await;
            gate.verdict = result.verdict.clone();
            if kind == CycleKind::Full {
                gate.symbol_blocks = result.symbol_blocks.clone();
                gate.news_block = result.news_block.clone();
            }
            gate.session = result.session.clone();
            gate.updated_at = Some(now);
        }

        Ok(CycleReport {
            cycle_id: result.cycle_id,
            kind,
            verdict: result.verdict,
            dispatched,
            failed,
            rolled_back,
        })
    }

    async fn fetch<T, F>(&self, what: &str, call: F) -> Feed<T>
    where
        F: Future<Output = Result<T>>,
    {
        match timeout(self.settings.provider_timeout, call).await {
            Ok(Ok(value)) => Feed::Available(value),
            Ok(Err(e)) => {
                warn!(source = what, error = %e, "Collaborator call failed");
                Feed::Unavailable(e.to_string())
            }
            Err(_) => {
                warn!(
                    source = what,
                    timeout_secs = self.settings.provider_timeout.as_secs(),
                    "Collaborator call timed out"
                );
                Feed::Unavailable(format!(
                    "{} timed out after {}s",
                    what,
                    self.settings.provider_timeout.as_secs()
                ))
            }
        }
    }
}
