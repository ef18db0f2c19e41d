//! Core types used throughout TradeGuard
//!
//! Defines positions, account snapshots, news events and the actions the
//! guard engine hands back to the broker layer.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Trading direction of an open position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// +1 for longs, -1 for shorts. Multiplying a price delta by this gives
    /// the favourable move.
    pub fn sign(&self) -> Decimal {
        match self {
            Direction::Long => Decimal::ONE,
            Direction::Short => Decimal::NEGATIVE_ONE,
        }
    }

    /// True when `candidate` is a stop level strictly better (tighter in the
    /// profitable direction) than `current`.
    pub fn is_improvement(&self, candidate: Decimal, current: Decimal) -> bool {
        match self {
            Direction::Long => candidate > current,
            Direction::Short => candidate < current,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Long => write!(f, "LONG"),
            Direction::Short => write!(f, "SHORT"),
        }
    }
}

/// Open position as reported by the broker. The guard engine only reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Broker ticket
    pub id: String,
    pub symbol: String,
    pub direction: Direction,
    /// Remaining volume in lots
    pub volume: Decimal,
    pub entry_price: Decimal,
    /// Last mark price
    pub current_price: Decimal,
    pub opened_at: DateTime<Utc>,
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    #[serde(default)]
    pub take_profit: Option<Decimal>,
    /// Floating P&L of this position in account currency
    pub profit: Decimal,
}

impl Position {
    pub fn in_profit(&self) -> bool {
        self.profit > Decimal::ZERO
    }

    /// Signed favourable distance between the mark price and `level`.
    pub fn favourable_distance_from(&self, level: Decimal) -> Decimal {
        (self.current_price - level) * self.direction.sign()
    }
}

/// Account state captured once per cycle. Never mutated, only superseded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub balance: Decimal,
    pub floating_pnl: Decimal,
    /// Realised P&L of deals closed since UTC midnight
    #[serde(default)]
    pub closed_pnl_today: Decimal,
    pub positions: Vec<Position>,
    pub timestamp: DateTime<Utc>,
}

impl AccountSnapshot {
    /// Floating P&L as a percentage of balance, `None` when the balance is unusable.
    pub fn floating_pct(&self) -> Option<Decimal> {
        if self.balance <= Decimal::ZERO {
            return None;
        }
        Some(self.floating_pnl / self.balance * Decimal::ONE_HUNDRED)
    }

    pub fn is_flat(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn position_ids(&self) -> Vec<String> {
        self.positions.iter().map(|p| p.id.clone()).collect()
    }
}

/// News impact level as published by the calendar
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Impact {
    High,
    Medium,
    Low,
}

impl Impact {
    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "high" | "red" => Some(Impact::High),
            "medium" | "orange" => Some(Impact::Medium),
            "low" | "yellow" => Some(Impact::Low),
            _ => None,
        }
    }
}

impl fmt::Display for Impact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Impact::High => write!(f, "High"),
            Impact::Medium => write!(f, "Medium"),
            Impact::Low => write!(f, "Low"),
        }
    }
}

/// Scheduled economic calendar event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewsEvent {
    pub name: String,
    pub time: DateTime<Utc>,
    pub currency: String,
    pub impact: Impact,
}

/// Which guard produced an action or decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GuardKind {
    Time,
    News,
    Drawdown,
    Profit,
    Trailing,
    /// Cycle-level bookkeeping (flat reset, data availability)
    Orchestrator,
}

impl fmt::Display for GuardKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuardKind::Time => write!(f, "TIME_GUARD"),
            GuardKind::News => write!(f, "NEWS_GUARD"),
            GuardKind::Drawdown => write!(f, "DRAWDOWN_GUARD"),
            GuardKind::Profit => write!(f, "PROFIT_GUARD"),
            GuardKind::Trailing => write!(f, "TRAILING_STOP"),
            GuardKind::Orchestrator => write!(f, "ORCHESTRATOR"),
        }
    }
}

/// One position leg of a close request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseOrder {
    pub position_id: String,
    pub symbol: String,
    /// Volume to close, already rounded to the broker lot step
    pub volume: Decimal,
}

/// Scope of an entry block
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockScope {
    /// Every symbol on the account
    All,
    Symbol(String),
}

impl fmt::Display for BlockScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockScope::All => write!(f, "*"),
            BlockScope::Symbol(s) => write!(f, "{}", s),
        }
    }
}

/// Instruction emitted by the guard engine for the broker layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Action {
    ClosePositions {
        origin: GuardKind,
        orders: Vec<CloseOrder>,
        /// Requested fraction of each position (1 = full close)
        fraction: Decimal,
        reason: String,
    },
    ModifyStopLoss {
        origin: GuardKind,
        position_id: String,
        symbol: String,
        new_price: Decimal,
    },
    BlockNewEntries {
        origin: GuardKind,
        scope: BlockScope,
        reason: String,
    },
    /// Return the configured lot size to its default after a partial close
    ResetLotSize { origin: GuardKind, reason: String },
}

impl Action {
    pub fn origin(&self) -> GuardKind {
        match self {
            Action::ClosePositions { origin, .. }
            | Action::ModifyStopLoss { origin, .. }
            | Action::BlockNewEntries { origin, .. }
            | Action::ResetLotSize { origin, .. } => *origin,
        }
    }

    /// True for actions that change broker-side positions
    pub fn mutates_positions(&self) -> bool {
        matches!(
            self,
            Action::ClosePositions { .. } | Action::ModifyStopLoss { .. }
        )
    }

    pub fn is_full_close(&self) -> bool {
        matches!(self, Action::ClosePositions { fraction, .. } if *fraction >= Decimal::ONE)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::ClosePositions {
                orders,
                fraction,
                reason,
                ..
            } => write!(
                f,
                "CLOSE {} position(s) x{} ({})",
                orders.len(),
                fraction,
                reason
            ),
            Action::ModifyStopLoss {
                position_id,
                symbol,
                new_price,
                ..
            } => write!(f, "MODIFY_SL {} #{} -> {}", symbol, position_id, new_price),
            Action::BlockNewEntries { scope, reason, .. } => {
                write!(f, "BLOCK_ENTRIES {} ({})", scope, reason)
            }
            Action::ResetLotSize { reason, .. } => write!(f, "RESET_LOT_SIZE ({})", reason),
        }
    }
}

/// Collaborator data for one cycle: either fetched, or unavailable with a reason
#[derive(Debug, Clone, PartialEq)]
pub enum Feed<T> {
    Available(T),
    Unavailable(String),
}

impl<T> Feed<T> {
    pub fn available(&self) -> Option<&T> {
        match self {
            Feed::Available(v) => Some(v),
            Feed::Unavailable(_) => None,
        }
    }
}

/// Split a broker symbol into its base and quote currency.
///
/// Broker suffixes after a dot (`EURUSD.raw`) and trailing lowercase/markers
/// are ignored. Returns `None` when no 3+3 letter split is possible.
pub fn split_currency_pair(symbol: &str) -> Option<(String, String)> {
    let core = symbol.split('.').next().unwrap_or(symbol).to_uppercase();
    let letters: String = core.chars().take_while(|c| c.is_ascii_alphabetic()).collect();
    if letters.len() < 6 {
        return None;
    }
    Some((letters[..3].to_string(), letters[3..6].to_string()))
}

/// Default pip size for a symbol: 0.01 for JPY-quoted pairs, 0.0001 otherwise.
pub fn default_pip_size(symbol: &str) -> Decimal {
    match split_currency_pair(symbol) {
        Some((_, quote)) if quote == "JPY" => Decimal::new(1, 2),
        _ => Decimal::new(1, 4),
    }
}
