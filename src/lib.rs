//! TradeGuard Library
//!
//! Trade protection and risk guard engine: profit securing, drawdown entry
//! blocks, end-of-day and hard session exits, news windows and trailing stops,
//! evaluated once per cycle against a persisted guard state.

pub mod audit;
pub mod config;
pub mod error;
pub mod guards;
pub mod orchestrator;
pub mod providers;
pub mod scheduler;
pub mod state;
pub mod types;

pub use error::{GuardError, Result};
pub use orchestrator::{CycleInput, CycleKind, CycleResult, GuardOrchestrator, Verdict};
