//! Configuration management for TradeGuard
//!
//! Loads from YAML/TOML files + environment variables via .env

mod types;

pub use types::*;

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub scheduler: SchedulerConfig,
    pub providers: ProvidersConfig,
    pub profit: ProfitConfig,
    pub drawdown: DrawdownConfig,
    pub time: TimeConfig,
    pub news: NewsConfig,
    pub trailing: TrailingConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Account identifier, used as the guard-state scope key
    pub account_id: String,
    /// Directory for guard state and the audit trail
    pub data_dir: String,
    /// Log actions instead of sending them to a broker
    pub dry_run: bool,
    /// Symbols checked for news blocks besides those with open positions;
    /// `*` enables the account-wide check
    #[serde(default)]
    pub watch_symbols: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Full evaluation cycle interval in seconds
    pub tick_secs: u64,
    /// Profit/drawdown sub-tick interval in seconds (0 disables sub-ticks)
    pub fast_tick_secs: u64,
    /// Upper bound for any collaborator call
    pub provider_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProvidersConfig {
    /// JSON file with the latest account snapshot (written by the broker bridge)
    pub snapshot_file: String,
    /// Local JSON news calendar
    pub news_file: Option<String>,
    /// Remote JSON news calendar (takes precedence over `news_file`)
    pub news_url: Option<String>,
    /// How long a fetched calendar is reused
    pub news_cache_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProfitConfig {
    /// Floating P&L (% of balance) that triggers the partial close
    pub partial_trigger_pct: f64,
    /// Floating P&L (% of balance) that triggers the full close
    pub full_trigger_pct: f64,
    /// Fraction of each position closed by the partial stage
    pub partial_close_fraction: f64,
    /// Cooldown after a full close before any profit trigger re-arms
    pub full_close_cooldown_minutes: i64,
    /// Broker lot step
    pub lot_step: f64,
    /// Smallest closable volume
    pub min_lot: f64,
    /// Buffer beyond entry for the breakeven stop, in pips
    pub breakeven_buffer_pips: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DrawdownConfig {
    /// Floating P&L (% of balance, negative) at or below which entries block
    pub block_trigger_pct: f64,
    /// Floating P&L (% of balance) that must be strictly exceeded to unblock
    pub recovery_trigger_pct: f64,
    /// Extra minutes entries stay blocked after recovery
    pub recovery_cooldown_minutes: i64,
    /// Daily loss limit, % of the reference balance
    #[serde(default)]
    pub max_daily_loss_pct: Option<f64>,
    /// Total loss limit, % of the reference balance
    #[serde(default)]
    pub max_total_loss_pct: Option<f64>,
    /// Account size the loss limits are measured against
    #[serde(default)]
    pub initial_balance: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimeConfig {
    /// Daily forced closure, "HH:MM" UTC
    pub daily_closure_time: String,
    /// Hard session exit, "HH:MM" UTC
    pub hard_exit_time: String,
    #[serde(default = "default_sessions")]
    pub sessions: Vec<SessionConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    pub name: String,
    pub start_utc: String,
    pub end_utc: String,
    pub lot_multiplier: f64,
    /// Forced close of all positions, "HH:MM" UTC
    #[serde(default)]
    pub auto_close_utc: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewsConfig {
    /// Master switch for news protection
    pub enabled: bool,
    /// Minutes blocked before and after each event
    pub window_minutes: i64,
    /// Impact levels that block ("High", "Medium", "Low")
    pub impact_filter: Vec<String>,
    /// Block entries when the calendar cannot be read
    pub fail_closed: bool,
    /// Currency exposure for symbols that are not plain FX pairs, "BASE/QUOTE" or "CCY"
    #[serde(default = "default_symbol_currencies")]
    pub symbol_currencies: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrailingConfig {
    /// Position age before breakeven may apply
    pub breakeven_after_minutes: i64,
    /// Trailing distance in pips
    pub trail_distance_pips: f64,
    /// Pip size overrides per symbol (metals, indices)
    #[serde(default)]
    pub pip_sizes: HashMap<String, f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON log lines
    pub json: bool,
    /// Default filter when RUST_LOG is unset
    pub level: String,
}

fn default_sessions() -> Vec<SessionConfig> {
    vec![
        SessionConfig {
            name: "asian".to_string(),
            start_utc: "00:00".to_string(),
            end_utc: "03:00".to_string(),
            lot_multiplier: 0.5,
            auto_close_utc: None,
        },
        SessionConfig {
            name: "ny_am".to_string(),
            start_utc: "12:30".to_string(),
            end_utc: "15:00".to_string(),
            lot_multiplier: 1.0,
            auto_close_utc: None,
        },
        SessionConfig {
            name: "pm".to_string(),
            start_utc: "17:00".to_string(),
            end_utc: "19:00".to_string(),
            lot_multiplier: 0.75,
            auto_close_utc: None,
        },
    ]
}

fn default_symbol_currencies() -> HashMap<String, String> {
    [
        ("US500.cash", "USD"),
        ("US30.cash", "USD"),
        ("US100.cash", "USD"),
        ("NAS100", "USD"),
        ("GER40.cash", "EUR"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let config = Config::builder()
            // Engine defaults
            .set_default("engine.account_id", "default")?
            .set_default("engine.data_dir", "./data")?
            .set_default("engine.dry_run", true)?
            // Scheduler defaults
            .set_default("scheduler.tick_secs", 900)?
            .set_default("scheduler.fast_tick_secs", 60)?
            .set_default("scheduler.provider_timeout_secs", 10)?
            // Provider defaults
            .set_default("providers.snapshot_file", "./data/account_snapshot.json")?
            .set_default("providers.news_file", "./data/high_impact_news.json")?
            .set_default("providers.news_cache_secs", 300)?
            // Profit guard defaults
            .set_default("profit.partial_trigger_pct", 1.0)?
            .set_default("profit.full_trigger_pct", 2.0)?
            .set_default("profit.partial_close_fraction", 0.5)?
            .set_default("profit.full_close_cooldown_minutes", 60)?
            .set_default("profit.lot_step", 0.01)?
            .set_default("profit.min_lot", 0.01)?
            .set_default("profit.breakeven_buffer_pips", 0.0)?
            // Drawdown guard defaults
            .set_default("drawdown.block_trigger_pct", -1.0)?
            .set_default("drawdown.recovery_trigger_pct", 0.0)?
            .set_default("drawdown.recovery_cooldown_minutes", 0)?
            .set_default("drawdown.max_daily_loss_pct", 5.0)?
            .set_default("drawdown.max_total_loss_pct", 10.0)?
            // Time guard defaults
            .set_default("time.daily_closure_time", "16:00")?
            .set_default("time.hard_exit_time", "19:30")?
            // News guard defaults
            .set_default("news.enabled", true)?
            .set_default("news.window_minutes", 30)?
            .set_default("news.impact_filter", vec!["High"])?
            .set_default("news.fail_closed", false)?
            // Trailing stop defaults
            .set_default("trailing.breakeven_after_minutes", 30)?
            .set_default("trailing.trail_distance_pips", 20.0)?
            // Logging defaults
            .set_default("logging.json", false)?
            .set_default("logging.level", "tradeguard=info")?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (TRADEGUARD__*)
            .add_source(Environment::with_prefix("TRADEGUARD").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        app_config.validate()?;
        Ok(app_config)
    }

    /// Check cross-field constraints that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.profit.partial_trigger_pct >= self.profit.full_trigger_pct {
            bail!(
                "profit.partial_trigger_pct ({}) must be below profit.full_trigger_pct ({})",
                self.profit.partial_trigger_pct,
                self.profit.full_trigger_pct
            );
        }
        if !(0.0..=1.0).contains(&self.profit.partial_close_fraction)
            || self.profit.partial_close_fraction == 0.0
        {
            bail!("profit.partial_close_fraction must be in (0, 1]");
        }
        if self.profit.lot_step <= 0.0 {
            bail!("profit.lot_step must be positive");
        }
        if self.drawdown.block_trigger_pct >= 0.0 {
            bail!("drawdown.block_trigger_pct must be negative");
        }
        if self.drawdown.recovery_trigger_pct <= self.drawdown.block_trigger_pct {
            bail!("drawdown.recovery_trigger_pct must be above drawdown.block_trigger_pct");
        }
        for (name, limit) in [
            ("drawdown.max_daily_loss_pct", self.drawdown.max_daily_loss_pct),
            ("drawdown.max_total_loss_pct", self.drawdown.max_total_loss_pct),
            ("drawdown.initial_balance", self.drawdown.initial_balance),
        ] {
            if limit.is_some_and(|v| v <= 0.0) {
                bail!("{} must be positive", name);
            }
        }
        if self.news.window_minutes < 0 {
            bail!("news.window_minutes must not be negative");
        }
        if self.scheduler.tick_secs == 0 {
            bail!("scheduler.tick_secs must be positive");
        }
        // Surface time/session parse errors at startup rather than mid-cycle
        self.guard_config()?;
        Ok(())
    }

    /// Generate a digest of the config for logging
    pub fn digest(&self) -> String {
        format!(
            "account={} dry_run={} tick={}s partial={}% full={}% dd_block={}% dd_recover={}% close={} hard_exit={} news=±{}m",
            self.engine.account_id,
            self.engine.dry_run,
            self.scheduler.tick_secs,
            self.profit.partial_trigger_pct,
            self.profit.full_trigger_pct,
            self.drawdown.block_trigger_pct,
            self.drawdown.recovery_trigger_pct,
            self.time.daily_closure_time,
            self.time.hard_exit_time,
            self.news.window_minutes
        )
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}
