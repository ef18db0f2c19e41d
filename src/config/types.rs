//! Typed guard configuration
//!
//! Converts the loosely typed `AppConfig` (floats, "HH:MM" strings) into the
//! immutable `GuardConfig` snapshot the guards read each cycle.

use super::{AppConfig, SessionConfig};
use anyhow::{anyhow, Context, Result};
use chrono::{Duration, NaiveTime};
use rust_decimal::Decimal;
use std::collections::HashMap;

use crate::types::{default_pip_size, split_currency_pair, Impact};

#[derive(Debug, Clone, PartialEq)]
pub struct ProfitGuardConfig {
    pub partial_trigger_pct: Decimal,
    pub full_trigger_pct: Decimal,
    pub partial_close_fraction: Decimal,
    pub full_close_cooldown: Duration,
    pub lot_step: Decimal,
    pub min_lot: Decimal,
    pub breakeven_buffer_pips: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DrawdownGuardConfig {
    pub block_trigger_pct: Decimal,
    pub recovery_trigger_pct: Decimal,
    pub recovery_cooldown: Duration,
    /// Daily loss limit (closed today + floating) as % of the reference balance
    pub max_daily_loss_pct: Option<Decimal>,
    /// Total loss limit (reference balance - equity) as % of the reference balance
    pub max_total_loss_pct: Option<Decimal>,
    /// Reference balance for both limits; the snapshot balance when unset
    pub initial_balance: Option<Decimal>,
}

/// Named trading window, half-open `[start, end)`; wraps midnight when `start > end`
#[derive(Debug, Clone, PartialEq)]
pub struct TradingSession {
    pub name: String,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub lot_multiplier: Decimal,
    /// Closes every open position once per day at this time
    pub auto_close: Option<NaiveTime>,
}

impl TradingSession {
    pub fn contains(&self, t: NaiveTime) -> bool {
        if self.start <= self.end {
            self.start <= t && t < self.end
        } else {
            t >= self.start || t < self.end
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimeGuardConfig {
    pub daily_closure_time: NaiveTime,
    pub hard_exit_time: NaiveTime,
    pub sessions: Vec<TradingSession>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewsGuardConfig {
    pub enabled: bool,
    pub window: Duration,
    pub impact_filter: Vec<Impact>,
    pub fail_closed: bool,
    /// Upper-cased symbol -> (base, quote)
    pub symbol_currencies: HashMap<String, (String, String)>,
}

impl NewsGuardConfig {
    /// Currencies a symbol is exposed to: explicit override, then a 3+3
    /// letter split, then USD.
    pub fn currencies_for(&self, symbol: &str) -> (String, String) {
        let key = symbol.to_uppercase();
        if let Some(pair) = self.symbol_currencies.get(&key) {
            return pair.clone();
        }
        split_currency_pair(symbol).unwrap_or_else(|| ("USD".to_string(), "USD".to_string()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrailingConfigSnapshot {
    pub breakeven_after: Duration,
    pub trail_distance_pips: Decimal,
    /// Upper-cased symbol -> pip size
    pub pip_sizes: HashMap<String, Decimal>,
}

impl TrailingConfigSnapshot {
    pub fn pip_size(&self, symbol: &str) -> Decimal {
        self.pip_sizes
            .get(&symbol.to_uppercase())
            .copied()
            .unwrap_or_else(|| default_pip_size(symbol))
    }
}

/// Immutable per-cycle configuration snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct GuardConfig {
    pub profit: ProfitGuardConfig,
    pub drawdown: DrawdownGuardConfig,
    pub time: TimeGuardConfig,
    pub news: NewsGuardConfig,
    pub trailing: TrailingConfigSnapshot,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            profit: ProfitGuardConfig {
                partial_trigger_pct: Decimal::ONE,
                full_trigger_pct: Decimal::TWO,
                partial_close_fraction: Decimal::new(5, 1),
                full_close_cooldown: Duration::minutes(60),
                lot_step: Decimal::new(1, 2),
                min_lot: Decimal::new(1, 2),
                breakeven_buffer_pips: Decimal::ZERO,
            },
            drawdown: DrawdownGuardConfig {
                block_trigger_pct: Decimal::NEGATIVE_ONE,
                recovery_trigger_pct: Decimal::ZERO,
                recovery_cooldown: Duration::zero(),
                max_daily_loss_pct: Some(Decimal::from(5)),
                max_total_loss_pct: Some(Decimal::from(10)),
                initial_balance: None,
            },
            time: TimeGuardConfig {
                daily_closure_time: hm(16, 0),
                hard_exit_time: hm(19, 30),
                sessions: vec![
                    session("asian", hm(0, 0), hm(3, 0), Decimal::new(5, 1)),
                    session("ny_am", hm(12, 30), hm(15, 0), Decimal::ONE),
                    session("pm", hm(17, 0), hm(19, 0), Decimal::new(75, 2)),
                ],
            },
            news: NewsGuardConfig {
                enabled: true,
                window: Duration::minutes(30),
                impact_filter: vec![Impact::High],
                fail_closed: false,
                symbol_currencies: HashMap::new(),
            },
            trailing: TrailingConfigSnapshot {
                breakeven_after: Duration::minutes(30),
                trail_distance_pips: Decimal::from(20),
                pip_sizes: HashMap::new(),
            },
        }
    }
}

fn hm(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap_or_default()
}

fn session(name: &str, start: NaiveTime, end: NaiveTime, lot_multiplier: Decimal) -> TradingSession {
    TradingSession {
        name: name.to_string(),
        start,
        end,
        lot_multiplier,
        auto_close: None,
    }
}

/// Parse an "HH:MM" (or "HH:MM:SS") UTC clock time
pub fn parse_clock_time(s: &str) -> Result<NaiveTime> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .with_context(|| format!("invalid clock time '{}', expected HH:MM", s))
}

fn decimal(name: &str, value: f64) -> Result<Decimal> {
    Decimal::try_from(value).map_err(|e| anyhow!("{} = {} is not representable: {}", name, value, e))
}

fn parse_currencies(symbol: &str, value: &str) -> Result<(String, String)> {
    let parts: Vec<String> = value
        .split('/')
        .map(|p| p.trim().to_uppercase())
        .filter(|p| !p.is_empty())
        .collect();
    match parts.as_slice() {
        [single] => Ok((single.clone(), single.clone())),
        [base, quote] => Ok((base.clone(), quote.clone())),
        _ => Err(anyhow!(
            "news.symbol_currencies.{} = '{}', expected CCY or BASE/QUOTE",
            symbol,
            value
        )),
    }
}

fn convert_session(cfg: &SessionConfig) -> Result<TradingSession> {
    Ok(TradingSession {
        name: cfg.name.clone(),
        start: parse_clock_time(&cfg.start_utc)
            .with_context(|| format!("session {} start", cfg.name))?,
        end: parse_clock_time(&cfg.end_utc).with_context(|| format!("session {} end", cfg.name))?,
        lot_multiplier: decimal("lot_multiplier", cfg.lot_multiplier)?,
        auto_close: cfg
            .auto_close_utc
            .as_deref()
            .map(parse_clock_time)
            .transpose()
            .with_context(|| format!("session {} auto_close", cfg.name))?,
    })
}

impl AppConfig {
    /// Build the immutable guard snapshot
    pub fn guard_config(&self) -> Result<GuardConfig> {
        let impact_filter = self
            .news
            .impact_filter
            .iter()
            .map(|s| Impact::from_str(s).ok_or_else(|| anyhow!("unknown impact level '{}'", s)))
            .collect::<Result<Vec<_>>>()?;

        let symbol_currencies = self
            .news
            .symbol_currencies
            .iter()
            .map(|(symbol, value)| Ok((symbol.to_uppercase(), parse_currencies(symbol, value)?)))
            .collect::<Result<HashMap<_, _>>>()?;

        let pip_sizes = self
            .trailing
            .pip_sizes
            .iter()
            .map(|(symbol, size)| Ok((symbol.to_uppercase(), decimal("pip_size", *size)?)))
            .collect::<Result<HashMap<_, _>>>()?;

        Ok(GuardConfig {
            profit: ProfitGuardConfig {
                partial_trigger_pct: decimal("partial_trigger_pct", self.profit.partial_trigger_pct)?,
                full_trigger_pct: decimal("full_trigger_pct", self.profit.full_trigger_pct)?,
                partial_close_fraction: decimal(
                    "partial_close_fraction",
                    self.profit.partial_close_fraction,
                )?,
                full_close_cooldown: Duration::minutes(self.profit.full_close_cooldown_minutes),
                lot_step: decimal("lot_step", self.profit.lot_step)?,
                min_lot: decimal("min_lot", self.profit.min_lot)?,
                breakeven_buffer_pips: decimal(
                    "breakeven_buffer_pips",
                    self.profit.breakeven_buffer_pips,
                )?,
            },
            drawdown: DrawdownGuardConfig {
                block_trigger_pct: decimal("block_trigger_pct", self.drawdown.block_trigger_pct)?,
                recovery_trigger_pct: decimal(
                    "recovery_trigger_pct",
                    self.drawdown.recovery_trigger_pct,
                )?,
                recovery_cooldown: Duration::minutes(self.drawdown.recovery_cooldown_minutes),
                max_daily_loss_pct: self
                    .drawdown
                    .max_daily_loss_pct
                    .map(|v| decimal("max_daily_loss_pct", v))
                    .transpose()?,
                max_total_loss_pct: self
                    .drawdown
                    .max_total_loss_pct
                    .map(|v| decimal("max_total_loss_pct", v))
                    .transpose()?,
                initial_balance: self
                    .drawdown
                    .initial_balance
                    .map(|v| decimal("initial_balance", v))
                    .transpose()?,
            },
            time: TimeGuardConfig {
                daily_closure_time: parse_clock_time(&self.time.daily_closure_time)
                    .context("time.daily_closure_time")?,
                hard_exit_time: parse_clock_time(&self.time.hard_exit_time)
                    .context("time.hard_exit_time")?,
                sessions: self
                    .time
                    .sessions
                    .iter()
                    .map(convert_session)
                    .collect::<Result<Vec<_>>>()?,
            },
            news: NewsGuardConfig {
                enabled: self.news.enabled,
                window: Duration::minutes(self.news.window_minutes),
                impact_filter,
                fail_closed: self.news.fail_closed,
                symbol_currencies,
            },
            trailing: TrailingConfigSnapshot {
                breakeven_after: Duration::minutes(self.trailing.breakeven_after_minutes),
                trail_distance_pips: decimal(
                    "trail_distance_pips",
                    self.trailing.trail_distance_pips,
                )?,
                pip_sizes,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_clock_time() {
        assert_eq!(parse_clock_time("16:00").unwrap(), hm(16, 0));
        assert_eq!(parse_clock_time(" 19:30 ").unwrap(), hm(19, 30));
        assert!(parse_clock_time("7pm").is_err());
    }

    #[test]
    fn test_session_contains_half_open() {
        let s = session("ny_am", hm(12, 30), hm(15, 0), Decimal::ONE);
        assert!(s.contains(hm(12, 30)));
        assert!(s.contains(hm(14, 59)));
        assert!(!s.contains(hm(15, 0)));
    }

    #[test]
    fn test_session_wraps_midnight() {
        let s = session("overnight", hm(23, 0), hm(2, 0), Decimal::ONE);
        assert!(s.contains(hm(23, 30)));
        assert!(s.contains(hm(1, 0)));
        assert!(!s.contains(hm(12, 0)));
    }

    #[test]
    fn test_parse_currencies() {
        assert_eq!(
            parse_currencies("US500.cash", "usd").unwrap(),
            ("USD".to_string(), "USD".to_string())
        );
        assert_eq!(
            parse_currencies("XAUUSD", "XAU/USD").unwrap(),
            ("XAU".to_string(), "USD".to_string())
        );
        assert!(parse_currencies("BAD", "A/B/C").is_err());
    }

    #[test]
    fn test_currencies_for_uses_override_then_split() {
        let mut cfg = GuardConfig::default().news;
        cfg.symbol_currencies
            .insert("GER40.CASH".to_string(), ("EUR".to_string(), "EUR".to_string()));

        assert_eq!(cfg.currencies_for("GER40.cash").0, "EUR");
        assert_eq!(
            cfg.currencies_for("USDJPY"),
            ("USD".to_string(), "JPY".to_string())
        );
        assert_eq!(cfg.currencies_for("BTC"), ("USD".to_string(), "USD".to_string()));
    }

    #[test]
    fn test_pip_size_override() {
        let mut cfg = GuardConfig::default();
        cfg.trailing
            .pip_sizes
            .insert("XAUUSD".to_string(), dec!(0.1));
        assert_eq!(cfg.trailing.pip_size("xauusd"), dec!(0.1));
        assert_eq!(cfg.trailing.pip_size("GBPJPY"), dec!(0.01));
    }

    #[test]
    fn test_convert_session_auto_close() {
        let mut raw = SessionConfig {
            name: "pm".to_string(),
            start_utc: "17:00".to_string(),
            end_utc: "19:00".to_string(),
            lot_multiplier: 0.75,
            auto_close_utc: Some("19:00".to_string()),
        };
        let session = convert_session(&raw).unwrap();
        assert_eq!(session.auto_close, Some(hm(19, 0)));
        assert_eq!(session.lot_multiplier, dec!(0.75));

        raw.auto_close_utc = None;
        assert_eq!(convert_session(&raw).unwrap().auto_close, None);

        raw.auto_close_utc = Some("late".to_string());
        let err = convert_session(&raw).unwrap_err();
        assert!(format!("{:#}", err).contains("session pm auto_close"));
    }
}
