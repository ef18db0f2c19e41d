//! News Guard - entry blocks around scheduled high-impact events
//!
//! A symbol is blocked while `now` lies inside `[T - window, T + window]` of
//! any filtered event in its base or quote currency. Blocked symbols are also
//! frozen: the trailing manager leaves their stops alone until the window ends.

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

use super::{Decision, GuardOutcome};
use crate::config::NewsGuardConfig;
use crate::error::GuardError;
use crate::types::{Action, BlockScope, Feed, GuardKind, Impact, NewsEvent};

/// Watch-list entry that asks for the account-wide check
pub const ALL_SYMBOLS: &str = "*";

/// Earliest event whose window contains the evaluation time
#[derive(Debug, Clone, PartialEq)]
pub struct NewsMatch {
    pub event: NewsEvent,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

impl NewsMatch {
    pub fn reason(&self) -> String {
        format!(
            "{} {} news '{}' at {} (window {}-{})",
            self.event.currency,
            self.event.impact,
            self.event.name,
            self.event.time.format("%H:%M"),
            self.window_start.format("%H:%M"),
            self.window_end.format("%H:%M")
        )
    }
}

/// News outcome plus the per-symbol blocks the orchestrator reports
#[derive(Debug, Clone)]
pub struct NewsAssessment {
    pub outcome: GuardOutcome,
    /// Blocked symbol -> reason
    pub symbol_blocks: BTreeMap<String, String>,
    /// Set when an account-wide match freezes every position
    pub freeze_all: bool,
}

pub struct NewsGuard<'a> {
    config: &'a NewsGuardConfig,
}

impl<'a> NewsGuard<'a> {
    pub fn new(config: &'a NewsGuardConfig) -> Self {
        Self { config }
    }

    /// Check one symbol, or every currency when `symbol` is `None`
    pub fn check(
        &self,
        events: &[NewsEvent],
        symbol: Option<&str>,
        now: DateTime<Utc>,
    ) -> Option<NewsMatch> {
        let currencies = symbol.map(|s| self.config.currencies_for(s));

        events
            .iter()
            .filter(|e| self.config.impact_filter.contains(&e.impact))
            .filter(|e| match &currencies {
                Some((base, quote)) => {
                    let ccy = e.currency.trim().to_uppercase();
                    ccy == *base || ccy == *quote
                }
                None => true,
            })
            .filter(|e| {
                e.time - self.config.window <= now && now <= e.time + self.config.window
            })
            .min_by_key(|e| e.time)
            .map(|e| NewsMatch {
                event: e.clone(),
                window_start: e.time - self.config.window,
                window_end: e.time + self.config.window,
            })
    }

    pub fn evaluate(
        &self,
        calendar: &Feed<Vec<NewsEvent>>,
        symbols: &BTreeSet<String>,
        now: DateTime<Utc>,
    ) -> NewsAssessment {
        if !self.config.enabled {
            return self.assessment(GuardOutcome::new(
                GuardKind::News,
                Decision::Skipped,
                "news guard disabled",
            ));
        }

        let events = match calendar {
            Feed::Available(events) => events,
            Feed::Unavailable(why) => return self.unavailable(why),
        };

        if symbols.contains(ALL_SYMBOLS) {
            if let Some(hit) = self.check(events, None, now) {
                let reason = hit.reason();
                warn!(reason = %reason, "📰 [NEWS] Account-wide news block");
                let outcome = GuardOutcome::new(GuardKind::News, Decision::Block, reason.clone())
                    .with_actions(vec![Action::BlockNewEntries {
                        origin: GuardKind::News,
                        scope: BlockScope::All,
                        reason,
                    }])
                    .blocking();
                return NewsAssessment {
                    outcome,
                    symbol_blocks: BTreeMap::new(),
                    freeze_all: true,
                };
            }
        }

        let mut symbol_blocks = BTreeMap::new();
        for symbol in symbols.iter().filter(|s| s.as_str() != ALL_SYMBOLS) {
            if let Some(hit) = self.check(events, Some(symbol), now) {
                let reason = hit.reason();
                warn!(symbol = %symbol, reason = %reason, "📰 [NEWS] Symbol blocked");
                symbol_blocks.insert(symbol.clone(), reason);
            }
        }

        if symbol_blocks.is_empty() {
            return self.assessment(GuardOutcome::new(
                GuardKind::News,
                Decision::Allow,
                format!("no filtered event within {} min", self.config.window.num_minutes()),
            ));
        }

        let actions = symbol_blocks
            .iter()
            .map(|(symbol, reason)| Action::BlockNewEntries {
                origin: GuardKind::News,
                scope: BlockScope::Symbol(symbol.clone()),
                reason: reason.clone(),
            })
            .collect();
        let summary = symbol_blocks
            .keys()
            .cloned()
            .collect::<Vec<_>>()
            .join(",");

        NewsAssessment {
            outcome: GuardOutcome::new(
                GuardKind::News,
                Decision::Block,
                format!("news window active for {}", summary),
            )
            .with_actions(actions),
            symbol_blocks,
            freeze_all: false,
        }
    }

    fn unavailable(&self, why: &str) -> NewsAssessment {
        if self.config.fail_closed {
            warn!(error = %why, "📰 [NEWS] Calendar unavailable, blocking entries (fail-closed)");
            let reason = format!("news calendar unavailable: {}", why);
            let outcome = GuardOutcome::new(GuardKind::News, Decision::Block, reason.clone())
                .with_actions(vec![Action::BlockNewEntries {
                    origin: GuardKind::News,
                    scope: BlockScope::All,
                    reason,
                }])
                .blocking();
            return self.assessment(outcome);
        }

        warn!(error = %why, "📰 [NEWS] Calendar unavailable, allowing entries (fail-open)");
        self.assessment(GuardOutcome::new(
            GuardKind::News,
            Decision::Allow,
            format!("news calendar unavailable, fail-open: {}", why),
        ))
    }

    fn assessment(&self, outcome: GuardOutcome) -> NewsAssessment {
        NewsAssessment {
            outcome,
            symbol_blocks: BTreeMap::new(),
            freeze_all: false,
        }
    }
}

/// Future events within `hours`, soonest first
pub fn upcoming(events: &[NewsEvent], now: DateTime<Utc>, hours: i64) -> Vec<NewsEvent> {
    let horizon = now + Duration::hours(hours);
    let mut out: Vec<NewsEvent> = events
        .iter()
        .filter(|e| e.time >= now && e.time <= horizon)
        .cloned()
        .collect();
    out.sort_by_key(|e| e.time);
    out
}

/// Parse raw calendar entries.
///
/// Accepts `{event|title|name, datetime|date|time, currency|country, impact}`.
/// Holiday and no-impact rows are dropped silently; every other bad row is
/// returned as a `MalformedEvent` next to the events that did parse.
pub fn parse_events(raw: &[Value]) -> (Vec<NewsEvent>, Vec<GuardError>) {
    let mut events = Vec::new();
    let mut errors = Vec::new();

    for (idx, entry) in raw.iter().enumerate() {
        match parse_event(entry) {
            Ok(Some(event)) => events.push(event),
            Ok(None) => debug!(index = idx, "Skipping no-impact calendar entry"),
            Err(e) => {
                warn!(index = idx, error = %e, "Skipping malformed calendar entry");
                errors.push(e);
            }
        }
    }
    (events, errors)
}

fn parse_event(entry: &Value) -> Result<Option<NewsEvent>, GuardError> {
    let field = |names: &[&str]| {
        names
            .iter()
            .find_map(|n| entry.get(*n).and_then(Value::as_str))
            .map(str::trim)
    };

    let impact_raw = field(&["impact"]).unwrap_or("");
    let impact = match impact_raw.to_lowercase().as_str() {
        "" | "none" | "holiday" | "non-economic" => return Ok(None),
        other => Impact::from_str(other).ok_or_else(|| {
            GuardError::MalformedEvent(format!("unknown impact '{}'", impact_raw))
        })?,
    };

    let name = field(&["event", "title", "name"])
        .filter(|s| !s.is_empty())
        .ok_or_else(|| GuardError::MalformedEvent("missing event name".to_string()))?;
    let currency = field(&["currency", "country"])
        .filter(|s| !s.is_empty())
        .ok_or_else(|| GuardError::MalformedEvent(format!("'{}' has no currency", name)))?;
    let when = field(&["datetime", "date", "time"])
        .ok_or_else(|| GuardError::MalformedEvent(format!("'{}' has no datetime", name)))?;

    Ok(Some(NewsEvent {
        name: name.to_string(),
        time: parse_utc(when)
            .ok_or_else(|| GuardError::MalformedEvent(format!("'{}' bad datetime '{}'", name, when)))?,
        currency: currency.to_uppercase(),
        impact,
    }))
}

/// RFC 3339, or a naive timestamp taken as UTC
fn parse_utc(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GuardConfig;
    use serde_json::json;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 6, h, m, s).unwrap()
    }

    fn event(ccy: &str, h: u32, m: u32, impact: Impact) -> NewsEvent {
        NewsEvent {
            name: format!("{} event", ccy),
            time: at(h, m, 0),
            currency: ccy.to_string(),
            impact,
        }
    }

    fn symbols(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_window_boundaries_are_inclusive() {
        let cfg = GuardConfig::default();
        let guard = NewsGuard::new(&cfg.news);
        let events = vec![event("EUR", 14, 0, Impact::High)];

        assert!(guard.check(&events, Some("EURUSD"), at(13, 30, 0)).is_some());
        assert!(guard.check(&events, Some("EURUSD"), at(14, 30, 0)).is_some());
        assert!(guard.check(&events, Some("EURUSD"), at(13, 29, 59)).is_none());
        assert!(guard.check(&events, Some("EURUSD"), at(14, 30, 1)).is_none());
    }

    #[test]
    fn test_usdjpy_scenario() {
        let cfg = GuardConfig::default();
        let guard = NewsGuard::new(&cfg.news);
        let events = vec![event("USD", 18, 0, Impact::High)];

        assert!(guard.check(&events, Some("USDJPY"), at(17, 31, 0)).is_some());
        assert!(guard.check(&events, Some("USDJPY"), at(17, 29, 0)).is_none());
    }

    #[test]
    fn test_impact_filter_and_currency_match() {
        let cfg = GuardConfig::default();
        let guard = NewsGuard::new(&cfg.news);
        let events = vec![
            event("USD", 12, 0, Impact::Medium),
            event("GBP", 12, 0, Impact::High),
        ];
        assert!(guard.check(&events, Some("EURUSD"), at(12, 0, 0)).is_none());
        assert!(guard.check(&events, Some("GBPJPY.raw"), at(12, 0, 0)).is_some());
    }

    #[test]
    fn test_reports_earliest_overlapping_event() {
        let cfg = GuardConfig::default();
        let guard = NewsGuard::new(&cfg.news);
        let events = vec![
            event("USD", 12, 20, Impact::High),
            event("USD", 12, 0, Impact::High),
        ];
        let hit = guard.check(&events, Some("EURUSD"), at(12, 10, 0)).unwrap();
        assert_eq!(hit.event.time, at(12, 0, 0));
    }

    #[test]
    fn test_evaluate_blocks_per_symbol() {
        let cfg = GuardConfig::default();
        let guard = NewsGuard::new(&cfg.news);
        let calendar = Feed::Available(vec![event("USD", 18, 0, Impact::High)]);

        let out = guard.evaluate(&calendar, &symbols(&["USDJPY", "EURGBP"]), at(17, 45, 0));
        assert_eq!(out.outcome.decision, Decision::Block);
        assert!(!out.outcome.blocks_entries);
        assert!(out.symbol_blocks.contains_key("USDJPY"));
        assert!(!out.symbol_blocks.contains_key("EURGBP"));
        assert!(!out.freeze_all);
        assert_eq!(out.outcome.actions.len(), 1);
    }

    #[test]
    fn test_account_wide_check() {
        let cfg = GuardConfig::default();
        let guard = NewsGuard::new(&cfg.news);
        let calendar = Feed::Available(vec![event("NZD", 9, 0, Impact::High)]);

        let out = guard.evaluate(&calendar, &symbols(&[ALL_SYMBOLS]), at(9, 10, 0));
        assert!(out.outcome.blocks_entries);
        assert!(out.freeze_all);
    }

    #[test]
    fn test_unavailable_calendar_fails_open_by_default() {
        let mut cfg = GuardConfig::default();
        let calendar = Feed::Unavailable("timeout".to_string());

        let out = NewsGuard::new(&cfg.news).evaluate(&calendar, &symbols(&["EURUSD"]), at(9, 0, 0));
        assert_eq!(out.outcome.decision, Decision::Allow);

        cfg.news.fail_closed = true;
        let out = NewsGuard::new(&cfg.news).evaluate(&calendar, &symbols(&["EURUSD"]), at(9, 0, 0));
        assert!(out.outcome.blocks_entries);
    }

    #[test]
    fn test_disabled_guard_is_skipped() {
        let mut cfg = GuardConfig::default();
        cfg.news.enabled = false;
        let calendar = Feed::Available(vec![event("USD", 18, 0, Impact::High)]);
        let out = NewsGuard::new(&cfg.news).evaluate(&calendar, &symbols(&["USDJPY"]), at(18, 0, 0));
        assert_eq!(out.outcome.decision, Decision::Skipped);
        assert!(out.symbol_blocks.is_empty());
    }

    #[test]
    fn test_parse_events_skips_bad_rows() {
        let raw = vec![
            json!({"event": "CPI m/m", "datetime": "2024-03-06T13:30:00Z", "currency": "usd", "impact": "High"}),
            json!({"title": "ECB Press Conference", "date": "2024-03-06 13:45:00", "country": "EUR", "impact": "high"}),
            json!({"event": "Bank Holiday", "datetime": "2024-03-06T00:00:00Z", "currency": "GBP", "impact": "Holiday"}),
            json!({"event": "Broken", "datetime": "yesterday", "currency": "USD", "impact": "High"}),
            json!({"event": "Nope", "datetime": "2024-03-06T10:00:00Z", "currency": "USD", "impact": "Extreme"}),
        ];
        let (events, errors) = parse_events(&raw);
        assert_eq!(events.len(), 2);
        assert_eq!(errors.len(), 2);
        assert_eq!(events[0].currency, "USD");
        assert_eq!(events[1].time, Utc.with_ymd_and_hms(2024, 3, 6, 13, 45, 0).unwrap());
        assert!(matches!(errors[0], GuardError::MalformedEvent(_)));
    }

    #[test]
    fn test_parse_events_accepts_serialized_event_shape() {
        let raw = vec![json!({"name": "NFP", "time": "2024-03-08T13:30:00Z", "currency": "USD", "impact": "High"})];
        let (events, errors) = parse_events(&raw);
        assert!(errors.is_empty());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].time, Utc.with_ymd_and_hms(2024, 3, 8, 13, 30, 0).unwrap());

        // what the engine writes, it reads back
        let written = serde_json::to_value(&events[0]).unwrap();
        let (again, _) = parse_events(&[written]);
        assert_eq!(again, events);
    }

    #[test]
    fn test_upcoming_sorted_and_bounded() {
        let events = vec![
            event("USD", 20, 0, Impact::High),
            event("EUR", 8, 0, Impact::High),
            event("GBP", 11, 0, Impact::High),
        ];
        let list = upcoming(&events, at(10, 0, 0), 12);
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].currency, "GBP");
    }
}
