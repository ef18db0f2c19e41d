//! News calendar sources: local JSON file, HTTP feed, and a TTL cache

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::NewsProvider;
use crate::error::{GuardError, Result};
use crate::guards::news::parse_events;
use crate::types::NewsEvent;

/// Calendar documents are either a bare array or `{"events": [...]}`
fn event_rows(doc: Value, source: &'static str) -> Result<Vec<Value>> {
    match doc {
        Value::Array(rows) => Ok(rows),
        Value::Object(mut map) => match map.remove("events") {
            Some(Value::Array(rows)) => Ok(rows),
            _ => Err(GuardError::unavailable(source, "no 'events' array in calendar")),
        },
        _ => Err(GuardError::unavailable(source, "calendar is not a JSON array")),
    }
}

fn into_events(doc: Value, source: &'static str) -> Result<Vec<NewsEvent>> {
    let rows = event_rows(doc, source)?;
    let (events, errors) = parse_events(&rows);
    if !errors.is_empty() {
        warn!(
            source = source,
            skipped = errors.len(),
            parsed = events.len(),
            "Calendar contained malformed entries"
        );
    }
    Ok(events)
}

/// `high_impact_news.json` style file
pub struct FileNewsCalendar {
    path: PathBuf,
}

impl FileNewsCalendar {
    const SOURCE: &'static str = "news calendar file";

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl NewsProvider for FileNewsCalendar {
    async fn events(&self) -> Result<Vec<NewsEvent>> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            GuardError::unavailable(Self::SOURCE, format!("{}: {}", self.path.display(), e))
        })?;
        let doc: Value = serde_json::from_str(&raw)
            .map_err(|e| GuardError::unavailable(Self::SOURCE, e.to_string()))?;
        into_events(doc, Self::SOURCE)
    }
}

/// Remote JSON calendar
pub struct HttpNewsCalendar {
    url: String,
    client: reqwest::Client,
}

impl HttpNewsCalendar {
    const SOURCE: &'static str = "news calendar feed";

    pub fn new(url: impl Into<String>, timeout: std::time::Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl NewsProvider for HttpNewsCalendar {
    async fn events(&self) -> Result<Vec<NewsEvent>> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| GuardError::unavailable(Self::SOURCE, e.to_string()))?;

        if !response.status().is_success() {
            return Err(GuardError::unavailable(
                Self::SOURCE,
                format!("HTTP {}", response.status()),
            ));
        }

        let doc: Value = response
            .json()
            .await
            .map_err(|e| GuardError::unavailable(Self::SOURCE, e.to_string()))?;
        into_events(doc, Self::SOURCE)
    }
}

struct CacheEntry {
    fetched_at: DateTime<Utc>,
    events: Vec<NewsEvent>,
}

/// Reuses the last successful fetch for `ttl`.
///
/// A failed refresh is reported as unavailable; stale events are never served.
pub struct CachedNewsCalendar {
    inner: Arc<dyn NewsProvider>,
    ttl: Duration,
    cache: RwLock<Option<CacheEntry>>,
}

impl CachedNewsCalendar {
    pub fn new(inner: Arc<dyn NewsProvider>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cache: RwLock::new(None),
        }
    }

    async fn events_at(&self, now: DateTime<Utc>) -> Result<Vec<NewsEvent>> {
        if let Some(entry) = self.cache.read().await.as_ref() {
            if now - entry.fetched_at < self.ttl {
                debug!(events = entry.events.len(), "News calendar served from cache");
                return Ok(entry.events.clone());
            }
        }

        let events = self.inner.events().await?;
        info!(events = events.len(), "📰 News calendar refreshed");
        *self.cache.write().await = Some(CacheEntry {
            fetched_at: now,
            events: events.clone(),
        });
        Ok(events)
    }
}

#[async_trait]
impl NewsProvider for CachedNewsCalendar {
    async fn events(&self) -> Result<Vec<NewsEvent>> {
        self.events_at(Utc::now()).await
    }
}
