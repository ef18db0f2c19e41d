//! TradeGuard
//!
//! Runs the guard scheduler against the configured account snapshot and news
//! calendar until Ctrl-C.

use anyhow::{Context, Result};
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tradeguard::audit::CsvAuditLog;
use tradeguard::config::AppConfig;
use tradeguard::guards::news::upcoming;
use tradeguard::orchestrator::GuardOrchestrator;
use tradeguard::providers::{
    ActionDispatcher, CachedNewsCalendar, FileAccountProvider, FileNewsCalendar,
    HttpNewsCalendar, JsonlOutboxDispatcher, LoggingDispatcher, NewsProvider,
};
use tradeguard::scheduler::{Scheduler, SchedulerSettings};
use tradeguard::state::JsonFileStateStore;

fn init_logging(config: &AppConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into());
    let json = config.logging.json;

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| tracing_subscriber::fmt::layer()))
        .init();
}

fn news_provider(config: &AppConfig) -> Result<Arc<dyn NewsProvider>> {
    let timeout = Duration::from_secs(config.scheduler.provider_timeout_secs);
    let source: Arc<dyn NewsProvider> = match (&config.providers.news_url, &config.providers.news_file) {
        (Some(url), _) => Arc::new(HttpNewsCalendar::new(url.clone(), timeout)?),
        (None, Some(path)) => Arc::new(FileNewsCalendar::new(path)),
        (None, None) => anyhow::bail!("either providers.news_url or providers.news_file must be set"),
    };
    let ttl = chrono::Duration::seconds(config.providers.news_cache_secs as i64);
    Ok(Arc::new(CachedNewsCalendar::new(source, ttl)))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load().context("Failed to load configuration")?;
    init_logging(&config);

    info!("🛡️ TradeGuard starting");
    info!(config = %config, "Configuration loaded");

    let guard_config = config.guard_config()?;
    let data_dir = Path::new(&config.engine.data_dir);

    let store = Arc::new(JsonFileStateStore::new(data_dir).context("Failed to open state directory")?);
    let audit = Arc::new(CsvAuditLog::new(data_dir)?);
    let account = Arc::new(FileAccountProvider::new(&config.providers.snapshot_file));
    let news = news_provider(&config)?;
    let dispatcher: Arc<dyn ActionDispatcher> = if config.engine.dry_run {
        warn!("🧪 Dry run: actions are logged, not sent");
        Arc::new(LoggingDispatcher)
    } else {
        Arc::new(JsonlOutboxDispatcher::new(data_dir.join("actions.jsonl")))
    };

    match news.events().await {
        Ok(events) => {
            let next = upcoming(&events, Utc::now(), 24);
            info!(count = next.len(), "📰 Upcoming news events (24h)");
            for event in next.iter().take(10) {
                info!(
                    time = %event.time.format("%Y-%m-%d %H:%M"),
                    currency = %event.currency,
                    impact = %event.impact,
                    event = %event.name,
                    "  scheduled"
                );
            }
        }
        Err(e) => warn!(error = %e, "News calendar unavailable at startup"),
    }

    let scheduler = Scheduler::new(
        GuardOrchestrator::new(guard_config),
        account,
        news,
        dispatcher,
        store,
        audit,
        SchedulerSettings::from_config(&config),
    )?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("🛑 Shutdown requested, finishing current cycle");
            let _ = shutdown_tx.send(true);
        }
    });

    scheduler.run(shutdown_rx).await?;
    info!("👋 TradeGuard stopped");
    Ok(())
}
