//! Collaborator interfaces (broker account, news calendar, action sink)

mod account;
mod calendar;
mod dispatch;

pub use account::FileAccountProvider;
pub use calendar::{CachedNewsCalendar, FileNewsCalendar, HttpNewsCalendar};
pub use dispatch::{JsonlOutboxDispatcher, LoggingDispatcher};

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{AccountSnapshot, Action, NewsEvent};

/// Source of the per-cycle account snapshot
#[async_trait]
pub trait AccountProvider: Send + Sync {
    async fn snapshot(&self) -> Result<AccountSnapshot>;
}

/// Source of scheduled news events
#[async_trait]
pub trait NewsProvider: Send + Sync {
    async fn events(&self) -> Result<Vec<NewsEvent>>;
}

/// Executes guard actions against the broker
#[async_trait]
pub trait ActionDispatcher: Send + Sync {
    async fn dispatch(&self, action: &Action) -> Result<()>;
}
