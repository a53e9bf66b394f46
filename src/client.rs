use crate::paging::PageSource;
use crate::types::{ContentType, FeedItem, FetchOrder, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// What a source client can do. Declared once by the plugin; the planner
/// reads it, never mutates it.
#[derive(Debug, Clone, Default)]
pub struct ClientCapabilities {
    /// Content types the client can fetch for a channel.
    pub content_types: Vec<ContentType>,
    /// Content types the client can cheaply peek at.
    pub peek_types: Vec<ContentType>,
    pub supports_search: bool,
}

impl ClientCapabilities {
    pub fn supports(&self, content_type: ContentType) -> bool {
        self.content_types.contains(&content_type)
    }

    pub fn can_peek(&self, content_type: ContentType) -> bool {
        self.peek_types.contains(&content_type)
    }

    /// True when the client exposes a single combined "subscriptions" feed
    /// instead of per-type channel feeds.
    pub fn is_mixed_only(&self) -> bool {
        self.content_types == [ContentType::Mixed]
    }
}

/// Handle to a remote content source plugin. The scheduler only invokes it;
/// authentication, parsing and transport live behind this trait.
#[async_trait]
pub trait SourceClient: Send + Sync {
    /// Stable identifier, unique within a registry.
    fn id(&self) -> &str;

    /// Whether this client owns the given channel URL.
    fn handles(&self, url: &str) -> bool;

    fn capabilities(&self) -> &ClientCapabilities;

    /// Advisory per-run live-fetch budget. `None` or a non-positive value
    /// means unlimited.
    fn subscription_rate_limit(&self) -> Option<i64>;

    /// Fetch the paged contents of a channel.
    async fn get_channel_contents(
        &self,
        url: &str,
        content_type: ContentType,
        order: FetchOrder,
    ) -> Result<Box<dyn PageSource>>;

    /// Lightweight freshness probe: the most recent items only. Callers must
    /// check `capabilities().can_peek` first.
    async fn peek_channel_contents(
        &self,
        url: &str,
        content_type: ContentType,
    ) -> Result<Vec<FeedItem>>;
}

/// The set of currently enabled source clients, constructor-injected into
/// the planner and executor.
#[derive(Default)]
pub struct ClientRegistry {
    clients: Vec<Arc<dyn SourceClient>>,
}

impl ClientRegistry {
    pub fn new(clients: Vec<Arc<dyn SourceClient>>) -> Self {
        Self { clients }
    }

    /// Resolve the owning client for a channel URL. `None` is expected when
    /// the owning plugin is disabled; callers skip the URL silently.
    pub fn resolve(&self, url: &str) -> Option<Arc<dyn SourceClient>> {
        let found = self.clients.iter().find(|c| c.handles(url)).cloned();
        if found.is_none() {
            debug!("no enabled source client handles {url}, skipping");
        }
        found
    }

    /// Ids of every enabled client, used as the dedup allow-list so items
    /// cached from since-disabled sources are hidden.
    pub fn enabled_ids(&self) -> Vec<String> {
        self.clients.iter().map(|c| c.id().to_string()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn SourceClient>> + '_ {
        self.clients.iter()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
