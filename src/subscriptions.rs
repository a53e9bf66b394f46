use crate::types::{ContentType, Result, SourceChannel};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// A field-level update to one channel's freshness data. Concurrent tasks for
/// different content types of the same channel each apply their own patch
/// under the store lock, so they cannot clobber each other's fields the way
/// whole-record saves would.
#[derive(Debug, Clone, Default)]
pub struct ChannelPatch {
    /// Content type the freshness fields below apply to.
    pub content_type: Option<ContentType>,
    pub last_item: Option<DateTime<Utc>>,
    pub last_update: Option<DateTime<Utc>>,
    pub interval_days: Option<f64>,
    pub last_peeked: Option<DateTime<Utc>>,
}

impl ChannelPatch {
    /// Patch recorded after a successful live fetch for one content type.
    pub fn fetched(
        content_type: ContentType,
        newest_item: Option<DateTime<Utc>>,
        interval_days: Option<f64>,
    ) -> Self {
        Self {
            content_type: Some(content_type),
            last_item: newest_item,
            last_update: Some(Utc::now()),
            interval_days,
            last_peeked: None,
        }
    }

    /// Patch recorded after a successful peek probe.
    pub fn peeked() -> Self {
        Self {
            last_peeked: Some(Utc::now()),
            ..Self::default()
        }
    }

    pub fn apply(&self, channel: &mut SourceChannel) {
        if let Some(content_type) = self.content_type {
            if let Some(ts) = self.last_item {
                channel.last_item.insert(content_type, ts);
            }
            if let Some(ts) = self.last_update {
                channel.last_update.insert(content_type, ts);
            }
            if let Some(days) = self.interval_days {
                channel.interval_days.insert(content_type, days);
            }
        }
        if let Some(ts) = self.last_peeked {
            channel.last_peeked = Some(ts);
        }
    }
}

/// Persistence collaborator for subscribed channels. The scheduler only ever
/// reads channels and applies patches; enumeration exists for callers that
/// aggregate "everything I am subscribed to".
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn get(&self, url: &str) -> Option<SourceChannel>;

    async fn save(&self, channel: SourceChannel) -> Result<()>;

    /// All subscribed channels, in no particular order.
    async fn all(&self) -> Vec<SourceChannel>;

    /// Apply a field-level patch to one channel. Unknown URLs create the
    /// channel first, so opportunistic updates never get lost.
    async fn apply_patch(&self, url: &str, patch: ChannelPatch) -> Result<()>;
}

/// In-memory subscription store. The durable on-disk layer lives outside
/// this crate; tests and embedders without persistence use this one.
#[derive(Default)]
pub struct MemorySubscriptionStore {
    channels: RwLock<HashMap<String, SourceChannel>>,
}

impl MemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl SubscriptionStore for MemorySubscriptionStore {
    async fn get(&self, url: &str) -> Option<SourceChannel> {
        self.channels.read().await.get(url).cloned()
    }

    async fn save(&self, channel: SourceChannel) -> Result<()> {
        self.channels
            .write()
            .await
            .insert(channel.url.clone(), channel);
        Ok(())
    }

    async fn all(&self) -> Vec<SourceChannel> {
        self.channels.read().await.values().cloned().collect()
    }

    async fn apply_patch(&self, url: &str, patch: ChannelPatch) -> Result<()> {
        let mut channels = self.channels.write().await;
        let channel = channels
            .entry(url.to_string())
            .or_insert_with(|| SourceChannel::new(url));
        patch.apply(channel);
        debug!("applied patch to channel {url}");
        Ok(())
    }
}
