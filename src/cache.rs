use crate::jobs::JobQueue;
use crate::paging::PageSource;
use crate::types::{canonicalize_url, FeedItem, Result};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Default)]
struct CacheInner {
    /// Canonical item URL -> item. Last writer wins.
    items: HashMap<String, FeedItem>,
    /// Channel URL -> canonical item URLs belonging to it.
    by_channel: HashMap<String, BTreeSet<String>>,
}

/// Durable, queryable store of previously seen feed items. Keyed by canonical
/// item URL and indexed by owning channel URL. Safe for concurrent reads and
/// writes from many tasks; updates are last-writer-wins per identity.
#[derive(Clone, Default)]
pub struct ContentCache {
    inner: Arc<RwLock<CacheInner>>,
}

impl ContentCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite an item, idempotent by canonical URL.
    /// Returns true when the item was not present before.
    pub async fn insert(&self, item: FeedItem) -> bool {
        let key = item.canonical_url();
        let mut inner = self.inner.write().await;
        inner
            .by_channel
            .entry(item.channel_url.clone())
            .or_default()
            .insert(key.clone());
        inner.items.insert(key, item).is_none()
    }

    /// Alias for [`insert`](Self::insert); both are last-writer-wins.
    pub async fn update(&self, item: FeedItem) -> bool {
        self.insert(item).await
    }

    pub async fn get(&self, url: &str) -> Option<FeedItem> {
        let key = canonicalize_url(url);
        self.inner.read().await.items.get(&key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.items.is_empty()
    }

    /// Drop every cached item. The only deletion path.
    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        inner.items.clear();
        inner.by_channel.clear();
        info!("content cache cleared");
    }

    /// All cached items for a set of channels, newest first.
    pub async fn items_for_channels(&self, channel_urls: &[String]) -> Vec<FeedItem> {
        let inner = self.inner.read().await;
        let mut items: Vec<FeedItem> = channel_urls
            .iter()
            .filter_map(|url| inner.by_channel.get(url))
            .flatten()
            .filter_map(|key| inner.items.get(key).cloned())
            .collect();
        items.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        items
    }

    /// Build a pager over the cached items of one or more channels. Pages
    /// come purely from the store, timestamp-descending, no network access.
    pub fn query_by_channel(&self, channel_urls: Vec<String>, page_size: usize) -> CachePageSource {
        CachePageSource {
            cache: self.clone(),
            channel_urls,
            page_size: page_size.max(1),
            snapshot: None,
            offset: 0,
        }
    }

    /// Persist the cache contents as pretty JSON.
    pub async fn save_snapshot(&self, path: &Path) -> Result<()> {
        let inner = self.inner.read().await;
        let mut items: Vec<&FeedItem> = inner.items.values().collect();
        items.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        let json = serde_json::to_string_pretty(&items)?;
        std::fs::write(path, json)?;
        debug!("saved {} cached items to {}", items.len(), path.display());
        Ok(())
    }

    /// Load a snapshot produced by [`save_snapshot`](Self::save_snapshot),
    /// merging into the current contents.
    pub async fn load_snapshot(&self, path: &Path) -> Result<usize> {
        let json = std::fs::read_to_string(path)?;
        let items: Vec<FeedItem> = serde_json::from_str(&json)?;
        let count = items.len();
        for item in items {
            self.insert(item).await;
        }
        debug!("loaded {count} cached items from {}", path.display());
        Ok(count)
    }
}

/// Pager over the Content Cache for a fixed set of channel URLs. The store is
/// read once, on the first page request.
pub struct CachePageSource {
    cache: ContentCache,
    channel_urls: Vec<String>,
    page_size: usize,
    snapshot: Option<Vec<FeedItem>>,
    offset: usize,
}

#[async_trait]
impl PageSource for CachePageSource {
    async fn next_page(&mut self) -> Result<Vec<FeedItem>> {
        if self.snapshot.is_none() {
            self.snapshot = Some(self.cache.items_for_channels(&self.channel_urls).await);
        }
        let items = self.snapshot.as_ref().unwrap();
        let end = (self.offset + self.page_size).min(items.len());
        let page = items[self.offset..end].to_vec();
        self.offset = end;
        Ok(page)
    }

    fn has_more(&self) -> bool {
        match &self.snapshot {
            None => true,
            Some(items) => self.offset < items.len(),
        }
    }
}

/// Wraps a live pager so every page it emits is also queued for insertion
/// into the Content Cache. Writes go through the job queue so consumers are
/// never blocked on cache writes and tests can drain them deterministically.
pub struct RecordingPageSource {
    inner: Box<dyn PageSource>,
    cache: ContentCache,
    jobs: JobQueue,
}

impl RecordingPageSource {
    pub fn new(inner: Box<dyn PageSource>, cache: ContentCache, jobs: JobQueue) -> Self {
        Self { inner, cache, jobs }
    }
}

#[async_trait]
impl PageSource for RecordingPageSource {
    async fn next_page(&mut self) -> Result<Vec<FeedItem>> {
        let page = self.inner.next_page().await?;
        for item in &page {
            let cache = self.cache.clone();
            let item = item.clone();
            self.jobs
                .enqueue(async move {
                    cache.insert(item).await;
                })
                .await;
        }
        Ok(page)
    }

    fn has_more(&self) -> bool {
        self.inner.has_more()
    }
}
