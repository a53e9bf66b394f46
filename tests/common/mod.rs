#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use subfeed::{
    AggregatorError, ClientCapabilities, ContentType, FeedItem, FetchOrder, PageSource, Result,
    SourceChannel, SourceClient, VecPageSource,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// A feed item with the given timestamp, attributed to `client_id`.
pub fn item(
    url: &str,
    channel_url: &str,
    client_id: &str,
    timestamp: DateTime<Utc>,
) -> FeedItem {
    FeedItem {
        url: url.to_string(),
        channel_url: channel_url.to_string(),
        client_id: client_id.to_string(),
        content_type: ContentType::Video,
        timestamp,
        title: Some(format!("item {url}")),
        author: None,
    }
}

pub fn hours_ago(hours: i64) -> DateTime<Utc> {
    Utc::now() - Duration::hours(hours)
}

pub fn days_ago(days: i64) -> DateTime<Utc> {
    Utc::now() - Duration::days(days)
}

/// A channel wanting only video content, updated `last_update` ago.
pub fn video_channel(url: &str, last_update: Option<DateTime<Utc>>) -> SourceChannel {
    let mut channel = SourceChannel::new(url);
    channel.wanted_types = vec![ContentType::Video];
    if let Some(ts) = last_update {
        channel.last_update.insert(ContentType::Video, ts);
        channel.last_item.insert(ContentType::Video, ts);
    }
    channel
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// Ordinary channel-level fetch failure.
    Fetch,
    /// Source-fatal failure that should disable the client for the run.
    Reauthorization,
}

/// Configurable in-memory source client. Counts network-path invocations so
/// tests can assert which tasks actually reached the fetch path.
pub struct MockClient {
    id: String,
    url_prefix: String,
    capabilities: ClientCapabilities,
    rate_limit: Option<i64>,
    items: HashMap<String, Vec<FeedItem>>,
    failures: HashMap<String, FailureMode>,
    page_size: usize,
    pub fetch_calls: AtomicUsize,
    pub peek_calls: AtomicUsize,
}

impl MockClient {
    pub fn new(id: &str, url_prefix: &str) -> Self {
        Self {
            id: id.to_string(),
            url_prefix: url_prefix.to_string(),
            capabilities: ClientCapabilities {
                content_types: vec![ContentType::Video],
                peek_types: Vec::new(),
                supports_search: false,
            },
            rate_limit: None,
            items: HashMap::new(),
            failures: HashMap::new(),
            page_size: 3,
            fetch_calls: AtomicUsize::new(0),
            peek_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_content_types(mut self, types: Vec<ContentType>) -> Self {
        self.capabilities.content_types = types;
        self
    }

    pub fn with_peek_types(mut self, types: Vec<ContentType>) -> Self {
        self.capabilities.peek_types = types;
        self
    }

    pub fn with_rate_limit(mut self, limit: i64) -> Self {
        self.rate_limit = Some(limit);
        self
    }

    pub fn with_items(mut self, url: &str, items: Vec<FeedItem>) -> Self {
        self.items.insert(url.to_string(), items);
        self
    }

    pub fn failing(mut self, url: &str, mode: FailureMode) -> Self {
        self.failures.insert(url.to_string(), mode);
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    fn failure_for(&self, url: &str) -> Option<Result<()>> {
        self.failures.get(url).map(|mode| match mode {
            FailureMode::Fetch => Err(AggregatorError::Fetch {
                url: url.to_string(),
                message: "simulated fetch failure".to_string(),
            }),
            FailureMode::Reauthorization => Err(AggregatorError::ReauthorizationRequired {
                client_id: self.id.clone(),
            }),
        })
    }
}

#[async_trait]
impl SourceClient for MockClient {
    fn id(&self) -> &str {
        &self.id
    }

    fn handles(&self, url: &str) -> bool {
        url.starts_with(&self.url_prefix)
    }

    fn capabilities(&self) -> &ClientCapabilities {
        &self.capabilities
    }

    fn subscription_rate_limit(&self) -> Option<i64> {
        self.rate_limit
    }

    async fn get_channel_contents(
        &self,
        url: &str,
        _content_type: ContentType,
        _order: FetchOrder,
    ) -> Result<Box<dyn PageSource>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(Err(err)) = self.failure_for(url) {
            return Err(err);
        }
        let mut items = self.items.get(url).cloned().unwrap_or_default();
        items.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(Box::new(VecPageSource::new(items, self.page_size)))
    }

    async fn peek_channel_contents(
        &self,
        url: &str,
        _content_type: ContentType,
    ) -> Result<Vec<FeedItem>> {
        self.peek_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(Err(err)) = self.failure_for(url) {
            return Err(err);
        }
        Ok(self.items.get(url).cloned().unwrap_or_default())
    }
}

/// A pager that fails on every `next_page` call.
pub struct FailingPageSource;

#[async_trait]
impl PageSource for FailingPageSource {
    async fn next_page(&mut self) -> Result<Vec<FeedItem>> {
        Err(AggregatorError::Fetch {
            url: "broken://source".to_string(),
            message: "simulated pager failure".to_string(),
        })
    }

    fn has_more(&self) -> bool {
        true
    }
}

/// Drain a pager to completion, collecting every emitted item in order.
pub async fn collect_all(pager: &mut Box<dyn PageSource>) -> Result<Vec<FeedItem>> {
    let mut all = Vec::new();
    while pager.has_more() {
        all.extend(pager.next_page().await?);
    }
    Ok(all)
}
