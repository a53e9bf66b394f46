use crate::types::{AggregatorError, FeedItem, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Default number of items per page when a caller does not specify one.
pub const DEFAULT_PAGE_SIZE: usize = 20;

/// An ordered page source: produces successive time-ordered pages of feed
/// items and knows whether more pages exist. Every pager in the scheduler
/// (live fetch results, cache queries, merge and dedup wrappers) implements
/// this trait.
#[async_trait]
pub trait PageSource: Send {
    /// Fetch the next page. May return fewer items than previous pages;
    /// an empty page is legal while `has_more` is still true (wrappers may
    /// filter a page down to nothing).
    async fn next_page(&mut self) -> Result<Vec<FeedItem>>;

    /// True while another call to `next_page` can still yield items.
    fn has_more(&self) -> bool;
}

/// Cooperative cancellation signal, honored per task and per page fetch.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Error out when the token has been triggered.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(AggregatorError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// A page source over an in-memory item list, paged at a fixed size.
/// Used for peer-provided exchange results and in tests.
pub struct VecPageSource {
    items: Vec<FeedItem>,
    offset: usize,
    page_size: usize,
}

impl VecPageSource {
    pub fn new(items: Vec<FeedItem>, page_size: usize) -> Self {
        Self {
            items,
            offset: 0,
            page_size: page_size.max(1),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), DEFAULT_PAGE_SIZE)
    }
}

#[async_trait]
impl PageSource for VecPageSource {
    async fn next_page(&mut self) -> Result<Vec<FeedItem>> {
        let end = (self.offset + self.page_size).min(self.items.len());
        let page = self.items[self.offset..end].to_vec();
        self.offset = end;
        Ok(page)
    }

    fn has_more(&self) -> bool {
        self.offset < self.items.len()
    }
}

/// Replays an already-consumed first page before delegating to the rest of
/// an underlying pager. The executor pulls a live pager's first page eagerly
/// to update channel freshness, then hands callers this wrapper so they
/// still see the full stream.
pub struct PrefetchedPageSource {
    prefetched: Option<Vec<FeedItem>>,
    inner: Box<dyn PageSource>,
}

impl PrefetchedPageSource {
    pub fn new(first_page: Vec<FeedItem>, inner: Box<dyn PageSource>) -> Self {
        Self {
            prefetched: Some(first_page),
            inner,
        }
    }
}

#[async_trait]
impl PageSource for PrefetchedPageSource {
    async fn next_page(&mut self) -> Result<Vec<FeedItem>> {
        if let Some(page) = self.prefetched.take() {
            return Ok(page);
        }
        self.inner.next_page().await
    }

    fn has_more(&self) -> bool {
        self.prefetched.is_some() || self.inner.has_more()
    }
}
