use crate::paging::{CancelToken, PageSource};
use crate::types::{AggregatorError, FeedItem, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use tracing::warn;

struct MergeEntry {
    source: Box<dyn PageSource>,
    exhausted: bool,
}

/// K-way chronological merge over N ordered page sources. Each `next_page`
/// pulls the next available page from every non-exhausted source, interleaves
/// the results with the carry-over buffer, sorts by descending timestamp,
/// emits the top `page_size` items and buffers the remainder.
///
/// In failure-tolerant mode a source that errors on `next_page` is treated as
/// exhausted from then on; otherwise the error propagates.
pub struct ChronoMergeSource {
    entries: Vec<MergeEntry>,
    buffer: Vec<FeedItem>,
    page_size: usize,
    tolerate_failures: bool,
    cancel: CancelToken,
}

impl ChronoMergeSource {
    pub fn new(sources: Vec<Box<dyn PageSource>>, page_size: usize) -> Self {
        Self {
            entries: sources
                .into_iter()
                .map(|source| MergeEntry {
                    source,
                    exhausted: false,
                })
                .collect(),
            buffer: Vec::new(),
            page_size: page_size.max(1),
            tolerate_failures: false,
            cancel: CancelToken::new(),
        }
    }

    pub fn tolerate_failures(mut self, tolerate: bool) -> Self {
        self.tolerate_failures = tolerate;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }
}

#[async_trait]
impl PageSource for ChronoMergeSource {
    async fn next_page(&mut self) -> Result<Vec<FeedItem>> {
        if self.cancel.is_cancelled() {
            if !self.tolerate_failures {
                return Err(AggregatorError::Cancelled);
            }
            // Tolerant mode: stop pulling new pages but keep serving what
            // was already fetched.
            for entry in &mut self.entries {
                entry.exhausted = true;
            }
        }
        for entry in &mut self.entries {
            if entry.exhausted || !entry.source.has_more() {
                continue;
            }
            match entry.source.next_page().await {
                Ok(page) => self.buffer.extend(page),
                Err(err) if self.tolerate_failures => {
                    warn!("merge source failed, excluding from further pages: {err}");
                    entry.exhausted = true;
                }
                Err(err) => return Err(err),
            }
        }
        self.buffer.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        let take = self.page_size.min(self.buffer.len());
        let page: Vec<FeedItem> = self.buffer.drain(..take).collect();
        Ok(page)
    }

    fn has_more(&self) -> bool {
        !self.buffer.is_empty()
            || self
                .entries
                .iter()
                .any(|e| !e.exhausted && e.source.has_more())
    }
}

/// Deduplicating wrapper pager. Filters out items whose canonical URL was
/// already emitted by this instance (first occurrence wins) and items whose
/// producing client id is not in the allow-list of currently enabled clients.
pub struct DedupSource {
    inner: Box<dyn PageSource>,
    seen: HashSet<String>,
    allowed_clients: Option<HashSet<String>>,
}

impl DedupSource {
    pub fn new(inner: Box<dyn PageSource>) -> Self {
        Self {
            inner,
            seen: HashSet::new(),
            allowed_clients: None,
        }
    }

    /// Restrict output to items produced by the given client ids. Items
    /// cached from a since-disabled source are dropped by this filter.
    pub fn allow_clients<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_clients = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    fn admit(&mut self, item: &FeedItem) -> bool {
        if let Some(allowed) = &self.allowed_clients {
            if !allowed.contains(&item.client_id) {
                return false;
            }
        }
        self.seen.insert(item.canonical_url())
    }
}

#[async_trait]
impl PageSource for DedupSource {
    async fn next_page(&mut self) -> Result<Vec<FeedItem>> {
        let page = self.inner.next_page().await?;
        Ok(page.into_iter().filter(|item| self.admit(item)).collect())
    }

    fn has_more(&self) -> bool {
        self.inner.has_more()
    }
}
