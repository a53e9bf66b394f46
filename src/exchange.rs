use crate::planner::{FetchTask, TaskTier};
use crate::types::{ContentType, FeedItem, Result};
use async_trait::async_trait;
use std::collections::HashMap;

/// Minimum number of eligible live tasks before an exchange round-trip is
/// worth negotiating at all.
pub const EXCHANGE_MIN_TASKS: usize = 5;

/// Peer-assisted prefetch collaborator. A peer may hand this instance
/// already-fetched results for a subset of URLs; in return this instance
/// contributes its own first pages after the run.
///
/// Strictly a best-effort optimization: peer-provided items are not trusted
/// beyond basic shape, never update channel freshness, and any failure
/// degrades to normal per-task execution with no correctness impact.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Ask the peer for prefetched items. URLs missing from the returned map
    /// are fetched normally.
    async fn acquire(&self, urls: &[String]) -> Result<HashMap<String, Vec<FeedItem>>>;

    /// Hand this run's fetched first pages back to the peer.
    async fn contribute(&self, results: HashMap<String, Vec<FeedItem>>) -> Result<()>;
}

/// Whether a task qualifies for the exchange shortcut: a live, non-peek
/// fetch of video or mixed content.
pub fn exchange_eligible(task: &FetchTask) -> bool {
    task.tier == TaskTier::Live
        && matches!(task.content_type, ContentType::Video | ContentType::Mixed)
}
