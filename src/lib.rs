pub mod aggregator;
pub mod cache;
pub mod client;
pub mod exchange;
pub mod executor;
pub mod jobs;
pub mod merge;
pub mod paging;
pub mod planner;
pub mod subscriptions;
pub mod types;

pub use aggregator::FeedAggregator;
pub use cache::{CachePageSource, ContentCache, RecordingPageSource};
pub use client::{ClientCapabilities, ClientRegistry, SourceClient};
pub use exchange::Exchange;
pub use executor::{ExecuteOptions, ProgressFn, TaskExecutor};
pub use jobs::JobQueue;
pub use merge::{ChronoMergeSource, DedupSource};
pub use paging::{CancelToken, PageSource, PrefetchedPageSource, VecPageSource, DEFAULT_PAGE_SIZE};
pub use planner::{urgency_score, FetchTask, PlannerConfig, TaskPlanner, TaskTier};
pub use subscriptions::{ChannelPatch, MemorySubscriptionStore, SubscriptionStore};
pub use types::*;
