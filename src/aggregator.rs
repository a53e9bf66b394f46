use crate::cache::ContentCache;
use crate::client::ClientRegistry;
use crate::exchange::Exchange;
use crate::executor::{ExecuteOptions, TaskExecutor};
use crate::jobs::JobQueue;
use crate::paging::PageSource;
use crate::planner::{PlannerConfig, TaskPlanner};
use crate::subscriptions::SubscriptionStore;
use crate::types::{AggregatorError, Result, SourceChannel};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Facade wiring the planner and executor to their collaborators. Everything
/// is constructor-injected; the aggregator holds no global state and a new
/// one can be built per call site.
pub struct FeedAggregator {
    registry: Arc<ClientRegistry>,
    store: Arc<dyn SubscriptionStore>,
    cache: ContentCache,
    planner: TaskPlanner,
    executor: TaskExecutor,
    jobs: JobQueue,
}

impl FeedAggregator {
    /// Builds an aggregator with its own background [`JobQueue`]. Spawns the
    /// queue's worker task, so this must be called from within a Tokio
    /// runtime; use [`with_job_queue`](Self::with_job_queue) to inject a
    /// queue created elsewhere.
    pub fn new(
        registry: Arc<ClientRegistry>,
        store: Arc<dyn SubscriptionStore>,
        cache: ContentCache,
        planner_config: PlannerConfig,
    ) -> Self {
        Self::with_job_queue(registry, store, cache, planner_config, JobQueue::default())
    }

    pub fn with_job_queue(
        registry: Arc<ClientRegistry>,
        store: Arc<dyn SubscriptionStore>,
        cache: ContentCache,
        planner_config: PlannerConfig,
        jobs: JobQueue,
    ) -> Self {
        let planner = TaskPlanner::new(registry.clone(), planner_config);
        let executor = TaskExecutor::new(
            registry.clone(),
            store.clone(),
            cache.clone(),
            jobs.clone(),
        );
        Self {
            registry,
            store,
            cache,
            planner,
            executor,
            jobs,
        }
    }

    /// Enable the best-effort peer exchange optimization.
    pub fn with_exchange(mut self, exchange: Arc<dyn Exchange>) -> Self {
        self.executor = self.executor.with_exchange(exchange);
        self
    }

    /// Plan fetch tasks for the given channels and execute them. Returns the
    /// merged, deduplicated, incrementally paginated feed plus every
    /// suppressed channel- and source-level error.
    pub async fn plan_and_execute(
        &self,
        channels: &[(SourceChannel, Vec<String>)],
        options: &ExecuteOptions,
    ) -> Result<(Box<dyn PageSource>, Vec<AggregatorError>)> {
        let tasks = self.planner.plan(channels);
        info!(
            "planned {} tasks across {} channels",
            tasks.len(),
            channels.len()
        );
        self.executor.execute(tasks, options).await
    }

    /// Aggregate every channel in the subscription store, each targeting its
    /// own URL.
    pub async fn plan_and_execute_subscribed(
        &self,
        options: &ExecuteOptions,
    ) -> Result<(Box<dyn PageSource>, Vec<AggregatorError>)> {
        let channels: Vec<(SourceChannel, Vec<String>)> = self
            .store
            .all()
            .await
            .into_iter()
            .map(|channel| {
                let url = channel.url.clone();
                (channel, vec![url])
            })
            .collect();
        self.plan_and_execute(&channels, options).await
    }

    /// Dry-run live request counts per client id, for UI budget display.
    pub fn count_planned_live_requests(
        &self,
        channels: &[(SourceChannel, Vec<String>)],
    ) -> HashMap<String, usize> {
        self.planner.count_planned_live_requests(channels)
    }

    pub fn cache(&self) -> &ContentCache {
        &self.cache
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// The background job queue carrying opportunistic cache writes. Await
    /// [`JobQueue::drain`] to observe their completion.
    pub fn jobs(&self) -> &JobQueue {
        &self.jobs
    }
}
