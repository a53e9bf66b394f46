use crate::cache::{ContentCache, RecordingPageSource};
use crate::client::ClientRegistry;
use crate::exchange::{exchange_eligible, Exchange, EXCHANGE_MIN_TASKS};
use crate::jobs::JobQueue;
use crate::merge::{ChronoMergeSource, DedupSource};
use crate::paging::{CancelToken, PageSource, PrefetchedPageSource, DEFAULT_PAGE_SIZE};
use crate::planner::{FetchTask, TaskTier};
use crate::subscriptions::{ChannelPatch, SubscriptionStore};
use crate::types::{AggregatorError, FeedItem, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Callback invoked after every task completion with (finished, total).
pub type ProgressFn = Arc<dyn Fn(usize, usize) + Send + Sync>;

#[derive(Clone, Default)]
pub struct ExecuteOptions {
    /// Best-effort mode: tolerate individual channel failures and a
    /// cancelled run still returns whatever completed.
    pub allow_failure: bool,
    /// Substitute the content cache when a channel's live fetch fails.
    /// When off, a live failure aborts the whole aggregation.
    pub with_cache_fallback: bool,
    /// Hard ceiling on concurrently running tasks. `None` runs every task
    /// as its own concurrent unit (task count is small, bounded by
    /// subscriptions x content types).
    pub worker_limit: Option<usize>,
    /// Page size of the merged feed; zero falls back to the default.
    pub page_size: usize,
    pub cancel: CancelToken,
    pub progress: Option<ProgressFn>,
}

impl ExecuteOptions {
    pub fn best_effort() -> Self {
        Self {
            allow_failure: true,
            with_cache_fallback: true,
            ..Self::default()
        }
    }

    fn effective_page_size(&self) -> usize {
        if self.page_size == 0 {
            DEFAULT_PAGE_SIZE
        } else {
            self.page_size
        }
    }
}

/// What one task produced: at most one pager for its channel, plus the
/// error kept for reporting when the pager came from cache fallback.
struct TaskOutcome {
    channel_url: String,
    pager: Option<Box<dyn PageSource>>,
    from_cache: bool,
    error: Option<AggregatorError>,
    /// Set when the failure must abort the whole aggregation.
    abort: bool,
}

impl TaskOutcome {
    fn empty(channel_url: String) -> Self {
        Self {
            channel_url,
            pager: None,
            from_cache: false,
            error: None,
            abort: false,
        }
    }
}

/// Per-run shared state used across concurrently executing tasks.
struct RunState {
    /// Ids of clients that failed fatally this run; their remaining tasks
    /// skip without a network call and without duplicate error reports.
    disabled: Mutex<HashSet<String>>,
    finished: AtomicUsize,
    total: usize,
    cancel_reported: AtomicBool,
    /// URL -> peer-provided items, filled by the exchange round-trip.
    prefetched: HashMap<String, Vec<FeedItem>>,
    /// URL -> first pages this run fetched itself, contributed back to the
    /// exchange peer afterwards.
    contributions: Mutex<HashMap<String, Vec<FeedItem>>>,
}

/// Executes planned tasks with bounded, source-isolated concurrency and
/// merges the results into one deduplicated chronological feed.
pub struct TaskExecutor {
    registry: Arc<ClientRegistry>,
    store: Arc<dyn SubscriptionStore>,
    cache: ContentCache,
    jobs: JobQueue,
    exchange: Option<Arc<dyn Exchange>>,
}

impl TaskExecutor {
    pub fn new(
        registry: Arc<ClientRegistry>,
        store: Arc<dyn SubscriptionStore>,
        cache: ContentCache,
        jobs: JobQueue,
    ) -> Self {
        Self {
            registry,
            store,
            cache,
            jobs,
            exchange: None,
        }
    }

    pub fn with_exchange(mut self, exchange: Arc<dyn Exchange>) -> Self {
        self.exchange = Some(exchange);
        self
    }

    /// Run every task, then merge per-channel results into the final feed.
    /// Channel-level failures are collected into the returned list, never
    /// thrown; source-level failures skip that source's remaining tasks;
    /// aggregation failures abort unless running best-effort.
    pub async fn execute(
        &self,
        tasks: Vec<FetchTask>,
        options: &ExecuteOptions,
    ) -> Result<(Box<dyn PageSource>, Vec<AggregatorError>)> {
        let total = tasks.len();
        let mut state = RunState {
            disabled: Mutex::new(HashSet::new()),
            finished: AtomicUsize::new(0),
            total,
            cancel_reported: AtomicBool::new(false),
            prefetched: HashMap::new(),
            contributions: Mutex::new(HashMap::new()),
        };

        let exchange_active = self.negotiate_exchange(&tasks, &mut state).await;

        let concurrency = options.worker_limit.unwrap_or(total.max(1));
        info!("executing {total} fetch tasks ({concurrency} concurrent)");

        let outcomes: Vec<TaskOutcome> = stream::iter(tasks)
            .map(|task| self.run_task(task, &state, options))
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

        let mut errors: Vec<AggregatorError> = Vec::new();
        let mut abort: Option<AggregatorError> = None;
        let mut per_channel: HashMap<String, (Vec<Box<dyn PageSource>>, Vec<Box<dyn PageSource>>)> =
            HashMap::new();

        for outcome in outcomes {
            if outcome.abort {
                let err = outcome
                    .error
                    .unwrap_or_else(|| AggregatorError::Aggregation("task aborted".into()));
                abort.get_or_insert(err);
                continue;
            }
            if let Some(err) = outcome.error {
                errors.push(err);
            }
            if let Some(pager) = outcome.pager {
                let entry = per_channel.entry(outcome.channel_url).or_default();
                if outcome.from_cache {
                    entry.1.push(pager);
                } else {
                    entry.0.push(pager);
                }
            }
        }

        if let Some(err) = abort {
            return Err(err);
        }

        if exchange_active {
            self.contribute_to_exchange(&state).await;
        }

        let page_size = options.effective_page_size();
        let channel_pagers: Vec<Box<dyn PageSource>> = per_channel
            .into_values()
            .map(|(mut live, mut cached)| self.channel_pager(&mut live, &mut cached, page_size))
            .collect();

        let merged = ChronoMergeSource::new(channel_pagers, page_size)
            .tolerate_failures(options.allow_failure)
            .with_cancel(options.cancel.clone());
        let feed: Box<dyn PageSource> = Box::new(
            DedupSource::new(Box::new(merged)).allow_clients(self.registry.enabled_ids()),
        );

        info!(
            "aggregation finished: {} tasks, {} suppressed errors",
            total,
            errors.len()
        );
        Ok((feed, errors))
    }

    /// One channel's contribution: its live pagers chronologically merged
    /// with its cache pagers. A single pager is used directly; a channel
    /// with neither contributes nothing upstream.
    fn channel_pager(
        &self,
        live: &mut Vec<Box<dyn PageSource>>,
        cached: &mut Vec<Box<dyn PageSource>>,
        page_size: usize,
    ) -> Box<dyn PageSource> {
        let mut all: Vec<Box<dyn PageSource>> = live.drain(..).chain(cached.drain(..)).collect();
        if all.len() == 1 {
            all.pop().unwrap()
        } else {
            Box::new(ChronoMergeSource::new(all, page_size))
        }
    }

    /// Offer eligible task URLs to the exchange peer. Returns whether the
    /// round-trip happened; failures degrade silently to normal execution.
    async fn negotiate_exchange(&self, tasks: &[FetchTask], state: &mut RunState) -> bool {
        let Some(exchange) = &self.exchange else {
            return false;
        };
        let eligible: Vec<String> = tasks
            .iter()
            .filter(|t| exchange_eligible(t))
            .map(|t| t.url.clone())
            .collect();
        if eligible.len() < EXCHANGE_MIN_TASKS {
            return false;
        }
        match exchange.acquire(&eligible).await {
            Ok(prefetched) => {
                debug!(
                    "exchange supplied {} of {} eligible urls",
                    prefetched.len(),
                    eligible.len()
                );
                state.prefetched = prefetched;
                true
            }
            Err(err) => {
                warn!("exchange negotiation failed, fetching everything locally: {err}");
                false
            }
        }
    }

    async fn contribute_to_exchange(&self, state: &RunState) {
        let Some(exchange) = self.exchange.clone() else {
            return;
        };
        let contributions = std::mem::take(&mut *state.contributions.lock().await);
        if contributions.is_empty() {
            return;
        }
        self.jobs
            .enqueue(async move {
                if let Err(err) = exchange.contribute(contributions).await {
                    warn!("exchange contribution failed: {err}");
                }
            })
            .await;
    }

    async fn run_task(
        &self,
        task: FetchTask,
        state: &RunState,
        options: &ExecuteOptions,
    ) -> TaskOutcome {
        let outcome = self.dispatch(task, state, options).await;
        let finished = state.finished.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(progress) = &options.progress {
            progress(finished, state.total);
        }
        outcome
    }

    async fn dispatch(
        &self,
        task: FetchTask,
        state: &RunState,
        options: &ExecuteOptions,
    ) -> TaskOutcome {
        let channel_url = task.channel.url.clone();

        if options.cancel.is_cancelled() {
            let mut outcome = TaskOutcome::empty(channel_url);
            if !state.cancel_reported.swap(true, Ordering::SeqCst) {
                outcome.error = Some(AggregatorError::Cancelled);
                outcome.abort = !options.allow_failure;
            }
            return outcome;
        }

        match task.tier {
            TaskTier::CacheOnly => self.run_cache_task(task),
            TaskTier::Peek => self.run_peek_task(task, state, options).await,
            TaskTier::Live => self.run_live_task(task, state, options).await,
        }
    }

    fn run_cache_task(&self, task: FetchTask) -> TaskOutcome {
        let channel_url = task.channel.url.clone();
        let pager = self
            .cache
            .query_by_channel(cache_query_urls(&task), DEFAULT_PAGE_SIZE);
        TaskOutcome {
            channel_url,
            pager: Some(Box::new(pager)),
            from_cache: true,
            error: None,
            abort: false,
        }
    }

    /// Peek probes never feed the merged result; they refresh the channel's
    /// peek timestamp and opportunistically cache items newer than the
    /// channel's last recorded update for this content type.
    async fn run_peek_task(
        &self,
        task: FetchTask,
        state: &RunState,
        options: &ExecuteOptions,
    ) -> TaskOutcome {
        let channel_url = task.channel.url.clone();
        if state.disabled.lock().await.contains(task.client_id()) {
            return TaskOutcome::empty(channel_url);
        }

        match task
            .client
            .peek_channel_contents(&task.url, task.content_type)
            .await
        {
            Ok(items) => {
                if let Err(err) = self
                    .store
                    .apply_patch(&channel_url, ChannelPatch::peeked())
                    .await
                {
                    warn!("failed to persist peek timestamp for {channel_url}: {err}");
                }
                let threshold = task.channel.last_update_or_epoch(task.content_type);
                let fresh: Vec<FeedItem> = items
                    .into_iter()
                    .filter(|item| item.timestamp > threshold)
                    .collect();
                debug!("peek of {channel_url} yielded {} fresh items", fresh.len());
                for item in fresh {
                    let cache = self.cache.clone();
                    self.jobs
                        .enqueue(async move {
                            cache.insert(item).await;
                        })
                        .await;
                }
                TaskOutcome::empty(channel_url)
            }
            Err(err) => {
                let mut outcome = TaskOutcome::empty(channel_url.clone());
                if err.is_source_fatal() {
                    outcome.error = self.disable_source(&task, err, state).await;
                } else if options.with_cache_fallback {
                    warn!("peek failed for {channel_url}: {err}");
                } else {
                    outcome.error = Some(AggregatorError::Peek {
                        url: task.url.clone(),
                        message: err.to_string(),
                    });
                }
                outcome
            }
        }
    }

    async fn run_live_task(
        &self,
        task: FetchTask,
        state: &RunState,
        options: &ExecuteOptions,
    ) -> TaskOutcome {
        let channel_url = task.channel.url.clone();
        if state.disabled.lock().await.contains(task.client_id()) {
            debug!(
                "client {} disabled this run, skipping {channel_url}",
                task.client_id()
            );
            return TaskOutcome::empty(channel_url);
        }

        // Peer-provided results bypass the network entirely. They never
        // update channel freshness: not trust-required.
        if let Some(items) = state.prefetched.get(&task.url) {
            debug!("using exchange-provided items for {}", task.url);
            let pager = self.recorded_pager(items.clone());
            return TaskOutcome {
                channel_url,
                pager: Some(pager),
                from_cache: false,
                error: None,
                abort: false,
            };
        }

        match task
            .client
            .get_channel_contents(&task.url, task.content_type, crate::types::FetchOrder::Chronological)
            .await
        {
            Ok(pager) => self.finish_live_fetch(task, pager, state, options).await,
            Err(err) => self.handle_live_failure(task, err, state, options).await,
        }
    }

    /// Pull the first page eagerly so the channel's freshness fields can be
    /// updated and persisted, then hand back a pager that replays it.
    async fn finish_live_fetch(
        &self,
        task: FetchTask,
        mut pager: Box<dyn PageSource>,
        state: &RunState,
        options: &ExecuteOptions,
    ) -> TaskOutcome {
        let first_page = match pager.next_page().await {
            Ok(page) => page,
            Err(err) => return self.handle_live_failure(task, err, state, options).await,
        };
        let channel_url = task.channel.url.clone();

        let newest = first_page.iter().map(|item| item.timestamp).max();
        let interval = estimate_interval_days(&first_page);
        if let Err(err) = self
            .store
            .apply_patch(
                &channel_url,
                ChannelPatch::fetched(task.content_type, newest, interval),
            )
            .await
        {
            warn!("failed to persist freshness for {channel_url}: {err}");
        }

        for item in &first_page {
            let cache = self.cache.clone();
            let item = item.clone();
            self.jobs
                .enqueue(async move {
                    cache.insert(item).await;
                })
                .await;
        }

        if exchange_eligible(&task) && self.exchange.is_some() {
            state
                .contributions
                .lock()
                .await
                .insert(task.url.clone(), first_page.clone());
        }

        let recording = RecordingPageSource::new(pager, self.cache.clone(), self.jobs.clone());
        TaskOutcome {
            channel_url,
            pager: Some(Box::new(PrefetchedPageSource::new(
                first_page,
                Box::new(recording),
            ))),
            from_cache: false,
            error: None,
            abort: false,
        }
    }

    async fn handle_live_failure(
        &self,
        task: FetchTask,
        err: AggregatorError,
        state: &RunState,
        options: &ExecuteOptions,
    ) -> TaskOutcome {
        let channel_url = task.channel.url.clone();

        if err.is_source_fatal() {
            let mut outcome = TaskOutcome::empty(channel_url);
            outcome.error = self.disable_source(&task, err, state).await;
            return outcome;
        }

        let reported = AggregatorError::Fetch {
            url: task.url.clone(),
            message: err.to_string(),
        };

        if options.with_cache_fallback {
            debug!("live fetch failed for {channel_url}, substituting cache");
            let pager = self
                .cache
                .query_by_channel(cache_query_urls(&task), DEFAULT_PAGE_SIZE);
            TaskOutcome {
                channel_url,
                pager: Some(Box::new(pager)),
                from_cache: true,
                error: Some(reported),
                abort: false,
            }
        } else {
            TaskOutcome {
                channel_url,
                pager: None,
                from_cache: false,
                error: Some(reported),
                abort: true,
            }
        }
    }

    /// Mark a client failed for the remainder of this run. The triggering
    /// error is reported once; subsequent tasks skip silently.
    async fn disable_source(
        &self,
        task: &FetchTask,
        err: AggregatorError,
        state: &RunState,
    ) -> Option<AggregatorError> {
        let newly_disabled = state
            .disabled
            .lock()
            .await
            .insert(task.client_id().to_string());
        if newly_disabled {
            warn!(
                "client {} failed fatally, skipping its remaining tasks: {err}",
                task.client_id()
            );
            Some(err)
        } else {
            None
        }
    }

    fn recorded_pager(&self, items: Vec<FeedItem>) -> Box<dyn PageSource> {
        let inner = crate::paging::VecPageSource::new(items, DEFAULT_PAGE_SIZE);
        Box::new(RecordingPageSource::new(
            Box::new(inner),
            self.cache.clone(),
            self.jobs.clone(),
        ))
    }
}

/// Cached items may be indexed under the channel's own URL or the task's
/// target URL when the channel aliases several; query both.
fn cache_query_urls(task: &FetchTask) -> Vec<String> {
    let mut urls = vec![task.channel.url.clone()];
    if task.url != task.channel.url {
        urls.push(task.url.clone());
    }
    urls
}

/// Rough per-type upload interval in days, estimated from the spacing of a
/// single page of items. Needs at least two timestamps.
fn estimate_interval_days(items: &[FeedItem]) -> Option<f64> {
    let mut stamps: Vec<DateTime<Utc>> = items.iter().map(|i| i.timestamp).collect();
    if stamps.len() < 2 {
        return None;
    }
    stamps.sort();
    let span = *stamps.last().unwrap() - stamps[0];
    let gaps = (stamps.len() - 1) as f64;
    let days = span.num_minutes() as f64 / 60.0 / 24.0 / gaps;
    Some(days.max(0.0))
}
