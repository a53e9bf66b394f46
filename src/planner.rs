use crate::client::{ClientRegistry, SourceClient};
use crate::types::{ContentType, SourceChannel};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Which path a task takes. Assigned exactly once, at planning time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskTier {
    /// Full network fetch of the channel's paged contents.
    Live,
    /// Lightweight freshness probe; feeds the cache, not the merged result.
    Peek,
    /// Served from the content cache only, no network.
    CacheOnly,
}

/// The unit of work produced by planning and consumed by the executor.
/// Created fresh every planning cycle, never persisted.
pub struct FetchTask {
    pub client: Arc<dyn SourceClient>,
    /// Snapshot of the channel at planning time.
    pub channel: SourceChannel,
    pub url: String,
    pub content_type: ContentType,
    /// Lower value = more overdue = scheduled sooner.
    pub urgency: i64,
    pub tier: TaskTier,
}

impl FetchTask {
    pub fn client_id(&self) -> &str {
        self.client.id()
    }
}

#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// Feature toggle for the peek tier.
    pub peek_enabled: bool,
    /// Global cap on how many channels may be peeked per planning cycle.
    pub max_peeked_channels: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            peek_enabled: true,
            max_peeked_channels: 50,
        }
    }
}

/// Urgency score for fetching one content type of one channel. A pure
/// function of the channel's recorded freshness fields, recomputed every
/// planning cycle: hours until the next upload is expected, times 100.
/// Overdue channels go negative, and never-updated channels (epoch default)
/// are maximally urgent.
pub fn urgency_score(channel: &SourceChannel, content_type: ContentType, now: DateTime<Utc>) -> i64 {
    let last_update = channel.last_update_or_epoch(content_type);
    let hours_since_update = (now - last_update).num_minutes() as f64 / 60.0;
    let expected_hours = channel.interval_days_or_default(content_type) * 24.0 - hours_since_update;
    (expected_hours * 100.0) as i64
}

/// Turns the set of subscribed channels into an ordered, tiered task list.
/// Pure planning: no side effects beyond log output.
pub struct TaskPlanner {
    registry: Arc<ClientRegistry>,
    config: PlannerConfig,
}

/// Internal planning candidate: a task whose tier is not yet decided, or was
/// fixed up front (the degraded cache-only safety net).
struct Candidate {
    client: Arc<dyn SourceClient>,
    channel: SourceChannel,
    url: String,
    content_type: ContentType,
    urgency: i64,
    fixed_tier: Option<TaskTier>,
}

impl TaskPlanner {
    pub fn new(registry: Arc<ClientRegistry>, config: PlannerConfig) -> Self {
        Self { registry, config }
    }

    /// Plan fetch tasks for the given channels. Each channel maps to one or
    /// more target URLs (a channel may alias several). URLs with no enabled
    /// owning client yield no task.
    pub fn plan(&self, channels: &[(SourceChannel, Vec<String>)]) -> Vec<FetchTask> {
        let now = Utc::now();
        let mut candidates: Vec<Candidate> = Vec::new();

        for (channel, urls) in channels {
            for url in urls {
                let Some(client) = self.registry.resolve(url) else {
                    continue;
                };
                candidates.extend(self.candidates_for_url(client, channel, url, now));
            }
        }

        self.assign_tiers(candidates)
    }

    /// Dry run: how many live requests would the current plan issue per
    /// source client. Used by UIs to display the fetch budget.
    pub fn count_planned_live_requests(
        &self,
        channels: &[(SourceChannel, Vec<String>)],
    ) -> HashMap<String, usize> {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for task in self.plan(channels) {
            if task.tier == TaskTier::Live {
                *counts.entry(task.client_id().to_string()).or_default() += 1;
            }
        }
        counts
    }

    fn candidates_for_url(
        &self,
        client: Arc<dyn SourceClient>,
        channel: &SourceChannel,
        url: &str,
        now: DateTime<Utc>,
    ) -> Vec<Candidate> {
        let caps = client.capabilities();

        if caps.is_mixed_only() {
            return vec![Candidate {
                client: client.clone(),
                channel: channel.clone(),
                url: url.to_string(),
                content_type: ContentType::Mixed,
                urgency: urgency_score(channel, ContentType::Mixed, now),
                fixed_tier: None,
            }];
        }

        let wanted: Vec<ContentType> = channel
            .effective_wanted_types()
            .into_iter()
            .filter(|t| caps.supports(*t))
            .collect();

        if wanted.is_empty() {
            // No overlap between what the channel wants and what the client
            // supports. Emit one degraded video task served from cache so the
            // channel still contributes something.
            debug!(
                "channel {} has no supported content types on client {}, degrading to cached video",
                channel.url,
                client.id()
            );
            return vec![Candidate {
                client: client.clone(),
                channel: channel.clone(),
                url: url.to_string(),
                content_type: ContentType::Video,
                urgency: urgency_score(channel, ContentType::Video, now),
                fixed_tier: Some(TaskTier::CacheOnly),
            }];
        }

        wanted
            .into_iter()
            .map(|content_type| Candidate {
                client: client.clone(),
                channel: channel.clone(),
                url: url.to_string(),
                content_type,
                urgency: urgency_score(channel, content_type, now),
                fixed_tier: None,
            })
            .collect()
    }

    /// Group candidates per client, spend each client's live budget on the
    /// most urgent tasks, then peek or cache the rest.
    fn assign_tiers(&self, candidates: Vec<Candidate>) -> Vec<FetchTask> {
        let mut per_client: HashMap<String, Vec<Candidate>> = HashMap::new();
        for candidate in candidates {
            per_client
                .entry(candidate.client.id().to_string())
                .or_default()
                .push(candidate);
        }

        let mut peeked_channels: HashSet<String> = HashSet::new();
        let mut tasks: Vec<FetchTask> = Vec::new();

        for (client_id, mut group) in per_client {
            group.sort_by_key(|c| c.urgency);

            let limit = group
                .first()
                .and_then(|c| c.client.subscription_rate_limit())
                .filter(|l| *l > 0)
                .map(|l| l as usize);

            let mut live = 0usize;
            let mut peek = 0usize;
            let mut cached = 0usize;

            for candidate in group {
                let tier = match candidate.fixed_tier {
                    Some(tier) => tier,
                    None => match limit {
                        None => TaskTier::Live,
                        // Spend the budget on actual live assignments; a
                        // fixed-tier candidate sorted above must not eat a slot.
                        Some(limit) if live < limit => TaskTier::Live,
                        Some(_) => {
                            if self.peek_allowed(&candidate, &peeked_channels) {
                                peeked_channels.insert(candidate.channel.url.clone());
                                TaskTier::Peek
                            } else {
                                TaskTier::CacheOnly
                            }
                        }
                    },
                };
                match tier {
                    TaskTier::Live => live += 1,
                    TaskTier::Peek => peek += 1,
                    TaskTier::CacheOnly => cached += 1,
                }
                tasks.push(FetchTask {
                    client: candidate.client,
                    channel: candidate.channel,
                    url: candidate.url,
                    content_type: candidate.content_type,
                    urgency: candidate.urgency,
                    tier,
                });
            }

            info!("client {client_id} budget: {live} live, {peek} peek, {cached} cached");
        }

        tasks.sort_by_key(|t| t.urgency);
        tasks
    }

    fn peek_allowed(&self, candidate: &Candidate, peeked_channels: &HashSet<String>) -> bool {
        if !self.config.peek_enabled {
            return false;
        }
        if !candidate.client.capabilities().can_peek(candidate.content_type) {
            return false;
        }
        let already_counted = peeked_channels.contains(&candidate.channel.url);
        if !already_counted && peeked_channels.len() >= self.config.max_peeked_channels {
            return false;
        }
        let stale_peek = match candidate.channel.last_peeked {
            None => true,
            Some(peeked_at) => {
                peeked_at < candidate.channel.last_update_or_epoch(candidate.content_type)
            }
        };
        stale_peek
    }
}
