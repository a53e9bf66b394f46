use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The kinds of content a channel can produce. `Mixed` is the single
/// "subscriptions" type some clients declare instead of per-type feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContentType {
    Video,
    Stream,
    Post,
    Live,
    Mixed,
}

impl ContentType {
    /// The per-channel content types, excluding `Mixed`.
    pub const CHANNEL_TYPES: [ContentType; 4] = [
        ContentType::Video,
        ContentType::Stream,
        ContentType::Post,
        ContentType::Live,
    ];
}

/// Requested ordering for a channel content fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOrder {
    /// Newest items first (the only order the scheduler asks for).
    Chronological,
}

/// One feed item. Identity is the canonical item URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedItem {
    pub url: String,
    pub channel_url: String,
    /// Stable id of the source client that produced this item.
    pub client_id: String,
    pub content_type: ContentType,
    pub timestamp: DateTime<Utc>,
    pub title: Option<String>,
    pub author: Option<String>,
}

impl FeedItem {
    /// Canonical identity used for dedup and cache keying: no fragment,
    /// no trailing slash. Unparseable URLs are used verbatim.
    pub fn canonical_url(&self) -> String {
        canonicalize_url(&self.url)
    }
}

pub fn canonicalize_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) => {
            parsed.set_fragment(None);
            let s = parsed.to_string();
            s.strip_suffix('/').map(|t| t.to_string()).unwrap_or(s)
        }
        Err(_) => raw.trim_end_matches('/').to_string(),
    }
}

/// A subscribed channel. Identity is the channel URL. The per-type freshness
/// fields drive urgency scoring and are updated field-by-field through
/// [`crate::subscriptions::ChannelPatch`], never by whole-record overwrite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceChannel {
    pub url: String,
    pub name: Option<String>,
    /// Content types this subscription wants. Empty means all channel types.
    pub wanted_types: Vec<ContentType>,
    /// Timestamp of the newest known item, per content type.
    pub last_item: HashMap<ContentType, DateTime<Utc>>,
    /// When a live fetch last succeeded, per content type.
    pub last_update: HashMap<ContentType, DateTime<Utc>>,
    /// Estimated days between uploads, per content type.
    pub interval_days: HashMap<ContentType, f64>,
    pub last_peeked: Option<DateTime<Utc>>,
}

impl SourceChannel {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: None,
            wanted_types: Vec::new(),
            last_item: HashMap::new(),
            last_update: HashMap::new(),
            interval_days: HashMap::new(),
            last_peeked: None,
        }
    }

    /// The types this channel wants fetched; defaults to every channel type.
    pub fn effective_wanted_types(&self) -> Vec<ContentType> {
        if self.wanted_types.is_empty() {
            ContentType::CHANNEL_TYPES.to_vec()
        } else {
            self.wanted_types.clone()
        }
    }

    /// Last successful update for a type; the epoch when never updated, so
    /// new subscriptions score as maximally overdue.
    pub fn last_update_or_epoch(&self, content_type: ContentType) -> DateTime<Utc> {
        self.last_update
            .get(&content_type)
            .copied()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }

    /// Estimated upload interval in days for a type, defaulting to daily.
    pub fn interval_days_or_default(&self, content_type: ContentType) -> f64 {
        self.interval_days.get(&content_type).copied().unwrap_or(1.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AggregatorError {
    /// Channel-level: one channel's live fetch failed. Recoverable via cache.
    #[error("fetch failed for {url}: {message}")]
    Fetch { url: String, message: String },

    /// Channel-level: a peek probe failed.
    #[error("peek failed for {url}: {message}")]
    Peek { url: String, message: String },

    /// Source-level: the client is broken for this entire run; all of its
    /// remaining tasks are skipped, not retried.
    #[error("source client {client_id} unusable: {reason}")]
    SourceUnusable { client_id: String, reason: String },

    /// Source-level: the client needs the user to re-authorize before it can
    /// fetch anything this run.
    #[error("source client {client_id} requires reauthorization")]
    ReauthorizationRequired { client_id: String },

    /// A required collaborator is unavailable. Fatal outside best-effort mode.
    #[error("aggregation error: {0}")]
    Aggregation(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AggregatorError {
    /// True for the failure classes that disable a source client for the
    /// remainder of the run.
    pub fn is_source_fatal(&self) -> bool {
        matches!(
            self,
            AggregatorError::SourceUnusable { .. } | AggregatorError::ReauthorizationRequired { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, AggregatorError>;
