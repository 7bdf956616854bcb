use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Feed parse error: {0}")]
    Parse(String),

    #[error("LLM provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Source not found: {0}")]
    SourceNotFound(String),

    #[error("Item not found: {0}")]
    ItemNotFound(Uuid),

    #[error("Draft not found: {0}")]
    DraftNotFound(Uuid),

    #[error("General error: {0}")]
    General(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors surfaced by LLM and image providers. The retryable variants
/// carry enough context for the caller to decide whether to retry.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Malformed response: {0}")]
    Malformed(String),
}

impl ProviderError {
    /// Whether a later attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. }
                | ProviderError::Server(_)
                | ProviderError::Timeout
                | ProviderError::Transport(_)
        )
    }
}

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Flood limit hit, retry after {retry_after_secs}s")]
    FloodWait { retry_after_secs: u64 },

    #[error("Message or chat not found")]
    NotFound,

    #[error("Bot lacks access to the chat")]
    Forbidden,

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Channel API error: {0}")]
    Api(String),
}

/// Lifecycle of an ingested item. Transitions only move forward; see
/// [`ItemStatus::can_transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// Ingested, awaiting the cleaning pass.
    New,
    /// Survived cleaning, eligible for ranking and drafting.
    Accepted,
    /// A draft was generated from this item.
    Drafted,
    /// Collapsed into an earlier near-duplicate.
    DuplicateRejected,
    /// Aged out of the working set by retention pruning.
    Stale,
    /// Draft generation gave up after repeated provider failures.
    Failed,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::New => "new",
            ItemStatus::Accepted => "accepted",
            ItemStatus::Drafted => "drafted",
            ItemStatus::DuplicateRejected => "duplicate_rejected",
            ItemStatus::Stale => "stale",
            ItemStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "new" => Ok(ItemStatus::New),
            "accepted" => Ok(ItemStatus::Accepted),
            "drafted" => Ok(ItemStatus::Drafted),
            "duplicate_rejected" => Ok(ItemStatus::DuplicateRejected),
            "stale" => Ok(ItemStatus::Stale),
            "failed" => Ok(ItemStatus::Failed),
            other => Err(PipelineError::General(format!(
                "unknown item status: {}",
                other
            ))),
        }
    }

    pub fn can_transition(&self, to: ItemStatus) -> bool {
        use ItemStatus::*;
        matches!(
            (self, to),
            (New, Accepted)
                | (New, DuplicateRejected)
                | (New, Stale)
                | (Accepted, Drafted)
                | (Accepted, DuplicateRejected)
                | (Accepted, Stale)
                | (Accepted, Failed)
        )
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Review state of a generated draft.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftStatus {
    PendingReview,
    Approved,
    Rejected,
    Edited,
}

impl DraftStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DraftStatus::PendingReview => "pending_review",
            DraftStatus::Approved => "approved",
            DraftStatus::Rejected => "rejected",
            DraftStatus::Edited => "edited",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending_review" => Ok(DraftStatus::PendingReview),
            "approved" => Ok(DraftStatus::Approved),
            "rejected" => Ok(DraftStatus::Rejected),
            "edited" => Ok(DraftStatus::Edited),
            other => Err(PipelineError::General(format!(
                "unknown draft status: {}",
                other
            ))),
        }
    }

    pub fn can_transition(&self, to: DraftStatus) -> bool {
        use DraftStatus::*;
        matches!(
            (self, to),
            (PendingReview, Approved)
                | (PendingReview, Rejected)
                | (PendingReview, Edited)
                | (Edited, PendingReview)
        )
    }

    /// Approved and rejected are terminal; a reviewed draft cannot be
    /// reviewed again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DraftStatus::Approved | DraftStatus::Rejected)
    }
}

impl std::fmt::Display for DraftStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of reviewer rejection reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    NotRelevant,
    Duplicate,
    LowQuality,
    Outdated,
    Other,
}

impl RejectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionReason::NotRelevant => "not_relevant",
            RejectionReason::Duplicate => "duplicate",
            RejectionReason::LowQuality => "low_quality",
            RejectionReason::Outdated => "outdated",
            RejectionReason::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "not_relevant" => Ok(RejectionReason::NotRelevant),
            "duplicate" => Ok(RejectionReason::Duplicate),
            "low_quality" => Ok(RejectionReason::LowQuality),
            "outdated" => Ok(RejectionReason::Outdated),
            "other" => Ok(RejectionReason::Other),
            other => Err(PipelineError::General(format!(
                "unknown rejection reason: {}",
                other
            ))),
        }
    }
}

/// Kind of a configured source; fetcher dispatch is closed over this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// RSS/Atom feed polled directly.
    Feed,
    /// Query template expanded into a news-search feed URL.
    Search,
    /// Public broadcast channel read through the channel API.
    Channel,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Feed => "feed",
            SourceKind::Search => "search",
            SourceKind::Channel => "channel",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "feed" | "rss" => Ok(SourceKind::Feed),
            "search" => Ok(SourceKind::Search),
            "channel" => Ok(SourceKind::Channel),
            other => Err(PipelineError::General(format!(
                "unknown source kind: {}",
                other
            ))),
        }
    }
}

/// A configured content source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: Uuid,
    pub name: String,
    /// Feed URL, search query template, or channel username depending on kind.
    pub endpoint: String,
    pub kind: SourceKind,
    pub enabled: bool,
    /// Editorial trust weight in [0.0, 1.0], folded into ranking.
    pub quality_weight: f64,
    pub last_fetch_at: Option<DateTime<Utc>>,
    /// Consecutive fetch failures; reset to zero on success.
    pub error_count: i32,
}

impl SourceConfig {
    pub fn new(name: &str, endpoint: &str, kind: SourceKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            endpoint: endpoint.to_string(),
            kind,
            enabled: true,
            quality_weight: 0.5,
            last_fetch_at: None,
            error_count: 0,
        }
    }
}

/// A not-yet-persisted item produced by a source fetcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawCandidate {
    /// Canonicalized identity used for exact-duplicate suppression.
    pub dedup_key: String,
    pub title: String,
    pub body: String,
    pub source_name: String,
    pub published_at: Option<DateTime<Utc>>,
    pub fetched_at: DateTime<Utc>,
}

/// A persisted pipeline item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawItem {
    pub id: Uuid,
    pub dedup_key: String,
    pub title: String,
    pub body: String,
    pub source_name: String,
    pub published_at: Option<DateTime<Utc>>,
    pub fetched_at: DateTime<Utc>,
    pub discovered_at: DateTime<Utc>,
    pub status: ItemStatus,
    pub relevance_score: Option<f64>,
    /// Draft-generation attempts consumed so far.
    pub attempts: i32,
}

impl RawItem {
    pub fn from_candidate(c: &RawCandidate) -> Self {
        Self {
            id: Uuid::new_v4(),
            dedup_key: c.dedup_key.clone(),
            title: c.title.clone(),
            body: c.body.clone(),
            source_name: c.source_name.clone(),
            published_at: c.published_at,
            fetched_at: c.fetched_at,
            discovered_at: Utc::now(),
            status: ItemStatus::New,
            relevance_score: None,
            attempts: 0,
        }
    }
}

/// Outcome of attempting to ingest a candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Created(Uuid),
    /// An item with the same dedup key already exists.
    Duplicate,
}

/// A generated post draft awaiting (or past) review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Draft {
    pub id: Uuid,
    pub item_id: Uuid,
    pub title: String,
    pub body: String,
    pub summary: Option<String>,
    /// Reference to a generated illustration, if any.
    pub image_ref: Option<String>,
    /// Model self-reported confidence in [0.0, 1.0].
    pub confidence: f64,
    pub status: DraftStatus,
    pub reviewed_by: Option<i64>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<RejectionReason>,
    pub edit_count: i32,
    pub created_at: DateTime<Utc>,
}

/// Record of a draft posted to the broadcast channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Publication {
    pub id: Uuid,
    pub draft_id: Uuid,
    pub channel: String,
    pub message_id: i64,
    pub published_at: DateTime<Utc>,
    pub views: i64,
    pub reactions: HashMap<String, i64>,
    pub forwards: i64,
    /// Set when the channel no longer serves stats for this message.
    pub metrics_stale: bool,
    pub metrics_updated_at: Option<DateTime<Utc>>,
}

impl Publication {
    pub fn reaction_total(&self) -> i64 {
        self.reactions.values().sum()
    }
}

/// Which paid operation a usage record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Ranking,
    DraftGeneration,
    MediaGeneration,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Ranking => "ranking",
            OperationKind::DraftGeneration => "draft_generation",
            OperationKind::MediaGeneration => "media_generation",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "ranking" => Ok(OperationKind::Ranking),
            "draft_generation" => Ok(OperationKind::DraftGeneration),
            "media_generation" => Ok(OperationKind::MediaGeneration),
            other => Err(PipelineError::General(format!(
                "unknown operation kind: {}",
                other
            ))),
        }
    }
}

/// One billed provider call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiUsageRecord {
    pub id: Uuid,
    pub provider: String,
    pub model: String,
    pub operation: OperationKind,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub cost_usd: f64,
    pub item_id: Option<Uuid>,
    pub draft_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Read-only aggregate counts for the dashboard boundary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineStats {
    pub items_by_status: HashMap<String, i64>,
    pub drafts_by_status: HashMap<String, i64>,
    pub items_by_source: HashMap<String, i64>,
    pub publication_count: i64,
    pub total_views: i64,
    pub total_reactions: i64,
    pub total_forwards: i64,
    pub month_spend_usd: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_status_forward_only() {
        assert!(ItemStatus::New.can_transition(ItemStatus::Accepted));
        assert!(ItemStatus::Accepted.can_transition(ItemStatus::Drafted));
        assert!(!ItemStatus::Drafted.can_transition(ItemStatus::New));
        assert!(!ItemStatus::DuplicateRejected.can_transition(ItemStatus::Accepted));
        assert!(!ItemStatus::Stale.can_transition(ItemStatus::New));
        assert!(!ItemStatus::New.can_transition(ItemStatus::Drafted));
    }

    #[test]
    fn draft_review_is_terminal() {
        assert!(DraftStatus::Approved.is_terminal());
        assert!(DraftStatus::Rejected.is_terminal());
        assert!(!DraftStatus::Approved.can_transition(DraftStatus::Rejected));
        assert!(DraftStatus::PendingReview.can_transition(DraftStatus::Edited));
        assert!(DraftStatus::Edited.can_transition(DraftStatus::PendingReview));
    }

    #[test]
    fn status_round_trips_through_strings() {
        for s in [
            ItemStatus::New,
            ItemStatus::Accepted,
            ItemStatus::Drafted,
            ItemStatus::DuplicateRejected,
            ItemStatus::Stale,
            ItemStatus::Failed,
        ] {
            assert_eq!(ItemStatus::parse(s.as_str()).unwrap(), s);
        }
        assert!(ItemStatus::parse("bogus").is_err());
    }
}
