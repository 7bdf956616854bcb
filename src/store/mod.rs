pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::types::{
    ApiUsageRecord, Draft, DraftStatus, IngestOutcome, ItemStatus, PipelineStats, Publication,
    RawCandidate, RawItem, Result, SourceConfig,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use uuid::Uuid;

/// Persistence boundary for the whole pipeline. Every stage derives its
/// pending work from here, which is what makes runs resumable.
#[async_trait]
pub trait Store: Send + Sync {
    // -- raw items ------------------------------------------------------

    /// Insert a candidate unless its dedup key is already present.
    async fn ingest_item(&self, candidate: &RawCandidate) -> Result<IngestOutcome>;

    async fn item(&self, id: Uuid) -> Result<RawItem>;

    async fn items_with_status(&self, status: ItemStatus, limit: i64) -> Result<Vec<RawItem>>;

    /// Items discovered since `cutoff` in any of `statuses`, oldest first.
    async fn items_since(
        &self,
        cutoff: DateTime<Utc>,
        statuses: &[ItemStatus],
    ) -> Result<Vec<RawItem>>;

    /// Validated status transition; illegal moves are errors.
    async fn transition_item(&self, id: Uuid, to: ItemStatus) -> Result<()>;

    async fn set_item_score(&self, id: Uuid, score: f64) -> Result<()>;

    /// Increment the draft-attempt counter, returning the new value.
    async fn bump_item_attempts(&self, id: Uuid) -> Result<i32>;

    /// Mark working-set items older than `cutoff` as stale. Returns how
    /// many were marked.
    async fn mark_stale_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    // -- drafts ---------------------------------------------------------

    async fn insert_draft(&self, draft: &Draft) -> Result<()>;

    async fn draft(&self, id: Uuid) -> Result<Draft>;

    async fn drafts_with_status(&self, status: DraftStatus, limit: i64) -> Result<Vec<Draft>>;

    /// Persist review fields (status, reviewer, reason, edited text).
    /// Returns false without writing when the stored draft is already
    /// in a terminal review state, so a racing reviewer can never
    /// overwrite a finished review.
    async fn update_draft_review(&self, draft: &Draft) -> Result<bool>;

    async fn set_draft_image(&self, draft_id: Uuid, image_ref: &str) -> Result<()>;

    // -- publications ---------------------------------------------------

    async fn insert_publication(&self, publication: &Publication) -> Result<()>;

    async fn publication_for_draft(&self, draft_id: Uuid) -> Result<Option<Publication>>;

    async fn publications_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Publication>>;

    /// Number of publications on a given UTC day.
    async fn publications_on(&self, day: NaiveDate) -> Result<i64>;

    async fn update_publication_metrics(&self, publication: &Publication) -> Result<()>;

    /// Source name -> publication count since `cutoff`, for the ranking
    /// diversity boost.
    async fn publication_counts_by_source(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<HashMap<String, i64>>;

    // -- sources --------------------------------------------------------

    async fn enabled_sources(&self) -> Result<Vec<SourceConfig>>;

    async fn upsert_source(&self, source: &SourceConfig) -> Result<()>;

    /// Record a fetch success or failure. Crossing `error_threshold`
    /// consecutive failures disables the source; success resets the count.
    async fn record_fetch_outcome(&self, id: Uuid, success: bool, error_threshold: i32)
        -> Result<()>;

    // -- API usage ------------------------------------------------------

    /// Append a usage record and fold it into the monthly aggregate.
    async fn record_usage(&self, record: &ApiUsageRecord) -> Result<()>;

    /// Total spend for a calendar month across providers, from the
    /// aggregate (not a scan of usage rows).
    async fn monthly_spend(&self, year: i32, month: u32) -> Result<f64>;

    // -- dashboard boundary --------------------------------------------

    async fn pipeline_stats(&self) -> Result<PipelineStats>;
}
