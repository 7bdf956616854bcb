use crate::store::Store;
use crate::types::{
    ApiUsageRecord, Draft, DraftStatus, IngestOutcome, ItemStatus, PipelineError, PipelineStats,
    Publication, RawCandidate, RawItem, Result, SourceConfig,
};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    items: HashMap<Uuid, RawItem>,
    drafts: HashMap<Uuid, Draft>,
    publications: HashMap<Uuid, Publication>,
    sources: HashMap<Uuid, SourceConfig>,
    usage: Vec<ApiUsageRecord>,
    // (year, month, provider) -> spend
    monthly: HashMap<(i32, u32, String), f64>,
}

/// In-memory [`Store`] with the same semantics as the Postgres one.
/// Backs the integration tests and local dry runs.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ingest_item(&self, candidate: &RawCandidate) -> Result<IngestOutcome> {
        let mut inner = self.inner.write().await;
        if inner
            .items
            .values()
            .any(|i| i.dedup_key == candidate.dedup_key)
        {
            return Ok(IngestOutcome::Duplicate);
        }
        let item = RawItem::from_candidate(candidate);
        let id = item.id;
        inner.items.insert(id, item);
        Ok(IngestOutcome::Created(id))
    }

    async fn item(&self, id: Uuid) -> Result<RawItem> {
        let inner = self.inner.read().await;
        inner
            .items
            .get(&id)
            .cloned()
            .ok_or(PipelineError::ItemNotFound(id))
    }

    async fn items_with_status(&self, status: ItemStatus, limit: i64) -> Result<Vec<RawItem>> {
        let inner = self.inner.read().await;
        let mut items: Vec<RawItem> = inner
            .items
            .values()
            .filter(|i| i.status == status)
            .cloned()
            .collect();
        items.sort_by_key(|i| i.discovered_at);
        items.truncate(limit as usize);
        Ok(items)
    }

    async fn items_since(
        &self,
        cutoff: DateTime<Utc>,
        statuses: &[ItemStatus],
    ) -> Result<Vec<RawItem>> {
        let inner = self.inner.read().await;
        let mut items: Vec<RawItem> = inner
            .items
            .values()
            .filter(|i| i.discovered_at >= cutoff && statuses.contains(&i.status))
            .cloned()
            .collect();
        items.sort_by_key(|i| i.discovered_at);
        Ok(items)
    }

    async fn transition_item(&self, id: Uuid, to: ItemStatus) -> Result<()> {
        let mut inner = self.inner.write().await;
        let item = inner
            .items
            .get_mut(&id)
            .ok_or(PipelineError::ItemNotFound(id))?;
        if !item.status.can_transition(to) {
            return Err(PipelineError::InvalidTransition {
                from: item.status.to_string(),
                to: to.to_string(),
            });
        }
        item.status = to;
        Ok(())
    }

    async fn set_item_score(&self, id: Uuid, score: f64) -> Result<()> {
        let mut inner = self.inner.write().await;
        let item = inner
            .items
            .get_mut(&id)
            .ok_or(PipelineError::ItemNotFound(id))?;
        item.relevance_score = Some(score);
        Ok(())
    }

    async fn bump_item_attempts(&self, id: Uuid) -> Result<i32> {
        let mut inner = self.inner.write().await;
        let item = inner
            .items
            .get_mut(&id)
            .ok_or(PipelineError::ItemNotFound(id))?;
        item.attempts += 1;
        Ok(item.attempts)
    }

    async fn mark_stale_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let mut marked = 0;
        for item in inner.items.values_mut() {
            if item.discovered_at < cutoff
                && matches!(item.status, ItemStatus::New | ItemStatus::Accepted)
            {
                item.status = ItemStatus::Stale;
                marked += 1;
            }
        }
        Ok(marked)
    }

    async fn insert_draft(&self, draft: &Draft) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.drafts.insert(draft.id, draft.clone());
        Ok(())
    }

    async fn draft(&self, id: Uuid) -> Result<Draft> {
        let inner = self.inner.read().await;
        inner
            .drafts
            .get(&id)
            .cloned()
            .ok_or(PipelineError::DraftNotFound(id))
    }

    async fn drafts_with_status(&self, status: DraftStatus, limit: i64) -> Result<Vec<Draft>> {
        let inner = self.inner.read().await;
        let mut drafts: Vec<Draft> = inner
            .drafts
            .values()
            .filter(|d| d.status == status)
            .cloned()
            .collect();
        drafts.sort_by_key(|d| d.created_at);
        drafts.truncate(limit as usize);
        Ok(drafts)
    }

    async fn update_draft_review(&self, draft: &Draft) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let terminal = inner
            .drafts
            .get(&draft.id)
            .ok_or(PipelineError::DraftNotFound(draft.id))?
            .status
            .is_terminal();
        if terminal {
            return Ok(false);
        }
        inner.drafts.insert(draft.id, draft.clone());
        Ok(true)
    }

    async fn set_draft_image(&self, draft_id: Uuid, image_ref: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let draft = inner
            .drafts
            .get_mut(&draft_id)
            .ok_or(PipelineError::DraftNotFound(draft_id))?;
        draft.image_ref = Some(image_ref.to_string());
        Ok(())
    }

    async fn insert_publication(&self, publication: &Publication) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .publications
            .insert(publication.id, publication.clone());
        Ok(())
    }

    async fn publication_for_draft(&self, draft_id: Uuid) -> Result<Option<Publication>> {
        let inner = self.inner.read().await;
        Ok(inner
            .publications
            .values()
            .find(|p| p.draft_id == draft_id)
            .cloned())
    }

    async fn publications_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Publication>> {
        let inner = self.inner.read().await;
        let mut pubs: Vec<Publication> = inner
            .publications
            .values()
            .filter(|p| p.published_at >= cutoff)
            .cloned()
            .collect();
        pubs.sort_by_key(|p| p.published_at);
        Ok(pubs)
    }

    async fn publications_on(&self, day: NaiveDate) -> Result<i64> {
        let inner = self.inner.read().await;
        Ok(inner
            .publications
            .values()
            .filter(|p| p.published_at.date_naive() == day)
            .count() as i64)
    }

    async fn update_publication_metrics(&self, publication: &Publication) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.publications.contains_key(&publication.id) {
            return Err(PipelineError::General(format!(
                "publication not found: {}",
                publication.id
            )));
        }
        inner
            .publications
            .insert(publication.id, publication.clone());
        Ok(())
    }

    async fn publication_counts_by_source(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<HashMap<String, i64>> {
        let inner = self.inner.read().await;
        let mut counts = HashMap::new();
        for publication in inner.publications.values() {
            if publication.published_at < cutoff {
                continue;
            }
            let source = inner
                .drafts
                .get(&publication.draft_id)
                .and_then(|d| inner.items.get(&d.item_id))
                .map(|i| i.source_name.clone());
            if let Some(source) = source {
                *counts.entry(source).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    async fn enabled_sources(&self) -> Result<Vec<SourceConfig>> {
        let inner = self.inner.read().await;
        let mut sources: Vec<SourceConfig> = inner
            .sources
            .values()
            .filter(|s| s.enabled)
            .cloned()
            .collect();
        sources.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(sources)
    }

    async fn upsert_source(&self, source: &SourceConfig) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.sources.insert(source.id, source.clone());
        Ok(())
    }

    async fn record_fetch_outcome(
        &self,
        id: Uuid,
        success: bool,
        error_threshold: i32,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let source = inner
            .sources
            .get_mut(&id)
            .ok_or_else(|| PipelineError::SourceNotFound(id.to_string()))?;
        source.last_fetch_at = Some(Utc::now());
        if success {
            source.error_count = 0;
        } else {
            source.error_count += 1;
            if source.error_count >= error_threshold && source.enabled {
                source.enabled = false;
                warn!(
                    "Disabling source '{}' after {} consecutive fetch failures",
                    source.name, source.error_count
                );
            }
        }
        Ok(())
    }

    async fn record_usage(&self, record: &ApiUsageRecord) -> Result<()> {
        let mut inner = self.inner.write().await;
        let key = (
            record.created_at.year(),
            record.created_at.month(),
            record.provider.clone(),
        );
        *inner.monthly.entry(key).or_insert(0.0) += record.cost_usd;
        inner.usage.push(record.clone());
        Ok(())
    }

    async fn monthly_spend(&self, year: i32, month: u32) -> Result<f64> {
        let inner = self.inner.read().await;
        Ok(inner
            .monthly
            .iter()
            .filter(|((y, m, _), _)| *y == year && *m == month)
            .map(|(_, spend)| spend)
            .sum())
    }

    async fn pipeline_stats(&self) -> Result<PipelineStats> {
        let inner = self.inner.read().await;
        let mut stats = PipelineStats::default();
        for item in inner.items.values() {
            *stats
                .items_by_status
                .entry(item.status.to_string())
                .or_insert(0) += 1;
            *stats
                .items_by_source
                .entry(item.source_name.clone())
                .or_insert(0) += 1;
        }
        for draft in inner.drafts.values() {
            *stats
                .drafts_by_status
                .entry(draft.status.to_string())
                .or_insert(0) += 1;
        }
        for publication in inner.publications.values() {
            stats.publication_count += 1;
            stats.total_views += publication.views;
            stats.total_reactions += publication.reaction_total();
            stats.total_forwards += publication.forwards;
        }
        let now = Utc::now();
        stats.month_spend_usd = inner
            .monthly
            .iter()
            .filter(|((y, m, _), _)| *y == now.year() && *m == now.month())
            .map(|(_, spend)| spend)
            .sum();
        info!(
            "Pipeline stats: {} items, {} drafts, {} publications",
            inner.items.len(),
            inner.drafts.len(),
            stats.publication_count
        );
        Ok(stats)
    }
}
