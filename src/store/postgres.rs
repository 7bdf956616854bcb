use crate::store::Store;
use crate::types::{
    ApiUsageRecord, Draft, DraftStatus, IngestOutcome, ItemStatus, PipelineError, PipelineStats,
    Publication, RawCandidate, RawItem, RejectionReason, Result, SourceConfig, SourceKind,
};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::collections::HashMap;
use tracing::{info, warn};
use uuid::Uuid;

/// Postgres-backed [`Store`]. All queries are runtime-checked and use
/// upserts where concurrent writers can race.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations applied");
        Ok(())
    }
}

fn item_from_row(row: &PgRow) -> Result<RawItem> {
    Ok(RawItem {
        id: row.try_get("id")?,
        dedup_key: row.try_get("dedup_key")?,
        title: row.try_get("title")?,
        body: row.try_get("body")?,
        source_name: row.try_get("source_name")?,
        published_at: row.try_get("published_at")?,
        fetched_at: row.try_get("fetched_at")?,
        discovered_at: row.try_get("discovered_at")?,
        status: ItemStatus::parse(row.try_get::<String, _>("status")?.as_str())?,
        relevance_score: row.try_get("relevance_score")?,
        attempts: row.try_get("attempts")?,
    })
}

fn draft_from_row(row: &PgRow) -> Result<Draft> {
    let reason: Option<String> = row.try_get("rejection_reason")?;
    Ok(Draft {
        id: row.try_get("id")?,
        item_id: row.try_get("item_id")?,
        title: row.try_get("title")?,
        body: row.try_get("body")?,
        summary: row.try_get("summary")?,
        image_ref: row.try_get("image_ref")?,
        confidence: row.try_get("confidence")?,
        status: DraftStatus::parse(row.try_get::<String, _>("status")?.as_str())?,
        reviewed_by: row.try_get("reviewed_by")?,
        reviewed_at: row.try_get("reviewed_at")?,
        rejection_reason: reason.as_deref().map(RejectionReason::parse).transpose()?,
        edit_count: row.try_get("edit_count")?,
        created_at: row.try_get("created_at")?,
    })
}

fn publication_from_row(row: &PgRow) -> Result<Publication> {
    let reactions: serde_json::Value = row.try_get("reactions")?;
    Ok(Publication {
        id: row.try_get("id")?,
        draft_id: row.try_get("draft_id")?,
        channel: row.try_get("channel")?,
        message_id: row.try_get("message_id")?,
        published_at: row.try_get("published_at")?,
        views: row.try_get("views")?,
        reactions: serde_json::from_value(reactions).unwrap_or_default(),
        forwards: row.try_get("forwards")?,
        metrics_stale: row.try_get("metrics_stale")?,
        metrics_updated_at: row.try_get("metrics_updated_at")?,
    })
}

fn source_from_row(row: &PgRow) -> Result<SourceConfig> {
    Ok(SourceConfig {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        endpoint: row.try_get("endpoint")?,
        kind: SourceKind::parse(row.try_get::<String, _>("kind")?.as_str())?,
        enabled: row.try_get("enabled")?,
        quality_weight: row.try_get("quality_weight")?,
        last_fetch_at: row.try_get("last_fetch_at")?,
        error_count: row.try_get("error_count")?,
    })
}

#[async_trait]
impl Store for PgStore {
    async fn ingest_item(&self, candidate: &RawCandidate) -> Result<IngestOutcome> {
        let item = RawItem::from_candidate(candidate);
        let row = sqlx::query(
            r#"
            INSERT INTO raw_items
                (id, dedup_key, title, body, source_name, published_at,
                 fetched_at, discovered_at, status, relevance_score, attempts)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (dedup_key) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(item.id)
        .bind(&item.dedup_key)
        .bind(&item.title)
        .bind(&item.body)
        .bind(&item.source_name)
        .bind(item.published_at)
        .bind(item.fetched_at)
        .bind(item.discovered_at)
        .bind(item.status.as_str())
        .bind(item.relevance_score)
        .bind(item.attempts)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(IngestOutcome::Created(row.try_get("id")?)),
            None => Ok(IngestOutcome::Duplicate),
        }
    }

    async fn item(&self, id: Uuid) -> Result<RawItem> {
        let row = sqlx::query("SELECT * FROM raw_items WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(PipelineError::ItemNotFound(id))?;
        item_from_row(&row)
    }

    async fn items_with_status(&self, status: ItemStatus, limit: i64) -> Result<Vec<RawItem>> {
        let rows = sqlx::query(
            "SELECT * FROM raw_items WHERE status = $1 ORDER BY discovered_at ASC LIMIT $2",
        )
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(item_from_row).collect()
    }

    async fn items_since(
        &self,
        cutoff: DateTime<Utc>,
        statuses: &[ItemStatus],
    ) -> Result<Vec<RawItem>> {
        let status_strings: Vec<String> =
            statuses.iter().map(|s| s.as_str().to_string()).collect();
        let rows = sqlx::query(
            r#"
            SELECT * FROM raw_items
            WHERE discovered_at >= $1 AND status = ANY($2)
            ORDER BY discovered_at ASC
            "#,
        )
        .bind(cutoff)
        .bind(&status_strings)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(item_from_row).collect()
    }

    async fn transition_item(&self, id: Uuid, to: ItemStatus) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT status FROM raw_items WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(PipelineError::ItemNotFound(id))?;
        let current = ItemStatus::parse(row.try_get::<String, _>("status")?.as_str())?;
        if !current.can_transition(to) {
            return Err(PipelineError::InvalidTransition {
                from: current.to_string(),
                to: to.to_string(),
            });
        }
        sqlx::query("UPDATE raw_items SET status = $1 WHERE id = $2")
            .bind(to.as_str())
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn set_item_score(&self, id: Uuid, score: f64) -> Result<()> {
        sqlx::query("UPDATE raw_items SET relevance_score = $1 WHERE id = $2")
            .bind(score)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn bump_item_attempts(&self, id: Uuid) -> Result<i32> {
        let row = sqlx::query(
            "UPDATE raw_items SET attempts = attempts + 1 WHERE id = $1 RETURNING attempts",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(PipelineError::ItemNotFound(id))?;
        Ok(row.try_get("attempts")?)
    }

    async fn mark_stale_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE raw_items SET status = 'stale'
            WHERE discovered_at < $1 AND status IN ('new', 'accepted')
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn insert_draft(&self, draft: &Draft) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO drafts
                (id, item_id, title, body, summary, image_ref, confidence,
                 status, reviewed_by, reviewed_at, rejection_reason,
                 edit_count, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(draft.id)
        .bind(draft.item_id)
        .bind(&draft.title)
        .bind(&draft.body)
        .bind(&draft.summary)
        .bind(&draft.image_ref)
        .bind(draft.confidence)
        .bind(draft.status.as_str())
        .bind(draft.reviewed_by)
        .bind(draft.reviewed_at)
        .bind(draft.rejection_reason.map(|r| r.as_str()))
        .bind(draft.edit_count)
        .bind(draft.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn draft(&self, id: Uuid) -> Result<Draft> {
        let row = sqlx::query("SELECT * FROM drafts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(PipelineError::DraftNotFound(id))?;
        draft_from_row(&row)
    }

    async fn drafts_with_status(&self, status: DraftStatus, limit: i64) -> Result<Vec<Draft>> {
        let rows = sqlx::query(
            "SELECT * FROM drafts WHERE status = $1 ORDER BY created_at ASC LIMIT $2",
        )
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(draft_from_row).collect()
    }

    async fn update_draft_review(&self, draft: &Draft) -> Result<bool> {
        // Terminal rows never match, so a racing reviewer's stale write
        // affects zero rows instead of overwriting a finished review.
        let result = sqlx::query(
            r#"
            UPDATE drafts SET
                title = $1, body = $2, status = $3, reviewed_by = $4,
                reviewed_at = $5, rejection_reason = $6, edit_count = $7
            WHERE id = $8 AND status IN ('pending_review', 'edited')
            "#,
        )
        .bind(&draft.title)
        .bind(&draft.body)
        .bind(draft.status.as_str())
        .bind(draft.reviewed_by)
        .bind(draft.reviewed_at)
        .bind(draft.rejection_reason.map(|r| r.as_str()))
        .bind(draft.edit_count)
        .bind(draft.id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            let exists = sqlx::query("SELECT 1 FROM drafts WHERE id = $1")
                .bind(draft.id)
                .fetch_optional(&self.pool)
                .await?;
            if exists.is_none() {
                return Err(PipelineError::DraftNotFound(draft.id));
            }
            return Ok(false);
        }
        Ok(true)
    }

    async fn set_draft_image(&self, draft_id: Uuid, image_ref: &str) -> Result<()> {
        let result = sqlx::query("UPDATE drafts SET image_ref = $1 WHERE id = $2")
            .bind(image_ref)
            .bind(draft_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(PipelineError::DraftNotFound(draft_id));
        }
        Ok(())
    }

    async fn insert_publication(&self, publication: &Publication) -> Result<()> {
        let reactions = serde_json::to_value(&publication.reactions)?;
        sqlx::query(
            r#"
            INSERT INTO publications
                (id, draft_id, channel, message_id, published_at, views,
                 reactions, forwards, metrics_stale, metrics_updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (draft_id) DO NOTHING
            "#,
        )
        .bind(publication.id)
        .bind(publication.draft_id)
        .bind(&publication.channel)
        .bind(publication.message_id)
        .bind(publication.published_at)
        .bind(publication.views)
        .bind(reactions)
        .bind(publication.forwards)
        .bind(publication.metrics_stale)
        .bind(publication.metrics_updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn publication_for_draft(&self, draft_id: Uuid) -> Result<Option<Publication>> {
        let row = sqlx::query("SELECT * FROM publications WHERE draft_id = $1")
            .bind(draft_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(publication_from_row).transpose()
    }

    async fn publications_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Publication>> {
        let rows = sqlx::query(
            "SELECT * FROM publications WHERE published_at >= $1 ORDER BY published_at ASC",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(publication_from_row).collect()
    }

    async fn publications_on(&self, day: NaiveDate) -> Result<i64> {
        let start = Utc
            .from_utc_datetime(&day.and_hms_opt(0, 0, 0).unwrap_or_default());
        let end = start + Duration::days(1);
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM publications WHERE published_at >= $1 AND published_at < $2",
        )
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("n")?)
    }

    async fn update_publication_metrics(&self, publication: &Publication) -> Result<()> {
        let reactions = serde_json::to_value(&publication.reactions)?;
        sqlx::query(
            r#"
            UPDATE publications SET
                views = $1, reactions = $2, forwards = $3,
                metrics_stale = $4, metrics_updated_at = $5
            WHERE id = $6
            "#,
        )
        .bind(publication.views)
        .bind(reactions)
        .bind(publication.forwards)
        .bind(publication.metrics_stale)
        .bind(publication.metrics_updated_at)
        .bind(publication.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn publication_counts_by_source(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<HashMap<String, i64>> {
        let rows = sqlx::query(
            r#"
            SELECT i.source_name AS source_name, COUNT(*) AS n
            FROM publications p
            JOIN drafts d ON d.id = p.draft_id
            JOIN raw_items i ON i.id = d.item_id
            WHERE p.published_at >= $1
            GROUP BY i.source_name
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        let mut counts = HashMap::new();
        for row in rows {
            counts.insert(row.try_get("source_name")?, row.try_get("n")?);
        }
        Ok(counts)
    }

    async fn enabled_sources(&self) -> Result<Vec<SourceConfig>> {
        let rows = sqlx::query("SELECT * FROM sources WHERE enabled = TRUE ORDER BY name ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(source_from_row).collect()
    }

    async fn upsert_source(&self, source: &SourceConfig) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sources
                (id, name, endpoint, kind, enabled, quality_weight,
                 last_fetch_at, error_count)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (name) DO UPDATE SET
                endpoint = EXCLUDED.endpoint,
                kind = EXCLUDED.kind,
                enabled = EXCLUDED.enabled,
                quality_weight = EXCLUDED.quality_weight
            "#,
        )
        .bind(source.id)
        .bind(&source.name)
        .bind(&source.endpoint)
        .bind(source.kind.as_str())
        .bind(source.enabled)
        .bind(source.quality_weight)
        .bind(source.last_fetch_at)
        .bind(source.error_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_fetch_outcome(
        &self,
        id: Uuid,
        success: bool,
        error_threshold: i32,
    ) -> Result<()> {
        if success {
            sqlx::query(
                "UPDATE sources SET last_fetch_at = $1, error_count = 0 WHERE id = $2",
            )
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
            return Ok(());
        }
        let row = sqlx::query(
            r#"
            UPDATE sources SET
                last_fetch_at = $1,
                error_count = error_count + 1,
                enabled = (error_count + 1 < $2) AND enabled
            WHERE id = $3
            RETURNING name, enabled, error_count
            "#,
        )
        .bind(Utc::now())
        .bind(error_threshold)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| PipelineError::SourceNotFound(id.to_string()))?;
        let enabled: bool = row.try_get("enabled")?;
        if !enabled {
            warn!(
                "Disabling source '{}' after {} consecutive fetch failures",
                row.try_get::<String, _>("name")?,
                row.try_get::<i32, _>("error_count")?
            );
        }
        Ok(())
    }

    async fn record_usage(&self, record: &ApiUsageRecord) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO api_usage
                (id, provider, model, operation, prompt_tokens,
                 completion_tokens, cost_usd, item_id, draft_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(record.id)
        .bind(&record.provider)
        .bind(&record.model)
        .bind(record.operation.as_str())
        .bind(record.prompt_tokens)
        .bind(record.completion_tokens)
        .bind(record.cost_usd)
        .bind(record.item_id)
        .bind(record.draft_id)
        .bind(record.created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO monthly_api_usage (year, month, provider, spend_usd, call_count)
            VALUES ($1, $2, $3, $4, 1)
            ON CONFLICT (year, month, provider) DO UPDATE SET
                spend_usd = monthly_api_usage.spend_usd + EXCLUDED.spend_usd,
                call_count = monthly_api_usage.call_count + 1
            "#,
        )
        .bind(record.created_at.year())
        .bind(record.created_at.month() as i32)
        .bind(&record.provider)
        .bind(record.cost_usd)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn monthly_spend(&self, year: i32, month: u32) -> Result<f64> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(spend_usd), 0.0) AS spend
            FROM monthly_api_usage
            WHERE year = $1 AND month = $2
            "#,
        )
        .bind(year)
        .bind(month as i32)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("spend")?)
    }

    async fn pipeline_stats(&self) -> Result<PipelineStats> {
        let mut stats = PipelineStats::default();

        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM raw_items GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            stats
                .items_by_status
                .insert(row.try_get("status")?, row.try_get("n")?);
        }

        let rows =
            sqlx::query("SELECT source_name, COUNT(*) AS n FROM raw_items GROUP BY source_name")
                .fetch_all(&self.pool)
                .await?;
        for row in rows {
            stats
                .items_by_source
                .insert(row.try_get("source_name")?, row.try_get("n")?);
        }

        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM drafts GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            stats
                .drafts_by_status
                .insert(row.try_get("status")?, row.try_get("n")?);
        }

        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS n,
                   COALESCE(SUM(views), 0) AS views,
                   COALESCE(SUM(forwards), 0) AS forwards
            FROM publications
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        stats.publication_count = row.try_get("n")?;
        stats.total_views = row.try_get("views")?;
        stats.total_forwards = row.try_get("forwards")?;

        // Reaction maps live in JSONB; sum them in one pass.
        let rows = sqlx::query("SELECT reactions FROM publications")
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            let value: serde_json::Value = row.try_get("reactions")?;
            let reactions: HashMap<String, i64> =
                serde_json::from_value(value).unwrap_or_default();
            stats.total_reactions += reactions.values().sum::<i64>();
        }

        let now = Utc::now();
        stats.month_spend_usd = self.monthly_spend(now.year(), now.month()).await?;
        Ok(stats)
    }
}
