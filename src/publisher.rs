use crate::channel::BroadcastChannel;
use crate::config::PublisherConfig;
use crate::store::Store;
use crate::types::{Draft, DraftStatus, Publication, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default)]
pub struct PublishStats {
    pub published: usize,
    pub skipped_existing: usize,
    pub deferred_by_cap: usize,
}

/// Posts approved drafts to the broadcast channel, one publication per
/// draft, at most `max_posts_per_day` per UTC day.
pub struct Publisher {
    store: Arc<dyn Store>,
    channel: Arc<dyn BroadcastChannel>,
    target: String,
    config: PublisherConfig,
}

impl Publisher {
    pub fn new(
        store: Arc<dyn Store>,
        channel: Arc<dyn BroadcastChannel>,
        target: String,
        config: PublisherConfig,
    ) -> Self {
        Self {
            store,
            channel,
            target,
            config,
        }
    }

    /// Publish one approved draft. Returns the existing publication
    /// without re-posting when the draft already went out — retries
    /// after an unknown-outcome attempt check here first.
    pub async fn publish(&self, draft: &Draft) -> Result<Publication> {
        if let Some(existing) = self.store.publication_for_draft(draft.id).await? {
            info!(
                "Draft '{}' already published as message {}, skipping",
                draft.title, existing.message_id
            );
            return Ok(existing);
        }

        let text = format!("{}\n\n{}", draft.title, draft.body);
        // The post call is never cancelled mid-flight; the message id is
        // persisted before anything else can interrupt us.
        let message_id = self
            .channel
            .post(&self.target, &text, draft.image_ref.as_deref())
            .await?;

        let publication = Publication {
            id: Uuid::new_v4(),
            draft_id: draft.id,
            channel: self.target.clone(),
            message_id,
            published_at: Utc::now(),
            views: 0,
            reactions: HashMap::new(),
            forwards: 0,
            metrics_stale: false,
            metrics_updated_at: None,
        };
        self.store.insert_publication(&publication).await?;
        info!(
            "Published '{}' to {} as message {}",
            draft.title, self.target, message_id
        );
        Ok(publication)
    }

    /// Publish approved drafts up to the daily cap, oldest first.
    /// Surplus drafts stay approved and go out on a later day.
    pub async fn publish_approved(&self) -> Result<PublishStats> {
        let mut stats = PublishStats::default();
        let drafts = self
            .store
            .drafts_with_status(DraftStatus::Approved, 100)
            .await?;
        if drafts.is_empty() {
            return Ok(stats);
        }

        let today = Utc::now().date_naive();
        let mut published_today = self.store.publications_on(today).await?;

        for draft in drafts {
            if self.store.publication_for_draft(draft.id).await?.is_some() {
                stats.skipped_existing += 1;
                continue;
            }
            if published_today >= self.config.max_posts_per_day {
                stats.deferred_by_cap += 1;
                continue;
            }
            match self.publish(&draft).await {
                Ok(_) => {
                    stats.published += 1;
                    published_today += 1;
                }
                Err(e) => {
                    // Leave the draft approved; the next cycle retries.
                    warn!("Failed to publish '{}': {}", draft.title, e);
                }
            }
        }

        info!(
            "Publish pass: {} published, {} already out, {} deferred by daily cap",
            stats.published, stats.skipped_existing, stats.deferred_by_cap
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MockChannel;
    use crate::store::MemoryStore;

    fn approved_draft(title: &str) -> Draft {
        Draft {
            id: Uuid::new_v4(),
            item_id: Uuid::new_v4(),
            title: title.to_string(),
            body: "Body text.".to_string(),
            summary: None,
            image_ref: None,
            confidence: 0.9,
            status: DraftStatus::Approved,
            reviewed_by: Some(1),
            reviewed_at: Some(Utc::now()),
            rejection_reason: None,
            edit_count: 0,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn publish_is_idempotent_per_draft() {
        let store = Arc::new(MemoryStore::new());
        let channel = Arc::new(MockChannel::new());
        let publisher = Publisher::new(
            store.clone(),
            channel.clone(),
            "@digest".to_string(),
            PublisherConfig::default(),
        );

        let draft = approved_draft("First");
        store.insert_draft(&draft).await.unwrap();

        let first = publisher.publish(&draft).await.unwrap();
        let second = publisher.publish(&draft).await.unwrap();
        assert_eq!(first.message_id, second.message_id);
        assert_eq!(channel.post_count(), 1);
    }

    #[tokio::test]
    async fn daily_cap_defers_surplus_drafts() {
        let store = Arc::new(MemoryStore::new());
        let channel = Arc::new(MockChannel::new());
        let publisher = Publisher::new(
            store.clone(),
            channel.clone(),
            "@digest".to_string(),
            PublisherConfig {
                max_posts_per_day: 2,
            },
        );

        for i in 0..4 {
            store
                .insert_draft(&approved_draft(&format!("Draft {}", i)))
                .await
                .unwrap();
        }

        let stats = publisher.publish_approved().await.unwrap();
        assert_eq!(stats.published, 2);
        assert_eq!(stats.deferred_by_cap, 2);
        assert_eq!(channel.post_count(), 2);

        // Deferred drafts are still approved and untouched.
        let approved = store
            .drafts_with_status(DraftStatus::Approved, 10)
            .await
            .unwrap();
        assert_eq!(approved.len(), 4);
    }
}
