use crate::channel::BroadcastChannel;
use crate::config::MetricsConfig;
use crate::store::Store;
use crate::types::{ChannelError, Publication, Result};
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSweepStats {
    pub refreshed: usize,
    pub marked_stale: usize,
    pub errors: usize,
}

/// Periodically refreshes engagement counters for recent publications.
/// Counters never decrease; a shrinking value from the platform is
/// clamped and logged.
pub struct MetricsCollector {
    store: Arc<dyn Store>,
    channel: Arc<dyn BroadcastChannel>,
    config: MetricsConfig,
}

impl MetricsCollector {
    pub fn new(
        store: Arc<dyn Store>,
        channel: Arc<dyn BroadcastChannel>,
        config: MetricsConfig,
    ) -> Self {
        Self {
            store,
            channel,
            config,
        }
    }

    pub async fn refresh_all(&self) -> Result<MetricsSweepStats> {
        let mut stats = MetricsSweepStats::default();
        let cutoff = Utc::now() - Duration::days(self.config.horizon_days);
        let publications = self.store.publications_since(cutoff).await?;

        for mut publication in publications {
            if publication.metrics_stale {
                continue;
            }
            match self
                .channel
                .message_stats(&publication.channel, publication.message_id)
                .await
            {
                Ok(fresh) => {
                    apply_monotonic(&mut publication, fresh.views, fresh.forwards);
                    publication.reactions = merge_reactions(&publication, fresh.reactions);
                    publication.metrics_updated_at = Some(Utc::now());
                    self.store.update_publication_metrics(&publication).await?;
                    stats.refreshed += 1;
                }
                Err(ChannelError::NotFound) | Err(ChannelError::Forbidden) => {
                    publication.metrics_stale = true;
                    publication.metrics_updated_at = Some(Utc::now());
                    self.store.update_publication_metrics(&publication).await?;
                    stats.marked_stale += 1;
                    info!(
                        "Message {} no longer reachable, marking metrics stale",
                        publication.message_id
                    );
                }
                Err(e) => {
                    // Transient failure: skip this message, keep sweeping.
                    warn!(
                        "Stats fetch failed for message {}: {}",
                        publication.message_id, e
                    );
                    stats.errors += 1;
                }
            }
        }

        info!(
            "Metrics sweep: {} refreshed, {} marked stale, {} errors",
            stats.refreshed, stats.marked_stale, stats.errors
        );
        Ok(stats)
    }
}

fn apply_monotonic(publication: &mut Publication, views: i64, forwards: i64) {
    if views < publication.views || forwards < publication.forwards {
        warn!(
            "Counters decreased for message {} (views {} -> {}, forwards {} -> {}), keeping stored values",
            publication.message_id, publication.views, views, publication.forwards, forwards
        );
    }
    publication.views = publication.views.max(views);
    publication.forwards = publication.forwards.max(forwards);
}

fn merge_reactions(
    publication: &Publication,
    fresh: std::collections::HashMap<String, i64>,
) -> std::collections::HashMap<String, i64> {
    let mut merged = publication.reactions.clone();
    for (emoji, count) in fresh {
        let entry = merged.entry(emoji).or_insert(0);
        *entry = (*entry).max(count);
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{MessageStats, MockChannel};
    use crate::store::MemoryStore;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn publication(message_id: i64) -> Publication {
        Publication {
            id: Uuid::new_v4(),
            draft_id: Uuid::new_v4(),
            channel: "@digest".to_string(),
            message_id,
            published_at: Utc::now(),
            views: 100,
            reactions: HashMap::from([("👍".to_string(), 5)]),
            forwards: 2,
            metrics_stale: false,
            metrics_updated_at: None,
        }
    }

    #[tokio::test]
    async fn counters_never_decrease() {
        let store = Arc::new(MemoryStore::new());
        let channel = Arc::new(MockChannel::new());
        let p = publication(1);
        store.insert_publication(&p).await.unwrap();
        channel.set_stats(
            1,
            MessageStats {
                views: 40, // platform reports fewer than we stored
                reactions: HashMap::from([("👍".to_string(), 9)]),
                forwards: 1,
            },
        );

        let collector =
            MetricsCollector::new(store.clone(), channel, MetricsConfig::default());
        collector.refresh_all().await.unwrap();

        let stored = store.publication_for_draft(p.draft_id).await.unwrap().unwrap();
        assert_eq!(stored.views, 100);
        assert_eq!(stored.forwards, 2);
        assert_eq!(stored.reactions.get("👍"), Some(&9));
    }

    #[tokio::test]
    async fn unreachable_messages_are_marked_stale_not_fatal() {
        let store = Arc::new(MemoryStore::new());
        let channel = Arc::new(MockChannel::new());
        let gone = publication(1);
        let live = publication(2);
        store.insert_publication(&gone).await.unwrap();
        store.insert_publication(&live).await.unwrap();
        channel.set_stat_error(1, "not_found");
        channel.set_stats(
            2,
            MessageStats {
                views: 500,
                reactions: HashMap::new(),
                forwards: 10,
            },
        );

        let collector =
            MetricsCollector::new(store.clone(), channel, MetricsConfig::default());
        let stats = collector.refresh_all().await.unwrap();
        assert_eq!(stats.marked_stale, 1);
        assert_eq!(stats.refreshed, 1);

        let stored = store
            .publication_for_draft(gone.draft_id)
            .await
            .unwrap()
            .unwrap();
        assert!(stored.metrics_stale);

        // Stale publications are skipped on the next sweep.
        let stats = collector.refresh_all().await.unwrap();
        assert_eq!(stats.marked_stale, 0);
    }
}
