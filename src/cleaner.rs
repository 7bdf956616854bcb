use crate::config::CleanerConfig;
use crate::store::Store;
use crate::types::{ItemStatus, RawItem, Result};
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default)]
pub struct CleanStats {
    pub accepted: usize,
    pub duplicates: usize,
    pub stale_marked: u64,
}

/// Second-pass deduplication and retention pruning. Exact URL dupes are
/// already suppressed at ingest; this pass catches the same story
/// republished under a different URL.
pub struct Cleaner {
    store: Arc<dyn Store>,
    config: CleanerConfig,
}

impl Cleaner {
    pub fn new(store: Arc<dyn Store>, config: CleanerConfig) -> Self {
        Self { store, config }
    }

    pub async fn run(&self) -> Result<CleanStats> {
        let mut stats = CleanStats::default();
        let now = Utc::now();

        let retention_cutoff = now - Duration::days(self.config.retention_days);
        stats.stale_marked = self.store.mark_stale_before(retention_cutoff).await?;
        if stats.stale_marked > 0 {
            info!("Marked {} items stale", stats.stale_marked);
        }

        let window_cutoff = now - Duration::days(self.config.dedup_window_days);
        let mut base = self
            .store
            .items_since(window_cutoff, &[ItemStatus::Accepted, ItemStatus::Drafted])
            .await?;

        // New items arrive oldest first, so the earliest copy of a story
        // is the one that survives into the comparison base.
        let new_items = self.store.items_with_status(ItemStatus::New, 1000).await?;
        for item in new_items {
            if let Some(canonical) = self.find_near_duplicate(&item, &base) {
                debug!(
                    "Collapsing '{}' into earlier item '{}'",
                    item.title, canonical.title
                );
                self.store
                    .transition_item(item.id, ItemStatus::DuplicateRejected)
                    .await?;
                stats.duplicates += 1;
            } else {
                self.store
                    .transition_item(item.id, ItemStatus::Accepted)
                    .await?;
                stats.accepted += 1;
                base.push(item);
            }
        }

        info!(
            "Clean pass: {} accepted, {} duplicates, {} stale",
            stats.accepted, stats.duplicates, stats.stale_marked
        );
        Ok(stats)
    }

    fn find_near_duplicate<'a>(&self, item: &RawItem, base: &'a [RawItem]) -> Option<&'a RawItem> {
        base.iter().find(|other| {
            other.id != item.id
                && item_similarity(item, other) >= self.config.similarity_threshold
        })
    }
}

/// Similarity of two items: the higher of title similarity and
/// leading-content similarity, both on normalized text.
pub fn item_similarity(a: &RawItem, b: &RawItem) -> f64 {
    let title = text_similarity(&a.title, &b.title);
    let body = text_similarity(snippet(&a.body), snippet(&b.body));
    title.max(body)
}

pub fn text_similarity(a: &str, b: &str) -> f64 {
    let a = normalize(a);
    let b = normalize(b);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    strsim::normalized_levenshtein(&a, &b)
}

fn normalize(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn snippet(body: &str) -> &str {
    let mut end = body.len().min(200);
    while end < body.len() && !body.is_char_boundary(end) {
        end += 1;
    }
    &body[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::{IngestOutcome, RawCandidate};
    use uuid::Uuid;

    fn candidate(key: &str, title: &str, body: &str) -> RawCandidate {
        RawCandidate {
            dedup_key: key.to_string(),
            title: title.to_string(),
            body: body.to_string(),
            source_name: "test".to_string(),
            published_at: Some(Utc::now()),
            fetched_at: Utc::now(),
        }
    }

    #[test]
    fn normalization_strips_punctuation_and_case() {
        assert_eq!(normalize("  Hello,   WORLD! "), "hello world");
    }

    #[test]
    fn near_identical_titles_score_high() {
        let s = text_similarity(
            "EU parliament approves AI liability directive",
            "EU Parliament approves the AI liability directive",
        );
        assert!(s > 0.85, "similarity was {}", s);
    }

    #[test]
    fn unrelated_titles_score_low() {
        let s = text_similarity(
            "EU parliament approves AI liability directive",
            "Quarterly earnings beat analyst expectations",
        );
        assert!(s < 0.5, "similarity was {}", s);
    }

    #[tokio::test]
    async fn clean_pass_collapses_near_duplicates_keeping_earliest() {
        let store = Arc::new(MemoryStore::new());
        let body = "Regulators in Brussels voted to extend liability rules to AI systems. ".repeat(6);

        let first = match store
            .ingest_item(&candidate("https://a.example/1", "EU approves AI liability directive", &body))
            .await
            .unwrap()
        {
            IngestOutcome::Created(id) => id,
            IngestOutcome::Duplicate => panic!("first item must insert"),
        };
        let second = match store
            .ingest_item(&candidate(
                "https://b.example/999",
                "EU approves AI liability directive!",
                &body,
            ))
            .await
            .unwrap()
        {
            IngestOutcome::Created(id) => id,
            IngestOutcome::Duplicate => panic!("second item must insert"),
        };

        let cleaner = Cleaner::new(store.clone(), CleanerConfig::default());
        let stats = cleaner.run().await.unwrap();
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.duplicates, 1);

        assert_eq!(store.item(first).await.unwrap().status, ItemStatus::Accepted);
        assert_eq!(
            store.item(second).await.unwrap().status,
            ItemStatus::DuplicateRejected
        );
    }

    #[tokio::test]
    async fn distinct_stories_both_survive() {
        let store = Arc::new(MemoryStore::new());
        let body_a = "The court ruled that model outputs are admissible under strict conditions. ".repeat(6);
        let body_b = "A new bar association guideline covers the use of drafting assistants. ".repeat(6);
        store
            .ingest_item(&candidate("https://a.example/1", "Court rules on AI evidence", &body_a))
            .await
            .unwrap();
        store
            .ingest_item(&candidate("https://b.example/2", "Bar association issues AI guideline", &body_b))
            .await
            .unwrap();

        let cleaner = Cleaner::new(store.clone(), CleanerConfig::default());
        let stats = cleaner.run().await.unwrap();
        assert_eq!(stats.accepted, 2);
        assert_eq!(stats.duplicates, 0);
    }

    #[tokio::test]
    async fn missing_item_errors_propagate() {
        let store = Arc::new(MemoryStore::new());
        let result = store
            .transition_item(Uuid::new_v4(), ItemStatus::Accepted)
            .await;
        assert!(result.is_err());
    }
}
