use crate::sources::{feed_to_candidates, HttpFetcher, SourceFetcher};
use crate::types::{RawCandidate, Result, SourceConfig};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// Polls RSS/Atom feeds directly.
pub struct FeedFetcher {
    http: Arc<HttpFetcher>,
    max_items: usize,
}

impl FeedFetcher {
    pub fn new(http: Arc<HttpFetcher>, max_items: usize) -> Self {
        Self { http, max_items }
    }
}

#[async_trait]
impl SourceFetcher for FeedFetcher {
    async fn fetch(&self, source: &SourceConfig, limit: usize) -> Result<Vec<RawCandidate>> {
        let content = self.http.fetch_text(&source.endpoint).await?;
        let candidates = feed_to_candidates(&content, source, limit.min(self.max_items))?;
        info!(
            "Fetched {} entries from feed '{}'",
            candidates.len(),
            source.name
        );
        Ok(candidates)
    }
}
