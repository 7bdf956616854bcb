use crate::sources::{feed_to_candidates, HttpFetcher, SourceFetcher};
use crate::types::{RawCandidate, Result, SourceConfig};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;
use url::Url;

const NEWS_SEARCH_BASE: &str = "https://news.google.com/rss/search";

/// Runs a news search by expanding the source's query into a search
/// feed URL and parsing the result like any other feed.
pub struct SearchFetcher {
    http: Arc<HttpFetcher>,
    max_items: usize,
}

impl SearchFetcher {
    pub fn new(http: Arc<HttpFetcher>, max_items: usize) -> Self {
        Self { http, max_items }
    }
}

/// A search source's endpoint is either a plain query ("AI court ruling")
/// or a full prebuilt search-feed URL.
pub fn search_url(endpoint: &str) -> Result<String> {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        return Ok(endpoint.to_string());
    }
    let mut url = Url::parse(NEWS_SEARCH_BASE)?;
    url.query_pairs_mut()
        .append_pair("q", endpoint)
        .append_pair("hl", "en-US")
        .append_pair("gl", "US")
        .append_pair("ceid", "US:en");
    Ok(url.to_string())
}

#[async_trait]
impl SourceFetcher for SearchFetcher {
    async fn fetch(&self, source: &SourceConfig, limit: usize) -> Result<Vec<RawCandidate>> {
        let url = search_url(&source.endpoint)?;
        let content = self.http.fetch_text(&url).await?;
        let candidates = feed_to_candidates(&content, source, limit.min(self.max_items))?;
        info!(
            "Search '{}' returned {} results",
            source.endpoint,
            candidates.len()
        );
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_is_url_encoded() {
        let url = search_url("AI court ruling").unwrap();
        assert!(url.starts_with(NEWS_SEARCH_BASE));
        assert!(url.contains("q=AI+court+ruling"));
        assert!(url.contains("ceid=US%3Aen"));
    }

    #[test]
    fn prebuilt_urls_pass_through() {
        let url = search_url("https://example.com/rss/search?q=ai").unwrap();
        assert_eq!(url, "https://example.com/rss/search?q=ai");
    }
}
