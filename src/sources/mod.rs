pub mod channel;
pub mod rss;
pub mod search;

pub use channel::ChannelFetcher;
pub use rss::FeedFetcher;
pub use search::SearchFetcher;

use crate::config::FetchConfig;
use crate::types::{PipelineError, RawCandidate, Result, SourceConfig, SourceKind};
use async_trait::async_trait;
use backoff::backoff::Backoff;
use chrono::Utc;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// One adapter per source kind; the orchestrator dispatches on
/// [`SourceKind`], which is a closed enum on purpose.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, source: &SourceConfig, limit: usize) -> Result<Vec<RawCandidate>>;
}

/// The full set of adapters, built once per run.
pub struct FetcherSet {
    feed: FeedFetcher,
    search: SearchFetcher,
    channel: ChannelFetcher,
}

impl FetcherSet {
    pub fn new(feed: FeedFetcher, search: SearchFetcher, channel: ChannelFetcher) -> Self {
        Self {
            feed,
            search,
            channel,
        }
    }

    pub fn for_kind(&self, kind: SourceKind) -> &dyn SourceFetcher {
        match kind {
            SourceKind::Feed => &self.feed,
            SourceKind::Search => &self.search,
            SourceKind::Channel => &self.channel,
        }
    }
}

/// Shared HTTP fetcher: retry with exponential backoff, per-host
/// request pacing.
pub struct HttpFetcher {
    client: reqwest::Client,
    config: FetchConfig,
    last_request: Mutex<HashMap<String, Instant>>,
}

impl HttpFetcher {
    pub fn new(config: FetchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;
        Ok(Self {
            client,
            config,
            last_request: Mutex::new(HashMap::new()),
        })
    }

    async fn pace(&self, url: &str) {
        let host = url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()));
        let Some(host) = host else { return };

        let min_gap = Duration::from_millis(self.config.per_host_delay_ms);
        let wait = {
            let mut last = self.last_request.lock().await;
            let wait = last
                .get(&host)
                .map(|at| min_gap.saturating_sub(at.elapsed()))
                .unwrap_or(Duration::ZERO);
            last.insert(host, Instant::now() + wait);
            wait
        };
        if !wait.is_zero() {
            debug!("Pacing: waiting {:?} before hitting {}", wait, url);
            tokio::time::sleep(wait).await;
        }
    }

    pub async fn fetch_text(&self, url: &str) -> Result<String> {
        self.pace(url).await;

        let mut policy = backoff::ExponentialBackoff {
            initial_interval: Duration::from_secs(self.config.retry_delay_seconds),
            max_elapsed_time: None,
            ..Default::default()
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self.try_fetch(url).await;
            match result {
                Ok(body) => return Ok(body),
                Err(e) if attempt <= self.config.max_retries => {
                    let delay = policy.next_backoff().unwrap_or(Duration::from_secs(
                        self.config.retry_delay_seconds,
                    ));
                    warn!(
                        "Fetch attempt {} failed for {}: {}, retrying in {:?}",
                        attempt, url, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_fetch(&self, url: &str) -> Result<String> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::General(format!(
                "GET {} returned {}",
                url, status
            )));
        }
        Ok(response.text().await?)
    }
}

/// Turn a parsed feed into candidates, newest entries first as served.
pub fn feed_to_candidates(
    content: &str,
    source: &SourceConfig,
    limit: usize,
) -> Result<Vec<RawCandidate>> {
    let feed = feed_rs::parser::parse(content.as_bytes())
        .map_err(|e| PipelineError::Parse(format!("failed to parse feed: {}", e)))?;

    let now = Utc::now();
    let mut candidates = Vec::new();
    for entry in feed.entries.into_iter().take(limit) {
        let Some(link) = entry.links.first().map(|l| l.href.clone()) else {
            continue;
        };
        let title = entry
            .title
            .map(|t| t.content)
            .unwrap_or_else(|| "Untitled".to_string());
        let body = entry
            .content
            .and_then(|c| c.body)
            .or_else(|| entry.summary.map(|s| s.content))
            .unwrap_or_default();
        candidates.push(RawCandidate {
            dedup_key: link,
            title: strip_html(&title),
            body: strip_html(&body),
            source_name: source.name.clone(),
            published_at: entry.published.map(|d| d.with_timezone(&Utc)),
            fetched_at: now,
        });
    }
    Ok(candidates)
}

/// Drop tags and collapse whitespace. Feed bodies routinely arrive as
/// HTML fragments.
pub fn strip_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_tag = false;
    for c in text.chars() {
        match c {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                out.push(' ');
            }
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    let decoded = out
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ");
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SourceKind;

    #[test]
    fn strip_html_removes_tags_and_entities() {
        assert_eq!(
            strip_html("<p>Court &amp; <b>AI</b></p>"),
            "Court & AI"
        );
        assert_eq!(strip_html("plain text"), "plain text");
    }

    #[test]
    fn feed_parsing_yields_candidates() {
        let rss = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>Example</title>
<item>
  <title>Court rules on AI evidence</title>
  <link>https://example.com/a</link>
  <description>&lt;p&gt;The ruling sets conditions.&lt;/p&gt;</description>
</item>
<item>
  <title>Second story</title>
  <link>https://example.com/b</link>
  <description>More text.</description>
</item>
</channel></rss>"#;
        let source = SourceConfig::new("example", "https://example.com/rss", SourceKind::Feed);
        let candidates = feed_to_candidates(rss, &source, 10).unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].dedup_key, "https://example.com/a");
        assert_eq!(candidates[0].body, "The ruling sets conditions.");

        let limited = feed_to_candidates(rss, &source, 1).unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn garbage_content_is_a_parse_error() {
        let source = SourceConfig::new("bad", "https://example.com/rss", SourceKind::Feed);
        assert!(feed_to_candidates("not a feed at all", &source, 10).is_err());
    }
}
