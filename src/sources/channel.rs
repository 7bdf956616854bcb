use crate::channel::{BroadcastChannel, ChannelMessage};
use crate::config::ChannelConfig;
use crate::sources::SourceFetcher;
use crate::types::{ChannelError, RawCandidate, Result, SourceConfig};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{info, warn};

/// Reads public broadcast channels as a content source. Request pacing
/// lives in the channel client; a flood-wait is honored once per source.
pub struct ChannelFetcher {
    client: Arc<dyn BroadcastChannel>,
    config: ChannelConfig,
}

impl ChannelFetcher {
    pub fn new(client: Arc<dyn BroadcastChannel>, config: ChannelConfig) -> Self {
        Self { client, config }
    }

    async fn fetch_with_flood_retry(
        &self,
        channel: &str,
        limit: usize,
    ) -> std::result::Result<Vec<ChannelMessage>, ChannelError> {
        match self.client.fetch_messages(channel, limit).await {
            Err(ChannelError::FloodWait { retry_after_secs }) => {
                warn!(
                    "Flood wait on '{}', sleeping {}s before one retry",
                    channel, retry_after_secs
                );
                tokio::time::sleep(std::time::Duration::from_secs(retry_after_secs)).await;
                self.client.fetch_messages(channel, limit).await
            }
            other => other,
        }
    }
}

#[async_trait]
impl SourceFetcher for ChannelFetcher {
    async fn fetch(&self, source: &SourceConfig, limit: usize) -> Result<Vec<RawCandidate>> {
        let channel = source.endpoint.as_str();
        let messages = self
            .fetch_with_flood_retry(channel, limit.min(self.config.fetch_limit))
            .await?;

        let cutoff = Utc::now() - Duration::days(self.config.max_message_age_days);
        let handle = channel.trim_start_matches('@');
        let mut candidates = Vec::new();

        for message in messages {
            if message.date < cutoff {
                continue;
            }
            let Some((title, body)) = split_message(&message.text) else {
                continue;
            };
            candidates.push(RawCandidate {
                dedup_key: format!("https://t.me/{}/{}", handle, message.id),
                title,
                body,
                source_name: source.name.clone(),
                published_at: Some(message.date),
                fetched_at: Utc::now(),
            });
        }

        info!(
            "Channel '{}' yielded {} candidates",
            source.name,
            candidates.len()
        );
        Ok(candidates)
    }
}

/// First line of a message is its title; the full text is the body.
/// Empty messages are skipped.
fn split_message(text: &str) -> Option<(String, String)> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    let title = trimmed
        .lines()
        .next()
        .map(|l| l.trim_matches(|c: char| c == '*' || c == '#' || c == ' '))
        .filter(|l| !l.is_empty())?;
    Some((title.to_string(), trimmed.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MockChannel;
    use crate::types::SourceKind;

    #[test]
    fn first_line_becomes_the_title() {
        let (title, body) = split_message("**Big ruling**\nDetails follow.").unwrap();
        assert_eq!(title, "Big ruling");
        assert!(body.contains("Details follow."));
        assert!(split_message("   \n  ").is_none());
    }

    #[tokio::test]
    async fn old_messages_are_skipped() {
        let mock = Arc::new(MockChannel::new());
        mock.seed_messages(vec![
            ChannelMessage {
                id: 1,
                text: "Fresh ruling\nBody.".to_string(),
                date: Utc::now() - Duration::hours(1),
            },
            ChannelMessage {
                id: 2,
                text: "Ancient news\nBody.".to_string(),
                date: Utc::now() - Duration::days(30),
            },
        ]);
        let config = ChannelConfig {
            message_delay_ms: 0,
            ..ChannelConfig::default()
        };
        let fetcher = ChannelFetcher::new(mock, config);
        let source = SourceConfig::new("legal_channel", "@legal_channel", SourceKind::Channel);

        let candidates = fetcher.fetch(&source, 10).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].title, "Fresh ruling");
        assert_eq!(candidates[0].dedup_key, "https://t.me/legal_channel/1");
    }
}
