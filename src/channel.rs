use crate::config::ChannelConfig;
use crate::types::ChannelError;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ChannelMessage {
    pub id: i64,
    pub text: String,
    pub date: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct MessageStats {
    pub views: i64,
    pub reactions: HashMap<String, i64>,
    pub forwards: i64,
}

/// Messaging-platform boundary: posting to the broadcast channel,
/// reading public channel history, and polling engagement stats.
#[async_trait]
pub trait BroadcastChannel: Send + Sync {
    /// Post a message, returning the platform message id.
    async fn post(
        &self,
        channel: &str,
        text: &str,
        image_ref: Option<&str>,
    ) -> std::result::Result<i64, ChannelError>;

    async fn fetch_messages(
        &self,
        channel: &str,
        limit: usize,
    ) -> std::result::Result<Vec<ChannelMessage>, ChannelError>;

    async fn message_stats(
        &self,
        channel: &str,
        message_id: i64,
    ) -> std::result::Result<MessageStats, ChannelError>;
}

#[derive(Deserialize)]
struct ApiEnvelope<T> {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    result: Option<T>,
    #[serde(default)]
    parameters: Option<ApiParameters>,
}

#[derive(Deserialize, Default)]
struct ApiParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

#[derive(Deserialize)]
struct SentMessage {
    message_id: i64,
}

#[derive(Deserialize)]
struct WireMessage {
    message_id: i64,
    #[serde(default)]
    text: Option<String>,
    date: i64,
    #[serde(default)]
    views: Option<i64>,
    #[serde(default)]
    forwards: Option<i64>,
    #[serde(default)]
    reactions: Option<Vec<WireReaction>>,
}

#[derive(Deserialize)]
struct WireReaction {
    emoji: String,
    count: i64,
}

/// Bot-API client over HTTPS. Requests are paced by a minimum gap so
/// bursts of calls stay under platform limits.
pub struct HttpBroadcastChannel {
    client: reqwest::Client,
    api_base: String,
    token: String,
    min_request_gap: Duration,
    last_request: AsyncMutex<Option<Instant>>,
}

impl HttpBroadcastChannel {
    pub fn new(config: &ChannelConfig) -> std::result::Result<Self, ChannelError> {
        if config.bot_token.is_empty() {
            return Err(ChannelError::Api("CHANNEL_BOT_TOKEN is not set".to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            token: config.bot_token.clone(),
            min_request_gap: Duration::from_millis(config.message_delay_ms),
            last_request: AsyncMutex::new(None),
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token, method)
    }

    async fn pace(&self) {
        let wait = {
            let mut last = self.last_request.lock().await;
            let wait = last
                .map(|at| self.min_request_gap.saturating_sub(at.elapsed()))
                .unwrap_or(Duration::ZERO);
            *last = Some(Instant::now() + wait);
            wait
        };
        if !wait.is_zero() {
            debug!("Pacing channel API, waiting {:?}", wait);
            tokio::time::sleep(wait).await;
        }
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> std::result::Result<T, ChannelError> {
        self.pace().await;
        debug!("Channel API call: {}", method);
        let response = self
            .client
            .post(self.method_url(method))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let envelope: ApiEnvelope<T> = response
            .json()
            .await
            .map_err(|e| ChannelError::Api(format!("malformed response: {}", e)))?;

        if !envelope.ok {
            let description = envelope.description.unwrap_or_default();
            if status.as_u16() == 429 {
                let retry_after_secs = envelope
                    .parameters
                    .and_then(|p| p.retry_after)
                    .unwrap_or(30);
                return Err(ChannelError::FloodWait { retry_after_secs });
            }
            if status.as_u16() == 403 {
                return Err(ChannelError::Forbidden);
            }
            if status.as_u16() == 400 && description.to_lowercase().contains("not found") {
                return Err(ChannelError::NotFound);
            }
            return Err(ChannelError::Api(description));
        }
        envelope
            .result
            .ok_or_else(|| ChannelError::Api("missing result".to_string()))
    }
}

#[async_trait]
impl BroadcastChannel for HttpBroadcastChannel {
    async fn post(
        &self,
        channel: &str,
        text: &str,
        image_ref: Option<&str>,
    ) -> std::result::Result<i64, ChannelError> {
        let sent: SentMessage = match image_ref {
            Some(image) => {
                self.call(
                    "sendPhoto",
                    json!({ "chat_id": channel, "photo": image, "caption": text }),
                )
                .await?
            }
            None => {
                self.call(
                    "sendMessage",
                    json!({ "chat_id": channel, "text": text }),
                )
                .await?
            }
        };
        Ok(sent.message_id)
    }

    async fn fetch_messages(
        &self,
        channel: &str,
        limit: usize,
    ) -> std::result::Result<Vec<ChannelMessage>, ChannelError> {
        let wire: Vec<WireMessage> = self
            .call(
                "getChannelHistory",
                json!({ "chat_id": channel, "limit": limit }),
            )
            .await?;
        Ok(wire
            .into_iter()
            .filter_map(|m| {
                let text = m.text?;
                let date = Utc.timestamp_opt(m.date, 0).single()?;
                Some(ChannelMessage {
                    id: m.message_id,
                    text,
                    date,
                })
            })
            .collect())
    }

    async fn message_stats(
        &self,
        channel: &str,
        message_id: i64,
    ) -> std::result::Result<MessageStats, ChannelError> {
        let wire: WireMessage = self
            .call(
                "getMessageStats",
                json!({ "chat_id": channel, "message_id": message_id }),
            )
            .await?;
        let reactions = wire
            .reactions
            .unwrap_or_default()
            .into_iter()
            .map(|r| (r.emoji, r.count))
            .collect();
        Ok(MessageStats {
            views: wire.views.unwrap_or(0),
            reactions,
            forwards: wire.forwards.unwrap_or(0),
        })
    }
}

/// Test double: records posts, serves scripted history and stats.
pub struct MockChannel {
    posts: Mutex<Vec<(String, String, Option<String>)>>,
    messages: Mutex<Vec<ChannelMessage>>,
    stats: Mutex<HashMap<i64, MessageStats>>,
    stat_errors: Mutex<HashMap<i64, &'static str>>,
    next_message_id: AtomicI64,
}

impl MockChannel {
    pub fn new() -> Self {
        Self {
            posts: Mutex::new(Vec::new()),
            messages: Mutex::new(Vec::new()),
            stats: Mutex::new(HashMap::new()),
            stat_errors: Mutex::new(HashMap::new()),
            next_message_id: AtomicI64::new(1000),
        }
    }

    pub fn seed_messages(&self, messages: Vec<ChannelMessage>) {
        if let Ok(mut stored) = self.messages.lock() {
            *stored = messages;
        }
    }

    pub fn set_stats(&self, message_id: i64, stats: MessageStats) {
        if let Ok(mut stored) = self.stats.lock() {
            stored.insert(message_id, stats);
        }
    }

    /// Make `message_stats` fail for one message ("not_found" or
    /// "forbidden").
    pub fn set_stat_error(&self, message_id: i64, kind: &'static str) {
        if let Ok(mut stored) = self.stat_errors.lock() {
            stored.insert(message_id, kind);
        }
    }

    pub fn post_count(&self) -> usize {
        self.posts.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn posts(&self) -> Vec<(String, String, Option<String>)> {
        self.posts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

impl Default for MockChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BroadcastChannel for MockChannel {
    async fn post(
        &self,
        channel: &str,
        text: &str,
        image_ref: Option<&str>,
    ) -> std::result::Result<i64, ChannelError> {
        if let Ok(mut posts) = self.posts.lock() {
            posts.push((
                channel.to_string(),
                text.to_string(),
                image_ref.map(|s| s.to_string()),
            ));
        }
        Ok(self.next_message_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn fetch_messages(
        &self,
        _channel: &str,
        limit: usize,
    ) -> std::result::Result<Vec<ChannelMessage>, ChannelError> {
        let mut messages = self
            .messages
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default();
        messages.truncate(limit);
        Ok(messages)
    }

    async fn message_stats(
        &self,
        _channel: &str,
        message_id: i64,
    ) -> std::result::Result<MessageStats, ChannelError> {
        if let Ok(errors) = self.stat_errors.lock() {
            match errors.get(&message_id) {
                Some(&"forbidden") => return Err(ChannelError::Forbidden),
                Some(_) => return Err(ChannelError::NotFound),
                None => {}
            }
        }
        Ok(self
            .stats
            .lock()
            .ok()
            .and_then(|s| s.get(&message_id).cloned())
            .unwrap_or_default())
    }
}
