use crate::config::LlmConfig;
use crate::types::ProviderError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub system: String,
    pub user: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub usage: TokenUsage,
}

/// Chat-completion boundary. Implementations return typed errors so
/// callers can tell retryable failures from permanent ones.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> std::result::Result<Completion, ProviderError>;
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[derive(Deserialize, Default)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: i64,
    #[serde(default)]
    completion_tokens: i64,
}

/// OpenAI-compatible HTTP provider (bearer auth, /chat/completions).
pub struct HttpLlmProvider {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    provider_name: String,
}

impl HttpLlmProvider {
    pub fn new(config: &LlmConfig) -> std::result::Result<Self, ProviderError> {
        if config.api_key.is_empty() {
            return Err(ProviderError::InvalidRequest(
                "LLM_API_KEY is not set".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            provider_name: config.provider.clone(),
        })
    }
}

#[async_trait]
impl LlmProvider for HttpLlmProvider {
    fn name(&self) -> &str {
        &self.provider_name
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> std::result::Result<Completion, ProviderError> {
        let body = ChatRequest {
            model: &request.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.user,
                },
            ],
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };

        debug!("LLM request: model={}", request.model);
        let response = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout
                } else {
                    ProviderError::Transport(e)
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(60);
            return Err(ProviderError::RateLimited { retry_after_secs });
        }
        if status.is_client_error() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ProviderError::InvalidRequest(format!(
                "{}: {}",
                status, detail
            )));
        }
        if status.is_server_error() {
            return Err(ProviderError::Server(status.to_string()));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Malformed("empty choices".to_string()))?;
        let usage = parsed.usage.unwrap_or_default();

        Ok(Completion {
            text: choice.message.content,
            usage: TokenUsage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
            },
        })
    }
}

/// Scripted provider for tests: pops responses in order and counts
/// calls. An exhausted script keeps returning the last response.
pub struct MockProvider {
    responses: Mutex<Vec<std::result::Result<Completion, ProviderError>>>,
    call_count: AtomicUsize,
    last_response: Mutex<Option<Completion>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
            last_response: Mutex::new(None),
        }
    }

    pub fn push_text(&self, text: &str, prompt_tokens: i64, completion_tokens: i64) {
        if let Ok(mut responses) = self.responses.lock() {
            responses.push(Ok(Completion {
                text: text.to_string(),
                usage: TokenUsage {
                    prompt_tokens,
                    completion_tokens,
                },
            }));
        }
    }

    pub fn push_error(&self, error: ProviderError) {
        if let Ok(mut responses) = self.responses.lock() {
            responses.push(Err(error));
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn complete(
        &self,
        _request: &CompletionRequest,
    ) -> std::result::Result<Completion, ProviderError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        let next = self
            .responses
            .lock()
            .ok()
            .and_then(|mut responses| {
                if responses.is_empty() {
                    None
                } else {
                    Some(responses.remove(0))
                }
            });
        match next {
            Some(Ok(completion)) => {
                if let Ok(mut last) = self.last_response.lock() {
                    *last = Some(completion.clone());
                }
                Ok(completion)
            }
            Some(Err(error)) => Err(error),
            None => {
                let last = self
                    .last_response
                    .lock()
                    .ok()
                    .and_then(|last| last.clone());
                match last {
                    Some(completion) => Ok(completion),
                    None => Err(ProviderError::Server(
                        "mock script exhausted".to_string(),
                    )),
                }
            }
        }
    }
}
