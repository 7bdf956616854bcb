use crate::budget::{BudgetDecision, BudgetGuard};
use crate::config::MediaConfig;
use crate::store::Store;
use crate::types::{DraftStatus, OperationKind, ProviderError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Image-generation boundary, flat-priced per image.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    fn name(&self) -> &str;

    /// Generate an illustration, returning a URL or storage reference.
    async fn generate(&self, prompt: &str) -> std::result::Result<String, ProviderError>;
}

#[derive(Deserialize)]
struct ImageResponse {
    data: Vec<ImageDatum>,
}

#[derive(Deserialize)]
struct ImageDatum {
    url: String,
}

/// OpenAI-compatible images endpoint.
pub struct HttpImageGenerator {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
    size: String,
}

impl HttpImageGenerator {
    pub fn new(
        api_base: &str,
        api_key: &str,
        config: &MediaConfig,
    ) -> std::result::Result<Self, ProviderError> {
        if api_key.is_empty() {
            return Err(ProviderError::InvalidRequest(
                "image generation requires an API key".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: config.model.clone(),
            size: config.size.clone(),
        })
    }
}

#[async_trait]
impl ImageGenerator for HttpImageGenerator {
    fn name(&self) -> &str {
        "openai"
    }

    async fn generate(&self, prompt: &str) -> std::result::Result<String, ProviderError> {
        let response = self
            .client
            .post(format!("{}/images/generations", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "prompt": prompt,
                "n": 1,
                "size": self.size,
            }))
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
            return Err(ProviderError::RateLimited {
                retry_after_secs: 60,
            });
        }
        if status.is_client_error() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ProviderError::InvalidRequest(format!("{}: {}", status, detail)));
        }
        if status.is_server_error() {
            return Err(ProviderError::Server(status.to_string()));
        }

        let parsed: ImageResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;
        parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.url)
            .ok_or_else(|| ProviderError::Malformed("empty image data".to_string()))
    }
}

/// Test double returning deterministic references.
pub struct MockImageGenerator;

#[async_trait]
impl ImageGenerator for MockImageGenerator {
    fn name(&self) -> &str {
        "mock"
    }

    async fn generate(&self, prompt: &str) -> std::result::Result<String, ProviderError> {
        Ok(format!("mock://image/{}", prompt.len()))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MediaStats {
    pub generated: usize,
    pub skipped: usize,
    pub halted: bool,
}

/// Fills in missing illustrations for pending drafts. Disabled by
/// default; every image is a paid call gated by the budget guard.
pub struct MediaStage {
    store: Arc<dyn Store>,
    generator: Arc<dyn ImageGenerator>,
    budget: Arc<BudgetGuard>,
    config: MediaConfig,
}

impl MediaStage {
    pub fn new(
        store: Arc<dyn Store>,
        generator: Arc<dyn ImageGenerator>,
        budget: Arc<BudgetGuard>,
        config: MediaConfig,
    ) -> Self {
        Self {
            store,
            generator,
            budget,
            config,
        }
    }

    pub async fn run(&self) -> Result<MediaStats> {
        let mut stats = MediaStats::default();
        if !self.config.enabled {
            return Ok(stats);
        }

        let drafts = self
            .store
            .drafts_with_status(DraftStatus::PendingReview, 50)
            .await?;
        for draft in drafts {
            if draft.image_ref.is_some() {
                stats.skipped += 1;
                continue;
            }
            if self.budget.decision().await? == BudgetDecision::Halted {
                stats.halted = true;
                info!("Budget halted, skipping remaining image generation");
                break;
            }
            let prompt = format!(
                "Minimalist editorial illustration for a news post titled: {}",
                draft.title
            );
            match self.generator.generate(&prompt).await {
                Ok(image_ref) => {
                    self.store.set_draft_image(draft.id, &image_ref).await?;
                    self.budget
                        .charge_flat(
                            self.generator.name(),
                            &self.config.model,
                            OperationKind::MediaGeneration,
                            Some(draft.id),
                        )
                        .await?;
                    stats.generated += 1;
                }
                Err(e) => {
                    // Drafts remain reviewable without an image.
                    warn!("Image generation failed for '{}': {}", draft.title, e);
                }
            }
        }

        info!(
            "Media pass: {} generated, {} already illustrated",
            stats.generated, stats.skipped
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BudgetConfig, PricingTable};
    use crate::store::MemoryStore;
    use crate::types::Draft;
    use chrono::Utc;
    use uuid::Uuid;

    fn pending_draft() -> Draft {
        Draft {
            id: Uuid::new_v4(),
            item_id: Uuid::new_v4(),
            title: "Court rules on AI evidence".to_string(),
            body: "Body.".to_string(),
            summary: None,
            image_ref: None,
            confidence: 0.8,
            status: DraftStatus::PendingReview,
            reviewed_by: None,
            reviewed_at: None,
            rejection_reason: None,
            edit_count: 0,
            created_at: Utc::now(),
        }
    }

    fn stage(store: Arc<MemoryStore>, enabled: bool) -> MediaStage {
        let budget = Arc::new(BudgetGuard::new(
            store.clone(),
            BudgetConfig::default(),
            PricingTable::builtin(),
        ));
        MediaStage::new(
            store,
            Arc::new(MockImageGenerator),
            budget,
            MediaConfig {
                enabled,
                ..MediaConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn disabled_stage_is_a_noop() {
        let store = Arc::new(MemoryStore::new());
        store.insert_draft(&pending_draft()).await.unwrap();
        let stats = stage(store.clone(), false).run().await.unwrap();
        assert_eq!(stats.generated, 0);
        let drafts = store
            .drafts_with_status(DraftStatus::PendingReview, 10)
            .await
            .unwrap();
        assert!(drafts[0].image_ref.is_none());
    }

    #[tokio::test]
    async fn fills_missing_images_and_charges_flat_price() {
        let store = Arc::new(MemoryStore::new());
        store.insert_draft(&pending_draft()).await.unwrap();
        let media = stage(store.clone(), true);
        let stats = media.run().await.unwrap();
        assert_eq!(stats.generated, 1);

        let drafts = store
            .drafts_with_status(DraftStatus::PendingReview, 10)
            .await
            .unwrap();
        assert!(drafts[0].image_ref.as_deref().unwrap().starts_with("mock://"));

        let now = Utc::now();
        use chrono::Datelike;
        let spend = store.monthly_spend(now.year(), now.month()).await.unwrap();
        assert!((spend - PricingTable::builtin().image_price_usd).abs() < 1e-9);
    }
}
