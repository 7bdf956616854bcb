use crate::config::{BudgetConfig, PricingTable};
use crate::provider::TokenUsage;
use crate::store::Store;
use crate::types::{ApiUsageRecord, OperationKind, Result};
use chrono::{Datelike, Utc};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// What the current month's spend allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetDecision {
    /// Spend below the warning threshold; use the configured model.
    Normal,
    /// Warning threshold crossed; downgrade to the cheap model.
    CheapTier,
    /// Hard limit crossed; refuse further paid calls this month.
    Halted,
}

/// Tracks monthly LLM spend and gates every paid call. The spend check
/// reads the O(1) monthly aggregate, not the usage log.
pub struct BudgetGuard {
    store: Arc<dyn Store>,
    config: BudgetConfig,
    pricing: PricingTable,
}

impl BudgetGuard {
    pub fn new(store: Arc<dyn Store>, config: BudgetConfig, pricing: PricingTable) -> Self {
        Self {
            store,
            config,
            pricing,
        }
    }

    pub async fn current_spend(&self) -> Result<f64> {
        let now = Utc::now();
        self.store.monthly_spend(now.year(), now.month()).await
    }

    pub async fn decision(&self) -> Result<BudgetDecision> {
        let spend = self.current_spend().await?;
        if self.config.stop_on_exceed && spend > self.config.monthly_limit_usd {
            warn!(
                "Monthly budget exhausted: ${:.2} of ${:.2}",
                spend, self.config.monthly_limit_usd
            );
            return Ok(BudgetDecision::Halted);
        }
        if spend > self.config.warning_threshold_usd {
            info!(
                "Budget warning threshold crossed (${:.2}), switching to cheap tier",
                spend
            );
            return Ok(BudgetDecision::CheapTier);
        }
        Ok(BudgetDecision::Normal)
    }

    /// Record a token-billed call. Returns the computed cost.
    pub async fn charge(
        &self,
        provider: &str,
        model: &str,
        operation: OperationKind,
        usage: TokenUsage,
        item_id: Option<Uuid>,
        draft_id: Option<Uuid>,
    ) -> Result<f64> {
        let cost = self
            .pricing
            .cost(provider, model, usage.prompt_tokens, usage.completion_tokens);
        self.append(provider, model, operation, usage, cost, item_id, draft_id)
            .await?;
        Ok(cost)
    }

    /// Record a flat-priced call (image generation).
    pub async fn charge_flat(
        &self,
        provider: &str,
        model: &str,
        operation: OperationKind,
        draft_id: Option<Uuid>,
    ) -> Result<f64> {
        let cost = self.pricing.image_price_usd;
        self.append(
            provider,
            model,
            operation,
            TokenUsage::default(),
            cost,
            None,
            draft_id,
        )
        .await?;
        Ok(cost)
    }

    async fn append(
        &self,
        provider: &str,
        model: &str,
        operation: OperationKind,
        usage: TokenUsage,
        cost: f64,
        item_id: Option<Uuid>,
        draft_id: Option<Uuid>,
    ) -> Result<()> {
        let record = ApiUsageRecord {
            id: Uuid::new_v4(),
            provider: provider.to_string(),
            model: model.to_string(),
            operation,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            cost_usd: cost,
            item_id,
            draft_id,
            created_at: Utc::now(),
        };
        self.store.record_usage(&record).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::ApiUsageRecord;

    async fn guard_with_spend(spend: f64) -> BudgetGuard {
        let store = Arc::new(MemoryStore::new());
        if spend > 0.0 {
            let record = ApiUsageRecord {
                id: Uuid::new_v4(),
                provider: "openai".to_string(),
                model: "gpt-4o".to_string(),
                operation: OperationKind::DraftGeneration,
                prompt_tokens: 0,
                completion_tokens: 0,
                cost_usd: spend,
                item_id: None,
                draft_id: None,
                created_at: Utc::now(),
            };
            store.record_usage(&record).await.unwrap();
        }
        BudgetGuard::new(store, BudgetConfig::default(), PricingTable::builtin())
    }

    #[tokio::test]
    async fn below_warning_is_normal() {
        let guard = guard_with_spend(7.99).await;
        assert_eq!(guard.decision().await.unwrap(), BudgetDecision::Normal);
    }

    #[tokio::test]
    async fn past_warning_switches_to_cheap_tier() {
        let guard = guard_with_spend(8.01).await;
        assert_eq!(guard.decision().await.unwrap(), BudgetDecision::CheapTier);
    }

    #[tokio::test]
    async fn past_limit_halts() {
        let guard = guard_with_spend(10.01).await;
        assert_eq!(guard.decision().await.unwrap(), BudgetDecision::Halted);
    }

    #[tokio::test]
    async fn exactly_at_thresholds_does_not_trip() {
        let guard = guard_with_spend(8.0).await;
        assert_eq!(guard.decision().await.unwrap(), BudgetDecision::Normal);
        let guard = guard_with_spend(10.0).await;
        assert_eq!(guard.decision().await.unwrap(), BudgetDecision::CheapTier);
    }

    #[tokio::test]
    async fn charge_accumulates_monthly_spend() {
        let guard = guard_with_spend(0.0).await;
        let usage = TokenUsage {
            prompt_tokens: 1_000_000,
            completion_tokens: 1_000_000,
        };
        let cost = guard
            .charge("openai", "gpt-4o-mini", OperationKind::Ranking, usage, None, None)
            .await
            .unwrap();
        assert!((cost - 0.75).abs() < 1e-9);
        assert!((guard.current_spend().await.unwrap() - 0.75).abs() < 1e-9);
    }
}
