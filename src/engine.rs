use crate::budget::{BudgetDecision, BudgetGuard};
use crate::config::LlmConfig;
use crate::provider::{CompletionRequest, LlmProvider};
use crate::store::Store;
use crate::types::{Draft, DraftStatus, ItemStatus, OperationKind, RawItem, Result};
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

const RANKING_SYSTEM_PROMPT: &str = "You are an editor for a professional newsletter covering \
AI in the legal and business world. Rate how newsworthy the following article is for that \
audience on a scale from 0 to 10. Respond with a single number.";

const DRAFT_SYSTEM_PROMPT: &str = "You are an editor for a professional newsletter covering \
AI in the legal and business world. Write a concise, factual post about the following article. \
Start with a short headline on its own line, then 2-3 paragraphs. Do not invent facts.";

#[derive(Debug, Clone, Copy, Default)]
pub struct EngineStats {
    pub ranked: usize,
    pub drafted: usize,
    pub failed: usize,
    /// True when the budget guard refused further paid calls.
    pub halted: bool,
}

/// Ranks accepted items and generates drafts for the top of the list.
/// Every paid call goes through the budget guard first.
pub struct DraftingEngine {
    store: Arc<dyn Store>,
    provider: Arc<dyn LlmProvider>,
    budget: Arc<BudgetGuard>,
    config: LlmConfig,
    top_items_per_cycle: usize,
}

impl DraftingEngine {
    pub fn new(
        store: Arc<dyn Store>,
        provider: Arc<dyn LlmProvider>,
        budget: Arc<BudgetGuard>,
        config: LlmConfig,
        top_items_per_cycle: usize,
    ) -> Self {
        Self {
            store,
            provider,
            budget,
            config,
            top_items_per_cycle,
        }
    }

    fn model_for(&self, decision: BudgetDecision) -> &str {
        match decision {
            BudgetDecision::CheapTier => &self.config.cheap_model,
            _ => &self.config.model,
        }
    }

    /// Rank accepted items and draft the top ones. Checks the deadline
    /// between items; unprocessed items simply stay `accepted`.
    pub async fn process_accepted(&self, deadline: Option<Instant>) -> Result<EngineStats> {
        let mut stats = EngineStats::default();

        let items = self
            .store
            .items_with_status(ItemStatus::Accepted, 500)
            .await?;
        if items.is_empty() {
            return Ok(stats);
        }

        let quality_weights: HashMap<String, f64> = self
            .store
            .enabled_sources()
            .await?
            .into_iter()
            .map(|s| (s.name, s.quality_weight))
            .collect();
        let publication_counts = self
            .store
            .publication_counts_by_source(Utc::now() - Duration::days(7))
            .await?;

        let mut scored: Vec<(RawItem, f64)> = Vec::with_capacity(items.len());
        for item in items {
            if past_deadline(deadline) {
                info!("Run budget exhausted during ranking, stopping early");
                break;
            }
            let decision = self.budget.decision().await?;
            let base = if decision == BudgetDecision::Halted {
                stats.halted = true;
                0.0
            } else {
                self.llm_rank(&item, self.model_for(decision)).await?
            };
            let composite = base
                + diversity_boost(&publication_counts, &item.source_name)
                + quality_weights
                    .get(&item.source_name)
                    .copied()
                    .unwrap_or(0.5)
                + recency_bonus(&item);
            let composite = composite.clamp(0.0, 15.0);
            self.store.set_item_score(item.id, composite).await?;
            stats.ranked += 1;
            scored.push((item, composite));
        }

        // Highest score first; on ties, the earlier discovery wins.
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.discovered_at.cmp(&b.0.discovered_at))
        });

        for (item, score) in scored.into_iter().take(self.top_items_per_cycle) {
            if past_deadline(deadline) {
                info!("Run budget exhausted during drafting, stopping early");
                break;
            }
            let decision = self.budget.decision().await?;
            if decision == BudgetDecision::Halted {
                stats.halted = true;
                info!("Budget halted, leaving remaining items queued");
                break;
            }
            match self.draft_item(&item, score, self.model_for(decision)).await {
                Ok(()) => stats.drafted += 1,
                Err(DraftFailure::GaveUp) => stats.failed += 1,
                Err(DraftFailure::WillRetry) => {}
            }
        }

        info!(
            "Analyze pass: {} ranked, {} drafted, {} failed{}",
            stats.ranked,
            stats.drafted,
            stats.failed,
            if stats.halted { " (budget halted)" } else { "" }
        );
        Ok(stats)
    }

    async fn llm_rank(&self, item: &RawItem, model: &str) -> Result<f64> {
        let request = CompletionRequest {
            model: model.to_string(),
            system: RANKING_SYSTEM_PROMPT.to_string(),
            user: format!("{}\n\n{}", item.title, truncate(&item.body, 2000)),
            max_tokens: 16,
            temperature: 0.0,
        };
        match self.provider.complete(&request).await {
            Ok(completion) => {
                self.budget
                    .charge(
                        self.provider.name(),
                        model,
                        OperationKind::Ranking,
                        completion.usage,
                        Some(item.id),
                        None,
                    )
                    .await?;
                Ok(parse_score(&completion.text))
            }
            Err(e) => {
                warn!("Ranking call failed for '{}': {}", item.title, e);
                Ok(0.0)
            }
        }
    }

    async fn draft_item(
        &self,
        item: &RawItem,
        score: f64,
        model: &str,
    ) -> std::result::Result<(), DraftFailure> {
        let request = CompletionRequest {
            model: model.to_string(),
            system: DRAFT_SYSTEM_PROMPT.to_string(),
            user: format!("{}\n\n{}", item.title, truncate(&item.body, 6000)),
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        };

        match self.provider.complete(&request).await {
            Ok(completion) => {
                if let Err(e) = self
                    .budget
                    .charge(
                        self.provider.name(),
                        model,
                        OperationKind::DraftGeneration,
                        completion.usage,
                        Some(item.id),
                        None,
                    )
                    .await
                {
                    warn!("Failed to record usage: {}", e);
                }
                let draft = build_draft(item, &completion.text, score);
                if let Err(e) = self.store.insert_draft(&draft).await {
                    warn!("Failed to store draft for '{}': {}", item.title, e);
                    return Err(DraftFailure::WillRetry);
                }
                if let Err(e) = self
                    .store
                    .transition_item(item.id, ItemStatus::Drafted)
                    .await
                {
                    warn!("Failed to mark '{}' drafted: {}", item.title, e);
                }
                info!("Drafted '{}' (score {:.1})", draft.title, score);
                Ok(())
            }
            Err(e) if e.is_retryable() => {
                let attempts = self
                    .store
                    .bump_item_attempts(item.id)
                    .await
                    .unwrap_or(i32::MAX);
                if attempts >= self.config.attempt_cap {
                    warn!(
                        "Giving up on '{}' after {} attempts: {}",
                        item.title, attempts, e
                    );
                    let _ = self.store.transition_item(item.id, ItemStatus::Failed).await;
                    Err(DraftFailure::GaveUp)
                } else {
                    warn!(
                        "Draft attempt {} failed for '{}', will retry next cycle: {}",
                        attempts, item.title, e
                    );
                    Err(DraftFailure::WillRetry)
                }
            }
            Err(e) => {
                warn!("Permanent draft failure for '{}': {}", item.title, e);
                let _ = self.store.transition_item(item.id, ItemStatus::Failed).await;
                Err(DraftFailure::GaveUp)
            }
        }
    }
}

enum DraftFailure {
    /// Item stays accepted and will be retried on a later cycle.
    WillRetry,
    /// Attempt cap reached or permanent error; item marked failed.
    GaveUp,
}

fn past_deadline(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

fn build_draft(item: &RawItem, generated: &str, score: f64) -> Draft {
    let (title, body) = split_title(generated, &item.title);
    Draft {
        id: Uuid::new_v4(),
        item_id: item.id,
        title,
        body,
        summary: None,
        image_ref: None,
        confidence: (score / 10.0).clamp(0.0, 1.0),
        status: DraftStatus::PendingReview,
        reviewed_by: None,
        reviewed_at: None,
        rejection_reason: None,
        edit_count: 0,
        created_at: Utc::now(),
    }
}

/// The first non-empty line of the generated text becomes the headline
/// (markdown markers stripped, clamped); the rest is the body. Falls
/// back to the source title when the output is a single block.
fn split_title(generated: &str, fallback: &str) -> (String, String) {
    let mut lines = generated.trim().lines();
    let first = lines
        .next()
        .map(|l| l.trim_matches(|c: char| c == '#' || c == '*' || c == ' '))
        .unwrap_or("");
    let rest: String = lines.collect::<Vec<_>>().join("\n").trim().to_string();

    if first.is_empty() || rest.is_empty() {
        let title = truncate(fallback, 120).to_string();
        return (title, generated.trim().to_string());
    }
    (truncate(first, 120).to_string(), rest)
}

/// Pull the first number out of a ranking response, clamped to [0, 10].
fn parse_score(text: &str) -> f64 {
    let cleaned: String = text
        .chars()
        .map(|c| if c.is_ascii_digit() || c == '.' { c } else { ' ' })
        .collect();
    cleaned
        .split_whitespace()
        .find_map(|t| t.parse::<f64>().ok())
        .map(|s| s.clamp(0.0, 10.0))
        .unwrap_or_else(|| {
            warn!("Unparseable ranking response: {:?}", truncate(text, 80));
            0.0
        })
}

/// Boost sources the channel has not featured recently; penalize the
/// dominant one.
fn diversity_boost(counts: &HashMap<String, i64>, source: &str) -> f64 {
    let count = counts.get(source).copied().unwrap_or(0);
    if count == 0 {
        return 1.5;
    }
    let total: i64 = counts.values().sum();
    let avg = total as f64 / counts.len() as f64;
    if (count as f64) < avg {
        1.0
    } else if count as f64 > avg * 1.5 {
        -0.5
    } else {
        0.0
    }
}

fn recency_bonus(item: &RawItem) -> f64 {
    match item.published_at {
        Some(published) => {
            let age = Utc::now() - published;
            if age < Duration::hours(6) {
                1.0
            } else if age < Duration::hours(24) {
                0.5
            } else {
                0.0
            }
        }
        None => 0.0,
    }
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_score_handles_common_shapes() {
        assert_eq!(parse_score("7"), 7.0);
        assert_eq!(parse_score("Score: 8.5"), 8.5);
        assert_eq!(parse_score("9/10"), 9.0);
        assert_eq!(parse_score("42"), 10.0);
        assert_eq!(parse_score("no idea"), 0.0);
    }

    #[test]
    fn split_title_takes_first_line() {
        let (title, body) = split_title("# Big ruling\n\nThe court decided.", "fallback");
        assert_eq!(title, "Big ruling");
        assert_eq!(body, "The court decided.");
    }

    #[test]
    fn split_title_falls_back_on_single_block() {
        let (title, body) = split_title("Just one paragraph of text.", "Original headline");
        assert_eq!(title, "Original headline");
        assert_eq!(body, "Just one paragraph of text.");
    }

    #[test]
    fn diversity_boost_tiers() {
        let mut counts = HashMap::new();
        counts.insert("a".to_string(), 1);
        counts.insert("b".to_string(), 5);
        assert_eq!(diversity_boost(&counts, "never_seen"), 1.5);
        assert_eq!(diversity_boost(&counts, "a"), 1.0);
        assert_eq!(diversity_boost(&counts, "b"), -0.5);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("ab", 10), "ab");
    }
}
