use crate::budget::BudgetGuard;
use crate::channel::BroadcastChannel;
use crate::cleaner::Cleaner;
use crate::config::AppConfig;
use crate::engine::DraftingEngine;
use crate::filter::{FilterStats, RelevanceFilter};
use crate::media::{ImageGenerator, MediaStage};
use crate::metrics::{MetricsCollector, MetricsSweepStats};
use crate::provider::LlmProvider;
use crate::publisher::Publisher;
use crate::sources::FetcherSet;
use crate::store::Store;
use crate::types::{Draft, DraftStatus, IngestOutcome, PipelineError, Result, SourceConfig, SourceKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Pipeline stages in their fixed execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fetch,
    Clean,
    Analyze,
    GenerateMedia,
    NotifyReviewer,
    Publish,
}

impl Stage {
    pub fn all() -> [Stage; 6] {
        [
            Stage::Fetch,
            Stage::Clean,
            Stage::Analyze,
            Stage::GenerateMedia,
            Stage::NotifyReviewer,
            Stage::Publish,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Fetch => "fetch",
            Stage::Clean => "clean",
            Stage::Analyze => "analyze",
            Stage::GenerateMedia => "generate-media",
            Stage::NotifyReviewer => "notify-reviewer",
            Stage::Publish => "publish",
        }
    }
}

impl std::str::FromStr for Stage {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fetch" => Ok(Stage::Fetch),
            "clean" => Ok(Stage::Clean),
            "analyze" => Ok(Stage::Analyze),
            "generate-media" => Ok(Stage::GenerateMedia),
            "notify-reviewer" => Ok(Stage::NotifyReviewer),
            "publish" => Ok(Stage::Publish),
            other => Err(PipelineError::Config(format!("unknown stage: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Completed { processed: usize },
    /// Nothing to do; distinct from failure.
    NoOp,
    /// Remaining stage skipped (run budget exhausted).
    Skipped(String),
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct StageReport {
    pub stage: Stage,
    pub outcome: StageOutcome,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stages: Vec<StageReport>,
}

impl RunReport {
    pub fn summary(&self) -> String {
        let mut lines = vec![format!(
            "Pipeline run {} -> {}",
            self.started_at.format("%H:%M:%S"),
            self.finished_at.format("%H:%M:%S")
        )];
        for report in &self.stages {
            let outcome = match &report.outcome {
                StageOutcome::Completed { processed } => format!("ok ({} processed)", processed),
                StageOutcome::NoOp => "nothing to do".to_string(),
                StageOutcome::Skipped(reason) => format!("skipped: {}", reason),
                StageOutcome::Failed(reason) => format!("FAILED: {}", reason),
            };
            lines.push(format!(
                "  {:<16} {} [{}ms]",
                report.stage.name(),
                outcome,
                report.duration_ms
            ));
        }
        lines.join("\n")
    }

    pub fn failed_stages(&self) -> Vec<Stage> {
        self.stages
            .iter()
            .filter(|r| matches!(r.outcome, StageOutcome::Failed(_)))
            .map(|r| r.stage)
            .collect()
    }
}

/// Tells a human reviewer that drafts are waiting.
#[async_trait]
pub trait ReviewerNotifier: Send + Sync {
    async fn notify(&self, pending: &[Draft]) -> Result<()>;
}

/// Sends the pending-review summary to the reviewer chat.
pub struct ChannelNotifier {
    channel: Arc<dyn BroadcastChannel>,
    reviewer_chat: String,
}

impl ChannelNotifier {
    pub fn new(channel: Arc<dyn BroadcastChannel>, reviewer_chat: String) -> Self {
        Self {
            channel,
            reviewer_chat,
        }
    }
}

#[async_trait]
impl ReviewerNotifier for ChannelNotifier {
    async fn notify(&self, pending: &[Draft]) -> Result<()> {
        let mut text = format!("{} draft(s) awaiting review:\n", pending.len());
        for draft in pending.iter().take(10) {
            text.push_str(&format!("• {}\n", draft.title));
        }
        if pending.len() > 10 {
            text.push_str(&format!("… and {} more\n", pending.len() - 10));
        }
        self.channel.post(&self.reviewer_chat, &text, None).await?;
        Ok(())
    }
}

/// Runs the stage chain. Every stage re-derives its pending work from
/// persisted status, so an interrupted run resumes by just running
/// again: already-fetched items are not re-fetched, already-drafted
/// items are not re-ranked.
pub struct Orchestrator {
    store: Arc<dyn Store>,
    fetchers: FetcherSet,
    filter: RelevanceFilter,
    cleaner: Cleaner,
    engine: DraftingEngine,
    media: MediaStage,
    notifier: Arc<dyn ReviewerNotifier>,
    publisher: Publisher,
    collector: MetricsCollector,
    config: AppConfig,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        provider: Arc<dyn LlmProvider>,
        channel: Arc<dyn BroadcastChannel>,
        image_generator: Arc<dyn ImageGenerator>,
        notifier: Arc<dyn ReviewerNotifier>,
        fetchers: FetcherSet,
        config: AppConfig,
    ) -> Self {
        let budget = Arc::new(BudgetGuard::new(
            store.clone(),
            config.budget.clone(),
            config.pricing.clone(),
        ));
        let filter = RelevanceFilter::new(config.filter.clone());
        let cleaner = Cleaner::new(store.clone(), config.cleaner.clone());
        let engine = DraftingEngine::new(
            store.clone(),
            provider,
            budget.clone(),
            config.llm.clone(),
            config.orchestrator.top_items_per_cycle,
        );
        let media = MediaStage::new(
            store.clone(),
            image_generator,
            budget,
            config.media.clone(),
        );
        let publisher = Publisher::new(
            store.clone(),
            channel.clone(),
            config.channel.broadcast_channel.clone(),
            config.publisher.clone(),
        );
        let collector = MetricsCollector::new(store.clone(), channel, config.metrics.clone());
        Self {
            store,
            fetchers,
            filter,
            cleaner,
            engine,
            media,
            notifier,
            publisher,
            collector,
            config,
        }
    }

    /// Run the full stage chain under the wall-clock budget.
    pub async fn run(&self) -> RunReport {
        let started_at = Utc::now();
        let deadline =
            Instant::now() + Duration::from_secs(self.config.orchestrator.run_budget_seconds);
        let mut stages = Vec::new();

        for stage in Stage::all() {
            if Instant::now() >= deadline {
                info!("Run budget exhausted, skipping stage '{}'", stage.name());
                stages.push(StageReport {
                    stage,
                    outcome: StageOutcome::Skipped("run budget exhausted".to_string()),
                    duration_ms: 0,
                });
                continue;
            }
            stages.push(self.run_stage_with_deadline(stage, Some(deadline)).await);
        }

        let report = RunReport {
            started_at,
            finished_at: Utc::now(),
            stages,
        };
        info!("\n{}", report.summary());
        report
    }

    /// Run a single stage standalone (operator recovery path).
    pub async fn run_stage(&self, stage: Stage) -> StageReport {
        self.run_stage_with_deadline(stage, None).await
    }

    async fn run_stage_with_deadline(
        &self,
        stage: Stage,
        deadline: Option<Instant>,
    ) -> StageReport {
        let start = Instant::now();
        let outcome = match stage {
            Stage::Fetch => self.fetch_stage(deadline).await,
            Stage::Clean => self.clean_stage().await,
            Stage::Analyze => self.analyze_stage(deadline).await,
            Stage::GenerateMedia => self.media_stage().await,
            Stage::NotifyReviewer => self.notify_stage().await,
            Stage::Publish => self.publish_stage().await,
        };
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Stage '{}' failed: {}", stage.name(), e);
                StageOutcome::Failed(e.to_string())
            }
        };
        StageReport {
            stage,
            outcome,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    async fn fetch_stage(&self, deadline: Option<Instant>) -> Result<StageOutcome> {
        let sources = self.store.enabled_sources().await?;
        if sources.is_empty() {
            return Err(PipelineError::Config(
                "no enabled sources configured".to_string(),
            ));
        }

        // Feed and search sources fetch concurrently; their writes are
        // disjoint by dedup key. Channel sources go sequentially to
        // respect platform pacing.
        let (channels, web): (Vec<_>, Vec<_>) = sources
            .into_iter()
            .partition(|s| s.kind == SourceKind::Channel);

        let limit = self.config.fetch.max_items_per_source;
        let web_results = futures::future::join_all(web.iter().map(|source| {
            let fetcher = self.fetchers.for_kind(source.kind);
            async move { (source, fetcher.fetch(source, limit).await) }
        }))
        .await;

        let mut ingested = 0usize;
        let mut filter_stats = FilterStats::default();
        for (source, result) in web_results {
            ingested += self
                .absorb_fetch_result(source, result, &mut filter_stats, deadline)
                .await?;
        }

        for source in &channels {
            if past(deadline) {
                info!("Run budget exhausted, skipping remaining channel sources");
                break;
            }
            let result = self
                .fetchers
                .for_kind(source.kind)
                .fetch(source, limit)
                .await;
            ingested += self
                .absorb_fetch_result(source, result, &mut filter_stats, deadline)
                .await?;
            tokio::time::sleep(Duration::from_millis(self.config.channel.source_delay_ms)).await;
        }

        info!(
            "Fetch stage: {} ingested, {} accepted by filter, {} rejected",
            ingested,
            filter_stats.accepted,
            filter_stats.rejected()
        );
        if ingested == 0 {
            return Ok(StageOutcome::NoOp);
        }
        Ok(StageOutcome::Completed { processed: ingested })
    }

    async fn absorb_fetch_result(
        &self,
        source: &SourceConfig,
        result: Result<Vec<crate::types::RawCandidate>>,
        filter_stats: &mut FilterStats,
        deadline: Option<Instant>,
    ) -> Result<usize> {
        let threshold = self.config.orchestrator.source_error_threshold;
        let candidates = match result {
            Ok(candidates) => {
                self.store
                    .record_fetch_outcome(source.id, true, threshold)
                    .await?;
                candidates
            }
            Err(e) => {
                // One bad source never fails the stage.
                warn!("Fetch failed for source '{}': {}", source.name, e);
                self.store
                    .record_fetch_outcome(source.id, false, threshold)
                    .await?;
                return Ok(0);
            }
        };

        let mut ingested = 0;
        for candidate in candidates {
            if past(deadline) {
                break;
            }
            let verdict = self.filter.classify(&candidate);
            filter_stats.record(verdict);
            if verdict != crate::filter::FilterVerdict::Accept {
                continue;
            }
            if let IngestOutcome::Created(_) = self.store.ingest_item(&candidate).await? {
                ingested += 1;
            }
        }
        Ok(ingested)
    }

    async fn clean_stage(&self) -> Result<StageOutcome> {
        let stats = self.cleaner.run().await?;
        let processed = stats.accepted + stats.duplicates;
        if processed == 0 && stats.stale_marked == 0 {
            return Ok(StageOutcome::NoOp);
        }
        Ok(StageOutcome::Completed { processed })
    }

    async fn analyze_stage(&self, deadline: Option<Instant>) -> Result<StageOutcome> {
        let stats = self.engine.process_accepted(deadline).await?;
        if stats.ranked == 0 {
            return Ok(StageOutcome::NoOp);
        }
        Ok(StageOutcome::Completed {
            processed: stats.drafted,
        })
    }

    async fn media_stage(&self) -> Result<StageOutcome> {
        let stats = self.media.run().await?;
        if stats.generated == 0 {
            return Ok(StageOutcome::NoOp);
        }
        Ok(StageOutcome::Completed {
            processed: stats.generated,
        })
    }

    async fn notify_stage(&self) -> Result<StageOutcome> {
        let pending = self
            .store
            .drafts_with_status(DraftStatus::PendingReview, 50)
            .await?;
        if pending.is_empty() {
            return Ok(StageOutcome::NoOp);
        }
        self.notifier.notify(&pending).await?;
        Ok(StageOutcome::Completed {
            processed: pending.len(),
        })
    }

    async fn publish_stage(&self) -> Result<StageOutcome> {
        let stats = self.publisher.publish_approved().await?;
        if stats.published == 0 && stats.deferred_by_cap == 0 && stats.skipped_existing == 0 {
            return Ok(StageOutcome::NoOp);
        }
        Ok(StageOutcome::Completed {
            processed: stats.published,
        })
    }

    /// Engagement refresh runs on its own schedule, outside the stage
    /// chain.
    pub async fn refresh_metrics(&self) -> Result<MetricsSweepStats> {
        self.collector.refresh_all().await
    }
}

fn past(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}
