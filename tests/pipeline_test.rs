use chrono::{Duration, Utc};
use news_aggregator::budget::BudgetGuard;
use news_aggregator::channel::{ChannelMessage, MessageStats, MockChannel};
use news_aggregator::config::{
    AppConfig, BudgetConfig, ChannelConfig, CleanerConfig, FetchConfig, FilterConfig, LlmConfig,
    MediaConfig, MetricsConfig, OrchestratorConfig, PricingTable, PublisherConfig,
};
use news_aggregator::engine::DraftingEngine;
use news_aggregator::moderation::{ModerationQueue, ReviewOutcome};
use news_aggregator::orchestrator::{ChannelNotifier, Orchestrator, Stage, StageOutcome};
use news_aggregator::provider::MockProvider;
use news_aggregator::sources::{ChannelFetcher, FeedFetcher, FetcherSet, HttpFetcher, SearchFetcher};
use news_aggregator::store::{MemoryStore, Store};
use news_aggregator::types::{
    ApiUsageRecord, DraftStatus, ItemStatus, OperationKind, ProviderError, RawCandidate,
    RejectionReason, SourceConfig, SourceKind,
};
use news_aggregator::MockImageGenerator;
use std::sync::Arc;
use uuid::Uuid;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn test_config() -> AppConfig {
    AppConfig {
        database_url: "postgresql://unused".to_string(),
        fetch: FetchConfig::default(),
        filter: FilterConfig::default(),
        cleaner: CleanerConfig::default(),
        llm: LlmConfig::default(),
        budget: BudgetConfig::default(),
        channel: ChannelConfig {
            broadcast_channel: "@digest".to_string(),
            reviewer_chat: "@reviewers".to_string(),
            message_delay_ms: 0,
            source_delay_ms: 0,
            ..ChannelConfig::default()
        },
        publisher: PublisherConfig::default(),
        metrics: MetricsConfig::default(),
        media: MediaConfig::default(),
        orchestrator: OrchestratorConfig::default(),
        pricing: PricingTable::builtin(),
    }
}

fn article(headline: &str, detail: &str) -> String {
    format!(
        "{}\n\nArtificial intelligence tools are reshaping legal work. {} \
         Compliance teams and court observers say the regulation debate will \
         continue through the year as more firms adopt machine learning systems \
         for contract review and litigation support across every practice area.",
        headline, detail
    )
}

fn seed_channel_messages(channel: &MockChannel) {
    channel.seed_messages(vec![
        ChannelMessage {
            id: 1,
            text: article(
                "Court rules on AI-generated evidence admissibility",
                "The appellate ruling sets strict authentication conditions for model outputs.",
            ),
            date: Utc::now() - Duration::hours(2),
        },
        ChannelMessage {
            id: 2,
            text: article(
                "Bar association publishes AI ethics guideline for lawyers",
                "The guideline covers confidentiality duties when using drafting assistants.",
            ),
            date: Utc::now() - Duration::hours(3),
        },
        ChannelMessage {
            id: 3,
            text: article(
                "EU parliament advances AI liability directive",
                "The directive would extend strict liability to providers of high-risk systems.",
            ),
            date: Utc::now() - Duration::hours(4),
        },
    ]);
}

fn build_orchestrator(
    store: Arc<MemoryStore>,
    provider: Arc<MockProvider>,
    channel: Arc<MockChannel>,
    config: AppConfig,
) -> Orchestrator {
    let http = Arc::new(HttpFetcher::new(config.fetch.clone()).expect("http fetcher"));
    let fetchers = FetcherSet::new(
        FeedFetcher::new(http.clone(), config.fetch.max_items_per_source),
        SearchFetcher::new(http, config.fetch.max_items_per_source),
        ChannelFetcher::new(channel.clone(), config.channel.clone()),
    );
    let notifier = Arc::new(ChannelNotifier::new(
        channel.clone(),
        config.channel.reviewer_chat.clone(),
    ));
    Orchestrator::new(
        store,
        provider,
        channel,
        Arc::new(MockImageGenerator),
        notifier,
        fetchers,
        config,
    )
}

fn script_full_cycle(provider: &MockProvider) {
    // Three ranking calls in discovery order, then three draft calls.
    provider.push_text("8", 200, 2);
    provider.push_text("5", 200, 2);
    provider.push_text("9", 200, 2);
    for _ in 0..3 {
        provider.push_text(
            "Generated headline\n\nGenerated body paragraph with the key facts.",
            800,
            200,
        );
    }
}

#[tokio::test]
async fn full_pipeline_from_fetch_to_publication() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let provider = Arc::new(MockProvider::new());
    let channel = Arc::new(MockChannel::new());
    seed_channel_messages(&channel);
    script_full_cycle(&provider);

    store
        .upsert_source(&SourceConfig::new(
            "legal_news",
            "@legal_news",
            SourceKind::Channel,
        ))
        .await
        .unwrap();

    let orchestrator =
        build_orchestrator(store.clone(), provider.clone(), channel.clone(), test_config());
    let report = orchestrator.run().await;

    assert!(report.failed_stages().is_empty(), "{}", report.summary());
    assert_eq!(
        report.stages[0].outcome,
        StageOutcome::Completed { processed: 3 }
    );
    assert_eq!(
        report.stages[2].outcome,
        StageOutcome::Completed { processed: 3 }
    );

    // All three items drafted, all drafts pending review.
    let pending = store
        .drafts_with_status(DraftStatus::PendingReview, 10)
        .await
        .unwrap();
    assert_eq!(pending.len(), 3);

    // The reviewer chat got exactly one notification; nothing was
    // published yet.
    let posts = channel.posts();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].0, "@reviewers");
    assert!(posts[0].1.contains("3 draft(s)"));

    // Approve one draft, reject another, publish.
    let queue = ModerationQueue::new(store.clone());
    let outcome = queue.approve(pending[0].id, 42).await.unwrap();
    assert_eq!(outcome, ReviewOutcome::Applied);
    queue
        .reject(pending[1].id, RejectionReason::NotRelevant, 42)
        .await
        .unwrap();
    let rejected = store.draft(pending[1].id).await.unwrap();
    assert_eq!(rejected.status, DraftStatus::Rejected);
    assert_eq!(rejected.rejection_reason, Some(RejectionReason::NotRelevant));

    let publish = orchestrator.run_stage(Stage::Publish).await;
    assert_eq!(publish.outcome, StageOutcome::Completed { processed: 1 });

    let posts = channel.posts();
    assert_eq!(posts.len(), 2);
    assert_eq!(posts[1].0, "@digest");

    // Engagement metrics flow back on the next sweep.
    let publication = store
        .publication_for_draft(pending[0].id)
        .await
        .unwrap()
        .expect("publication exists");
    channel.set_stats(
        publication.message_id,
        MessageStats {
            views: 120,
            reactions: [("👍".to_string(), 4)].into_iter().collect(),
            forwards: 2,
        },
    );
    orchestrator.refresh_metrics().await.unwrap();
    let refreshed = store
        .publication_for_draft(pending[0].id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(refreshed.views, 120);
    assert_eq!(refreshed.forwards, 2);
}

#[tokio::test]
async fn rerun_does_not_refetch_or_redraft() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let provider = Arc::new(MockProvider::new());
    let channel = Arc::new(MockChannel::new());
    seed_channel_messages(&channel);
    script_full_cycle(&provider);

    store
        .upsert_source(&SourceConfig::new(
            "legal_news",
            "@legal_news",
            SourceKind::Channel,
        ))
        .await
        .unwrap();

    let orchestrator =
        build_orchestrator(store.clone(), provider.clone(), channel.clone(), test_config());
    orchestrator.run().await;
    let calls_after_first = provider.call_count();
    assert_eq!(calls_after_first, 6);

    // Same channel content on the second run: every dedup key already
    // exists, nothing re-enters the pipeline, no paid calls happen.
    let report = orchestrator.run().await;
    assert_eq!(provider.call_count(), calls_after_first);
    assert_eq!(report.stages[0].outcome, StageOutcome::NoOp);
    assert_eq!(report.stages[1].outcome, StageOutcome::NoOp);
    assert_eq!(report.stages[2].outcome, StageOutcome::NoOp);

    let drafted = store
        .items_with_status(ItemStatus::Drafted, 10)
        .await
        .unwrap();
    assert_eq!(drafted.len(), 3);
}

#[tokio::test]
async fn halted_budget_leaves_items_queued() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    // Burn past the hard limit before the run.
    store
        .record_usage(&ApiUsageRecord {
            id: Uuid::new_v4(),
            provider: "openai".to_string(),
            model: "gpt-4o".to_string(),
            operation: OperationKind::DraftGeneration,
            prompt_tokens: 0,
            completion_tokens: 0,
            cost_usd: 10.01,
            item_id: None,
            draft_id: None,
            created_at: Utc::now(),
        })
        .await
        .unwrap();

    let candidate = RawCandidate {
        dedup_key: "https://example.com/halted".to_string(),
        title: "Court rules on AI evidence".to_string(),
        body: article("Court rules on AI evidence", "Details of the ruling."),
        source_name: "legal_news".to_string(),
        published_at: Some(Utc::now()),
        fetched_at: Utc::now(),
    };
    store.ingest_item(&candidate).await.unwrap();

    let provider = Arc::new(MockProvider::new());
    let config = test_config();
    let budget = Arc::new(BudgetGuard::new(
        store.clone(),
        config.budget.clone(),
        config.pricing.clone(),
    ));
    let engine = DraftingEngine::new(
        store.clone(),
        provider.clone(),
        budget,
        config.llm.clone(),
        config.orchestrator.top_items_per_cycle,
    );

    // Move the item through the clean pass first.
    let items = store.items_with_status(ItemStatus::New, 10).await.unwrap();
    store
        .transition_item(items[0].id, ItemStatus::Accepted)
        .await
        .unwrap();

    let stats = engine.process_accepted(None).await.unwrap();
    assert!(stats.halted);
    assert_eq!(stats.drafted, 0);
    assert_eq!(provider.call_count(), 0);

    // The item is still accepted and will be drafted next month.
    let accepted = store
        .items_with_status(ItemStatus::Accepted, 10)
        .await
        .unwrap();
    assert_eq!(accepted.len(), 1);
}

#[tokio::test]
async fn repeated_provider_failures_mark_the_item_failed() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let candidate = RawCandidate {
        dedup_key: "https://example.com/flaky".to_string(),
        title: "Court rules on AI evidence".to_string(),
        body: article("Court rules on AI evidence", "Details of the ruling."),
        source_name: "legal_news".to_string(),
        published_at: Some(Utc::now()),
        fetched_at: Utc::now(),
    };
    store.ingest_item(&candidate).await.unwrap();
    let items = store.items_with_status(ItemStatus::New, 10).await.unwrap();
    store
        .transition_item(items[0].id, ItemStatus::Accepted)
        .await
        .unwrap();

    let provider = Arc::new(MockProvider::new());
    let config = test_config();
    let budget = Arc::new(BudgetGuard::new(
        store.clone(),
        config.budget.clone(),
        config.pricing.clone(),
    ));
    let engine = DraftingEngine::new(
        store.clone(),
        provider.clone(),
        budget,
        config.llm.clone(),
        config.orchestrator.top_items_per_cycle,
    );

    // Three cycles: rank succeeds, draft generation times out each time.
    for _ in 0..3 {
        provider.push_text("7", 100, 2);
        provider.push_error(ProviderError::Timeout);
    }
    for _ in 0..2 {
        let stats = engine.process_accepted(None).await.unwrap();
        assert_eq!(stats.drafted, 0);
        assert_eq!(stats.failed, 0);
    }
    let stats = engine.process_accepted(None).await.unwrap();
    assert_eq!(stats.failed, 1);

    let item = store.item(items[0].id).await.unwrap();
    assert_eq!(item.status, ItemStatus::Failed);
    assert_eq!(item.attempts, 3);
}

#[tokio::test]
async fn approve_after_publish_remains_single_publication() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let provider = Arc::new(MockProvider::new());
    let channel = Arc::new(MockChannel::new());
    seed_channel_messages(&channel);
    script_full_cycle(&provider);

    store
        .upsert_source(&SourceConfig::new(
            "legal_news",
            "@legal_news",
            SourceKind::Channel,
        ))
        .await
        .unwrap();

    let orchestrator =
        build_orchestrator(store.clone(), provider.clone(), channel.clone(), test_config());
    orchestrator.run().await;

    let queue = ModerationQueue::new(store.clone());
    let pending = queue.list_pending(10).await.unwrap();
    queue.approve(pending[0].id, 1).await.unwrap();

    // Publish twice; the second pass must notice the existing
    // publication and post nothing new.
    orchestrator.run_stage(Stage::Publish).await;
    let broadcast_posts = channel
        .posts()
        .into_iter()
        .filter(|(target, _, _)| target == "@digest")
        .count();
    let second = orchestrator.run_stage(Stage::Publish).await;
    assert_eq!(second.outcome, StageOutcome::Completed { processed: 0 });
    let broadcast_posts_after = channel
        .posts()
        .into_iter()
        .filter(|(target, _, _)| target == "@digest")
        .count();
    assert_eq!(broadcast_posts, 1);
    assert_eq!(broadcast_posts_after, 1);

    // A second approve tap is a no-op, not a second publication.
    assert_eq!(
        queue.approve(pending[0].id, 1).await.unwrap(),
        ReviewOutcome::AlreadyReviewed(DraftStatus::Approved)
    );
}
