use anyhow::Context;
use clap::{Parser, Subcommand};
use news_aggregator::config::AppConfig;
use news_aggregator::orchestrator::{ChannelNotifier, Orchestrator, Stage};
use news_aggregator::sources::{ChannelFetcher, FeedFetcher, FetcherSet, HttpFetcher, SearchFetcher};
use news_aggregator::types::{SourceConfig, SourceKind};
use news_aggregator::{HttpBroadcastChannel, HttpImageGenerator, HttpLlmProvider, PgStore, Store};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "news-aggregator")]
#[command(about = "News aggregation and moderation pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the full stage chain once
    Run,
    /// Run a single stage (fetch, clean, analyze, generate-media,
    /// notify-reviewer, publish)
    Stage { name: String },
    /// Refresh engagement metrics for recent publications
    Metrics,
    /// Print aggregate pipeline statistics
    Stats,
    /// Add or update a source
    AddSource {
        name: String,
        endpoint: String,
        /// feed, search, or channel
        #[arg(default_value = "feed")]
        kind: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = AppConfig::from_env().context("loading configuration")?;

    let store = PgStore::connect(&config.database_url)
        .await
        .context("connecting to database")?;
    store.migrate().await.context("running migrations")?;
    let store: Arc<dyn Store> = Arc::new(store);

    match cli.command {
        Command::Run => {
            let orchestrator = build_orchestrator(store, config)?;
            let report = orchestrator.run().await;
            println!("{}", report.summary());
            if !report.failed_stages().is_empty() {
                std::process::exit(1);
            }
        }
        Command::Stage { name } => {
            let stage: Stage = name.parse()?;
            let orchestrator = build_orchestrator(store, config)?;
            let report = orchestrator.run_stage(stage).await;
            println!("{:<16} {:?} [{}ms]", report.stage.name(), report.outcome, report.duration_ms);
        }
        Command::Metrics => {
            let orchestrator = build_orchestrator(store, config)?;
            let stats = orchestrator.refresh_metrics().await?;
            println!(
                "Metrics sweep: {} refreshed, {} marked stale, {} errors",
                stats.refreshed, stats.marked_stale, stats.errors
            );
        }
        Command::Stats => {
            let stats = store.pipeline_stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::AddSource {
            name,
            endpoint,
            kind,
        } => {
            let kind = SourceKind::parse(&kind)?;
            let source = SourceConfig::new(&name, &endpoint, kind);
            store.upsert_source(&source).await?;
            info!("Source '{}' ({}) saved", name, kind.as_str());
        }
    }

    Ok(())
}

fn build_orchestrator(store: Arc<dyn Store>, config: AppConfig) -> anyhow::Result<Orchestrator> {
    let provider = Arc::new(HttpLlmProvider::new(&config.llm).context("building LLM provider")?);
    let channel = Arc::new(
        HttpBroadcastChannel::new(&config.channel).context("building channel client")?,
    );
    let image_generator = Arc::new(
        HttpImageGenerator::new(&config.llm.api_base, &config.llm.api_key, &config.media)
            .context("building image generator")?,
    );
    let notifier = Arc::new(ChannelNotifier::new(
        channel.clone(),
        config.channel.reviewer_chat.clone(),
    ));

    let http = Arc::new(HttpFetcher::new(config.fetch.clone())?);
    let fetchers = FetcherSet::new(
        FeedFetcher::new(http.clone(), config.fetch.max_items_per_source),
        SearchFetcher::new(http, config.fetch.max_items_per_source),
        ChannelFetcher::new(channel.clone(), config.channel.clone()),
    );

    Ok(Orchestrator::new(
        store,
        provider,
        channel,
        image_generator,
        notifier,
        fetchers,
        config,
    ))
}
