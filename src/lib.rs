pub mod budget;
pub mod channel;
pub mod cleaner;
pub mod config;
pub mod engine;
pub mod filter;
pub mod media;
pub mod metrics;
pub mod moderation;
pub mod orchestrator;
pub mod provider;
pub mod publisher;
pub mod sources;
pub mod store;
pub mod types;

pub use budget::{BudgetDecision, BudgetGuard};
pub use channel::{BroadcastChannel, ChannelMessage, HttpBroadcastChannel, MessageStats, MockChannel};
pub use cleaner::Cleaner;
pub use config::{AppConfig, PricingTable};
pub use engine::DraftingEngine;
pub use filter::{FilterVerdict, RelevanceFilter};
pub use media::{HttpImageGenerator, ImageGenerator, MediaStage, MockImageGenerator};
pub use metrics::MetricsCollector;
pub use moderation::{ModerationQueue, ReviewOutcome};
pub use orchestrator::{
    ChannelNotifier, Orchestrator, ReviewerNotifier, RunReport, Stage, StageOutcome, StageReport,
};
pub use provider::{CompletionRequest, HttpLlmProvider, LlmProvider, MockProvider};
pub use publisher::Publisher;
pub use sources::{ChannelFetcher, FeedFetcher, FetcherSet, HttpFetcher, SearchFetcher, SourceFetcher};
pub use store::{MemoryStore, PgStore, Store};
pub use types::{PipelineError, Result};
