//! Shared application state and the HTTP router.

use std::sync::Arc;

use axum::{Router, routing::get};
use tokio_util::task::TaskTracker;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

use crate::{
    auth::TokenTable,
    chat_log::ChatLogger,
    config::GatewayConfig,
    content_policy::{ContentPolicy, ContentPolicyError, KeywordPolicy},
    db::{DbError, DbPool},
    jobs::JobQueue,
    ledger::{AccountId, LedgerError},
    middleware,
    pricing::PricingStore,
    providers::AdaptorRegistry,
    relay::{PipelineParts, QuotaService, RelayPipeline, RelaySettings},
    routes,
    routing::ChannelTable,
    tokenizer,
    usage_buffer::{ConsumeBufferConfig, ConsumeLogBuffer},
};

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("database initialization failed: {0}")]
    Database(#[from] DbError),

    #[error("failed to seed quota ledger: {0}")]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    ContentPolicy(#[from] ContentPolicyError),

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub db: Arc<DbPool>,
    pub pipeline: RelayPipeline,
    pub chat_logger: ChatLogger,
    /// API key lookup, built once from `[[tokens]]`.
    pub tokens: Arc<TokenTable>,
    /// Batches consume log writes off the request path.
    pub consume_buffer: Arc<ConsumeLogBuffer>,
    pub jobs: JobQueue,
    /// Buffer flushes and job workers.
    pub task_tracker: TaskTracker,
    /// Streaming settlements. These feed the job queue and the consume log
    /// buffer, so they are drained first.
    pub settlements: TaskTracker,
}

impl AppState {
    pub async fn new(config: GatewayConfig) -> Result<Self, AppError> {
        let db = Arc::new(DbPool::from_config(&config.database).await?);
        tracing::info!(backend = db.backend(), "Storage initialized");

        seed_accounts(&config, &db).await?;

        let task_tracker = TaskTracker::new();
        let settlements = TaskTracker::new();

        let consume_buffer = Arc::new(ConsumeLogBuffer::new(ConsumeBufferConfig::from(
            &config.usage_buffer,
        )));
        consume_buffer.start_worker(db.consume_logs(), &task_tracker);

        let chat_logger = ChatLogger::new(db.chat_logs());
        let jobs = JobQueue::start(
            &config.jobs,
            config.chat_log.enabled.then(|| chat_logger.clone()),
            &task_tracker,
        );

        let policy: Option<Arc<dyn ContentPolicy>> = if config.content_policy.enabled {
            let policy = KeywordPolicy::from_config(&config.content_policy)?;
            tracing::info!(
                words = config.content_policy.words.len(),
                "Content policy enabled"
            );
            Some(Arc::new(policy))
        } else {
            None
        };

        // One client for all channels; reqwest pools connections per host.
        let http = reqwest::Client::builder()
            .connect_timeout(config.server.connect_timeout())
            .build()?;

        let adaptors = AdaptorRegistry::with_defaults();
        tracing::debug!(adaptors = adaptors.len(), "Adaptor registry built");

        let tokens = Arc::new(TokenTable::from_config(&config));
        if tokens.is_empty() {
            tracing::warn!("No API tokens configured; every relay request will be rejected");
        }

        let pipeline = RelayPipeline::new(PipelineParts {
            settings: RelaySettings {
                relay: config.relay.clone(),
                streaming_idle_timeout: config.server.streaming_idle_timeout(),
                max_response_body_bytes: config.server.max_response_body_bytes,
            },
            channels: Arc::new(ChannelTable::new(config.channels.clone())),
            adaptors: Arc::new(adaptors),
            pricing: Arc::new(PricingStore::new(config.pricing.clone())),
            counter: tokenizer::default_counter(),
            policy,
            http,
            quota: QuotaService::new(db.ledger(), config.relay.trust_multiplier),
            consume_logs: Arc::clone(&consume_buffer),
            jobs: jobs.clone(),
            settlements: settlements.clone(),
        });

        Ok(Self {
            config: Arc::new(config),
            db,
            pipeline,
            chat_logger,
            tokens,
            consume_buffer,
            jobs,
            task_tracker,
            settlements,
        })
    }

    /// Wait for in-flight stream settlements, then stop the job workers and
    /// the consume log buffer. Callers then wait on `task_tracker`.
    pub async fn shutdown(&self) {
        self.settlements.close();
        self.settlements.wait().await;
        self.jobs.shutdown();
        self.consume_buffer.shutdown();
        self.task_tracker.close();
    }
}

/// Create ledger accounts for configured users and tokens. Existing balances
/// are left alone, so a restart does not refill spent quota.
async fn seed_accounts(config: &GatewayConfig, db: &DbPool) -> Result<(), LedgerError> {
    let ledger = db.ledger();
    for user in &config.users {
        ledger.seed(AccountId::User(user.id), user.quota).await?;
    }
    for token in &config.tokens {
        ledger.seed(AccountId::Token(token.id), token.quota).await?;
    }
    tracing::debug!(
        users = config.users.len(),
        tokens = config.tokens.len(),
        "Quota accounts seeded"
    );
    Ok(())
}

pub fn build_app(config: &GatewayConfig, state: AppState) -> Router {
    let mut app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/health/live", get(routes::health::liveness))
        .route("/health/ready", get(routes::health::readiness));

    if config.observability.metrics.enabled {
        app = app.route("/metrics", get(routes::health::metrics));
    }

    app = app
        .nest("/v1", routes::relay_routes(state.clone()))
        .nest("/api", routes::chat_log_routes(state.clone()));

    app.layer(axum::middleware::from_fn(middleware::request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(config.server.body_limit_bytes))
        .with_state(state)
}
