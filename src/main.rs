//! Guideline Core - guideline compliance decision engine
//!
//! This service checks generated text and images against a versioned set
//! of guideline rules before publication, caching verdicts and recording
//! every decision for audit.

use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::SqlitePool;
use tokio::net::TcpListener;

mod api;
mod config;
mod domain;
mod engine;
mod error;
mod logging;
mod storage;

use crate::api::build_router;
use crate::config::{CacheConfig, Config, EngineConfig};
use crate::domain::CheckSpec;
use crate::engine::{
    AuditRecorder, CheckFactory, ContentNormalizer, DecisionService, Evaluator, LlamaGuardClient,
    MokaVerdictCache, RegistryLoader, RuleRegistry, VerdictCache,
};
use crate::storage::EngineRepository;

/// Headroom for JSON framing around a base64 image.
const BODY_OVERHEAD: usize = 64 * 1024;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// The check pipeline.
    pub service: Arc<DecisionService>,
    /// Database repository.
    pub repository: EngineRepository,
    /// Current rule set.
    pub registry: Arc<RuleRegistry>,
    /// Audit recorder (for health reporting).
    pub recorder: AuditRecorder,
}

impl AppState {
    pub fn new(
        engine: &EngineConfig,
        cache: &CacheConfig,
        repository: EngineRepository,
        registry: Arc<RuleRegistry>,
        recorder: AuditRecorder,
    ) -> Self {
        let verdict_cache: Option<Arc<dyn VerdictCache>> = if cache.enabled {
            Some(Arc::new(MokaVerdictCache::new(cache.capacity)))
        } else {
            None
        };

        let service = DecisionService::new(
            ContentNormalizer::new(engine),
            Evaluator::new(Duration::from_millis(engine.rule_timeout_ms)),
            registry.clone(),
            verdict_cache,
            Duration::from_secs(cache.ttl_secs),
            recorder.clone(),
        );

        Self {
            service: Arc::new(service),
            repository,
            registry,
            recorder,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file (if present)
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("Note: No .env file loaded ({e})");
    }

    logging::init();

    tracing::info!("Starting Guideline Core v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load().map_err(|e| {
        tracing::error!(error = %e, "Failed to load configuration");
        anyhow::anyhow!("Configuration error: {}", e)
    })?;

    tracing::info!(
        host = %config.server.host,
        port = %config.server.port,
        database = %config.database.url,
        cache_enabled = config.cache.enabled,
        cache_ttl_secs = config.cache.ttl_secs,
        "Configuration loaded"
    );

    // Connect to database
    let pool = SqlitePool::connect(&config.database.url)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to database");
            anyhow::anyhow!("Database connection error: {}", e)
        })?;

    let repository = EngineRepository::new(pool);
    repository.init_schema().await.map_err(|e| {
        tracing::error!(error = %e, "Failed to initialize database schema");
        anyhow::anyhow!("Schema initialization error: {}", e)
    })?;

    tracing::info!("Database connected and schema initialized");

    // Classifier-backed rules need an API key
    let classifier = LlamaGuardClient::from_config(&config.llm)?;
    let mut seed = config.rules.seed.clone();
    if classifier.is_some() {
        tracing::info!("Llama Guard classifier enabled");
    } else {
        seed.retain(|rule| {
            let keep = !matches!(rule.check, CheckSpec::LlmGuard { .. });
            if !keep {
                tracing::warn!(
                    key = %rule.key,
                    "Skipping classifier rule: no OpenRouter API key configured"
                );
            }
            keep
        });
    }

    // Load the rule registry
    let registry = Arc::new(RuleRegistry::new());
    let loader = RegistryLoader::new(
        Arc::new(repository.clone()),
        CheckFactory::new(classifier),
        config.rules.thresholds.clone(),
    );
    loader.seed(&seed).await.map_err(|e| {
        tracing::error!(error = %e, "Failed to seed guideline rules");
        anyhow::anyhow!("Rule seeding error: {}", e)
    })?;
    if let Err(e) = loader.reload(&registry).await {
        // Checks answer 503 until a refresh succeeds.
        tracing::error!(error = %e, "Failed to load rule set");
    }
    let _refresh = loader.spawn_refresh(
        registry.clone(),
        Duration::from_secs(config.registry.refresh_secs.max(1)),
    );

    // Audit recorder and its retry worker
    let (recorder, _audit_worker) =
        AuditRecorder::start(Arc::new(repository.clone()), &config.audit);

    let state = AppState::new(
        &config.engine,
        &config.cache,
        repository,
        registry,
        recorder,
    );

    // Base64 inflates by 4/3
    let body_limit = config.engine.max_image_bytes / 3 * 4 + BODY_OVERHEAD;
    let app = build_router(state, body_limit);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr).await?;

    tracing::info!(address = %addr, "Server listening");
    tracing::info!("Swagger UI available at http://{}/swagger-ui/", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
