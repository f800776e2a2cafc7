//! Compliance Tracker Validation API Server

mod db;
mod models;
mod routes;

use axum::{
    routing::{delete, get, post},
    Router,
};
use ct_clients::{
    AnalysisConfig, EvidenceConfig, HttpEvidenceFetcher, HttpIntegrationClient,
    IntegrationClientConfig, LlmAnalysisEngine,
};
use ct_core::{MemoryStore, Orchestrator, OrchestratorConfig, ResultStore, StepExecutor};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application state shared across handlers
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub store: Arc<dyn ResultStore>,
    pub config: AppConfig,
}

/// Application configuration
#[derive(Clone)]
pub struct AppConfig {
    /// Postgres URL, or the literal `memory` for a database-less run.
    pub database_url: String,
    pub bind_addr: String,
    pub analysis_api_url: String,
    pub analysis_api_key: String,
    pub analysis_model: String,
    pub step_timeout_secs: u64,
    pub workflow_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost/compliance_tracker".to_string()),
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            analysis_api_url: std::env::var("ANALYSIS_API_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1/chat/completions".to_string()),
            analysis_api_key: std::env::var("ANALYSIS_API_KEY").unwrap_or_default(),
            analysis_model: std::env::var("ANALYSIS_MODEL")
                .unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            step_timeout_secs: env_u64("STEP_TIMEOUT_SECS", 120),
            workflow_timeout_secs: env_u64("WORKFLOW_TIMEOUT_SECS", 600),
        }
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "ct_api=debug,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Compliance Tracker Validation API Server");

    let config = AppConfig::default();

    // Connect storage
    let store: Arc<dyn ResultStore> = if config.database_url == "memory" {
        info!("Using in-memory result store");
        Arc::new(MemoryStore::new())
    } else {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(&config.database_url)
            .await
            .expect("Failed to connect to database");

        info!("Connected to database");

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .expect("Failed to run migrations");

        info!("Database migrations complete");
        Arc::new(db::PgStore::new(pool))
    };

    // Build the collaborator clients
    let fetcher =
        HttpEvidenceFetcher::new(EvidenceConfig::default()).expect("Failed to build evidence fetcher");
    let engine = LlmAnalysisEngine::new(AnalysisConfig {
        endpoint: config.analysis_api_url.clone(),
        api_key: config.analysis_api_key.clone(),
        model: config.analysis_model.clone(),
        ..AnalysisConfig::default()
    })
    .expect("Failed to build analysis engine");
    let integrations = HttpIntegrationClient::new(IntegrationClientConfig::default())
        .expect("Failed to build integration client");

    let executor = Arc::new(StepExecutor::new(
        Arc::new(fetcher),
        Arc::new(engine),
        Arc::new(integrations),
    ));
    let orchestrator = Orchestrator::new(
        store.clone(),
        executor,
        OrchestratorConfig {
            step_timeout: Duration::from_secs(config.step_timeout_secs),
            workflow_timeout: Duration::from_secs(config.workflow_timeout_secs),
        },
    );

    // Create shared state
    let state = Arc::new(AppState {
        orchestrator,
        store,
        config: config.clone(),
    });

    // Build router
    let app = Router::new()
        // Health check
        .route("/health", get(routes::health_check))

        // Submission
        .route("/api/validations/items", post(routes::validations::validate_item))
        .route("/api/validations/batch", post(routes::validations::validate_batch))
        .route("/api/validations/applications/:app_id", post(routes::validations::validate_application))

        // Workflows
        .route("/api/validations/workflows/:id", get(routes::validations::get_workflow))
        .route("/api/validations/workflows/:id", delete(routes::validations::delete_workflow))
        .route("/api/validations/workflows/:id/cancel", post(routes::validations::cancel_workflow))
        .route("/api/validations/applications/:app_id/latest", get(routes::validations::latest_for_application))

        // Results
        .route("/api/validations/results/:id", get(routes::validations::get_result))
        .route("/api/validations/results/:id", delete(routes::validations::delete_result))
        .route("/api/validations/checklist-items/:item_id", get(routes::validations::results_for_item))

        // CORS
        .layer(CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any))

        // Tracing
        .layer(TraceLayer::new_for_http())

        // State
        .with_state(state);

    // Start server
    info!("Listening on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind listener");
    axum::serve(listener, app).await.expect("Server error");
}
