//! Kafka-lens - query orchestration and health scoring for Kafka metrics

use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kafka_lens::cache::ResultCache;
use kafka_lens::config::Config;
use kafka_lens::executor::{EntitySearchService, QueryExecutor, QueryService};
use kafka_lens::facade::MetricsOrchestrator;
use kafka_lens::routes;
use kafka_lens::services::{FixtureService, NerdGraphClient};
use kafka_lens::state::AppState;
use kafka_lens::tasks::cache_sweeper;

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "kafka_lens=info,tower_http=info".into());
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() {
    init_tracing();

    if let Err(e) = run().await {
        error!(error = %e, "Kafka-lens failed");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let health = config.health_calculator()?;

    // Data source
    let (query_service, search_service, data_source): (
        Arc<dyn QueryService>,
        Arc<dyn EntitySearchService>,
        &'static str,
    ) = if config.fixture_mode {
        let fixture = Arc::new(FixtureService::demo());
        (fixture.clone(), fixture, "fixture")
    } else {
        let client = Arc::new(NerdGraphClient::new(
            config.nerdgraph_url.clone(),
            config.nerdgraph_api_key.clone().unwrap_or_default(),
            config.attempt_timeout,
        )?);
        (client.clone(), client, "nerdgraph")
    };

    let executor = Arc::new(QueryExecutor::new(
        query_service,
        search_service,
        config.retry_policy(),
        config.account_id,
    ));
    let orchestrator = MetricsOrchestrator::new(
        config.provider,
        Arc::new(ResultCache::new(config.cache_capacity)),
        executor,
        health,
        config.batch_config(),
        config.ttl_policy(),
    );

    // Create application state
    let state = AppState::new(orchestrator, data_source);

    // Spawn background tasks
    let sweeper = Arc::clone(&state.orchestrator);
    let sweep_every = config.cache_sweep_interval;
    tokio::spawn(async move {
        cache_sweeper::cache_sweeper_task(sweeper, sweep_every).await;
    });

    // Build router
    let app = routes::router(state).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            ),
    );

    info!("Kafka-lens v{} starting on {}", env!("CARGO_PKG_VERSION"), config.listen_addr);
    info!("Data source: {} ({})", data_source, config.provider);
    info!("Cache capacity: {}", config.cache_capacity);

    // Start server
    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
