mod api;
mod router;
mod state;
mod throttle;

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use orderflow_core::Config;
use orderflow_queue::{termination_signal, IngestPipeline, NatsBus, ShutdownCoordinator};
use orderflow_storage::{MemoryCache, PgOrderStore, PoolSettings, RetryPolicy};

use crate::state::AppState;

async fn connect_store(config: &Config) -> anyhow::Result<PgOrderStore> {
    let pg = &config.postgres;
    let policy = RetryPolicy {
        interval: pg.retry_interval(),
        budget: pg.connect_budget(),
    };
    let settings = PoolSettings {
        max_connections: pg.max_connections,
        attempt_timeout: pg.attempt_timeout(),
    };
    PgOrderStore::connect(&pg.connection_string(), policy, settings)
        .await
        .context("PostgreSQL is unavailable")
}

async fn serve(config: Config) -> anyhow::Result<()> {
    config.log_summary();

    let store = Arc::new(connect_store(&config).await?);
    let cache = Arc::new(
        MemoryCache::seed_from(store.as_ref())
            .await
            .context("failed to load orders into the cache")?,
    );

    let bus = Arc::new(
        NatsBus::connect(&config.nats)
            .await
            .context("NATS is unavailable")?,
    );
    let pipeline = Arc::new(IngestPipeline::new(store.clone(), cache.clone()));
    let durable_name = config.nats.durable_name.clone();
    let subscription = pipeline
        .subscribe(bus.as_ref(), &config.nats.channel, durable_name.as_deref())
        .await
        .with_context(|| format!("failed to subscribe to '{}'", config.nats.channel))?;

    let ingestion_stopped = ShutdownCoordinator::new(
        bus.clone(),
        subscription,
        durable_name,
        pipeline.status(),
    )
    .spawn(termination_signal());

    let state = Arc::new(AppState {
        cache,
        metrics: pipeline.metrics(),
        status: pipeline.status(),
    });
    let limiter = throttle::limiter(
        config.server.rate_limit_per_sec,
        config.server.rate_limit_burst,
    );
    let app = router::build_router(state, limiter);

    let addr = config.server.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            // A dropped sender means the coordinator task died; stop anyway.
            let _ = ingestion_stopped.await;
        })
        .await?;

    store.close().await;
    info!("server stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    orderflow_core::config::load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    serve(Config::from_env()).await
}
