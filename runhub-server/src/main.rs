use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use runhub_core::bus::EventBus;
use runhub_core::config::CoreConfig;
use runhub_core::engine::LifecycleEngine;
use runhub_core::external::{
    BotCatalog, BotVersion, NoSecrets, NoopNotifier, NoopPower, StaticCatalog,
};
use runhub_core::queue::RunQueue;
use runhub_core::registry::RunnerRegistry;
use runhub_core::store::RunStore;
use runhub_core::store_memory::MemoryStore;
use runhub_core::tick::SchedulerTick;
use runhub_server::gateway::{spawn_dispatcher, spawn_liveness_monitor};
use runhub_server::http::{app, AppState};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "runhub-server", about = "Run dispatch and execution control server")]
struct Args {
    /// Listen address for the control API and runner gateway.
    #[arg(long, env = "RUNHUB_BIND", default_value = "0.0.0.0:8080")]
    bind: String,

    /// PostgreSQL connection string; omit to run on the in-memory store.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// JSON file with bot versions for the static catalog.
    #[arg(long, env = "RUNHUB_CATALOG")]
    catalog: Option<PathBuf>,

    /// Seconds between scheduler ticks.
    #[arg(long, env = "RUNHUB_TICK_INTERVAL", default_value_t = 5)]
    tick_interval: u64,

    /// Max non-terminal runs per tenant (0 = unlimited).
    #[arg(long, env = "RUNHUB_MAX_CONCURRENT_RUNS", default_value_t = 100)]
    max_concurrent_runs: u64,

    /// Max runs per tenant in a rolling 30-day window (0 = unlimited).
    #[arg(long, env = "RUNHUB_MAX_MONTHLY_RUNS", default_value_t = 0)]
    max_monthly_runs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let args = Args::parse();

    let store: Arc<dyn RunStore> = match args.database_url {
        #[cfg(feature = "postgres")]
        Some(url) => {
            tracing::info!("Connecting to PostgreSQL...");
            let pool = sqlx::PgPool::connect(&url).await?;
            let pg = runhub_core::store_postgres::PostgresRunStore::new(pool);
            pg.migrate().await?;
            tracing::info!("Using PostgresRunStore (migrations applied)");
            Arc::new(pg)
        }
        #[cfg(not(feature = "postgres"))]
        Some(_) => {
            tracing::warn!(
                "DATABASE_URL set but postgres feature not enabled, using MemoryStore"
            );
            Arc::new(MemoryStore::new())
        }
        None => {
            tracing::info!("Using MemoryStore (no database URL configured)");
            Arc::new(MemoryStore::new())
        }
    };

    let catalog: Arc<dyn BotCatalog> = {
        let static_catalog = StaticCatalog::new();
        if let Some(path) = args.catalog {
            let raw = std::fs::read_to_string(&path)?;
            let versions: Vec<BotVersion> = serde_json::from_str(&raw)?;
            tracing::info!(count = versions.len(), path = %path.display(), "catalog loaded");
            for version in versions {
                static_catalog.insert(version);
            }
        }
        Arc::new(static_catalog)
    };

    let config = CoreConfig {
        tick_interval_seconds: args.tick_interval.max(1),
        max_concurrent_runs: args.max_concurrent_runs,
        max_monthly_runs: args.max_monthly_runs,
        ..Default::default()
    };

    let queue = Arc::new(RunQueue::new(store.clone()));
    let bus = Arc::new(EventBus::new());
    let registry = Arc::new(RunnerRegistry::new());
    let engine = Arc::new(LifecycleEngine::new(
        store.clone(),
        queue,
        bus.clone(),
        registry.clone(),
        catalog,
        Arc::new(NoSecrets),
        Arc::new(NoopNotifier),
        config.clone(),
    ));

    let state = AppState {
        engine: engine.clone(),
        store: store.clone(),
        bus: bus.clone(),
        registry,
        config: config.clone(),
    };

    spawn_dispatcher(state.clone());
    spawn_liveness_monitor(state.clone());
    Arc::new(SchedulerTick::new(
        store,
        engine,
        bus,
        Arc::new(NoopPower),
        config,
    ))
    .spawn();

    let listener = tokio::net::TcpListener::bind(&args.bind).await?;
    tracing::info!("runhub server listening on {}", args.bind);
    axum::serve(listener, app(state)).await?;

    Ok(())
}
