use std::sync::Arc;

use anyhow::Result;
use tokio::signal::unix::SignalKind;

use evolution_core::AdminControls;
use evolution_scheduler::{EvolutionScheduler, SchedulerConfig};
use market_data::{GatewayConfig, MarketDataGateway, PolygonProvider, SimProvider, TokenBucketConfig};
use strategy_memory::StrategyMemory;
use strategy_repository::StrategyRepository;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load .env, init tracing
    dotenvy::dotenv().ok();

    let json_logging = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    }

    // Panic hook: log panic info before crashing
    std::panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
        tracing::error!("PANIC: {info}");
    }));

    tracing::info!("Starting EvoQuant evolution scheduler");

    // 2. Live tunables from the environment
    let controls = Arc::new(AdminControls::from_env());
    tracing::info!(
        "  Max concurrent backtests: {}",
        controls.max_concurrent_backtests()
    );
    tracing::info!(
        "  Evolution interval: {}s",
        controls.evolution_interval_seconds()
    );
    tracing::info!(
        "  Monitoring interval: {}s",
        controls.monitoring_interval_seconds()
    );

    // 3. Database
    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "sqlite:evoquant.db?mode=rwc".to_string());
    let pool = sqlx::SqlitePool::connect(&database_url).await?;

    let repository = Arc::new(StrategyRepository::new(pool.clone()));
    repository.init_tables().await?;
    tracing::info!("Strategy repository initialized");

    let memory = Arc::new(StrategyMemory::new(pool.clone()));
    memory.init_tables().await?;
    tracing::info!("Strategy memory initialized");

    // 4. Market data gateway: configured providers in fixed failover order.
    // Without an API key the deterministic sim source serves alone.
    let mut gateway = MarketDataGateway::new(GatewayConfig::default());
    match std::env::var("POLYGON_API_KEY") {
        Ok(key) if !key.is_empty() => {
            gateway = gateway.with_provider(
                Arc::new(PolygonProvider::new(key)),
                TokenBucketConfig {
                    capacity: 100.0,
                    refill_per_second: 1.5,
                },
            );
            tracing::info!("Market data: polygon (primary), sim (fallback)");
        }
        _ => tracing::info!("Market data: sim only (POLYGON_API_KEY not set)"),
    }
    gateway = gateway.with_provider(Arc::new(SimProvider::new()), TokenBucketConfig::default());
    let gateway = Arc::new(gateway);

    // 5. Startup connectivity check
    sqlx::query("SELECT 1")
        .execute(&pool)
        .await
        .map_err(|e| anyhow::anyhow!("Database connectivity check failed: {e}"))?;
    tracing::info!("Startup check: database OK");

    // 6. Scheduler
    let scheduler = Arc::new(EvolutionScheduler::new(
        repository,
        gateway,
        memory,
        Arc::clone(&controls),
        SchedulerConfig::default(),
    ));

    // Monitoring worker runs beside the evolution loop.
    let monitor = Arc::clone(&scheduler);
    let monitor_task = tokio::spawn(async move { monitor.run_monitor_until_shutdown().await });

    // 7. Main loop with graceful shutdown (SIGINT + SIGTERM)
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())?;
    let loop_scheduler = Arc::clone(&scheduler);
    let evolution_task = tokio::spawn(async move { loop_scheduler.run_until_shutdown().await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received SIGINT");
        }
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
    }

    tracing::info!("Shutdown signal received, exiting gracefully...");
    scheduler.request_shutdown();

    evolution_task.await??;
    monitor_task.await??;

    tracing::info!("Evolution scheduler shut down.");
    Ok(())
}
