use std::net::SocketAddr;
use std::sync::Arc;

use quotad::{
    alloc::engine::{Allocator, PolicyHandle},
    alloc::repository_sqlx::{SqlxAllocationRepository, supports_skip_locked},
    api::{self, AppState},
    config::AppConfig,
    db::Db,
    logger::init_tracing,
    metrics::counters::Counters,
    ratelimit::TokenBucketLimiter,
    time::SystemClock,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sqlx::any::install_default_drivers();

    let is_production = std::env::var("APP_ENV").unwrap_or_default() == "production";
    init_tracing(is_production);

    tracing::info!("Starting quotad...");

    let cfg = AppConfig::from_env();

    let db = Db::connect(&cfg).await?;
    db.migrate().await?;
    db.seed(cfg.nodes, cfg.node_budget).await?;

    let repo = Arc::new(SqlxAllocationRepository::new(
        db.pool.clone(),
        supports_skip_locked(&cfg.database_url),
    ));

    let policy = PolicyHandle::new(cfg.strategy, cfg.big_request_threshold);
    let counters = Counters::default();
    let allocator = Arc::new(Allocator::new(repo, policy.clone(), counters.clone()));

    let limiter = cfg.rate_limit_enabled.then(|| {
        Arc::new(TokenBucketLimiter::new(
            cfg.rate_limit_global_per_sec,
            cfg.rate_limit_global_burst,
            cfg.rate_limit_client_per_sec,
            cfg.rate_limit_client_burst,
            Arc::new(SystemClock::new()),
        ))
    });

    let state = AppState {
        allocator,
        limiter,
        policy,
        counters,
        overload_retry_after_secs: cfg.overload_retry_after_sec,
    };

    let app = api::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(
        %addr,
        nodes = cfg.nodes,
        node_budget = cfg.node_budget,
        strategy = %cfg.strategy,
        rate_limit_enabled = cfg.rate_limit_enabled,
        "listening"
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = ?e, "failed to install ctrl-c handler");
        return;
    }
    tracing::info!("Shutdown signal received");
}
