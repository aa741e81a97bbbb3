use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use trailstop::config::AppConfig;
use trailstop::db::{self, PgPositionStore};
use trailstop::engine::Engine;
use trailstop::exchange::{KrakenClient, PriceCache};
use trailstop::services::scheduler::{run_escalation_loop, run_reconciliation_loop};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;

    tracing::info!("Connecting to database...");
    let pool = db::init_pool(&config.database_url).await?;
    tracing::info!("Database connected");

    let store = PgPositionStore::new(pool, config.claim_ttl_secs);
    let exchange = KrakenClient::new(
        reqwest::Client::new(),
        config.kraken_api_key.clone(),
        config.kraken_api_secret.clone(),
    );
    let prices = PriceCache::new(Duration::from_secs(config.price_cache_ttl_secs), 100);

    let engine = Arc::new(Engine::new(
        store,
        exchange,
        config.retry_policy(),
        prices,
        config.engine_config(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let escalation = tokio::spawn(run_escalation_loop(
        engine.clone(),
        config.trade_interval_secs,
        shutdown_rx.clone(),
    ));
    let reconciliation = tokio::spawn(run_reconciliation_loop(
        engine,
        config.sync_interval_secs,
        shutdown_rx,
    ));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received — finishing in-flight work");
    shutdown_tx.send(true).ok();

    let _ = tokio::join!(escalation, reconciliation);
    tracing::info!("Worker stopped");

    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();
}
