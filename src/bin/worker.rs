//! Worker process entry point (teacher-style: a separate bin from the API
//! process, same crate). Delegates to `Engine::run`, the owned-subsystem
//! lifecycle from spec section 9's "global state → owned subsystem"
//! redesign flag — `Start(config) → Run() → Stop(ctx)`.

use dotenvy::dotenv;
use tokio::signal;
use tokio::sync::watch;

use campaign_delivery_engine::config::Config;
use campaign_delivery_engine::engine::Engine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt::init();

    let cfg = Config::from_env();
    let engine = Engine::start(cfg).await?;

    tracing::info!(
        concurrency = engine.cfg.worker_concurrency,
        "delivery worker started"
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    let run_handle = tokio::spawn({
        let engine = engine.clone();
        async move { engine.run(stop_rx).await }
    });

    signal::ctrl_c().await?;
    tracing::info!("shutdown signal received, stopping in-flight work");
    let _ = stop_tx.send(true);
    let _ = run_handle.await?;

    Ok(())
}
