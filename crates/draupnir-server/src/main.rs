use color_eyre::eyre::{Result, WrapErr};
use draupnir_server::config::ServerConfig;
use draupnir_server::{build_engine, build_whitelister, create_app, AppState, VERSION};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "info,draupnir_server=debug,draupnir_engine=debug";

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let config = ServerConfig::from_env().wrap_err("invalid configuration")?;
    info!(?config, version = VERSION, "starting draupnir");

    let engine = build_engine(&config).await.wrap_err("failed to open engine")?;
    let recovery = engine.recovery();
    info!(
        rolled_back = recovery.rolled_back.len(),
        marked_failed = recovery.marked_failed.len(),
        orphans_removed = recovery.orphans_removed.len(),
        corrupted_images = recovery.corrupted_images.len(),
        "startup recovery complete"
    );

    let mut state = AppState::new(Arc::new(engine), config.shared_secret.as_str());
    let mut reconciler = None;
    if let Some(whitelister) = build_whitelister(&config, &state.engine) {
        reconciler = Some(tokio::spawn(
            whitelister.clone().run(config.whitelist.reconcile_interval),
        ));
        state = state.with_whitelisting(whitelister, config.client_ip.clone());
    }
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(config.listen_address)
        .await
        .wrap_err_with(|| format!("failed to bind {}", config.listen_address))?;
    info!("draupnir listening on {}", config.listen_address);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(reconciler) = reconciler {
        reconciler.abort();
    }

    info!("draupnir stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
}
