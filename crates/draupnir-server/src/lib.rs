//! HTTP surface of Draupnir: JSON:API resources for images and instances

use axum::body::Body;
use axum::http::Request;
use axum::middleware::{from_fn, from_fn_with_state, map_response};
use axum::routing::{get, post};
use axum::Router;
use draupnir_engine::{
    BtrfsBackend, DatabaseRuntime, DirectoryBackend, Engine, IptablesFirewall, PostgresRuntime,
    VolumeBackend, Whitelister,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, info_span, warn};
use uuid::Uuid;

pub mod client_ip;
pub mod config;
pub mod errors;
pub mod jsonapi;
pub mod middleware;
pub mod routes;

#[cfg(test)]
mod tests;

use client_ip::ClientIpConfig;
use config::{ServerConfig, SnapshotBackendKind};

/// Version advertised in every `Draupnir-Version` response header.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub shared_secret: Arc<str>,
    /// Present only when IP whitelisting is enabled
    pub whitelister: Option<Arc<Whitelister>>,
    pub client_ip: Arc<ClientIpConfig>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>, shared_secret: impl Into<Arc<str>>) -> Self {
        Self {
            engine,
            shared_secret: shared_secret.into(),
            whitelister: None,
            client_ip: Arc::new(ClientIpConfig::default()),
        }
    }

    pub fn with_whitelisting(mut self, whitelister: Arc<Whitelister>, client_ip: ClientIpConfig) -> Self {
        self.whitelister = Some(whitelister);
        self.client_ip = Arc::new(client_ip);
        self
    }
}

pub fn create_app(state: AppState) -> Router {
    let api = Router::new()
        .route("/images", get(routes::images::list).post(routes::images::create))
        .route(
            "/images/:id",
            get(routes::images::get).delete(routes::images::destroy),
        )
        .route("/images/:id/done", post(routes::images::done))
        .route(
            "/instances",
            get(routes::instances::list).post(routes::instances::create),
        )
        .route(
            "/instances/:id",
            get(routes::instances::get).delete(routes::instances::destroy),
        )
        .route_layer(from_fn_with_state(state.clone(), middleware::authenticate))
        .route_layer(from_fn(middleware::check_api_version));

    Router::new()
        .route("/health_check", get(routes::health::health_check))
        .merge(api)
        .fallback(routes::not_found)
        .layer(map_response(middleware::add_version_header))
        .layer(TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
            info_span!(
                "request",
                id = %Uuid::new_v4(),
                method = %request.method(),
                uri = %request.uri(),
            )
        }))
        .with_state(state)
}

/// Open the engine with the backends the configuration selects.
pub async fn build_engine(config: &ServerConfig) -> draupnir_common::Result<Engine> {
    let backend: Arc<dyn VolumeBackend> = match config.snapshot_backend {
        SnapshotBackendKind::Btrfs => {
            if !BtrfsBackend::is_available().await {
                warn!("btrfs tooling not found on PATH, snapshot operations will fail");
            }
            Arc::new(BtrfsBackend::new(config.use_sudo))
        }
        SnapshotBackendKind::Directory => Arc::new(DirectoryBackend::new()),
    };

    let postgres = PostgresRuntime::new(config.postgres.clone());
    if !postgres.is_available().await {
        warn!(bin_dir = %config.postgres.bin_dir.display(), "pg_ctl not found, instances will fail to start");
    }
    let runtime: Arc<dyn DatabaseRuntime> = Arc::new(postgres);

    Engine::open(config.engine.clone(), backend, runtime).await
}

/// The firewall reconciler for `engine`, if whitelisting is enabled.
pub fn build_whitelister(config: &ServerConfig, engine: &Engine) -> Option<Arc<Whitelister>> {
    if !config.whitelist.enabled {
        info!("ip whitelisting disabled");
        return None;
    }
    let firewall = IptablesFirewall::new(config.whitelist.chain.clone(), config.use_sudo);
    Some(Arc::new(Whitelister::new(engine.records(), Arc::new(firewall))))
}
