pub mod api;
pub mod dtos;
pub mod error;
pub mod extractors;
pub mod services;
pub mod utils;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use axum::{
    Extension, Router, ServiceExt,
    extract::Request,
    http::{HeaderValue, Method},
    routing::get,
};
use once_cell::sync::Lazy;
use tower::Layer;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    normalize_path::NormalizePathLayer,
    trace::TraceLayer,
};
use tracing::info;

use crate::config::AppConfig;
use api::{
    download_controller::DownloadController, health_controller::health_endpoint,
    proxy_controller::ProxyController,
};
use services::AppServices;

static START_TIME: Lazy<Instant> = Lazy::new(Instant::now);

pub fn get_uptime_seconds() -> u64 {
    START_TIME.elapsed().as_secs()
}

pub fn get_app_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub struct ApplicationServer;

impl ApplicationServer {
    fn cors(config: &AppConfig) -> CorsLayer {
        let origins = if config.cors_origin.trim() == "*" {
            AllowOrigin::from(Any)
        } else {
            AllowOrigin::list(
                config
                    .cors_origin
                    .split(',')
                    .map(|o| o.trim())
                    .filter(|o| !o.is_empty())
                    .filter_map(|o| HeaderValue::from_str(o).ok()),
            )
        };

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::OPTIONS])
            .allow_headers(Any)
    }

    /// all routes with services attached, no listener
    pub fn router(services: AppServices) -> Router {
        let config = services.config.clone();

        Router::new()
            .nest("/api/download", DownloadController::app())
            .nest(config.proxy_path(), ProxyController::app())
            .route("/api/health", get(health_endpoint))
            .layer(Extension(services))
            .layer(Self::cors(&config))
            .layer(TraceLayer::new_for_http())
    }

    pub async fn serve(config: Arc<AppConfig>) -> anyhow::Result<()> {
        Lazy::force(&START_TIME);

        let services = AppServices::new(config.clone()).context("failed to build services")?;
        let router = Self::router(services);
        let app = NormalizePathLayer::trim_trailing_slash().layer(router);

        let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .context("failed to bind listener")?;

        info!(
            "listening on {} (proxy at {}, {:?} downloads)",
            addr,
            config.proxy_path(),
            config.download_mode
        );

        axum::serve(listener, ServiceExt::<Request>::into_make_service(app))
            .await
            .context("server error")?;

        Ok(())
    }
}
