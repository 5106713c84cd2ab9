use axum::Extension;
use axum::Json;
use axum::http::StatusCode;
use chrono::Utc;
use tracing::error;

use crate::config::DownloadMode;
use crate::server::dtos::health_dto::{HealthResponse, HealthStatus, RelayHealth};
use crate::server::services::AppServices;
use crate::server::{get_app_version, get_uptime_seconds};

/// health endpoint, only degrades when the disk relay can't create its temp files
pub async fn health_endpoint(
    Extension(services): Extension<AppServices>,
) -> (StatusCode, Json<HealthResponse>) {
    let cache_dir_writable = check_cache_dir(&services);

    // the other modes never touch the disk so a bad cache dir doesn't matter to them
    let status = match (cache_dir_writable, services.config.download_mode) {
        (true, _) => HealthStatus::Healthy,
        (false, DownloadMode::Disk) => HealthStatus::Unhealthy,
        (false, _) => HealthStatus::Degraded,
    };

    let response = HealthResponse {
        status,
        timestamp: Utc::now(),
        uptime_seconds: get_uptime_seconds(),
        version: get_app_version().to_string(),
        environment: format!("{:?}", services.config.cargo_env).to_lowercase(),
        relay: RelayHealth {
            download_mode: format!("{:?}", services.config.download_mode).to_lowercase(),
            segment_concurrency: services.prefetch.concurrency(),
            cache_dir_writable,
        },
    };

    let http_status = match status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(response))
}

fn check_cache_dir(services: &AppServices) -> bool {
    let dir = services.relay_cache.cache_dir();
    match tempfile::tempfile_in(dir) {
        Ok(_) => true,
        Err(e) => {
            error!("relay cache dir {} not writable: {}", dir.display(), e);
            false
        }
    }
}
