use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::{
    config::AppConfig,
    server::services::{
        manifest_services::ManifestService, prefetch_services::PrefetchService,
        relay_cache_services::RelayCacheService,
    },
};

use super::manifest_services::DynManifestService;

/// everything a handler needs, cloned into each request through an extension
#[derive(Clone)]
pub struct AppServices {
    pub manifests: DynManifestService,
    pub prefetch: Arc<PrefetchService>,
    pub relay_cache: Arc<RelayCacheService>,
    pub http: reqwest::Client,
    pub config: Arc<AppConfig>,
}

impl AppServices {
    pub fn new(config: Arc<AppConfig>) -> anyhow::Result<Self> {
        info!("starting relay services...");

        // one pooled client for the whole process, every upstream fetch goes through it
        let http = Self::build_http_client(&config)?;

        info!(
            "http client ok (connect timeout {}ms, keep-alive {}ms), starting remaining services...",
            config.http_connect_timeout_ms, config.http_keep_alive_timeout_ms
        );

        let manifests = Arc::new(ManifestService::new(http.clone())) as DynManifestService;

        Ok(Self::with_manifest_service(config, http, manifests))
    }

    /// lets tests swap the playlist resolver for a mock
    pub fn with_manifest_service(
        config: Arc<AppConfig>,
        http: reqwest::Client,
        manifests: DynManifestService,
    ) -> Self {
        let prefetch = Arc::new(PrefetchService::new(
            http.clone(),
            config.segment_concurrency(),
        ));
        let relay_cache = Arc::new(RelayCacheService::new(http.clone(), config.cache_dir()));

        Self {
            manifests,
            prefetch,
            relay_cache,
            http,
            config,
        }
    }

    pub fn build_http_client(config: &AppConfig) -> reqwest::Result<reqwest::Client> {
        reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.http_connect_timeout_ms))
            .pool_idle_timeout(Duration::from_millis(config.http_keep_alive_timeout_ms))
            .pool_max_idle_per_host(config.http_pool_max_idle_per_host)
            .tcp_keepalive(Duration::from_millis(config.http_keep_alive_timeout_ms))
            .build()
    }
}
