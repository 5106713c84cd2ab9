// playlists get rewritten so every uri comes back through here, everything else is piped through
// untouched so range requests keep working
use axum::{
    Router,
    body::Body,
    extract::Query,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use futures::TryStreamExt;
use serde::Deserialize;
use tracing::{debug, error};
use url::Url;

use crate::server::{
    error::{AppResult, Error},
    extractors::RelayContext,
    services::AppServices,
    utils::{UpstreamHeaders, manifest_utils::rewrite_manifest, url_utils::parse_proxy_target},
};

const PROXY_CACHE_CONTROL: &str = "private, max-age=5";

/// headers copied from a segment response onto ours
const SEGMENT_PASSTHROUGH: [header::HeaderName; 4] = [
    header::CONTENT_TYPE,
    header::ACCEPT_RANGES,
    header::CONTENT_RANGE,
    header::CONTENT_ENCODING,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayKind {
    Manifest,
    Segment,
}

impl RelayKind {
    // anything that isn't explicitly a manifest is relayed as raw bytes
    fn from_param(value: Option<&str>) -> Self {
        match value {
            Some("manifest") => Self::Manifest,
            _ => Self::Segment,
        }
    }
}

#[derive(Deserialize)]
struct ProxyQuery {
    url: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
}

pub struct ProxyController;

impl ProxyController {
    pub fn app() -> Router {
        // preflight never gets here, the cors layer answers it
        Router::new().route("/", get(Self::proxy_get))
    }

    async fn proxy_get(
        RelayContext(_, services): RelayContext,
        Query(params): Query<ProxyQuery>,
        headers: HeaderMap,
    ) -> AppResult<Response> {
        let target = parse_proxy_target(params.url.as_deref().unwrap_or(""))?;
        let kind = RelayKind::from_param(params.kind.as_deref());
        debug!("proxying ({:?}): {}", kind, target);

        Self::relay(&services, &target, kind, UpstreamHeaders::for_proxy(&headers)).await
    }

    pub async fn relay(
        services: &AppServices,
        target: &Url,
        kind: RelayKind,
        upstream_headers: UpstreamHeaders,
    ) -> AppResult<Response> {
        let upstream_headers = match kind {
            RelayKind::Manifest => upstream_headers.without_encoding(),
            RelayKind::Segment => upstream_headers,
        };

        let target_response = services
            .http
            .get(target.clone())
            .headers(upstream_headers.for_target(target))
            .send()
            .await
            .map_err(|e| {
                error!("proxy request for {} failed: {}", target, e);
                Error::from(e)
            })?;

        let response_status = target_response.status();
        debug!("received response with status: {}", response_status);

        if !response_status.is_success() {
            error!(
                "{:?} upstream {} not successful: {}",
                kind, target, response_status
            );
            return Err(Error::UpstreamFetchFailed {
                status: response_status.as_u16(),
            });
        }

        match kind {
            RelayKind::Manifest => {
                let text = target_response.text().await.map_err(|e| {
                    error!("failed to read playlist {}: {}", target, e);
                    Error::from(e)
                })?;
                let processed = rewrite_manifest(&text, target, services.config.proxy_path());
                debug!(
                    "rewrote playlist {} ({} -> {} bytes)",
                    target,
                    text.len(),
                    processed.len()
                );
                Ok(Self::build_m3u8_response(processed))
            }
            RelayKind::Segment => {
                let mut response_headers = HeaderMap::new();
                for name in SEGMENT_PASSTHROUGH {
                    if let Some(value) = target_response.headers().get(&name) {
                        response_headers.insert(name, value.clone());
                    }
                }
                response_headers.insert(
                    header::CACHE_CONTROL,
                    HeaderValue::from_static(PROXY_CACHE_CONTROL),
                );

                let body = target_response.bytes_stream().map_err(Error::from);
                Ok((response_status, response_headers, Body::from_stream(body)).into_response())
            }
        }
    }

    fn build_m3u8_response(processed_body: String) -> Response {
        let mut response_headers = HeaderMap::new();
        response_headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/vnd.apple.mpegurl; charset=utf-8"),
        );
        response_headers.insert(
            header::CACHE_CONTROL,
            HeaderValue::from_static(PROXY_CACHE_CONTROL),
        );

        (StatusCode::OK, response_headers, processed_body).into_response()
    }
}
