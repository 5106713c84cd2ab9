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
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use url::Url;

use crate::{
    config::DownloadMode,
    server::{
        error::{AppResult, Error},
        extractors::RelayContext,
        services::{AppServices, SegmentStream},
        utils::{
            UpstreamHeaders,
            manifest_utils::MANIFEST_EXTENSION,
            url_utils::{path_extension, resolve_target},
        },
    },
};

pub const DEFAULT_FILENAME: &str = "lunatv";

#[derive(Deserialize)]
struct DownloadQuery {
    url: Option<String>,
    filename: Option<String>,
}

/// `attachment; filename="<ascii>"; filename*=UTF-8''<utf8>` so old and new clients both get a name
pub fn build_disposition(filename: &str, extension: &str) -> String {
    let base = if filename.is_empty() {
        DEFAULT_FILENAME
    } else {
        filename
    };
    let ascii: String = base
        .chars()
        .map(|c| {
            if c.is_ascii() && !c.is_ascii_control() && c != '"' && c != '\\' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let extension = if extension.starts_with('.') {
        extension.to_string()
    } else {
        format!(".{}", extension)
    };

    format!(
        "attachment; filename=\"{}{}\"; filename*=UTF-8''{}{}",
        ascii,
        extension,
        urlencoding::encode(base),
        extension
    )
}

pub struct DownloadController;

impl DownloadController {
    pub fn app() -> Router {
        Router::new().route("/", get(Self::download_get))
    }

    async fn download_get(
        RelayContext(origin, services): RelayContext,
        Query(params): Query<DownloadQuery>,
        headers: HeaderMap,
    ) -> AppResult<Response> {
        let raw = params.url.as_deref().unwrap_or("");
        let target = resolve_target(raw, &origin, services.config.proxy_path())?;
        let filename = params
            .filename
            .filter(|f| !f.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_FILENAME.to_string());
        let upstream_headers = UpstreamHeaders::for_download(&headers);

        debug!("download requested for {} as {}", target, filename);

        let extension = path_extension(&target);
        if extension == MANIFEST_EXTENSION {
            Self::download_playlist(&services, &target, &filename, upstream_headers)
                .await
                .map_err(Error::into_download_failure)
        } else {
            Self::download_direct(&services, &target, &filename, &extension, upstream_headers).await
        }
    }

    async fn download_playlist(
        services: &AppServices,
        target: &Url,
        filename: &str,
        upstream_headers: UpstreamHeaders,
    ) -> AppResult<Response> {
        let segments = services.manifests.resolve(target, &upstream_headers).await?;

        // cancelled by the relay itself once the body is dropped, which is how a disconnect shows up
        let cancel = CancellationToken::new();
        let mode = services.config.download_mode;
        info!(
            "relaying {} segments from {} ({:?})",
            segments.len(),
            target,
            mode
        );

        let body: SegmentStream = match mode {
            DownloadMode::Passthrough => {
                services
                    .prefetch
                    .passthrough(segments, upstream_headers, cancel)
            }
            DownloadMode::Prefetch => services.prefetch.stream(segments, upstream_headers, cancel),
            DownloadMode::Disk => {
                let (stream, ready) = services
                    .relay_cache
                    .start(segments, upstream_headers, cancel)?;
                ready.ready().await?;
                stream
            }
        };

        let mut response_headers = HeaderMap::new();
        response_headers.insert(
            header::CONTENT_DISPOSITION,
            Self::header_value(build_disposition(filename, ".ts"))?,
        );
        response_headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("video/mp2t"));
        response_headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));

        Ok((StatusCode::OK, response_headers, Body::from_stream(body)).into_response())
    }

    async fn download_direct(
        services: &AppServices,
        target: &Url,
        filename: &str,
        extension: &str,
        upstream_headers: UpstreamHeaders,
    ) -> AppResult<Response> {
        let upstream = services
            .http
            .get(target.clone())
            .headers(upstream_headers.for_target(target))
            .send()
            .await
            .map_err(|e| {
                error!("download request for {} failed: {}", target, e);
                Error::DownloadFailed {
                    detail: e.to_string(),
                }
            })?;

        let status = upstream.status();
        if !status.is_success() {
            error!("download upstream {} returned {}", target, status);
            return Err(Error::UpstreamFetchFailed {
                status: status.as_u16(),
            });
        }

        let extension = if extension.is_empty() {
            ".bin"
        } else {
            extension
        };

        let mut response_headers = HeaderMap::new();
        response_headers.insert(
            header::CONTENT_DISPOSITION,
            Self::header_value(build_disposition(filename, extension))?,
        );
        let content_type = upstream
            .headers()
            .get(header::CONTENT_TYPE)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static("application/octet-stream"));
        response_headers.insert(header::CONTENT_TYPE, content_type);
        response_headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));

        let body = upstream.bytes_stream().map_err(Error::from);
        Ok((status, response_headers, Body::from_stream(body)).into_response())
    }

    fn header_value(value: String) -> AppResult<HeaderValue> {
        HeaderValue::from_str(&value).map_err(|e| {
            Error::InternalServerErrorWithContext(format!("invalid header value: {}", e))
        })
    }
}
