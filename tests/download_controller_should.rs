use std::path::Path;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use axum::response::Response;
use http_body_util::BodyExt;
use segment_relay::server::error::Error;
use segment_relay::server::services::AppServices;
use segment_relay::server::services::manifest_services::MockManifestServiceTrait;
use segment_relay::{AppConfig, ApplicationServer, DownloadMode};
use tempfile::TempDir;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config(mode: DownloadMode, cache: &Path) -> Arc<AppConfig> {
    Arc::new(AppConfig {
        download_mode: mode,
        relay_cache_dir: Some(cache.to_path_buf()),
        ..AppConfig::default()
    })
}

async fn get(services: AppServices, uri: &str) -> Response {
    ApplicationServer::router(services)
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

async fn body_bytes(response: Response) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

async fn body_json(response: Response) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

fn download_uri(target: &str) -> String {
    format!("/api/download?url={}", urlencoding::encode(target))
}

fn segment_body(index: usize) -> Vec<u8> {
    format!("ts-payload-{}|", index).repeat(50 * (index + 1)).into_bytes()
}

async fn mount_vod(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/vod/index.m3u8"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string("#EXTM3U\nseg0.ts\nseg1.ts\nseg2.ts"),
        )
        .mount(server)
        .await;
    for i in 0..3 {
        Mock::given(method("GET"))
            .and(path(format!("/vod/seg{}.ts", i)))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(segment_body(i)))
            .mount(server)
            .await;
    }
}

#[tokio::test]
async fn test_playlist_download_concatenates_segments_in_every_mode() {
    let server = MockServer::start().await;
    mount_vod(&server).await;
    let target = format!("{}/vod/index.m3u8", server.uri());
    let expected: Vec<u8> = (0..3).flat_map(segment_body).collect();

    for mode in [
        DownloadMode::Passthrough,
        DownloadMode::Prefetch,
        DownloadMode::Disk,
    ] {
        let cache = TempDir::new().unwrap();
        let services = AppServices::new(config(mode, cache.path())).unwrap();

        let response = get(services, &download_uri(&target)).await;

        assert_eq!(response.status(), StatusCode::OK, "{:?}", mode);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "video/mp2t");
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"lunatv.ts\"; filename*=UTF-8''lunatv.ts"
        );
        assert_eq!(body_bytes(response).await, expected, "{:?}", mode);
        assert_eq!(
            std::fs::read_dir(cache.path()).unwrap().count(),
            0,
            "{:?} left files behind",
            mode
        );
    }
}

#[tokio::test]
async fn test_master_playlist_downloads_best_variant() {
    let server = MockServer::start().await;
    mount_vod(&server).await;
    Mock::given(method("GET"))
        .and(path("/master.m3u8"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=200\nlow/index.m3u8\n#EXT-X-STREAM-INF:BANDWIDTH=3000000\nvod/index.m3u8\n",
        ))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/low/index.m3u8"))
        .respond_with(ResponseTemplate::new(200).set_body_string("low.ts"))
        .expect(0)
        .mount(&server)
        .await;

    let cache = TempDir::new().unwrap();
    let services = AppServices::new(config(DownloadMode::Prefetch, cache.path())).unwrap();
    let response = get(
        services,
        &download_uri(&format!("{}/master.m3u8", server.uri())),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_bytes(response).await,
        (0..3).flat_map(segment_body).collect::<Vec<u8>>()
    );
}

#[tokio::test]
async fn test_nested_proxy_url_is_unwrapped_before_download() {
    let server = MockServer::start().await;
    mount_vod(&server).await;
    let target = format!("{}/vod/index.m3u8", server.uri());
    let wrapped = format!(
        "/api/proxy?type=manifest&url={}",
        urlencoding::encode(&target)
    );

    let cache = TempDir::new().unwrap();
    let services = AppServices::new(config(DownloadMode::Prefetch, cache.path())).unwrap();
    let response = get(services, &download_uri(&wrapped)).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_bytes(response).await,
        (0..3).flat_map(segment_body).collect::<Vec<u8>>()
    );
}

#[tokio::test]
async fn test_missing_url_is_a_bad_request() {
    let cache = TempDir::new().unwrap();
    let services = AppServices::new(config(DownloadMode::Prefetch, cache.path())).unwrap();

    let response = get(services, "/api/download").await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "missing url parameter");
}

#[tokio::test]
async fn test_non_http_scheme_is_a_bad_request() {
    let cache = TempDir::new().unwrap();
    let services = AppServices::new(config(DownloadMode::Prefetch, cache.path())).unwrap();

    let response = get(services, &download_uri("ftp://files.example.com/video.m3u8")).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unreachable_playlist_is_a_bad_gateway_with_detail() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/gone/index.m3u8"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let cache = TempDir::new().unwrap();
    let services = AppServices::new(config(DownloadMode::Prefetch, cache.path())).unwrap();
    let response = get(
        services,
        &download_uri(&format!("{}/gone/index.m3u8", server.uri())),
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = body_json(response).await;
    assert_eq!(body["error"], "download failed");
    assert_eq!(body["detail"], "upstream returned 404");
}

#[tokio::test]
async fn test_disk_mode_reports_a_dead_first_segment_before_headers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/vod/index.m3u8"))
        .respond_with(ResponseTemplate::new(200).set_body_string("seg0.ts\nseg1.ts"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/vod/seg0.ts"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let cache = TempDir::new().unwrap();
    let services = AppServices::new(config(DownloadMode::Disk, cache.path())).unwrap();
    let response = get(
        services,
        &download_uri(&format!("{}/vod/index.m3u8", server.uri())),
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(body_json(response).await["detail"], "upstream returned 403");
    assert_eq!(std::fs::read_dir(cache.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_resolver_failures_become_download_failures() {
    let cache = TempDir::new().unwrap();
    let mut manifests = MockManifestServiceTrait::new();
    manifests
        .expect_resolve()
        .times(1)
        .returning(|_, _| Err(Error::NoSegmentsFound));

    let services = AppServices::with_manifest_service(
        config(DownloadMode::Prefetch, cache.path()),
        reqwest::Client::new(),
        Arc::new(manifests),
    );
    let response = get(services, &download_uri("https://cdn.example.com/a.m3u8")).await;

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = body_json(response).await;
    assert_eq!(body["error"], "download failed");
    assert_eq!(body["detail"], "no downloadable segments found");
}

#[tokio::test]
async fn test_direct_file_is_streamed_with_upstream_type() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/files/movie.MP4"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "video/mp4")
                .set_body_bytes(b"mp4-bytes".to_vec()),
        )
        .mount(&server)
        .await;

    let cache = TempDir::new().unwrap();
    let services = AppServices::new(config(DownloadMode::Prefetch, cache.path())).unwrap();
    let uri = format!(
        "{}&filename=holiday",
        download_uri(&format!("{}/files/movie.MP4", server.uri()))
    );
    let response = get(services, &uri).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "video/mp4");
    assert_eq!(
        response.headers()[header::CONTENT_DISPOSITION],
        "attachment; filename=\"holiday.mp4\"; filename*=UTF-8''holiday.mp4"
    );
    assert_eq!(body_bytes(response).await, b"mp4-bytes");
}

#[tokio::test]
async fn test_direct_file_without_extension_gets_bin() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/blob"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"raw".to_vec()))
        .mount(&server)
        .await;

    let cache = TempDir::new().unwrap();
    let services = AppServices::new(config(DownloadMode::Prefetch, cache.path())).unwrap();
    let response = get(services, &download_uri(&format!("{}/blob", server.uri()))).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/octet-stream"
    );
    assert_eq!(
        response.headers()[header::CONTENT_DISPOSITION],
        "attachment; filename=\"lunatv.bin\"; filename*=UTF-8''lunatv.bin"
    );
}

#[tokio::test]
async fn test_direct_file_upstream_status_is_kept() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/files/missing.mp4"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let cache = TempDir::new().unwrap();
    let services = AppServices::new(config(DownloadMode::Prefetch, cache.path())).unwrap();
    let response = get(
        services,
        &download_uri(&format!("{}/files/missing.mp4", server.uri())),
    )
    .await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unicode_filename_gets_both_disposition_forms() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/a.mp4"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"x".to_vec()))
        .mount(&server)
        .await;

    let cache = TempDir::new().unwrap();
    let services = AppServices::new(config(DownloadMode::Prefetch, cache.path())).unwrap();
    let uri = format!(
        "{}&filename={}",
        download_uri(&format!("{}/a.mp4", server.uri())),
        urlencoding::encode("电影 \"1\"")
    );
    let response = get(services, &uri).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_DISPOSITION],
        "attachment; filename=\"__ _1_.mp4\"; filename*=UTF-8''%E7%94%B5%E5%BD%B1%20%221%22.mp4"
    );
}

#[tokio::test]
async fn test_health_reports_relay_settings() {
    let cache = TempDir::new().unwrap();
    let services = AppServices::new(config(DownloadMode::Disk, cache.path())).unwrap();

    let response = get(services, "/api/health").await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["relay"]["download_mode"], "disk");
    assert_eq!(body["relay"]["segment_concurrency"], 4);
    assert_eq!(body["relay"]["cache_dir_writable"], true);
}

#[tokio::test]
async fn test_health_is_unavailable_when_disk_mode_cannot_write() {
    let cache = TempDir::new().unwrap();
    let missing = cache.path().join("does-not-exist");
    let services = AppServices::new(config(DownloadMode::Disk, &missing)).unwrap();

    let response = get(services, "/api/health").await;

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(response).await["status"], "unhealthy");
}
