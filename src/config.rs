#[derive(clap::ValueEnum, Clone, Debug, Copy)]
pub enum CargoEnv {
    Development,
    Production,
}

/// how resolved hls output gets relayed to the client
#[derive(clap::ValueEnum, Clone, Debug, Copy, PartialEq, Eq)]
pub enum DownloadMode {
    /// one segment at a time, chunks forwarded as they arrive
    Passthrough,
    /// bounded concurrent fetches, emitted in playlist order
    Prefetch,
    /// sequential fetch into a temp file, read back at the client's pace
    Disk,
}

pub const DEFAULT_PROXY_PATH: &str = "/api/proxy";

#[derive(clap::Parser, Clone, Debug)]
pub struct AppConfig {
    // production or development
    #[clap(long, env, value_enum)]
    pub cargo_env: CargoEnv,

    // port that the app will bind to
    #[clap(long, env, default_value = "5000")]
    pub port: u16,

    // this should be either * for allowing everything, or a comma seperated list of domains like
    // example.com,something.com
    #[clap(long, env, default_value = "*")]
    pub cors_origin: String,

    // optional sentry integration
    #[clap(long, env)]
    pub sentry_dsn: Option<String>,

    // path the proxy is mounted on, also used to detect urls that are already proxied
    #[clap(long, env, default_value = DEFAULT_PROXY_PATH)]
    pub stream_proxy_path: String,

    // how many segments are downloaded at once in prefetch mode
    #[clap(long, env, default_value = "4")]
    pub download_segment_concurrency: usize,

    #[clap(long, env, value_enum, default_value = "prefetch")]
    pub download_mode: DownloadMode,

    // where the disk relay puts its temp files, falls back to the os temp dir
    #[clap(long, env)]
    pub relay_cache_dir: Option<std::path::PathBuf>,

    #[clap(long, env, default_value = "10000")]
    pub http_connect_timeout_ms: u64,

    #[clap(long, env, default_value = "60000")]
    pub http_keep_alive_timeout_ms: u64,

    #[clap(long, env, default_value = "32")]
    pub http_pool_max_idle_per_host: usize,
}

impl AppConfig {
    /// proxy path with whitespace stripped, empty values fall back to the default
    pub fn proxy_path(&self) -> &str {
        let trimmed = self.stream_proxy_path.trim();
        if trimmed.is_empty() {
            DEFAULT_PROXY_PATH
        } else {
            trimmed
        }
    }

    pub fn segment_concurrency(&self) -> usize {
        self.download_segment_concurrency.max(1)
    }

    pub fn cache_dir(&self) -> std::path::PathBuf {
        self.relay_cache_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}

impl Default for AppConfig {
    // mostly for tests, the binary always goes through clap
    fn default() -> Self {
        Self {
            cargo_env: CargoEnv::Development,
            port: 5000,
            cors_origin: "*".to_string(),
            sentry_dsn: None,
            stream_proxy_path: DEFAULT_PROXY_PATH.to_string(),
            download_segment_concurrency: 4,
            download_mode: DownloadMode::Prefetch,
            relay_cache_dir: None,
            http_connect_timeout_ms: 10_000,
            http_keep_alive_timeout_ms: 60_000,
            http_pool_max_idle_per_host: 32,
        }
    }
}
