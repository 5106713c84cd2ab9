use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use dotenvy::dotenv;

use tracing::info;

use segment_relay::{AppConfig, ApplicationServer, Logger};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let config = Arc::new(AppConfig::parse());

    // guards are kept alive to flush logs and keep sentry connected
    let _guards = Logger::init(config.cargo_env, config.sentry_dsn.clone());

    info!(
        "logger and env prepped, starting relay ({:?}, concurrency {})...",
        config.download_mode,
        config.segment_concurrency()
    );

    ApplicationServer::serve(config)
        .await
        .context("relay server failed to start")?;

    Ok(())
}
