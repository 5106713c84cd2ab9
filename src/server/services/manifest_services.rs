use async_trait::async_trait;
use mockall::automock;
use std::sync::Arc;
use tracing::{debug, error, info};
use url::Url;

use crate::server::{
    error::{AppResult, Error},
    utils::{UpstreamHeaders, manifest_utils::parse_manifest},
};

/// root playlist plus at most two nested variant playlists
pub const MAX_MANIFEST_DEPTH: usize = 3;

pub type DynManifestService = Arc<dyn ManifestServiceTrait + Send + Sync>;

#[automock]
#[async_trait]
pub trait ManifestServiceTrait {
    /// follow variant playlists (best bandwidth first) until a flat segment list shows up
    async fn resolve(&self, target: &Url, headers: &UpstreamHeaders) -> AppResult<Vec<Url>>;
}

pub struct ManifestService {
    http: reqwest::Client,
}

impl ManifestService {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    async fn fetch_text(&self, url: &Url, headers: &UpstreamHeaders) -> AppResult<String> {
        let response = self
            .http
            .get(url.clone())
            .headers(headers.for_target(url))
            .send()
            .await
            .map_err(|e| {
                error!("playlist request failed for {}: {}", url, e);
                Error::from(e)
            })?;

        let status = response.status();
        if !status.is_success() {
            error!("playlist fetch for {} returned {}", url, status);
            return Err(Error::UpstreamFetchFailed {
                status: status.as_u16(),
            });
        }

        Ok(response.text().await?)
    }
}

#[async_trait]
impl ManifestServiceTrait for ManifestService {
    async fn resolve(&self, target: &Url, headers: &UpstreamHeaders) -> AppResult<Vec<Url>> {
        let mut current = target.clone();

        for depth in 0..MAX_MANIFEST_DEPTH {
            let text = self.fetch_text(&current, headers).await?;
            let doc = parse_manifest(&text, &current);
            debug!(
                "playlist {} at depth {}: {} segments, {} variants",
                current,
                depth,
                doc.segments.len(),
                doc.variants.len()
            );

            if !doc.segments.is_empty() {
                info!("resolved {} into {} segments", target, doc.segments.len());
                return Ok(doc.segments);
            }

            match doc.best_variant() {
                Some(variant) => {
                    debug!(
                        "following variant {} ({} bps)",
                        variant.url, variant.bandwidth
                    );
                    current = variant.url.clone();
                }
                None => return Err(Error::NoSegmentsFound),
            }
        }

        error!("playlist {} nests deeper than {}", target, MAX_MANIFEST_DEPTH);
        Err(Error::ManifestTooDeep)
    }
}
