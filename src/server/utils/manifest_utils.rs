use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;
use url::Url;

use crate::server::utils::url_utils::build_proxy_url;

pub const MANIFEST_EXTENSION: &str = ".m3u8";

const STREAM_INF_TAG: &str = "#EXT-X-STREAM-INF";
const KEY_TAG: &str = "#EXT-X-KEY";

static BANDWIDTH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)BANDWIDTH=(\d+)").expect("bandwidth regex should compile"));

static KEY_URI_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"URI="([^"]+)""#).expect("key uri regex should compile"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variant {
    pub url: Url,
    pub bandwidth: u64,
}

/// one parsed playlist, either a media playlist (segments) or a master playlist (variants)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestDocument {
    pub segments: Vec<Url>,
    pub variants: Vec<Variant>,
}

impl ManifestDocument {
    /// highest bandwidth variant, the first one listed wins a tie
    pub fn best_variant(&self) -> Option<&Variant> {
        self.variants.iter().fold(None, |best: Option<&Variant>, v| match best {
            Some(b) if b.bandwidth >= v.bandwidth => Some(b),
            _ => Some(v),
        })
    }
}

fn bandwidth_of(tag_line: &str) -> u64 {
    BANDWIDTH_RE
        .captures(tag_line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

/// lenient: junk lines and unknown tags are skipped, a missing or bad bandwidth is 0
pub fn parse_manifest(text: &str, base_url: &Url) -> ManifestDocument {
    let mut doc = ManifestDocument::default();
    let mut current_bandwidth = 0;

    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with(STREAM_INF_TAG) {
            current_bandwidth = bandwidth_of(line);
            continue;
        }
        if line.starts_with('#') {
            continue;
        }

        // stream-inf only describes the uri right after it, even one we end up skipping
        let bandwidth = std::mem::take(&mut current_bandwidth);
        let resolved = match base_url.join(line) {
            Ok(resolved) => resolved,
            Err(e) => {
                debug!("skipping unparsable playlist line {:?}: {}", line, e);
                continue;
            }
        };

        if line.ends_with(MANIFEST_EXTENSION) {
            doc.variants.push(Variant {
                url: resolved,
                bandwidth,
            });
        } else {
            doc.segments.push(resolved);
        }
    }

    doc
}

fn resolve_or_raw(raw: &str, base_url: &Url) -> String {
    base_url
        .join(raw)
        .map(|u| u.to_string())
        .unwrap_or_else(|_| raw.to_string())
}

fn relay_kind(resolved: &str) -> &'static str {
    if resolved.ends_with(MANIFEST_EXTENSION) {
        "manifest"
    } else {
        "segment"
    }
}

/// point every uri in the playlist back at our own proxy endpoint
pub fn rewrite_manifest(text: &str, upstream_url: &Url, proxy_path: &str) -> String {
    text.lines()
        .map(|line| {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                return line.to_string();
            }

            if trimmed.starts_with(KEY_TAG) {
                return KEY_URI_RE
                    .replace(line, |caps: &regex::Captures| {
                        let uri = &caps[1];
                        // already ours, resolving it would make it absolute and wrap it again
                        if uri.starts_with(proxy_path) {
                            return caps[0].to_string();
                        }
                        let resolved = resolve_or_raw(uri, upstream_url);
                        format!(
                            "URI=\"{}\"",
                            build_proxy_url(&resolved, "segment", proxy_path)
                        )
                    })
                    .into_owned();
            }

            if trimmed.starts_with('#') || trimmed.starts_with(proxy_path) {
                return line.to_string();
            }

            let resolved = resolve_or_raw(trimmed, upstream_url);
            build_proxy_url(&resolved, relay_kind(&resolved), proxy_path)
        })
        .collect::<Vec<_>>()
        .join("\n")
}
