use tracing::debug;
use url::Url;

use crate::server::error::{AppResult, Error};

const ALLOWED_SCHEMES: [&str; 2] = ["http", "https"];

/// how many times an embedded `url=` value gets percent-decoded before we give up
const MAX_DENEST_ATTEMPTS: usize = 3;

/// proxy urls wrapped inside proxy urls, anything deeper than this is rejected
const MAX_PROXY_NESTING: usize = 3;

const PROXY_PARAM: &str = "url=";

fn is_http(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

/// only http(s) gets through. no dns lookups and no private range blocking happen here, any
/// host the client names is reachable
pub fn ensure_allowed_scheme(url: &Url) -> AppResult<()> {
    if ALLOWED_SCHEMES.contains(&url.scheme()) {
        Ok(())
    } else {
        Err(Error::DisallowedScheme(url.scheme().to_string()))
    }
}

/// peel an embedded proxy target, decoding at most three times and stopping as soon as it looks
/// like a bare absolute url
pub fn denest(raw: &str) -> Option<String> {
    let mut current = raw.trim().to_string();
    if current.is_empty() {
        return None;
    }

    for _ in 0..MAX_DENEST_ATTEMPTS {
        if is_http(&current) {
            return Some(current);
        }
        let decoded = match urlencoding::decode(&current) {
            Ok(decoded) => decoded.into_owned(),
            Err(_) => break,
        };
        if decoded == current {
            break;
        }
        current = decoded;
    }

    is_http(&current).then_some(current)
}

/// turn whatever the client sent into the url we actually fetch
pub fn resolve_target(raw: &str, request_origin: &Url, proxy_path: &str) -> AppResult<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(Error::MissingTarget);
    }

    let absolute = if is_http(trimmed) {
        Url::parse(trimmed)
    } else {
        request_origin.join(trimmed)
    }
    .map_err(|_| Error::InvalidTarget)?;

    let mut current = absolute;
    for depth in 0..=MAX_PROXY_NESTING {
        let Some(embedded) = embedded_target(&current, proxy_path) else {
            ensure_allowed_scheme(&current)?;
            return Ok(current);
        };
        if depth == MAX_PROXY_NESTING {
            break;
        }
        let inner = denest(&embedded).ok_or(Error::InvalidTarget)?;
        debug!("denested proxied url {} -> {}", current, inner);
        current = Url::parse(&inner).map_err(|_| Error::InvalidTarget)?;
    }

    Err(Error::InvalidTarget)
}

/// the `url` query value if this url points at our own proxy path
fn embedded_target(url: &Url, proxy_path: &str) -> Option<String> {
    if proxy_path.is_empty() || !url.path().starts_with(proxy_path) {
        return None;
    }
    url.query_pairs()
        .find(|(key, _)| key == "url")
        .map(|(_, value)| value.into_owned())
}

/// proxy endpoint input, no denesting and no relative resolution
pub fn parse_proxy_target(raw: &str) -> AppResult<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(Error::MissingTarget);
    }
    let url = Url::parse(trimmed).map_err(|_| Error::InvalidTarget)?;
    ensure_allowed_scheme(&url)?;
    Ok(url)
}

pub fn is_already_proxied(url: &str, proxy_path: &str) -> bool {
    url.is_empty() || (url.contains(proxy_path) && url.contains(PROXY_PARAM))
}

/// `<proxy_path>?type=<kind>&url=<encoded target>`, left alone if it already goes through us
pub fn build_proxy_url(target: &str, kind: &str, proxy_path: &str) -> String {
    if is_already_proxied(target, proxy_path) {
        return target.to_string();
    }
    let separator = if proxy_path.contains('?') { '&' } else { '?' };
    format!(
        "{}{}type={}&url={}",
        proxy_path,
        separator,
        kind,
        urlencoding::encode(target)
    )
}

/// lower cased extension of the last path segment including the dot, empty if there isn't one
pub fn path_extension(url: &Url) -> String {
    let last = url.path().rsplit('/').next().unwrap_or("");
    match last.rfind('.') {
        Some(idx) if idx > 0 => last[idx..].to_lowercase(),
        _ => String::new(),
    }
}
