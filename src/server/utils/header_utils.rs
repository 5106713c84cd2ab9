use axum::http::{HeaderMap, HeaderName, HeaderValue, header};
use url::Url;

const DOWNLOAD_FORWARD: [HeaderName; 3] = [header::USER_AGENT, header::ACCEPT, header::ACCEPT_LANGUAGE];

const PROXY_FORWARD: [HeaderName; 5] = [
    header::USER_AGENT,
    header::ACCEPT,
    header::ACCEPT_LANGUAGE,
    header::RANGE,
    header::ACCEPT_ENCODING,
];

/// headers sent upstream for every fetch a request makes, built once from the inbound request
/// and then stamped with host/origin/referer per target
#[derive(Debug, Clone, Default)]
pub struct UpstreamHeaders {
    forwarded: HeaderMap,
}

impl UpstreamHeaders {
    fn pick(inbound: &HeaderMap, keys: &[HeaderName]) -> Self {
        let mut forwarded = HeaderMap::new();
        for key in keys {
            if let Some(value) = inbound.get(key) {
                forwarded.insert(key.clone(), value.clone());
            }
        }
        Self { forwarded }
    }

    pub fn for_download(inbound: &HeaderMap) -> Self {
        Self::pick(inbound, &DOWNLOAD_FORWARD)
    }

    pub fn for_proxy(inbound: &HeaderMap) -> Self {
        Self::pick(inbound, &PROXY_FORWARD)
    }

    /// playlists get rewritten as text so they're always requested uncompressed
    pub fn without_encoding(mut self) -> Self {
        self.forwarded.remove(header::ACCEPT_ENCODING);
        self
    }

    pub fn forwarded(&self) -> &HeaderMap {
        &self.forwarded
    }

    pub fn for_target(&self, target: &Url) -> HeaderMap {
        let mut headers = self.forwarded.clone();

        if let Some(host) = target.host_str() {
            let host = match target.port() {
                Some(port) => format!("{}:{}", host, port),
                None => host.to_string(),
            };
            if let Ok(value) = HeaderValue::from_str(&host) {
                headers.insert(header::HOST, value);
            }
        }

        let origin = target.origin().ascii_serialization();
        if let Ok(value) = HeaderValue::from_str(&format!("{}/", origin)) {
            headers.insert(header::REFERER, value);
        }
        if let Ok(value) = HeaderValue::from_str(&origin) {
            headers.insert(header::ORIGIN, value);
        }

        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamps_origin_headers_for_each_target() {
        let mut inbound = HeaderMap::new();
        inbound.insert(header::USER_AGENT, HeaderValue::from_static("vlc/3.0"));
        inbound.insert(header::COOKIE, HeaderValue::from_static("auth=secret"));

        let headers = UpstreamHeaders::for_download(&inbound)
            .for_target(&Url::parse("https://cdn.example.com:8443/a/b.ts").unwrap());

        assert_eq!(headers.get(header::USER_AGENT).unwrap(), "vlc/3.0");
        assert_eq!(headers.get(header::HOST).unwrap(), "cdn.example.com:8443");
        assert_eq!(
            headers.get(header::REFERER).unwrap(),
            "https://cdn.example.com:8443/"
        );
        assert_eq!(
            headers.get(header::ORIGIN).unwrap(),
            "https://cdn.example.com:8443"
        );
        assert!(headers.get(header::COOKIE).is_none());
    }

    #[test]
    fn proxy_forwards_range_but_download_does_not() {
        let mut inbound = HeaderMap::new();
        inbound.insert(header::RANGE, HeaderValue::from_static("bytes=0-99"));
        inbound.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip"));

        assert!(UpstreamHeaders::for_download(&inbound).forwarded().is_empty());

        let proxy = UpstreamHeaders::for_proxy(&inbound);
        assert_eq!(proxy.forwarded().len(), 2);
        assert!(
            proxy
                .without_encoding()
                .forwarded()
                .get(header::ACCEPT_ENCODING)
                .is_none()
        );
    }
}
