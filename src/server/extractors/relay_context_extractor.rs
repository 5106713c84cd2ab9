use axum::Extension;
use axum::extract::FromRequestParts;
use axum::http::header::HOST;
use axum::http::request::Parts;
use tracing::debug;
use url::Url;

use crate::server::error::Error;
use crate::server::services::AppServices;

/// origin this request was made against plus the shared services
pub struct RelayContext(pub Url, pub AppServices);

fn header_str<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts
        .headers
        .get(name)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
}

/// rebuilds `scheme://host/` from forwarding headers, falling back to the host header
pub fn request_origin(parts: &Parts) -> Url {
    let scheme = header_str(parts, "x-forwarded-proto").unwrap_or("http");
    let host = header_str(parts, "x-forwarded-host")
        .or_else(|| header_str(parts, HOST.as_str()))
        .or_else(|| parts.uri.authority().map(|a| a.as_str()))
        .unwrap_or("localhost");

    Url::parse(&format!("{}://{}/", scheme, host)).unwrap_or_else(|_| {
        debug!("unusable request origin {}://{}, using localhost", scheme, host);
        Url::parse("http://localhost/").expect("static origin should parse")
    })
}

impl<S> FromRequestParts<S> for RelayContext
where
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Extension(services): Extension<AppServices> =
            Extension::from_request_parts(parts, state)
                .await
                .map_err(|err| Error::InternalServerErrorWithContext(err.to_string()))?;

        let origin = request_origin(parts);
        debug!("request origin resolved to {}", origin);

        Ok(RelayContext(origin, services))
    }
}
