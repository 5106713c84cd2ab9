use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::{debug, error};

pub type AppResult<T> = Result<T, Error>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("missing url parameter")]
    MissingTarget,

    #[error("invalid url")]
    InvalidTarget,

    #[error("protocol not allowed: {0}")]
    DisallowedScheme(String),

    #[error("upstream returned {status}")]
    UpstreamFetchFailed { status: u16 },

    #[error("manifest nesting too deep")]
    ManifestTooDeep,

    #[error("no downloadable segments found")]
    NoSegmentsFound,

    #[error("upstream request failed: {0}")]
    Network(String),

    #[error("request cancelled by client")]
    Cancelled,

    #[error("download failed")]
    DownloadFailed { detail: String },

    #[error("{0}")]
    InternalServerErrorWithContext(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::MissingTarget | Error::InvalidTarget | Error::DisallowedScheme(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::UpstreamFetchFailed { status } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Error::ManifestTooDeep
            | Error::NoSegmentsFound
            | Error::Network(_)
            | Error::Cancelled
            | Error::DownloadFailed { .. } => StatusCode::BAD_GATEWAY,
            Error::InternalServerErrorWithContext(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// wraps anything that went wrong while preparing an hls download, the client always gets a
    /// 502 with the real reason in `detail`
    pub fn into_download_failure(self) -> Self {
        match self {
            Error::DownloadFailed { .. } => self,
            other => Error::DownloadFailed {
                detail: other.to_string(),
            },
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Network(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::InternalServerErrorWithContext(format!("relay cache io: {}", err))
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // nobody is listening anymore but it still ends up here if a handler bails late
        if matches!(self, Error::Cancelled) {
            debug!("request cancelled before a response was sent");
        } else if status.is_server_error() {
            error!("request failed with {}: {}", status, self);
        } else {
            debug!("request rejected with {}: {}", status, self);
        }

        let body = match self {
            Error::DownloadFailed { detail } => ErrorBody {
                error: "download failed".to_string(),
                detail: Some(detail),
            },
            other => ErrorBody {
                error: other.to_string(),
                detail: None,
            },
        };

        (status, Json(body)).into_response()
    }
}
