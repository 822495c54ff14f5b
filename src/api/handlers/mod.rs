pub mod health;
pub mod test_db;
pub mod user_show;

use crate::{
    api::ApiState,
    broker::{BrokerError, CredentialHandle, ErrorKind},
};
use axum::{
    Json,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, error, warn};
use utoipa::ToSchema;

/// Error body returned by every endpoint.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    /// Failure kind, e.g. `DownstreamAuthRejected`.
    pub error: String,
    pub message: String,
}

#[derive(Debug)]
pub enum ApiError {
    /// The credential cache header is absent or unusable.
    MissingCredential(String),
    MissingParameter(&'static str),
    Broker(BrokerError),
}

impl From<BrokerError> for ApiError {
    fn from(err: BrokerError) -> Self {
        Self::Broker(err)
    }
}

/// HTTP status for each failure kind.
#[must_use]
pub const fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::CredentialUnavailable => StatusCode::UNAUTHORIZED,
        ErrorKind::TicketIssuanceFailed
        | ErrorKind::DownstreamAuthRejected
        | ErrorKind::SessionCookieMissing
        | ErrorKind::DownstreamTransportError
        | ErrorKind::DownstreamApplicationError => StatusCode::BAD_GATEWAY,
        ErrorKind::SlotAcquireTimeout | ErrorKind::DeadlineExceeded => {
            StatusCode::GATEWAY_TIMEOUT
        }
        ErrorKind::ConfigInvalid | ErrorKind::TokenEncodingFailed => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            Self::MissingCredential(message) => (
                StatusCode::UNAUTHORIZED,
                ErrorKind::CredentialUnavailable.to_string(),
                message,
            ),
            Self::MissingParameter(name) => (
                StatusCode::BAD_REQUEST,
                "MissingParameter".to_string(),
                format!("missing required query parameter `{name}`"),
            ),
            Self::Broker(err) => {
                let status = status_for(err.kind());
                if status.is_server_error() {
                    error!("request failed: {err}");
                } else {
                    warn!("request failed: {err}");
                }
                (status, err.kind().to_string(), err.to_string())
            }
        };
        (status, Json(ErrorBody { error, message })).into_response()
    }
}

/// Read the delegated credential handle from the configured header.
pub(crate) fn credential_handle(
    headers: &HeaderMap,
    state: &ApiState,
) -> Result<CredentialHandle, ApiError> {
    let Some(value) = headers.get(&state.ccache_header) else {
        debug!("no {} header", state.ccache_header);
        return Err(ApiError::MissingCredential(format!(
            "missing {} header",
            state.ccache_header
        )));
    };
    let raw = value.to_str().map_err(|_| {
        ApiError::MissingCredential(format!("{} header is not valid text", state.ccache_header))
    })?;
    CredentialHandle::parse(raw).map_err(|err| ApiError::MissingCredential(err.to_string()))
}

pub(crate) fn deadline(state: &ApiState) -> Instant {
    Instant::now() + state.request_timeout
}
