use crate::krb5;
use serde::Serialize;
use std::{fmt, time::Duration};
use thiserror::Error;
use utoipa::ToSchema;

/// Every failure the broker can surface to a caller.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("delegated credentials unavailable: {0}")]
    CredentialUnavailable(String),
    #[error("invalid realm configuration: {0}")]
    ConfigInvalid(String),
    #[error("ticket issuance for {spn} failed: {source}")]
    TicketIssuanceFailed {
        spn: String,
        #[source]
        source: krb5::Error,
    },
    #[error("token encoding failed: {0}")]
    TokenEncodingFailed(String),
    #[error("downstream rejected authentication: {0}")]
    DownstreamAuthRejected(String),
    #[error("login response carried no `{0}` session cookie")]
    SessionCookieMissing(String),
    #[error("downstream transport error: {0}")]
    DownstreamTransportError(String),
    #[error("downstream error {code}: {message}")]
    DownstreamApplicationError { code: String, message: String },
    #[error("exclusive slot not acquired within {0:?}")]
    SlotAcquireTimeout(Duration),
    #[error("request deadline exceeded")]
    DeadlineExceeded,
}

/// Stable, serializable names for [`BrokerError`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
pub enum ErrorKind {
    CredentialUnavailable,
    ConfigInvalid,
    TicketIssuanceFailed,
    TokenEncodingFailed,
    DownstreamAuthRejected,
    SessionCookieMissing,
    DownstreamTransportError,
    DownstreamApplicationError,
    SlotAcquireTimeout,
    DeadlineExceeded,
}

impl ErrorKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CredentialUnavailable => "CredentialUnavailable",
            Self::ConfigInvalid => "ConfigInvalid",
            Self::TicketIssuanceFailed => "TicketIssuanceFailed",
            Self::TokenEncodingFailed => "TokenEncodingFailed",
            Self::DownstreamAuthRejected => "DownstreamAuthRejected",
            Self::SessionCookieMissing => "SessionCookieMissing",
            Self::DownstreamTransportError => "DownstreamTransportError",
            Self::DownstreamApplicationError => "DownstreamApplicationError",
            Self::SlotAcquireTimeout => "SlotAcquireTimeout",
            Self::DeadlineExceeded => "DeadlineExceeded",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl BrokerError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::CredentialUnavailable(_) => ErrorKind::CredentialUnavailable,
            Self::ConfigInvalid(_) => ErrorKind::ConfigInvalid,
            Self::TicketIssuanceFailed { .. } => ErrorKind::TicketIssuanceFailed,
            Self::TokenEncodingFailed(_) => ErrorKind::TokenEncodingFailed,
            Self::DownstreamAuthRejected(_) => ErrorKind::DownstreamAuthRejected,
            Self::SessionCookieMissing(_) => ErrorKind::SessionCookieMissing,
            Self::DownstreamTransportError(_) => ErrorKind::DownstreamTransportError,
            Self::DownstreamApplicationError { .. } => ErrorKind::DownstreamApplicationError,
            Self::SlotAcquireTimeout(_) => ErrorKind::SlotAcquireTimeout,
            Self::DeadlineExceeded => ErrorKind::DeadlineExceeded,
        }
    }

    /// Issuance failures that a second attempt may fix (KDC unreachable).
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TicketIssuanceFailed { source, .. } if source.is_transient())
    }
}
