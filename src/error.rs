//! Error taxonomy shared by the token lifecycle, the authorization flow and
//! the API proxy, plus its mapping onto HTTP responses.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use std::fmt;

/// Why a scope has no usable token.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnauthorizedReason {
    /// No record was ever stored for the scope (or it was disconnected).
    NotConnected,
    /// A record exists but it expired and could not be refreshed.
    Expired,
}

impl fmt::Display for UnauthorizedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnauthorizedReason::NotConnected => write!(f, "not connected"),
            UnauthorizedReason::Expired => write!(f, "token expired and could not be refreshed"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Token exchange or refresh rejected by the provider. Carries the raw
    /// provider error body.
    #[error("{message}")]
    UpstreamAuth { message: String },

    /// CSRF state missing, unknown, expired or superseded.
    #[error("Invalid or expired OAuth state")]
    InvalidState,

    #[error("Scope '{scope}' is {reason}")]
    Unauthorized {
        scope: String,
        reason: UnauthorizedReason,
    },

    /// Non-2xx from a provider data endpoint. Passed through verbatim.
    #[error("Upstream API returned {status}")]
    UpstreamApi { status: u16, body: String },

    /// Network failure or timeout talking to the provider.
    #[error("Upstream request failed: {0}")]
    Transport(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotConfigured(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Storage failure: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl From<reqwest::Error> for BrokerError {
    fn from(err: reqwest::Error) -> Self {
        BrokerError::Transport(err.to_string())
    }
}

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl BrokerError {
    /// HTTP status this error is reported with.
    pub fn status_code(&self) -> StatusCode {
        match self {
            BrokerError::UpstreamApi { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            BrokerError::UpstreamAuth { .. } | BrokerError::Transport(_) => StatusCode::BAD_GATEWAY,
            BrokerError::InvalidState | BrokerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            BrokerError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            BrokerError::NotConfigured(_) | BrokerError::NotFound(_) => StatusCode::NOT_FOUND,
            BrokerError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if let BrokerError::UpstreamApi { body, .. } = self {
            return (status, [(header::CONTENT_TYPE, "application/json")], body).into_response();
        }

        let body = Json(ErrorResponse {
            error: self.to_string(),
        });

        (status, body).into_response()
    }
}
