use thiserror::Error;

use crate::protocol::ErrorBody;

pub const DEFAULT_CONFLICT_MESSAGE: &str = "data conflict";

/// Outcome taxonomy for every HTTP call. `Display` is the user-facing text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("invalid URL")]
    InvalidUrl,
    #[error("failed to encode request")]
    EncodingError,
    #[error("failed to decode response")]
    DecodingError,
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("not authorized")]
    Unauthorized,
    #[error("server error, try again later")]
    ServerError,
    #[error("invalid username or password")]
    InvalidCredentials,
    #[error("bad request")]
    BadRequest,
    #[error("HTTP error: {0}")]
    HttpError(u16),
    #[error("{0}")]
    Conflict(String),
}

impl ApiError {
    /// Maps a non-success status to its error; `None` for 2xx.
    pub fn from_status(status: u16, body: &[u8]) -> Option<Self> {
        match status {
            200..=299 => None,
            401 => Some(Self::InvalidCredentials),
            400 => Some(Self::BadRequest),
            409 => Some(Self::Conflict(conflict_message(body))),
            500..=599 => Some(Self::ServerError),
            other => Some(Self::HttpError(other)),
        }
    }

    /// Errors after which the held credential can no longer be trusted.
    pub fn is_credential_rejection(&self) -> bool {
        matches!(self, Self::InvalidCredentials | Self::Unauthorized)
    }
}

fn conflict_message(body: &[u8]) -> String {
    serde_json::from_slice::<ErrorBody>(body)
        .map(|b| b.error)
        .unwrap_or_else(|_| DEFAULT_CONFLICT_MESSAGE.to_string())
}
