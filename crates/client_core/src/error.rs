use shared::{
    domain::{ContentError, UserId},
    error::ApiError,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("username must be at least {min} characters")]
    InvalidUsername { min: usize },
    #[error("server returned an empty token")]
    MissingToken,
    #[error("failed to persist session: {0}")]
    Storage(String),
}

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("not logged in")]
    NotAuthenticated,
    #[error("profile belongs to user {received}, session was for user {held}")]
    IdentityMismatch { held: UserId, received: UserId },
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Realtime connection failures. The channel also reports these by
/// falling back to [`crate::realtime::ConnectionState::Disconnected`].
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("invalid realtime url '{0}'")]
    InvalidUrl(String),
    #[error("realtime handshake failed: {0}")]
    Handshake(String),
    #[error("connection attempt was cancelled by a disconnect")]
    Superseded,
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error(transparent)]
    Content(#[from] ContentError),
    #[error(transparent)]
    Api(#[from] ApiError),
}
