//! Authenticated session state and its persisted copy.
//!
//! The credential and the identity always travel together: in memory through
//! [`Session`], and on disk as the `authToken` / `currentUser` blob pair,
//! which is written and cleared in one [`BlobStore::apply`] batch.

use std::{fmt, sync::Arc};

use anyhow::Result;
use chrono::Utc;
use shared::{
    domain::{User, MIN_USERNAME_CHARS},
    error::ApiError,
    protocol::{RegisterRequest, RegisteredUser},
};
use storage::{BlobOp, BlobStore};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::{
    api::ApiClient,
    error::{AuthError, ProfileError},
};

pub const AUTH_TOKEN_KEY: &str = "authToken";
pub const CURRENT_USER_KEY: &str = "currentUser";

/// Opaque bearer token. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Empty tokens are treated as no token at all.
    pub fn new(token: impl Into<String>) -> Option<Self> {
        let token = token.into();
        (!token.is_empty()).then_some(Self(token))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum Session {
    #[default]
    Unauthenticated,
    Authenticated {
        credential: Credential,
        identity: User,
    },
}

impl Session {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated { .. })
    }

    pub fn credential(&self) -> Option<&Credential> {
        match self {
            Self::Authenticated { credential, .. } => Some(credential),
            Self::Unauthenticated => None,
        }
    }

    pub fn identity(&self) -> Option<&User> {
        match self {
            Self::Authenticated { identity, .. } => Some(identity),
            Self::Unauthenticated => None,
        }
    }
}

pub struct SessionStore {
    api: Arc<ApiClient>,
    blobs: Arc<dyn BlobStore>,
    inner: Mutex<Session>,
    published: watch::Sender<Session>,
}

impl SessionStore {
    pub fn new(api: Arc<ApiClient>, blobs: Arc<dyn BlobStore>) -> Self {
        let (published, _) = watch::channel(Session::Unauthenticated);
        Self {
            api,
            blobs,
            inner: Mutex::new(Session::Unauthenticated),
            published,
        }
    }

    pub fn session(&self) -> Session {
        self.published.borrow().clone()
    }

    pub fn credential(&self) -> Option<Credential> {
        self.published.borrow().credential().cloned()
    }

    pub fn identity(&self) -> Option<User> {
        self.published.borrow().identity().cloned()
    }

    pub fn is_authenticated(&self) -> bool {
        self.published.borrow().is_authenticated()
    }

    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.published.subscribe()
    }

    fn commit(&self, guard: &mut Session, next: Session) {
        *guard = next.clone();
        self.published.send_replace(next);
    }

    /// Loads the persisted session, repairing a half-written pair by
    /// clearing both halves.
    pub async fn restore(&self) -> Session {
        let mut guard = self.inner.lock().await;
        let restored = match self.read_persisted().await {
            Ok(session) => session,
            Err(err) => {
                warn!(error = %err, "session: failed to read persisted session");
                self.clear_persisted().await;
                Session::Unauthenticated
            }
        };
        if let Some(identity) = restored.identity() {
            info!(
                user_id = identity.id.0,
                username = %identity.username,
                "session: restored"
            );
        }
        self.commit(&mut guard, restored.clone());
        restored
    }

    async fn read_persisted(&self) -> Result<Session> {
        let token = self.blobs.load(AUTH_TOKEN_KEY).await?;
        let user = self.blobs.load(CURRENT_USER_KEY).await?;
        let any_persisted = token.is_some() || user.is_some();

        let credential = token
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .and_then(Credential::new);
        let identity = user.and_then(|bytes| match serde_json::from_slice::<User>(&bytes) {
            Ok(user) => Some(user),
            Err(err) => {
                warn!(error = %err, "session: stored identity is corrupt");
                None
            }
        });

        match (credential, identity) {
            (Some(credential), Some(identity)) => Ok(Session::Authenticated {
                credential,
                identity,
            }),
            (credential, identity) => {
                if any_persisted {
                    warn!(
                        has_credential = credential.is_some(),
                        has_identity = identity.is_some(),
                        "session: incomplete persisted session, clearing"
                    );
                    self.blobs
                        .apply(vec![
                            BlobOp::delete(AUTH_TOKEN_KEY),
                            BlobOp::delete(CURRENT_USER_KEY),
                        ])
                        .await?;
                }
                Ok(Session::Unauthenticated)
            }
        }
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<Session, AuthError> {
        let result = self.api.login(username, password).await;
        let mut guard = self.inner.lock().await;

        let response = match result {
            Ok(response) => response,
            Err(err) => {
                warn!(username, error = %err, "session: login failed");
                self.wipe_session(&mut guard).await;
                return Err(AuthError::Api(err));
            }
        };
        let Some(credential) = Credential::new(response.token) else {
            self.wipe_session(&mut guard).await;
            return Err(AuthError::MissingToken);
        };

        let mut identity = User::placeholder(response.user.id, response.user.username);
        identity.updated_at = Some(Utc::now());

        if let Err(err) = self.persist_new_login(&credential, &identity).await {
            error!(error = %err, "session: failed to persist login");
            self.wipe_session(&mut guard).await;
            return Err(AuthError::Storage(err.to_string()));
        }

        info!(
            user_id = identity.id.0,
            username = %identity.username,
            "session: logged in"
        );
        let session = Session::Authenticated {
            credential,
            identity,
        };
        self.commit(&mut guard, session.clone());
        Ok(session)
    }

    async fn persist_new_login(&self, credential: &Credential, identity: &User) -> Result<()> {
        // The previous account's identity must be gone before the new pair lands.
        self.blobs.remove(CURRENT_USER_KEY).await?;
        self.persist_pair(credential, identity).await
    }

    async fn persist_pair(&self, credential: &Credential, identity: &User) -> Result<()> {
        let user_bytes = serde_json::to_vec(identity)?;
        self.blobs
            .apply(vec![
                BlobOp::put(AUTH_TOKEN_KEY, credential.expose().as_bytes().to_vec()),
                BlobOp::put(CURRENT_USER_KEY, user_bytes),
            ])
            .await
    }

    /// Creates an account. Does not log in.
    pub async fn register(
        &self,
        username: &str,
        email: &str,
        password: &str,
    ) -> Result<RegisteredUser, AuthError> {
        if username.trim().chars().count() < MIN_USERNAME_CHARS {
            return Err(AuthError::InvalidUsername {
                min: MIN_USERNAME_CHARS,
            });
        }
        let body = RegisterRequest {
            username: username.trim().to_string(),
            email: email.trim().to_string(),
            password: password.to_string(),
        };
        let response = self.api.register(&body).await?;
        info!(username = %response.user.username, "session: account registered");
        Ok(response.user)
    }

    pub async fn logout(&self) {
        let mut guard = self.inner.lock().await;
        if let Some(identity) = guard.identity() {
            info!(user_id = identity.id.0, "session: logged out");
        }
        self.wipe_session(&mut guard).await;
    }

    /// Re-reads the identity from the server.
    ///
    /// A profile for a different user id wipes every persisted blob, not
    /// just the session pair.
    pub async fn refresh_identity(&self) -> Result<User, ProfileError> {
        let Some(credential) = self.credential() else {
            return Err(ProfileError::NotAuthenticated);
        };
        let result = self.api.profile(credential.expose()).await;
        let mut guard = self.inner.lock().await;

        let held_id = match &*guard {
            Session::Authenticated {
                credential: held,
                identity,
            } if *held == credential => identity.id,
            _ => {
                debug!("session: changed while profile refresh was in flight");
                return Err(ProfileError::NotAuthenticated);
            }
        };

        let user = match result {
            Ok(user) => user,
            Err(err) => {
                warn!(error = %err, "session: profile refresh failed, logging out");
                self.wipe_session(&mut guard).await;
                return Err(ProfileError::Api(err));
            }
        };

        if user.id != held_id {
            error!(
                held = held_id.0,
                received = user.id.0,
                "session: profile identity mismatch, wiping local state"
            );
            if let Err(err) = self.blobs.clear_all().await {
                error!(error = %err, "session: failed to wipe local state");
            }
            self.commit(&mut guard, Session::Unauthenticated);
            return Err(ProfileError::IdentityMismatch {
                held: held_id,
                received: user.id,
            });
        }

        if let Err(err) = self.persist_pair(&credential, &user).await {
            warn!(error = %err, "session: failed to persist refreshed identity");
        }
        self.commit(
            &mut guard,
            Session::Authenticated {
                credential,
                identity: user.clone(),
            },
        );
        Ok(user)
    }

    /// Logs out when `err` says the server no longer accepts the credential.
    pub async fn revoke_if_unauthorized(&self, err: &ApiError) {
        if err.is_credential_rejection() && self.is_authenticated() {
            warn!(error = %err, "session: credential rejected, logging out");
            self.logout().await;
        }
    }

    async fn wipe_session(&self, guard: &mut Session) {
        self.clear_persisted().await;
        self.commit(guard, Session::Unauthenticated);
    }

    async fn clear_persisted(&self) {
        if let Err(err) = self
            .blobs
            .apply(vec![
                BlobOp::delete(AUTH_TOKEN_KEY),
                BlobOp::delete(CURRENT_USER_KEY),
            ])
            .await
        {
            warn!(error = %err, "session: failed to clear persisted session");
        }
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
