use std::sync::{Arc, Weak};

use shared::{
    domain::{
        validate_message_content, Chat, ChatId, ContentError, Message, MessageId, MessageKind,
        UserId,
    },
    error::ApiError,
    protocol::RegisteredUser,
};
use storage::BlobStore;
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing::{debug, info, warn};

pub mod api;
pub mod config;
pub mod error;
pub mod realtime;
pub mod reconciler;
pub mod session;

pub use api::ApiClient;
pub use config::{load_settings, ClientSettings};
pub use error::{AuthError, ConnectionError, ProfileError, SendError};
pub use realtime::{ConnectionState, RealtimeChannel, RealtimeEvent, RealtimeOptions};
pub use reconciler::MessageReconciler;
pub use session::{Credential, Session, SessionStore};

/// Application root: builds the services once and owns their lifecycle.
pub struct ChatClient {
    settings: ClientSettings,
    api: Arc<ApiClient>,
    session: Arc<SessionStore>,
    realtime: Arc<RealtimeChannel>,
    reconciler: Arc<MessageReconciler>,
    live_pump: Mutex<Option<JoinHandle<()>>>,
    session_watch: Mutex<Option<JoinHandle<()>>>,
    room_binding: Mutex<Option<RoomBinding>>,
}

/// Identity the open room (live socket and message list) was opened under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RoomBinding {
    user_id: Option<UserId>,
}

impl ChatClient {
    pub fn new(settings: ClientSettings, blobs: Arc<dyn BlobStore>) -> Result<Arc<Self>, ApiError> {
        let api = Arc::new(ApiClient::with_timeout(
            &settings.api_base_url,
            settings.request_timeout(),
        )?);
        let session = Arc::new(SessionStore::new(Arc::clone(&api), blobs));
        let realtime = RealtimeChannel::new(settings.realtime_options());
        let reconciler = Arc::new(MessageReconciler::new(
            Arc::clone(&api),
            Arc::clone(&session),
        ));
        Ok(Arc::new(Self {
            settings,
            api,
            session,
            realtime,
            reconciler,
            live_pump: Mutex::new(None),
            session_watch: Mutex::new(None),
            room_binding: Mutex::new(None),
        }))
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn api(&self) -> &Arc<ApiClient> {
        &self.api
    }

    pub fn session(&self) -> &Arc<SessionStore> {
        &self.session
    }

    pub fn realtime(&self) -> &Arc<RealtimeChannel> {
        &self.realtime
    }

    pub fn reconciler(&self) -> &Arc<MessageReconciler> {
        &self.reconciler
    }

    /// Restores the persisted session and, when there is one, re-validates
    /// the identity against the server.
    pub async fn start(self: &Arc<Self>) -> Session {
        self.ensure_session_watch().await;
        let restored = self.session.restore().await;
        if restored.is_authenticated() {
            if let Err(err) = self.session.refresh_identity().await {
                warn!(error = %err, "client: stored session no longer valid");
            }
        }
        self.enforce_session_boundary().await;
        self.session.session()
    }

    /// Closes the room whenever the session it was opened under ends,
    /// including session changes made directly on [`SessionStore`].
    async fn ensure_session_watch(self: &Arc<Self>) {
        let mut guard = self.session_watch.lock().await;
        if guard.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let mut sessions = self.session.subscribe();
        let client: Weak<Self> = Arc::downgrade(self);
        *guard = Some(tokio::spawn(async move {
            while sessions.changed().await.is_ok() {
                let Some(client) = client.upgrade() else {
                    break;
                };
                client.enforce_session_boundary().await;
            }
        }));
    }

    async fn enforce_session_boundary(&self) {
        let current = self.session.identity().map(|identity| identity.id);
        let mut binding = self.room_binding.lock().await;
        let Some(bound) = *binding else {
            return;
        };
        if bound.user_id == current {
            return;
        }
        info!(
            bound_user = ?bound.user_id.map(|id| id.0),
            current_user = ?current.map(|id| id.0),
            "client: session changed, closing room"
        );
        *binding = None;
        self.reset_room().await;
    }

    /// Disconnects, drops queued live events, then empties the message list.
    /// Callers hold the `room_binding` lock.
    async fn reset_room(&self) {
        self.realtime.disconnect().await;
        if let Some(task) = self.live_pump.lock().await.take() {
            task.abort();
        }
        self.reconciler.clear().await;
    }

    async fn ensure_live_pump(self: &Arc<Self>) {
        let mut guard = self.live_pump.lock().await;
        if guard.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let mut events = BroadcastStream::new(self.realtime.subscribe());
        let reconciler = Arc::clone(&self.reconciler);
        *guard = Some(tokio::spawn(async move {
            while let Some(event) = events.next().await {
                match event {
                    Ok(RealtimeEvent::Message(message)) => {
                        reconciler.on_live_message(message).await;
                    }
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "client: live message pump lagged"),
                }
            }
        }));
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<Session, AuthError> {
        let result = self.session.login(username, password).await;
        self.enforce_session_boundary().await;
        result
    }

    pub async fn register(
        &self,
        username: &str,
        email: &str,
        password: &str,
    ) -> Result<RegisteredUser, AuthError> {
        self.session.register(username, email, password).await
    }

    pub async fn logout(&self) {
        let mut binding = self.room_binding.lock().await;
        *binding = None;
        self.reset_room().await;
        drop(binding);
        self.session.logout().await;
    }

    fn bearer(&self) -> Result<Credential, ApiError> {
        self.session.credential().ok_or(ApiError::Unauthorized)
    }

    async fn checked<T>(&self, result: Result<T, ApiError>) -> Result<T, ApiError> {
        if let Err(err) = &result {
            self.session.revoke_if_unauthorized(err).await;
            self.enforce_session_boundary().await;
        }
        result
    }

    pub async fn list_chats(&self) -> Result<Vec<Chat>, ApiError> {
        let credential = self.bearer()?;
        let result = self.api.list_chats(credential.expose()).await;
        self.checked(result).await.map(|response| response.chats)
    }

    pub async fn chat(&self, chat_id: ChatId) -> Result<Chat, ApiError> {
        let credential = self.bearer()?;
        let result = self.api.chat(chat_id, credential.expose()).await;
        self.checked(result).await
    }

    /// Connects the live channel, then replaces the message list with the
    /// server history for `chat_id`.
    pub async fn open_room(self: &Arc<Self>, chat_id: ChatId) -> Result<Vec<Message>, ApiError> {
        self.ensure_session_watch().await;
        self.enforce_session_boundary().await;
        let identity = self.session.identity();
        {
            let mut binding = self.room_binding.lock().await;
            *binding = Some(RoomBinding {
                user_id: identity.as_ref().map(|identity| identity.id),
            });
            self.ensure_live_pump().await;
        }
        debug!(chat_id = chat_id.0, "client: opening room");
        if let Err(err) = self.realtime.connect(identity.as_ref()).await {
            warn!(error = %err, "client: live updates unavailable");
        }
        if chat_id != self.settings.room() {
            info!(
                chat_id = chat_id.0,
                room = self.settings.room_chat_id,
                "client: live updates only cover the shared room"
            );
        }
        let history = self.reconciler.load_history(chat_id).await;
        self.enforce_session_boundary().await;
        history
    }

    /// Sends over the live channel; the server echo lands in the message list.
    pub async fn send_message(&self, content: &str, chat_id: ChatId) -> Result<(), ContentError> {
        self.realtime.send_chat_message(content, chat_id).await
    }

    /// Sends through `POST /messages` and returns the stored message.
    pub async fn post_message(
        &self,
        content: &str,
        chat_id: ChatId,
        kind: MessageKind,
        reply_to_id: Option<MessageId>,
    ) -> Result<Message, SendError> {
        let content = validate_message_content(content)?;
        let credential = self.bearer()?;
        let result = self
            .api
            .send_message(content, kind, chat_id, reply_to_id, credential.expose())
            .await;
        Ok(self.checked(result).await?)
    }

    pub async fn set_typing(&self, chat_id: ChatId, is_typing: bool) {
        self.realtime.send_typing(chat_id, is_typing).await;
    }

    pub fn is_from_current_user(&self, message: &Message) -> bool {
        self.reconciler.is_from_current_user(message)
    }

    pub async fn close(&self) {
        self.realtime.disconnect().await;
        if let Some(task) = self.live_pump.lock().await.take() {
            task.abort();
        }
        if let Some(task) = self.session_watch.lock().await.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
