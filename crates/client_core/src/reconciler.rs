use std::sync::Arc;

use shared::{
    domain::{ChatId, Message},
    error::ApiError,
};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::{api::ApiClient, session::SessionStore};

/// The single ordered message list shown for the open chat.
///
/// History loads replace the list; live messages append in receipt order.
/// Duplicate suppression happens upstream in the realtime channel.
pub struct MessageReconciler {
    api: Arc<ApiClient>,
    session: Arc<SessionStore>,
    inner: Mutex<ReconcilerState>,
    published: watch::Sender<Vec<Message>>,
}

#[derive(Default)]
struct ReconcilerState {
    chat_id: Option<ChatId>,
    messages: Vec<Message>,
}

impl MessageReconciler {
    pub fn new(api: Arc<ApiClient>, session: Arc<SessionStore>) -> Self {
        let (published, _) = watch::channel(Vec::new());
        Self {
            api,
            session,
            inner: Mutex::new(ReconcilerState::default()),
            published,
        }
    }

    pub fn messages(&self) -> Vec<Message> {
        self.published.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Message>> {
        self.published.subscribe()
    }

    pub async fn chat_id(&self) -> Option<ChatId> {
        self.inner.lock().await.chat_id
    }

    fn publish(&self, state: &ReconcilerState) {
        self.published.send_replace(state.messages.clone());
    }

    /// Full refresh from the server. On failure the list is emptied.
    pub async fn load_history(&self, chat_id: ChatId) -> Result<Vec<Message>, ApiError> {
        let result = match self.session.credential() {
            Some(credential) => self
                .api
                .chat_messages(chat_id, credential.expose())
                .await
                .map(|response| response.messages),
            None => Err(ApiError::Unauthorized),
        };

        let mut guard = self.inner.lock().await;
        guard.chat_id = Some(chat_id);
        match result {
            Ok(messages) => {
                info!(chat_id = chat_id.0, count = messages.len(), "history: loaded");
                guard.messages = messages.clone();
                self.publish(&guard);
                Ok(messages)
            }
            Err(err) => {
                warn!(chat_id = chat_id.0, error = %err, "history: load failed");
                guard.messages.clear();
                self.publish(&guard);
                drop(guard);
                self.session.revoke_if_unauthorized(&err).await;
                Err(err)
            }
        }
    }

    pub async fn on_live_message(&self, message: Message) {
        let mut guard = self.inner.lock().await;
        debug!(
            message_id = message.id.0,
            chat_id = message.chat_id.0,
            "history: live message appended"
        );
        guard.messages.push(message);
        self.publish(&guard);
    }

    /// Matches by username: live frames may carry a placeholder sender id.
    pub fn is_from_current_user(&self, message: &Message) -> bool {
        self.session
            .identity()
            .is_some_and(|identity| identity.username == message.sender.username)
    }

    pub async fn clear(&self) {
        let mut guard = self.inner.lock().await;
        guard.chat_id = None;
        guard.messages.clear();
        self.publish(&guard);
    }
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;
