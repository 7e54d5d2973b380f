//! Persistent WebSocket channel for live chat frames.
//!
//! One connection at a time. The receive loop runs as a spawned task tagged
//! with a connection generation; a loop from an older connection can never
//! change the state of a newer one. Reconnecting is always an explicit
//! [`RealtimeChannel::connect`] call.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use shared::{
    domain::{
        validate_message_content, ChatId, ContentError, Message, MessageId, MessageKind, User,
        UserId, SYNTHETIC_MESSAGE_IDS, SYSTEM_ID,
    },
    protocol::{ChatPayload, InboundFrame, OutboundFrame, TypingPayload},
};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::ConnectionError;

pub const DEFAULT_JOIN_DELAY: Duration = Duration::from_millis(500);
const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeEvent {
    Message(Message),
    Typing {
        chat_id: ChatId,
        usernames: Vec<String>,
    },
    StateChanged(ConnectionState),
}

#[derive(Debug, Clone)]
pub struct RealtimeOptions {
    pub url: String,
    /// Room joined after every successful connect.
    pub room: ChatId,
    pub join_delay: Duration,
}

pub struct RealtimeChannel {
    options: RealtimeOptions,
    inner: Mutex<ChannelState>,
    events: broadcast::Sender<RealtimeEvent>,
}

struct ChannelState {
    state: ConnectionState,
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<String>>,
    seen_message_ids: HashSet<MessageId>,
    typing: HashMap<ChatId, Vec<String>>,
    reader_task: Option<JoinHandle<()>>,
    join_task: Option<JoinHandle<()>>,
}

impl RealtimeChannel {
    pub fn new(options: RealtimeOptions) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            options,
            inner: Mutex::new(ChannelState {
                state: ConnectionState::Disconnected,
                generation: 0,
                outbound: None,
                seen_message_ids: HashSet::new(),
                typing: HashMap::new(),
                reader_task: None,
                join_task: None,
            }),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.events.subscribe()
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    pub async fn typing_users(&self, chat_id: ChatId) -> Vec<String> {
        self.inner
            .lock()
            .await
            .typing
            .get(&chat_id)
            .cloned()
            .unwrap_or_default()
    }

    fn set_state(&self, guard: &mut ChannelState, next: ConnectionState) {
        if guard.state != next {
            guard.state = next;
            let _ = self.events.send(RealtimeEvent::StateChanged(next));
        }
    }

    /// Opens the connection and joins the configured room.
    ///
    /// Calling this while connecting or connected is a no-op. A
    /// [`RealtimeChannel::disconnect`] during the handshake makes this return
    /// [`ConnectionError::Superseded`].
    pub async fn connect(self: &Arc<Self>, identity: Option<&User>) -> Result<(), ConnectionError> {
        let generation = {
            let mut guard = self.inner.lock().await;
            if guard.state != ConnectionState::Disconnected {
                debug!(state = ?guard.state, "realtime: connect ignored");
                return Ok(());
            }
            guard.generation += 1;
            self.set_state(&mut guard, ConnectionState::Connecting);
            guard.generation
        };

        let url = match build_connect_url(&self.options.url, identity) {
            Ok(url) => url,
            Err(err) => {
                self.mark_disconnected(generation).await;
                return Err(err);
            }
        };

        info!(url = %url, "realtime: connecting");
        let ws_stream = match connect_async(url.as_str()).await {
            Ok((stream, _)) => stream,
            Err(err) => {
                warn!(error = %err, "realtime: handshake failed");
                self.mark_disconnected(generation).await;
                return Err(ConnectionError::Handshake(err.to_string()));
            }
        };
        let (mut writer, mut reader) = ws_stream.split();

        let mut guard = self.inner.lock().await;
        if guard.generation != generation {
            debug!("realtime: connection superseded during handshake");
            return Err(ConnectionError::Superseded);
        }

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(err) = writer.send(WsMessage::Text(text)).await {
                    warn!(error = %err, "realtime: failed to send frame");
                }
            }
            let _ = writer.close().await;
        });

        let channel = Arc::clone(self);
        let reader_task = tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => channel.handle_frame(&text).await,
                    Ok(WsMessage::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => channel.handle_frame(&text).await,
                        Err(_) => debug!("realtime: ignoring non-utf8 binary frame"),
                    },
                    Ok(WsMessage::Close(_)) => {
                        info!("realtime: server closed the connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(error = %err, "realtime: receive failed");
                        break;
                    }
                }
            }
            channel.mark_disconnected(generation).await;
        });

        let channel = Arc::clone(self);
        let room = self.options.room;
        let join_delay = self.options.join_delay;
        let join_task = tokio::spawn(async move {
            tokio::time::sleep(join_delay).await;
            channel.join(room).await;
        });

        guard.outbound = Some(outbound_tx);
        guard.seen_message_ids.clear();
        guard.typing.clear();
        guard.reader_task = Some(reader_task);
        guard.join_task = Some(join_task);
        self.set_state(&mut guard, ConnectionState::Connected);
        info!(generation, "realtime: connected");
        Ok(())
    }

    /// Closes the connection. Subscribers only see the state change.
    pub async fn disconnect(&self) {
        let mut guard = self.inner.lock().await;
        guard.generation += 1;
        guard.outbound = None;
        if let Some(task) = guard.reader_task.take() {
            task.abort();
        }
        if let Some(task) = guard.join_task.take() {
            task.abort();
        }
        if guard.state != ConnectionState::Disconnected {
            info!("realtime: disconnected");
        }
        self.set_state(&mut guard, ConnectionState::Disconnected);
    }

    async fn mark_disconnected(&self, generation: u64) {
        let mut guard = self.inner.lock().await;
        if guard.generation != generation {
            return;
        }
        guard.outbound = None;
        guard.reader_task = None;
        if let Some(task) = guard.join_task.take() {
            task.abort();
        }
        self.set_state(&mut guard, ConnectionState::Disconnected);
    }

    pub async fn join(&self, chat_id: ChatId) {
        self.send_frame(OutboundFrame::Join { chat_id }).await;
    }

    /// Rejects oversized or empty content before anything reaches the socket.
    pub async fn send_chat_message(
        &self,
        content: &str,
        chat_id: ChatId,
    ) -> Result<(), ContentError> {
        let content = validate_message_content(content)?;
        self.send_frame(OutboundFrame::Chat {
            content: content.to_string(),
            chat_id,
        })
        .await;
        Ok(())
    }

    pub async fn send_typing(&self, chat_id: ChatId, is_typing: bool) {
        self.send_frame(OutboundFrame::Typing {
            chat_id,
            typing: is_typing,
        })
        .await;
    }

    async fn send_frame(&self, frame: OutboundFrame) {
        let text = match frame.encode() {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "realtime: failed to encode frame");
                return;
            }
        };
        let guard = self.inner.lock().await;
        match &guard.outbound {
            Some(tx) => {
                if tx.send(text).is_err() {
                    warn!("realtime: writer closed, frame dropped");
                }
            }
            None => warn!("realtime: not connected, frame dropped"),
        }
    }

    pub(crate) async fn handle_frame(&self, text: &str) {
        let frame = match InboundFrame::decode(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "realtime: dropping malformed frame");
                return;
            }
        };
        match frame {
            InboundFrame::Chat(payload) => {
                if let Some(message) = self.accept_chat(payload).await {
                    let _ = self.events.send(RealtimeEvent::Message(message));
                }
            }
            InboundFrame::Typing(payload) => self.apply_typing(payload).await,
            InboundFrame::Status(_) => debug!("realtime: status frame ignored"),
            InboundFrame::Unknown { kind } => {
                debug!(kind = %kind, "realtime: ignoring unrecognized frame");
            }
        }
    }

    async fn accept_chat(&self, payload: ChatPayload) -> Option<Message> {
        let mut guard = self.inner.lock().await;
        if let Some(id) = payload.id {
            if !guard.seen_message_ids.insert(id) {
                debug!(message_id = id.0, "realtime: duplicate chat frame dropped");
                return None;
            }
        }
        drop(guard);

        if payload.is_history {
            debug!(message_id = ?payload.id, "realtime: history frame");
        }
        Some(message_from_payload(payload, self.options.room))
    }

    async fn apply_typing(&self, payload: TypingPayload) {
        let chat_id = payload.chat_id.unwrap_or(self.options.room);
        let mut guard = self.inner.lock().await;
        let users = guard.typing.entry(chat_id).or_default();
        let changed = if payload.typing {
            if users.contains(&payload.username) {
                false
            } else {
                users.push(payload.username);
                true
            }
        } else {
            let before = users.len();
            users.retain(|name| *name != payload.username);
            users.len() != before
        };
        if changed {
            let usernames = users.clone();
            let _ = self.events.send(RealtimeEvent::Typing { chat_id, usernames });
        }
    }
}

/// Builds the handshake URL. Only the identity claim goes on the wire;
/// the bearer credential is never part of the realtime handshake.
fn build_connect_url(base: &str, identity: Option<&User>) -> Result<Url, ConnectionError> {
    let mut url = Url::parse(base).map_err(|_| ConnectionError::InvalidUrl(base.to_string()))?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(ConnectionError::InvalidUrl(base.to_string()));
    }
    if let Some(identity) = identity {
        url.query_pairs_mut()
            .append_pair("user_id", &identity.id.0.to_string())
            .append_pair("username", &identity.username);
    }
    Ok(url)
}

fn message_from_payload(payload: ChatPayload, room: ChatId) -> Message {
    let id = payload
        .id
        .unwrap_or_else(|| MessageId(rand::thread_rng().gen_range(SYNTHETIC_MESSAGE_IDS)));
    let sender_id = payload.sender_id.unwrap_or(UserId(SYSTEM_ID));
    Message {
        id,
        content: payload.content,
        kind: MessageKind::Text,
        sender: User::placeholder(sender_id, payload.username),
        chat_id: payload.chat_id.unwrap_or(room),
        reply_to_id: None,
        is_edited: false,
        created_at: payload.created_at.unwrap_or_else(Utc::now),
        updated_at: None,
    }
}

#[cfg(test)]
#[path = "tests/realtime_tests.rs"]
mod tests;
