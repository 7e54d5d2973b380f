use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message as SocketMessage, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use shared::domain::Message;
use storage::{BlobOp, BlobStore, MemoryBlobStore};
use tokio::{
    net::TcpListener,
    sync::{broadcast, mpsc, Mutex},
};

use crate::{
    api::ApiClient,
    config::ClientSettings,
    realtime::{ConnectionState, RealtimeChannel, RealtimeEvent},
};

pub(crate) const PASSWORD: &str = "secret";
pub(crate) const USER_ID: i64 = 42;
pub(crate) const USERNAME: &str = "alice";
pub(crate) const TOKEN: &str = "token-alice";

const CLOSE_SOCKET: &str = "__close__";
const WAIT: Duration = Duration::from_secs(3);
/// How long the `/slow` routes stall before answering.
pub(crate) const SLOW_RESPONSE: Duration = Duration::from_millis(1500);

#[derive(Debug, Clone)]
pub(crate) struct RecordedRequest {
    pub path: String,
    pub authorization: Option<String>,
    pub body: Option<Value>,
}

#[derive(Clone)]
struct MockState {
    profile_id: Arc<Mutex<i64>>,
    history_status: Arc<Mutex<StatusCode>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    ws_queries: Arc<Mutex<Vec<HashMap<String, String>>>>,
    ws_received: mpsc::UnboundedSender<String>,
    ws_push: broadcast::Sender<String>,
}

impl MockState {
    async fn record(&self, path: String, headers: &HeaderMap, body: Option<Value>) {
        let authorization = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        self.requests.lock().await.push(RecordedRequest {
            path,
            authorization,
            body,
        });
    }
}

/// In-process stand-in for the chat server: REST under `/api/v1` and the
/// live socket under `/ws`.
pub(crate) struct MockServer {
    pub api_url: String,
    pub ws_url: String,
    state: MockState,
    frames: Mutex<mpsc::UnboundedReceiver<String>>,
}

impl MockServer {
    pub async fn spawn() -> Result<Self> {
        std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (ws_received, frames) = mpsc::unbounded_channel();
        let (ws_push, _) = broadcast::channel(64);
        let state = MockState {
            profile_id: Arc::new(Mutex::new(USER_ID)),
            history_status: Arc::new(Mutex::new(StatusCode::OK)),
            requests: Arc::new(Mutex::new(Vec::new())),
            ws_queries: Arc::new(Mutex::new(Vec::new())),
            ws_received,
            ws_push,
        };

        let api = Router::new()
            .route("/auth/login", post(handle_login))
            .route("/auth/register", post(handle_register))
            .route("/users/profile", get(handle_profile))
            .route("/chats", get(handle_chats))
            .route("/chats/:id", get(handle_chat))
            .route("/messages/chat/:id", get(handle_history))
            .route("/messages", post(handle_send))
            .route("/status/:code", get(handle_status))
            .route("/malformed", get(handle_malformed))
            .route("/slow", get(handle_slow));
        let app = Router::new()
            .nest("/api/v1", api)
            .route("/ws", get(handle_socket_upgrade))
            .route("/ws/slow", get(handle_slow_socket_upgrade))
            .with_state(state.clone());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Ok(Self {
            api_url: format!("http://{addr}/api/v1"),
            ws_url: format!("ws://{addr}/ws"),
            state,
            frames: Mutex::new(frames),
        })
    }

    pub fn settings(&self) -> ClientSettings {
        ClientSettings {
            api_base_url: self.api_url.clone(),
            realtime_url: self.ws_url.clone(),
            room_chat_id: 1,
            join_delay_ms: 20,
            request_timeout_secs: 5,
            database_url: "sqlite::memory:".into(),
        }
    }

    pub fn api_client(&self) -> Arc<ApiClient> {
        Arc::new(ApiClient::new(&self.api_url).expect("api client"))
    }

    /// Socket endpoint that waits [`SLOW_RESPONSE`] before upgrading.
    pub fn slow_ws_url(&self) -> String {
        format!("{}/slow", self.ws_url)
    }

    pub fn channel(&self) -> Arc<RealtimeChannel> {
        RealtimeChannel::new(self.settings().realtime_options())
    }

    pub async fn set_profile_id(&self, id: i64) {
        *self.state.profile_id.lock().await = id;
    }

    pub async fn set_history_status(&self, status: StatusCode) {
        *self.state.history_status.lock().await = status;
    }

    pub async fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().await.clone()
    }

    pub async fn requests_to(&self, path: &str) -> Vec<RecordedRequest> {
        self.requests()
            .await
            .into_iter()
            .filter(|request| request.path == path)
            .collect()
    }

    pub async fn socket_queries(&self) -> Vec<HashMap<String, String>> {
        self.state.ws_queries.lock().await.clone()
    }

    /// Next text frame a client sent over the socket.
    pub async fn next_frame(&self) -> Value {
        let mut frames = self.frames.lock().await;
        let text = tokio::time::timeout(WAIT, frames.recv())
            .await
            .expect("timed out waiting for client frame")
            .expect("socket frame channel closed");
        serde_json::from_str(&text).expect("client frame is json")
    }

    /// Sends `frame` to every open socket.
    pub fn push(&self, frame: Value) {
        self.state
            .ws_push
            .send(frame.to_string())
            .expect("no socket is listening");
    }

    pub fn close_sockets(&self) {
        let _ = self.state.ws_push.send(CLOSE_SOCKET.to_string());
    }
}

pub(crate) fn user_json(id: i64, username: &str) -> Value {
    json!({
        "id": id,
        "username": username,
        "email": format!("{username}@example.com"),
        "avatar": "",
        "status": "online",
        "created_at": "2024-05-01T10:00:00Z"
    })
}

pub(crate) fn message_json(id: i64, content: &str, sender_id: i64, username: &str, chat_id: i64) -> Value {
    json!({
        "id": id,
        "content": content,
        "type": "text",
        "sender": user_json(sender_id, username),
        "chat_id": chat_id,
        "is_edited": false,
        "created_at": "2024-05-01T10:05:00Z"
    })
}

pub(crate) fn chat_frame(id: Option<i64>, content: &str, username: &str) -> Value {
    let mut payload = json!({
        "content": content,
        "username": username,
        "sender_id": 7,
        "chat_id": 1
    });
    if let Some(id) = id {
        payload["id"] = json!(id);
    }
    json!({"type": "chat", "payload": payload})
}

fn chat_json(id: i64) -> Value {
    json!({
        "id": id,
        "name": "General",
        "type": "group",
        "participants": [user_json(USER_ID, USERNAME)],
        "unread_count": 0,
        "created_at": "2024-05-01T09:00:00Z"
    })
}

fn bearer_ok(headers: &HeaderMap) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("Bearer token-"))
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

async fn handle_login(
    State(state): State<MockState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    state
        .record("/auth/login".into(), &headers, Some(body.clone()))
        .await;
    let username = body["username"].as_str().unwrap_or_default().to_string();
    if body["password"] != PASSWORD {
        return error_response(StatusCode::UNAUTHORIZED, "Invalid credentials");
    }
    let token = if username == "tokenless" {
        String::new()
    } else {
        format!("token-{username}")
    };
    let id = if username == USERNAME { USER_ID } else { USER_ID + 1 };
    Json(json!({
        "message": "Login successful",
        "token": token,
        "user": {"id": id, "username": username}
    }))
    .into_response()
}

async fn handle_register(
    State(state): State<MockState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    state
        .record("/auth/register".into(), &headers, Some(body.clone()))
        .await;
    if body["username"] == "taken" {
        return error_response(StatusCode::CONFLICT, "username already exists");
    }
    (
        StatusCode::CREATED,
        Json(json!({
            "message": "User created",
            "user": {"username": body["username"], "email": body["email"]}
        })),
    )
        .into_response()
}

async fn handle_profile(State(state): State<MockState>, headers: HeaderMap) -> Response {
    state.record("/users/profile".into(), &headers, None).await;
    if !bearer_ok(&headers) {
        return error_response(StatusCode::UNAUTHORIZED, "Unauthorized");
    }
    let id = *state.profile_id.lock().await;
    Json(user_json(id, USERNAME)).into_response()
}

async fn handle_chats(State(state): State<MockState>, headers: HeaderMap) -> Response {
    state.record("/chats".into(), &headers, None).await;
    if !bearer_ok(&headers) {
        return error_response(StatusCode::UNAUTHORIZED, "Unauthorized");
    }
    Json(json!({"chats": [chat_json(1)], "user_id": USER_ID})).into_response()
}

async fn handle_chat(
    State(state): State<MockState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Response {
    state.record(format!("/chats/{id}"), &headers, None).await;
    if !bearer_ok(&headers) {
        return error_response(StatusCode::UNAUTHORIZED, "Unauthorized");
    }
    if id != 1 {
        return error_response(StatusCode::NOT_FOUND, "Chat not found");
    }
    Json(chat_json(id)).into_response()
}

async fn handle_history(
    State(state): State<MockState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Response {
    state
        .record(format!("/messages/chat/{id}"), &headers, None)
        .await;
    if !bearer_ok(&headers) {
        return error_response(StatusCode::UNAUTHORIZED, "Unauthorized");
    }
    let status = *state.history_status.lock().await;
    if status != StatusCode::OK {
        return error_response(status, "history unavailable");
    }
    Json(json!({
        "chat_id": id,
        "messages": [
            message_json(1, "welcome", 7, "bob", id),
            message_json(2, "hi bob", USER_ID, USERNAME, id),
        ]
    }))
    .into_response()
}

async fn handle_send(
    State(state): State<MockState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    state
        .record("/messages".into(), &headers, Some(body.clone()))
        .await;
    if !bearer_ok(&headers) {
        return error_response(StatusCode::UNAUTHORIZED, "Unauthorized");
    }
    let content = body["content"].as_str().unwrap_or_default();
    let chat_id = body["chat_id"].as_i64().unwrap_or(1);
    (
        StatusCode::CREATED,
        Json(json!({
            "message": "Message sent",
            "data": message_json(100, content, USER_ID, USERNAME, chat_id)
        })),
    )
        .into_response()
}

async fn handle_status(Path(code): Path<u16>) -> Response {
    let status = StatusCode::from_u16(code).unwrap_or(StatusCode::IM_A_TEAPOT);
    error_response(status, "forced status")
}

async fn handle_malformed() -> Response {
    (StatusCode::OK, "definitely not json").into_response()
}

async fn handle_slow() -> Response {
    tokio::time::sleep(SLOW_RESPONSE).await;
    Json(json!({"ok": true})).into_response()
}

async fn handle_slow_socket_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<MockState>,
) -> Response {
    tokio::time::sleep(SLOW_RESPONSE).await;
    ws.on_upgrade(move |socket| serve_socket(socket, state))
}

async fn handle_socket_upgrade(
    ws: WebSocketUpgrade,
    Query(query): Query<HashMap<String, String>>,
    State(state): State<MockState>,
) -> Response {
    state.ws_queries.lock().await.push(query);
    ws.on_upgrade(move |socket| serve_socket(socket, state))
}

async fn serve_socket(socket: WebSocket, state: MockState) {
    let mut pushes = state.ws_push.subscribe();
    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(SocketMessage::Text(text))) => {
                    let _ = state.ws_received.send(text);
                }
                Some(Ok(SocketMessage::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            outgoing = pushes.recv() => match outgoing {
                Ok(text) if text == CLOSE_SOCKET => {
                    let _ = sink.send(SocketMessage::Close(None)).await;
                    break;
                }
                Ok(text) => {
                    if sink.send(SocketMessage::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            },
        }
    }
}

/// Accepts reads and deletes but refuses to write anything new.
#[derive(Default)]
pub(crate) struct ReadOnlyBlobStore {
    inner: MemoryBlobStore,
}

#[async_trait]
impl BlobStore for ReadOnlyBlobStore {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.load(key).await
    }

    async fn apply(&self, ops: Vec<BlobOp>) -> Result<()> {
        if ops.iter().any(|op| matches!(op, BlobOp::Put { .. })) {
            anyhow::bail!("disk is read-only");
        }
        self.inner.apply(ops).await
    }

    async fn clear_all(&self) -> Result<()> {
        self.inner.clear_all().await
    }
}

/// Waits for the next delivered chat message, skipping other events.
pub(crate) async fn next_message(events: &mut broadcast::Receiver<RealtimeEvent>) -> Message {
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(RealtimeEvent::Message(message)) => return message,
                Ok(_) => continue,
                Err(err) => panic!("event stream failed: {err}"),
            }
        }
    })
    .await
    .expect("timed out waiting for a message event")
}

pub(crate) async fn wait_for_state(channel: &RealtimeChannel, expected: ConnectionState) {
    tokio::time::timeout(WAIT, async {
        while channel.state().await != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for connection state");
}
